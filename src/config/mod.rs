//! Configuration
//!
//! [`AppConfig`] is read from a TOML file and overridden by command-line
//! flags; [`ConfigStore`] holds the active copy.

mod schema;
mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
