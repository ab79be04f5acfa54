//! Room codes

use rand::Rng;

use crate::error::{AppError, Result};

/// Length of generated room codes
pub const ROOM_CODE_LEN: usize = 6;

/// No 0/O or 1/I/L, so codes survive being read aloud
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Trim and uppercase a user-supplied room id
pub fn normalize_room_id(raw: &str) -> Result<String> {
    let id = raw.trim().to_uppercase();
    if id.is_empty() {
        return Err(AppError::BadRequest("room id is empty".to_string()));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(AppError::BadRequest(format!(
            "room id must not contain whitespace: {:?}",
            raw
        )));
    }
    Ok(id)
}

/// Random room code from an unambiguous alphabet
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}
