use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use talkstick::audio::{
    enumerate_devices, format_device_list, AlsaOutput, AudioCapturer, AudioOutput, AudioPipeline,
    DeviceKind, NullOutput,
};
use talkstick::config::{AppConfig, ConfigChange, ConfigStore};
use talkstick::events::{EventBus, SessionEvent};
use talkstick::mesh::UdpTransport;
use talkstick::protocol::PeerId;
use talkstick::session::{
    generate_room_code, RoomState, SessionCoordinator, SessionDeps, SessionHandle,
};
use talkstick::translation::{TranslationBridge, WsTranslationBridge};
use talkstick::utils::{Clock, SystemClock};
use talkstick::AppError;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// talkstick command line arguments
#[derive(Parser, Debug)]
#[command(name = "talkstick")]
#[command(version, about = "Push-to-talk voice rooms with live translation", long_about = None)]
struct CliArgs {
    /// Room code to join (a new one is generated if omitted)
    #[arg(short = 'r', long, value_name = "CODE")]
    room: Option<String>,

    /// Display name shown to other peers
    #[arg(short = 'n', long, value_name = "NAME")]
    name: Option<String>,

    /// Configuration file (default: ~/.config/talkstick/config.toml)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Mesh UDP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Listen only; never open the microphone
    #[arg(long)]
    no_mic: bool,

    /// Discard incoming audio instead of playing it
    #[arg(long)]
    no_playback: bool,

    /// Run the translation bridge while hosting
    #[arg(long)]
    translate: bool,

    /// Take the floor automatically when speech is detected
    #[arg(long)]
    auto_floor: bool,

    /// Print ALSA capture and playback devices, then exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    if args.list_devices {
        for kind in [DeviceKind::Capture, DeviceKind::Playback] {
            let devices = enumerate_devices(kind)?;
            println!("{} devices:\n{}", kind, format_device_list(&devices));
        }
        return Ok(());
    }

    tracing::info!("Starting talkstick v{}", env!("CARGO_PKG_VERSION"));

    let config_store = match args.config.clone().or_else(default_config_path) {
        Some(path) => {
            tracing::info!("Configuration file: {}", path.display());
            ConfigStore::load(&path).await?
        }
        None => ConfigStore::new(AppConfig::default())?,
    };

    // CLI overrides apply to this run only
    let mut config = (*config_store.get()).clone();
    if let Some(name) = args.name.clone() {
        config.session.display_name = name;
    }
    if let Some(port) = args.port {
        config.mesh.port = port;
    }
    if args.no_mic {
        config.audio.enabled = false;
    }
    if args.no_playback {
        config.playback.enabled = false;
    }
    if args.translate {
        config.translation.enabled = true;
    }
    if args.auto_floor {
        config.session.auto_floor = true;
    }
    config.validate()?;

    let room_id = match args.room.clone().or_else(|| config.session.room_id.clone()) {
        Some(room) => room,
        None => {
            let code = generate_room_code();
            println!("Created room {} (others join with --room {})", code, code);
            code
        }
    };

    let clock = SystemClock::new();
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let events = EventBus::new();

    let transport = Arc::new(UdpTransport::new(config.transport_config()?));
    let output: Arc<dyn AudioOutput> = if config.playback.enabled {
        Arc::new(AlsaOutput::new(config.playback.device.clone(), clock.clone()))
    } else {
        tracing::info!("Playback disabled");
        Arc::new(NullOutput)
    };
    let bridge: Option<Arc<dyn TranslationBridge>> = if config.translation.enabled {
        tracing::info!("Translation engine: {}", config.translation.url);
        Some(Arc::new(WsTranslationBridge::new(config.bridge_config())))
    } else {
        None
    };

    let handle = SessionCoordinator::join(
        config.session_config(room_id),
        SessionDeps {
            transport,
            output,
            bridge,
            clock: shared_clock.clone(),
            events,
        },
    )
    .await?;

    let capturer = if config.audio.enabled {
        start_capture(&config, shared_clock, &handle).await
    } else {
        tracing::info!("Microphone disabled");
        None
    };

    let printer = tokio::spawn(print_events(handle.clone()));
    let follower = tokio::spawn(follow_config(
        config_store.subscribe(),
        config_store.clone(),
        handle.clone(),
    ));
    println!("Type 'help' for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Ok(ConsoleCommand::Quit) => break,
            Ok(command) => {
                if let Err(e) = run_command(command, &handle, &config_store).await {
                    println!("! {}", e);
                    if handle.is_closed() {
                        break;
                    }
                }
            }
            Err(e) => println!("! {}", e),
        }
        if handle.is_closed() {
            break;
        }
    }

    if let Some(capturer) = capturer {
        if let Err(e) = capturer.stop().await {
            tracing::warn!("Failed to stop capture: {}", e);
        }
    }
    if !handle.is_closed() {
        if let Err(e) = handle.leave().await {
            tracing::warn!("Leave failed: {}", e);
        }
    }
    printer.abort();
    follower.abort();

    tracing::info!("talkstick stopped");
    Ok(())
}

async fn start_capture(
    config: &AppConfig,
    clock: Arc<dyn Clock>,
    handle: &SessionHandle,
) -> Option<AudioCapturer> {
    let pipeline = match AudioPipeline::new(config.pipeline_config(), clock) {
        Ok(pipeline) => handle.audio_sender().attach(pipeline),
        Err(e) => {
            tracing::warn!("Audio pipeline unavailable: {}", e);
            return None;
        }
    };

    let capturer = AudioCapturer::new(config.capture_config());
    match capturer.start(pipeline).await {
        Ok(()) => {
            tracing::info!("Microphone: {}", config.audio.device);
            Some(capturer)
        }
        Err(e) => {
            tracing::warn!("Microphone unavailable, listening only: {}", e);
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ConsoleCommand {
    Help,
    Talk,
    Release,
    Who,
    Log(usize),
    Lang(String, String),
    Mute(String),
    Kick(String),
    Mic(bool),
    Quit,
}

fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let mut parts = line.split_whitespace();
    let name = parts.next().unwrap_or_default().to_lowercase();
    let args: Vec<&str> = parts.collect();

    let command = match (name.as_str(), args.as_slice()) {
        ("help" | "?", []) => ConsoleCommand::Help,
        ("talk" | "t", []) => ConsoleCommand::Talk,
        ("release" | "r", []) => ConsoleCommand::Release,
        ("who" | "w", []) => ConsoleCommand::Who,
        ("log", []) => ConsoleCommand::Log(20),
        ("log", [n]) => ConsoleCommand::Log(
            n.parse()
                .map_err(|_| format!("log: {:?} is not a number", n))?,
        ),
        ("lang", [src, dst]) => ConsoleCommand::Lang(src.to_string(), dst.to_string()),
        ("mute", [peer]) => ConsoleCommand::Mute(peer.to_string()),
        ("kick", [peer]) => ConsoleCommand::Kick(peer.to_string()),
        ("mic", ["on"]) => ConsoleCommand::Mic(true),
        ("mic", ["off"]) => ConsoleCommand::Mic(false),
        ("quit" | "exit" | "q", []) => ConsoleCommand::Quit,
        ("lang", _) => return Err("usage: lang <source> <target>".to_string()),
        ("mute" | "kick", _) => return Err(format!("usage: {} <peer>", name)),
        ("mic", _) => return Err("usage: mic on|off".to_string()),
        _ => return Err(format!("unknown command {:?} (try 'help')", line.trim())),
    };
    Ok(command)
}

/// Match a peer by exact id, display name, or unique id prefix
fn resolve_peer(room: &RoomState, query: &str) -> Result<PeerId, String> {
    if let Some(peer) = room.peers.values().find(|p| p.id.as_str() == query) {
        return Ok(peer.id.clone());
    }
    let matches: Vec<&PeerId> = room
        .peers
        .values()
        .filter(|p| p.display_name.eq_ignore_ascii_case(query) || p.id.as_str().starts_with(query))
        .map(|p| &p.id)
        .collect();
    match matches.as_slice() {
        [id] => Ok((*id).clone()),
        [] => Err(format!("no peer matches {:?}", query)),
        _ => Err(format!("{:?} is ambiguous", query)),
    }
}

async fn run_command(
    command: ConsoleCommand,
    handle: &SessionHandle,
    store: &ConfigStore,
) -> anyhow::Result<()> {
    match command {
        ConsoleCommand::Help => println!(
            "talk | release | who | log [n] | lang <src> <dst> | mute <peer> | kick <peer> | mic on|off | quit"
        ),
        ConsoleCommand::Talk => handle.request_floor().await?,
        ConsoleCommand::Release => handle.release_floor().await?,
        ConsoleCommand::Who => print_room(&handle.room()),
        ConsoleCommand::Log(n) => {
            let room = handle.room();
            let entries = handle.transcript();
            let start = entries.len().saturating_sub(n);
            for entry in &entries[start..] {
                println!(
                    "[{}] {} ({:?}{}): {}",
                    entry.index,
                    room.display_name(&entry.sender_id),
                    entry.kind,
                    if entry.is_final { "" } else { ", partial" },
                    entry.text
                );
            }
        }
        ConsoleCommand::Lang(source, target) => {
            if !handle.room().is_host() {
                return Err(AppError::NotHost.into());
            }
            // persisted first; follow_config pushes it into the session
            store
                .update(|c| {
                    c.session.source_language = source;
                    c.session.target_language = target;
                })
                .await?;
        }
        ConsoleCommand::Mute(query) => {
            let peer = resolve_peer(&handle.room(), &query).map_err(anyhow::Error::msg)?;
            handle.mute_peer(peer).await?;
        }
        ConsoleCommand::Kick(query) => {
            let peer = resolve_peer(&handle.room(), &query).map_err(anyhow::Error::msg)?;
            handle.kick_peer(peer).await?;
        }
        ConsoleCommand::Mic(enabled) => handle.set_mic_enabled(enabled).await?,
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

/// Apply saved language changes to the running session
async fn follow_config(
    mut changes: broadcast::Receiver<ConfigChange>,
    store: ConfigStore,
    handle: SessionHandle,
) {
    loop {
        match changes.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
        if handle.is_closed() {
            break;
        }

        let languages = store.get().languages();
        if handle.room().language_config == languages {
            continue;
        }
        tracing::info!(
            "Switching languages to {} -> {}",
            languages.source_language, languages.target_language
        );
        if let Err(e) = handle.set_languages(languages).await {
            tracing::warn!("Language change not applied: {}", e);
        }
    }
}

fn print_room(room: &RoomState) {
    println!(
        "Room {} ({} -> {})",
        room.room_id, room.language_config.source_language, room.language_config.target_language
    );
    for peer in room.peers.values() {
        let mut tags = vec![peer.role.to_string()];
        if room.speaker_id.as_ref() == Some(&peer.id) {
            tags.push("speaking".to_string());
        }
        if peer.id == room.local_id {
            tags.push("you".to_string());
        }
        println!("  {:<16} {} [{}]", peer.display_name, peer.id.short(), tags.join(", "));
    }
}

async fn print_events(handle: SessionHandle) {
    let mut rx = handle.subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Console missed {} events", n);
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        let room = handle.room();
        let name = |id: &PeerId| room.display_name(id);
        match event {
            SessionEvent::Joined { room_id, .. } => println!("* joined room {}", room_id),
            SessionEvent::Left { room_id } => println!("* left room {}", room_id),
            SessionEvent::HostChanged { host_id, is_local } => {
                if is_local {
                    println!("* you are the host");
                } else {
                    println!("* {} is the host", name(&host_id));
                }
            }
            SessionEvent::FloorChanged { speaker_id } => match speaker_id {
                Some(id) if id == room.local_id => println!("* you have the floor"),
                Some(id) => println!("* {} is speaking", name(&id)),
                None => println!("* floor is free"),
            },
            SessionEvent::PeerJoined { peer_id } => println!("* {} joined", name(&peer_id)),
            SessionEvent::PeerLeft { peer_id } => println!("* {} left", name(&peer_id)),
            SessionEvent::PeerUpdated { display_name, .. } => {
                println!("* {} is here", display_name)
            }
            SessionEvent::VoiceActivity { .. } => {}
            SessionEvent::MicChanged { enabled, by_host } => match (enabled, by_host) {
                (false, true) => println!("* the host muted your microphone"),
                (false, false) => println!("* microphone off"),
                (true, _) => println!("* microphone on"),
            },
            SessionEvent::TranscriptAppended { entry } => {
                if entry.is_final {
                    println!("{}: {}", name(&entry.sender_id), entry.text);
                }
            }
            SessionEvent::LanguagesChanged {
                source_language,
                target_language,
            } => println!("* translating {} -> {}", source_language, target_language),
            SessionEvent::TranslationStatus { active } => {
                println!("* translation {}", if active { "on" } else { "off" })
            }
            SessionEvent::TranslationError { message } => {
                println!("! translation: {}", message)
            }
            SessionEvent::TransportLost { reason } => println!("! network lost: {}", reason),
            SessionEvent::Kicked { by } => println!("! removed from the room by {}", name(&by)),
        }
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "talkstick=error",
        LogLevel::Warn => "talkstick=warn",
        LogLevel::Info => "talkstick=info",
        LogLevel::Verbose => "talkstick=debug,tokio_tungstenite=info",
        LogLevel::Debug => "talkstick=debug,tokio_tungstenite=debug",
        LogLevel::Trace => "talkstick=trace,tokio_tungstenite=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    // stdout belongs to the console
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Default configuration file location
fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("TALKSTICK_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
        .ok()?;
    Some(base.join("talkstick").join("config.toml"))
}
