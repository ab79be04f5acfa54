//! Session coordinator
//!
//! One tokio task owns the [`RoomState`] and serializes every mutation:
//! handle commands, transport events, bridge events, VAD edges and the
//! heartbeat ticker all arrive through its `select!` loop. Readers get lock-free
//! `Arc<RoomState>` snapshots.

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::room::normalize_room_id;
use super::state::RoomState;
use super::transcript::{Transcript, TranscriptEntry};
use crate::audio::{
    AudioOutput, AudioPipeline, PlaybackFrame, PlaybackScheduler, ProcessedFrame,
    WIRE_SAMPLE_RATE,
};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::mesh::{
    FloorControl, FloorOutcome, LeaderElector, Moderation, Outgoing, PeerTransport,
    TransportEvent,
};
use crate::protocol::{
    codec, AudioChunkPayload, ControlPayload, ControlSignal, EventKind, EventPayload, Inbound,
    LanguageConfig, PeerId, ProtocolError, StateUpdatePayload, TranslationEvent,
};
use crate::translation::{BridgeEvent, TranslationBridge};
use crate::utils::{Clock, LogThrottler};

const BRIDGE_CHANNEL_CAPACITY: usize = 64;

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Room to join; trimmed and uppercased before use
    pub room_id: String,
    pub display_name: String,
    /// Initial languages (replaced by the host's once it announces)
    pub languages: LanguageConfig,
    pub heartbeat_interval: Duration,
    pub jitter_latency: Duration,
    /// Run the translation bridge while this peer is host
    pub translation_enabled: bool,
    /// Take and release the floor from voice activity
    pub auto_floor: bool,
    /// Largest bot audio chunk relayed to guests
    pub bot_chunk_samples: usize,
    /// Rate the bridge expects; peer audio at other rates is not forwarded
    pub wire_rate: u32,
    pub mailbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room_id: String::new(),
            display_name: "guest".to_string(),
            languages: LanguageConfig::default(),
            heartbeat_interval: Duration::from_secs(2),
            jitter_latency: Duration::from_millis(50),
            translation_enabled: false,
            auto_floor: false,
            bot_chunk_samples: 4096,
            wire_rate: WIRE_SAMPLE_RATE,
            mailbox_capacity: 256,
        }
    }
}

/// Collaborators the coordinator drives
pub struct SessionDeps {
    pub transport: Arc<dyn PeerTransport>,
    pub output: Arc<dyn AudioOutput>,
    pub bridge: Option<Arc<dyn TranslationBridge>>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    RequestFloor(Reply<()>),
    ReleaseFloor(Reply<()>),
    SetLanguages(LanguageConfig, Reply<()>),
    MutePeer(PeerId, Reply<()>),
    KickPeer(PeerId, Reply<()>),
    SetMic(bool, Reply<()>),
    Sync(Reply<()>),
    Leave(Reply<()>),
    LocalAudio(ProcessedFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub struct SessionCoordinator {
    config: SessionConfig,
    room: RoomState,
    elector: LeaderElector,
    scheduler: PlaybackScheduler,
    transcript: Arc<RwLock<Transcript>>,
    snapshot: Arc<ArcSwap<RoomState>>,
    transport: Arc<dyn PeerTransport>,
    output: Arc<dyn AudioOutput>,
    bridge: Option<Arc<dyn TranslationBridge>>,
    bridge_tx: mpsc::Sender<BridgeEvent>,
    bridge_start: Option<JoinHandle<()>>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    /// Whether this peer acted on being host (bridge started, languages announced)
    hosting: bool,
    sequence: u64,
    bot_sequence: u64,
    throttler: LogThrottler,
}

impl SessionCoordinator {
    /// Join the mesh and start the coordinator task
    pub async fn join(config: SessionConfig, deps: SessionDeps) -> Result<SessionHandle> {
        let room_id = normalize_room_id(&config.room_id)?;
        let transport_rx = deps.transport.join(&room_id).await?;
        let local_id = deps.transport.local_id();

        info!(room = %room_id, peer = %local_id, "Joined room as {}", config.display_name);

        let room = RoomState::new(
            room_id,
            local_id.clone(),
            config.display_name.clone(),
            config.languages.clone(),
            deps.clock.unix_millis(),
        );
        let snapshot = Arc::new(ArcSwap::from_pointee(room.clone()));
        let transcript = Arc::new(RwLock::new(Transcript::new()));
        let (tx, mailbox) = mpsc::channel(config.mailbox_capacity.max(1));
        // edges bypass the mailbox so a backlog of frames cannot swallow them
        let (vad_tx, vad_rx) = watch::channel(false);
        let (bridge_tx, bridge_rx) = mpsc::channel(BRIDGE_CHANNEL_CAPACITY);

        let coordinator = Self {
            elector: LeaderElector::new(local_id.clone()),
            scheduler: PlaybackScheduler::new(deps.clock.clone(), config.jitter_latency),
            config,
            room,
            transcript: transcript.clone(),
            snapshot: snapshot.clone(),
            transport: deps.transport,
            output: deps.output,
            bridge: deps.bridge,
            bridge_tx,
            bridge_start: None,
            clock: deps.clock,
            events: deps.events.clone(),
            hosting: false,
            sequence: 0,
            bot_sequence: 0,
            throttler: LogThrottler::with_secs(5),
        };

        tokio::spawn(coordinator.run(mailbox, vad_rx, transport_rx, bridge_rx));

        Ok(SessionHandle {
            tx,
            vad: Arc::new(vad_tx),
            room: snapshot,
            transcript,
            events: deps.events,
            local_id,
        })
    }

    async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<Command>,
        mut vad_rx: watch::Receiver<bool>,
        transport_rx: mpsc::Receiver<TransportEvent>,
        mut bridge_rx: mpsc::Receiver<BridgeEvent>,
    ) {
        self.on_joined().await;
        self.publish_room();

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut transport_rx = Some(transport_rx);

        loop {
            let flow = tokio::select! {
                cmd = mailbox.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        // every handle dropped
                        let _ = self.shutdown().await;
                        Flow::Stop
                    }
                },
                event = recv_opt(&mut transport_rx) => match event {
                    Some(event) => self.handle_transport(event).await,
                    None => {
                        transport_rx = None;
                        Flow::Continue
                    }
                },
                Some(event) = bridge_rx.recv() => self.handle_bridge(event).await,
                Ok(()) = vad_rx.changed() => {
                    let speaking = *vad_rx.borrow_and_update();
                    self.on_voice_activity(speaking).await
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeat().await;
                    Flow::Continue
                }
            };

            self.publish_room();
            if flow == Flow::Stop {
                break;
            }
        }

        debug!(peer = %self.room.local_id, "Session coordinator stopped");
    }

    fn publish_room(&self) {
        if **self.snapshot.load() != self.room {
            self.snapshot.store(Arc::new(self.room.clone()));
        }
    }

    fn respond<T>(&self, reply: Reply<T>, result: Result<T>) {
        self.publish_room();
        let _ = reply.send(result);
    }

    fn now_ms(&self) -> i64 {
        self.clock.unix_millis()
    }

    async fn on_joined(&mut self) {
        self.events.publish(SessionEvent::Joined {
            room_id: self.room.room_id.clone(),
            local_id: self.room.local_id.clone(),
        });
        // only self is known, so this always elects us and announces
        if let Some(host) = self.elector.elect() {
            self.on_host_changed(host).await;
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::RequestFloor(reply) => {
                let outcome = FloorControl::request(&mut self.room);
                let flow = self.apply_floor(outcome).await;
                self.respond(reply, Ok(()));
                flow
            }
            Command::ReleaseFloor(reply) => {
                let outcome = FloorControl::release(&mut self.room);
                let flow = self.apply_floor(outcome).await;
                self.respond(reply, Ok(()));
                flow
            }
            Command::SetLanguages(languages, reply) => {
                let result = self.set_languages(languages).await;
                self.respond(reply, result);
                Flow::Continue
            }
            Command::MutePeer(target, reply) => {
                let result = self.moderate(ControlSignal::MutePeer, target).await;
                self.respond(reply, result);
                Flow::Continue
            }
            Command::KickPeer(target, reply) => {
                let result = self.moderate(ControlSignal::KickPeer, target).await;
                self.respond(reply, result);
                Flow::Continue
            }
            Command::SetMic(enabled, reply) => {
                let flow = self.set_mic(enabled).await;
                self.respond(reply, Ok(()));
                flow
            }
            Command::Sync(reply) => {
                self.respond(reply, Ok(()));
                Flow::Continue
            }
            Command::Leave(reply) => {
                let result = self.shutdown().await;
                self.respond(reply, result);
                Flow::Stop
            }
            Command::LocalAudio(frame) => {
                self.send_local_audio(frame).await;
                Flow::Continue
            }
        }
    }

    async fn set_languages(&mut self, languages: LanguageConfig) -> Result<()> {
        if !self.room.is_host() {
            return Err(AppError::NotHost);
        }
        if self.room.language_config == languages {
            return Ok(());
        }

        info!(
            "Room languages: {} -> {}",
            languages.source_language, languages.target_language
        );
        self.room.language_config = languages;
        self.publish_languages();
        self.announce(None).await;

        if self.bridge_active() || self.bridge_start.is_some() {
            self.stop_bridge().await;
            self.start_bridge();
        }
        Ok(())
    }

    async fn moderate(&mut self, signal: ControlSignal, target: PeerId) -> Result<()> {
        if !self.room.is_host() {
            return Err(AppError::NotHost);
        }
        if target == self.room.local_id || target.is_bot() {
            return Err(AppError::BadRequest(format!("cannot {:?} {}", signal, target)));
        }
        if !self.room.peers.contains_key(&target) {
            return Err(AppError::BadRequest(format!("unknown peer {}", target)));
        }

        info!(peer = %target, "Host moderation: {:?}", signal);
        let control = ControlPayload::new(signal, Some(target.clone()));
        self.send_control(Outgoing::Unicast(target, control)).await;
        Ok(())
    }

    async fn set_mic(&mut self, enabled: bool) -> Flow {
        if self.room.mic_enabled == enabled {
            return Flow::Continue;
        }
        self.room.mic_enabled = enabled;
        info!("Microphone {}", if enabled { "enabled" } else { "disabled" });
        self.events.publish(SessionEvent::MicChanged {
            enabled,
            by_host: false,
        });

        if !enabled {
            let outcome = FloorControl::release(&mut self.room);
            return self.apply_floor(outcome).await;
        }
        Flow::Continue
    }

    async fn on_voice_activity(&mut self, speaking: bool) -> Flow {
        self.events.publish(SessionEvent::VoiceActivity { speaking });
        if !self.config.auto_floor || !self.room.mic_enabled {
            return Flow::Continue;
        }

        let outcome = if speaking && self.room.speaker_id.is_none() {
            FloorControl::request(&mut self.room)
        } else if !speaking && self.room.holds_floor() {
            FloorControl::release(&mut self.room)
        } else {
            return Flow::Continue;
        };
        self.apply_floor(outcome).await
    }

    async fn send_local_audio(&mut self, frame: ProcessedFrame) {
        if !self.room.holds_floor() || !self.room.mic_enabled || frame.samples.is_empty() {
            return;
        }

        if self.bridge_active() {
            self.push_to_bridge(&frame.samples, frame.sample_rate);
        }

        self.sequence += 1;
        let event = TranslationEvent::audio(
            self.room.local_id.clone(),
            self.now_ms(),
            frame.samples,
            frame.sample_rate,
            self.sequence,
        );
        self.broadcast_event(&event).await;
    }

    /// Leave the mesh; heartbeats stop with the task
    async fn shutdown(&mut self) -> Result<()> {
        self.stop_bridge().await;
        let result = self.transport.leave().await;
        self.output.close();
        self.scheduler.clear();
        self.room.speaker_id = None;
        self.room.reset_to_self();

        info!(room = %self.room.room_id, "Left room");
        self.events.publish(SessionEvent::Left {
            room_id: self.room.room_id.clone(),
        });
        result
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    async fn handle_transport(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::PeerJoined(id) => {
                self.on_peer_joined(id).await;
                Flow::Continue
            }
            TransportEvent::PeerLeft(id) => {
                self.on_peer_left(id).await;
                Flow::Continue
            }
            TransportEvent::Message { from, frame } => self.on_frame(from, &frame).await,
            TransportEvent::Disconnected(reason) => {
                self.on_disconnected(reason).await;
                Flow::Continue
            }
        }
    }

    async fn on_peer_joined(&mut self, id: PeerId) {
        if id == self.room.local_id || id.is_bot() {
            return;
        }
        if self.room.add_peer(id.clone(), self.now_ms()) {
            info!(peer = %id, "Peer joined");
            self.events
                .publish(SessionEvent::PeerJoined { peer_id: id.clone() });
        }
        if let Some(host) = self.elector.peer_joined(id.clone()) {
            self.on_host_changed(host).await;
        }
        self.announce(Some(id)).await;
    }

    async fn on_peer_left(&mut self, id: PeerId) {
        if id == self.room.local_id {
            return;
        }
        if self.room.remove_peer(&id).is_some() {
            info!(peer = %id, "Peer left");
            self.events
                .publish(SessionEvent::PeerLeft { peer_id: id.clone() });
        }
        if FloorControl::on_peer_left(&mut self.room, &id) {
            info!(peer = %id, "Speaker left, floor is free");
            self.publish_floor();
        }
        self.scheduler.forget(&id);
        self.output.close_stream(&id);

        if let Some(host) = self.elector.peer_left(&id) {
            self.on_host_changed(host).await;
        }
    }

    async fn on_disconnected(&mut self, reason: String) {
        warn!("Transport lost: {}", reason);
        self.events
            .publish(SessionEvent::TransportLost { reason });

        self.room.reset_to_self();
        if !self.room.holds_floor() && self.room.speaker_id.is_some() {
            self.room.speaker_id = None;
            self.publish_floor();
        }
        self.scheduler.clear();
        self.output.close();

        self.elector.reset();
        if let Some(host) = self.elector.elect() {
            self.on_host_changed(host).await;
        }
    }

    async fn on_host_changed(&mut self, host: PeerId) {
        self.room.set_host(host.clone());
        let is_local = self.room.is_host();
        info!(host = %host, "Host is now {}", self.room.display_name(&host));
        self.events.publish(SessionEvent::HostChanged {
            host_id: host,
            is_local,
        });

        if is_local && !self.hosting {
            self.hosting = true;
            self.announce(None).await;
            self.start_bridge();
        } else if !is_local && self.hosting {
            self.hosting = false;
            self.stop_bridge().await;
        }
    }

    async fn on_frame(&mut self, from: PeerId, frame: &[u8]) -> Flow {
        let event = match codec::decode(frame) {
            Ok(Inbound::Event(event)) => event,
            Ok(Inbound::Heartbeat { sender_id, .. }) => {
                trace!(peer = %sender_id, "Heartbeat");
                return Flow::Continue;
            }
            Err(ProtocolError::Unknown(what)) => {
                debug!(peer = %from, "Ignoring {}", what);
                return Flow::Continue;
            }
            Err(e) => {
                if self.throttler.should_log(&format!("malformed_{}", from)) {
                    debug!(peer = %from, "Dropping frame: {}", e);
                }
                return Flow::Continue;
            }
        };

        if event.sender_id().is_bot() {
            self.on_bot_event(event, false).await;
            return Flow::Continue;
        }

        if matches!(event.kind(), EventKind::Transcription | EventKind::Translation) {
            self.record_transcript(&event);
            return Flow::Continue;
        }

        match event.into_payload() {
            EventPayload::AudioChunk(chunk) => {
                self.on_peer_audio(from, chunk);
                Flow::Continue
            }
            EventPayload::Control(control) => {
                let outcome = FloorControl::on_signal(&mut self.room, &from, &control);
                self.apply_floor(outcome).await
            }
            EventPayload::StateUpdate(update) => {
                self.on_state_update(from, update);
                Flow::Continue
            }
            EventPayload::Transcription(_) | EventPayload::Translation(_) => Flow::Continue,
        }
    }

    fn on_peer_audio(&mut self, from: PeerId, chunk: AudioChunkPayload) {
        if from == self.room.local_id {
            return;
        }
        if self.bridge_active() {
            self.push_to_bridge(&chunk.samples, chunk.sample_rate);
        }
        self.play(from, chunk);
    }

    fn on_state_update(&mut self, from: PeerId, update: StateUpdatePayload) {
        if self.room.rename_peer(&from, &update.display_name) {
            debug!(peer = %from, "Peer is {}", update.display_name);
            self.events.publish(SessionEvent::PeerUpdated {
                peer_id: from.clone(),
                display_name: update.display_name,
            });
        }

        // guests follow the host's languages
        if let Some(languages) = update.language_config {
            if self.room.is_host_peer(&from)
                && !self.room.is_host()
                && self.room.language_config != languages
            {
                self.room.language_config = languages;
                self.publish_languages();
            }
        }
    }

    // ------------------------------------------------------------------
    // Translation bridge
    // ------------------------------------------------------------------

    fn bridge_active(&self) -> bool {
        self.hosting && self.bridge.as_ref().map(|b| b.is_active()).unwrap_or(false)
    }

    fn start_bridge(&mut self) {
        if !self.config.translation_enabled {
            return;
        }
        let Some(bridge) = self.bridge.clone() else {
            return;
        };

        let languages = self.room.language_config.clone();
        let tx = self.bridge_tx.clone();
        let events = self.events.clone();
        self.bridge_start = Some(tokio::spawn(async move {
            match bridge.start(languages, tx).await {
                Ok(()) => {
                    info!("Translation bridge active");
                    events.publish(SessionEvent::TranslationStatus { active: true });
                }
                Err(e) => {
                    warn!("Translation bridge failed to start: {}", e);
                    events.publish(SessionEvent::TranslationError {
                        message: e.to_string(),
                    });
                }
            }
        }));
    }

    async fn stop_bridge(&mut self) {
        if let Some(task) = self.bridge_start.take() {
            task.abort();
            let _ = task.await;
        }
        let Some(bridge) = self.bridge.as_ref() else {
            return;
        };
        let was_active = bridge.is_active();
        if let Err(e) = bridge.stop().await {
            warn!("Failed to stop translation bridge: {}", e);
        }
        if was_active {
            self.events
                .publish(SessionEvent::TranslationStatus { active: false });
        }
    }

    fn push_to_bridge(&self, samples: &[f32], sample_rate: u32) {
        if sample_rate != self.config.wire_rate {
            if self.throttler.should_log("bridge_rate") {
                debug!(
                    "Not forwarding {}Hz audio to the bridge (expects {}Hz)",
                    sample_rate, self.config.wire_rate
                );
            }
            return;
        }
        let Some(bridge) = self.bridge.as_ref() else {
            return;
        };
        if let Err(e) = bridge.push_audio(samples) {
            if self.throttler.should_log("bridge_push") {
                warn!("Translation bridge rejected audio: {}", e);
            }
        }
    }

    async fn handle_bridge(&mut self, event: BridgeEvent) -> Flow {
        match event {
            BridgeEvent::Event(event) => self.on_bot_event(event, true).await,
            BridgeEvent::Error(message) => {
                self.events
                    .publish(SessionEvent::TranslationError { message });
            }
            BridgeEvent::Closed(Some(reason)) => {
                info!("Translation bridge closed: {}", reason);
                self.events
                    .publish(SessionEvent::TranslationStatus { active: false });
            }
            BridgeEvent::Closed(None) => {}
        }
        Flow::Continue
    }

    /// Bot output: play/log it and, when it came from our own bridge, relay it
    async fn on_bot_event(&mut self, event: TranslationEvent, relay: bool) {
        if matches!(event.kind(), EventKind::Transcription | EventKind::Translation) {
            self.record_transcript(&event);
            if relay {
                self.broadcast_event(&event).await;
            }
            return;
        }

        let timestamp = event.timestamp();
        if let EventPayload::AudioChunk(chunk) = event.into_payload() {
            if relay {
                let size = self.config.bot_chunk_samples.max(1);
                for part in chunk.samples.chunks(size) {
                    self.bot_sequence += 1;
                    let relayed = TranslationEvent::audio(
                        PeerId::bot(),
                        timestamp,
                        part.to_vec(),
                        chunk.sample_rate,
                        self.bot_sequence,
                    );
                    self.broadcast_event(&relayed).await;
                }
            }
            self.play(PeerId::bot(), chunk);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn apply_floor(&mut self, outcome: FloorOutcome) -> Flow {
        if let Some(out) = outcome.send {
            self.send_control(out).await;
        }
        if outcome.speaker_changed {
            self.publish_floor();
        }

        match outcome.moderation {
            Some(Moderation::Muted) => {
                info!("Host muted our microphone");
                if self.room.mic_enabled {
                    self.room.mic_enabled = false;
                    self.events.publish(SessionEvent::MicChanged {
                        enabled: false,
                        by_host: true,
                    });
                }
                Flow::Continue
            }
            Some(Moderation::Kicked) => {
                warn!("Removed from the room by the host");
                self.events.publish(SessionEvent::Kicked {
                    by: self.room.host_id.clone(),
                });
                let _ = self.shutdown().await;
                Flow::Stop
            }
            None => Flow::Continue,
        }
    }

    fn publish_floor(&self) {
        self.events.publish(SessionEvent::FloorChanged {
            speaker_id: self.room.speaker_id.clone(),
        });
    }

    fn publish_languages(&self) {
        self.events.publish(SessionEvent::LanguagesChanged {
            source_language: self.room.language_config.source_language.clone(),
            target_language: self.room.language_config.target_language.clone(),
        });
    }

    fn record_transcript(&self, event: &TranslationEvent) {
        let entry = self.transcript.write().record(event, self.now_ms()).cloned();
        if let Some(entry) = entry {
            self.events
                .publish(SessionEvent::TranscriptAppended { entry });
        }
    }

    fn play(&mut self, stream: PeerId, chunk: AudioChunkPayload) {
        if chunk.samples.is_empty() {
            return;
        }
        let slot = self
            .scheduler
            .schedule(&stream, chunk.samples.len(), chunk.sample_rate);
        let frame = PlaybackFrame {
            stream,
            samples: chunk.samples,
            sample_rate: chunk.sample_rate,
            start: slot.start,
        };
        if let Err(e) = self.output.play(frame) {
            if self.throttler.should_log("playback") {
                warn!("Playback failed: {}", e);
            }
        }
    }

    /// Broadcast (or unicast) our display name; the host includes the languages
    async fn announce(&self, to: Option<PeerId>) {
        let local = self.room.local_peer();
        let payload = StateUpdatePayload {
            display_name: local.map(|p| p.display_name.clone()).unwrap_or_default(),
            language_config: self
                .room
                .is_host()
                .then(|| self.room.language_config.clone()),
        };
        let event = TranslationEvent::new(
            self.room.local_id.clone(),
            self.now_ms(),
            EventPayload::StateUpdate(payload),
        );
        match to {
            Some(peer) => self.unicast_event(&peer, &event).await,
            None => self.broadcast_event(&event).await,
        }
    }

    async fn send_control(&self, out: Outgoing) {
        let local = self.room.local_id.clone();
        match out {
            Outgoing::Broadcast(control) => {
                let event =
                    TranslationEvent::new(local, self.now_ms(), EventPayload::Control(control));
                self.broadcast_event(&event).await;
            }
            Outgoing::Unicast(peer, control) => {
                let event =
                    TranslationEvent::new(local, self.now_ms(), EventPayload::Control(control));
                self.unicast_event(&peer, &event).await;
            }
        }
    }

    async fn broadcast_event(&self, event: &TranslationEvent) {
        let result = match codec::encode_event(event) {
            Ok(frame) => self.transport.broadcast(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if self.throttler.should_log("broadcast") {
                warn!("Failed to broadcast {}: {}", event.kind(), e);
            }
        }
    }

    async fn unicast_event(&self, peer: &PeerId, event: &TranslationEvent) {
        let result = match codec::encode_event(event) {
            Ok(frame) => self.transport.send_to(peer, frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if self.throttler.should_log(&format!("unicast_{}", peer)) {
                warn!(peer = %peer, "Failed to send {}: {}", event.kind(), e);
            }
        }
    }

    async fn send_heartbeat(&self) {
        let result = match codec::encode_heartbeat(&self.room.local_id, self.now_ms()) {
            Ok(frame) => self.transport.broadcast(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if self.throttler.should_log("heartbeat") {
                debug!("Heartbeat failed: {}", e);
            }
        }
    }
}

/// Cloneable front end to a running session
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    vad: Arc<watch::Sender<bool>>,
    room: Arc<ArcSwap<RoomState>>,
    transcript: Arc<RwLock<Transcript>>,
    events: EventBus,
    local_id: PeerId,
}

impl SessionHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| AppError::SessionClosed)?;
        rx.await.map_err(|_| AppError::SessionClosed)?
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Current room snapshot (lock-free)
    pub fn room(&self) -> Arc<RoomState> {
        self.room.load_full()
    }

    /// Copy of the transcript so far
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.read().entries().to_vec()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn request_floor(&self) -> Result<()> {
        self.call(Command::RequestFloor).await
    }

    pub async fn release_floor(&self) -> Result<()> {
        self.call(Command::ReleaseFloor).await
    }

    /// Change the room languages (host only)
    pub async fn set_languages(&self, languages: LanguageConfig) -> Result<()> {
        self.call(|reply| Command::SetLanguages(languages, reply)).await
    }

    /// Ask a guest to disable its microphone (host only)
    pub async fn mute_peer(&self, peer: PeerId) -> Result<()> {
        self.call(|reply| Command::MutePeer(peer, reply)).await
    }

    /// Remove a guest from the room (host only)
    pub async fn kick_peer(&self, peer: PeerId) -> Result<()> {
        self.call(|reply| Command::KickPeer(peer, reply)).await
    }

    pub async fn set_mic_enabled(&self, enabled: bool) -> Result<()> {
        self.call(|reply| Command::SetMic(enabled, reply)).await
    }

    /// Resolves once every command sent before it has been processed
    pub async fn sync(&self) -> Result<()> {
        self.call(Command::Sync).await
    }

    /// Leave the room; presence is cleared and heartbeats stopped on return
    pub async fn leave(&self) -> Result<()> {
        self.call(Command::Leave).await
    }

    /// Non-blocking entry point for the capture thread
    pub fn audio_sender(&self) -> AudioSender {
        AudioSender {
            tx: self.tx.clone(),
            vad: self.vad.clone(),
            room: self.room.clone(),
            throttler: Arc::new(LogThrottler::with_secs(5)),
        }
    }
}

/// Feeds captured audio into the session without ever blocking
#[derive(Clone)]
pub struct AudioSender {
    tx: mpsc::Sender<Command>,
    vad: Arc<watch::Sender<bool>>,
    room: Arc<ArcSwap<RoomState>>,
    throttler: Arc<LogThrottler>,
}

impl AudioSender {
    /// Queue a frame for broadcast; dropped unless we hold the floor
    pub fn send_frame(&self, frame: ProcessedFrame) {
        {
            let room = self.room.load();
            if !room.holds_floor() || !room.mic_enabled {
                return;
            }
        }
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(Command::LocalAudio(frame))
        {
            if self.throttler.should_log("mailbox_full") {
                warn!("Session mailbox full, dropping audio frame");
            }
        }
    }

    /// Report a VAD edge; only the latest state is kept if the session lags
    pub fn voice_activity(&self, speaking: bool) {
        self.vad.send_replace(speaking);
    }

    /// Route a pipeline's callbacks into the session
    pub fn attach(self, pipeline: AudioPipeline) -> AudioPipeline {
        let frames = self.clone();
        pipeline
            .on_frame(move |frame| frames.send_frame(frame))
            .on_activity(move |speaking| self.voice_activity(speaking))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MemoryMesh;
    use crate::protocol::TranscriptionPayload;
    use crate::utils::SystemClock;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_test::{assert_err, assert_ok};

    const ROOM: &str = "ROOM1";

    fn id(s: &str) -> PeerId {
        PeerId::from(s)
    }

    #[derive(Default)]
    struct RecordingOutput {
        frames: Mutex<Vec<PlaybackFrame>>,
    }

    impl RecordingOutput {
        fn from_stream(&self, stream: &PeerId) -> Vec<PlaybackFrame> {
            self.frames
                .lock()
                .iter()
                .filter(|f| &f.stream == stream)
                .cloned()
                .collect()
        }
    }

    impl AudioOutput for RecordingOutput {
        fn play(&self, frame: PlaybackFrame) -> Result<()> {
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockBridge {
        started: Mutex<Vec<LanguageConfig>>,
        pushed: Mutex<Vec<Vec<f32>>>,
        events: Mutex<Option<mpsc::Sender<BridgeEvent>>>,
    }

    impl MockBridge {
        async fn emit(&self, event: TranslationEvent) {
            let tx = self.events.lock().clone().expect("bridge not started");
            tx.send(BridgeEvent::Event(event)).await.unwrap();
        }
    }

    #[async_trait]
    impl TranslationBridge for MockBridge {
        async fn start(
            &self,
            languages: LanguageConfig,
            events: mpsc::Sender<BridgeEvent>,
        ) -> Result<()> {
            self.started.lock().push(languages);
            *self.events.lock() = Some(events);
            Ok(())
        }

        fn push_audio(&self, samples: &[f32]) -> Result<()> {
            self.pushed.lock().push(samples.to_vec());
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.events.lock().take();
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.events.lock().is_some()
        }
    }

    struct TestPeer {
        handle: SessionHandle,
        output: Arc<RecordingOutput>,
    }

    fn config(name: &str) -> SessionConfig {
        SessionConfig {
            room_id: " room1 ".to_string(),
            display_name: name.to_string(),
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    async fn join_with(
        mesh: &MemoryMesh,
        peer: &str,
        config: SessionConfig,
        bridge: Option<Arc<dyn TranslationBridge>>,
    ) -> TestPeer {
        let output = Arc::new(RecordingOutput::default());
        let deps = SessionDeps {
            transport: Arc::new(mesh.transport(peer)),
            output: output.clone(),
            bridge,
            clock: Arc::new(SystemClock::new()),
            events: EventBus::new(),
        };
        let handle = SessionCoordinator::join(config, deps).await.unwrap();
        TestPeer { handle, output }
    }

    async fn join(mesh: &MemoryMesh, peer: &str) -> TestPeer {
        join_with(mesh, peer, config(peer), None).await
    }

    async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn converge(peers: &[&TestPeer], host: &str) {
        let n = peers.len();
        for p in peers {
            eventually("membership", || {
                let room = p.handle.room();
                room.peers.len() == n && room.host_id == id(host)
            })
            .await;
        }
    }

    fn control_frames(mesh: &MemoryMesh, from: &str) -> Vec<(Option<PeerId>, ControlPayload)> {
        mesh.sent_frames(&id(from))
            .into_iter()
            .filter_map(|f| match codec::decode(&f.frame) {
                Ok(Inbound::Event(e)) => match e.payload() {
                    EventPayload::Control(c) => Some((f.to.clone(), c.clone())),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    fn frame(samples: usize) -> ProcessedFrame {
        ProcessedFrame {
            samples: vec![0.1; samples],
            sample_rate: 16000,
            volume: 0.1,
            speaking: true,
        }
    }

    async fn next_matching(
        rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
        mut pred: impl FnMut(&SessionEvent) -> bool,
    ) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not published")
    }

    #[tokio::test]
    async fn test_room_id_is_normalized() {
        let mesh = MemoryMesh::new();
        let a = join(&mesh, "a").await;
        assert_eq!(a.handle.room().room_id, ROOM);
        assert_eq!(mesh.members(ROOM), vec![id("a")]);
        assert!(a.handle.room().is_host());
    }

    #[tokio::test]
    async fn test_join_order_does_not_change_host() {
        let mesh = MemoryMesh::new();
        let c = join(&mesh, "c").await;
        let a = join(&mesh, "a").await;
        let b = join(&mesh, "b").await;

        converge(&[&a, &b, &c], "a").await;
        assert!(a.handle.room().is_host());
        assert!(!c.handle.room().is_host());
    }

    #[tokio::test]
    async fn test_display_names_are_exchanged() {
        let mesh = MemoryMesh::new();
        let a = join_with(&mesh, "a", config("Alice"), None).await;
        let b = join_with(&mesh, "b", config("Bob"), None).await;
        converge(&[&a, &b], "a").await;

        eventually("names", || {
            a.handle.room().display_name(&id("b")) == "Bob"
                && b.handle.room().display_name(&id("a")) == "Alice"
        })
        .await;
    }

    #[tokio::test]
    async fn test_host_takes_floor_with_one_broadcast() {
        let mesh = MemoryMesh::with_recording();
        let a = join(&mesh, "a").await;
        let b = join(&mesh, "b").await;
        converge(&[&a, &b], "a").await;
        mesh.clear_recording();

        a.handle.request_floor().await.unwrap();
        assert_eq!(a.handle.room().speaker_id, Some(id("a")));

        let sent = control_frames(&mesh, "a");
        assert_eq!(
            sent,
            vec![(
                None,
                ControlPayload::new(ControlSignal::GrantToken, Some(id("a")))
            )]
        );
        eventually("guest sees host speaking", || {
            b.handle.room().speaker_id == Some(id("a"))
        })
        .await;
    }

    #[tokio::test]
    async fn test_guest_request_is_granted_by_host() {
        let mesh = MemoryMesh::with_recording();
        let a = join(&mesh, "a").await;
        let b = join(&mesh, "b").await;
        let c = join(&mesh, "c").await;
        converge(&[&a, &b, &c], "a").await;
        mesh.clear_recording();

        b.handle.request_floor().await.unwrap();
        for p in [&a, &b, &c] {
            eventually("grant", || p.handle.room().speaker_id == Some(id("b"))).await;
        }

        let requests = control_frames(&mesh, "b");
        assert_eq!(
            requests,
            vec![(
                Some(id("a")),
                ControlPayload::new(ControlSignal::RequestToken, Some(id("b")))
            )]
        );
        assert!(b.handle.room().holds_floor());

        b.handle.release_floor().await.unwrap();
        for p in [&a, &b, &c] {
            eventually("release", || p.handle.room().speaker_id.is_none()).await;
        }
    }

    #[tokio::test]
    async fn test_speaker_leaving_frees_floor_without_release() {
        let mesh = MemoryMesh::with_recording();
        let a = join(&mesh, "a").await;
        let g = join(&mesh, "g").await;
        let x = join(&mesh, "x").await;
        converge(&[&a, &g, &x], "a").await;

        g.handle.request_floor().await.unwrap();
        for p in [&a, &x] {
            eventually("grant", || p.handle.room().speaker_id == Some(id("g"))).await;
        }
        mesh.clear_recording();

        assert_ok!(g.handle.leave().await);
        for p in [&a, &x] {
            eventually("speaker cleared", || {
                let room = p.handle.room();
                room.speaker_id.is_none() && room.peers.len() == 2
            })
            .await;
        }

        for peer in ["a", "g", "x"] {
            assert!(control_frames(&mesh, peer)
                .iter()
                .all(|(_, c)| c.signal != ControlSignal::ReleaseToken));
        }
    }

    #[tokio::test]
    async fn test_guest_never_grants() {
        let mesh = MemoryMesh::with_recording();
        let a = join(&mesh, "a").await;
        let b = join(&mesh, "b").await;
        converge(&[&a, &b], "a").await;

        // a raw peer asks the guest for the floor
        let z = mesh.transport("z");
        let _z_rx = z.join(ROOM).await.unwrap();
        converge_len(&b, 3).await;
        mesh.clear_recording();

        let request = TranslationEvent::control(
            id("z"),
            0,
            ControlSignal::RequestToken,
            Some(id("z")),
        );
        z.send_to(&id("b"), codec::encode_event(&request).unwrap())
            .await
            .unwrap();
        b.handle.sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.handle.sync().await.unwrap();

        assert!(control_frames(&mesh, "b").is_empty());
        assert_eq!(b.handle.room().speaker_id, None);
    }

    async fn converge_len(p: &TestPeer, n: usize) {
        eventually("peer count", || p.handle.room().peers.len() == n).await;
    }

    #[tokio::test]
    async fn test_audio_flows_only_from_floor_holder() {
        let mesh = MemoryMesh::new();
        let a = join(&mesh, "a").await;
        let b = join(&mesh, "b").await;
        converge(&[&a, &b], "a").await;

        a.handle.request_floor().await.unwrap();
        let a_audio = a.handle.audio_sender();
        a_audio.send_frame(frame(320));
        a_audio.send_frame(frame(320));

        eventually("audio at guest", || b.output.from_stream(&id("a")).len() == 2).await;
        let played = b.output.from_stream(&id("a"));
        assert_eq!(played[0].samples.len(), 320);
        assert_eq!(played[0].sample_rate, 16000);
        assert_eq!(played[1].start, played[0].start + Duration::from_millis(20));

        // b does not hold the floor: nothing is sent
        b.handle.audio_sender().send_frame(frame(320));
        b.handle.sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.output.frames.lock().is_empty());
    }

    #[tokio::test]
    async fn test_muted_mic_stops_audio() {
        let mesh = MemoryMesh::new();
        let a = join(&mesh, "a").await;
        let b = join(&mesh, "b").await;
        converge(&[&a, &b], "a").await;

        assert_ok!(a.handle.request_floor().await);
        assert_ok!(a.handle.set_mic_enabled(false).await);
        let room = a.handle.room();
        assert!(!room.mic_enabled);
        // disabling the mic hands the floor back
        assert_eq!(room.speaker_id, None);

        a.handle.audio_sender().send_frame(frame(320));
        a.handle.sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.output.frames.lock().is_empty());
    }

    #[tokio::test]
    async fn test_auto_floor_follows_voice_activity() {
        let mesh = MemoryMesh::new();
        let a = join(&mesh, "a").await;
        let b = join_with(
            &mesh,
            "b",
            SessionConfig {
                auto_floor: true,
                ..config("b")
            },
            None,
        )
        .await;
        converge(&[&a, &b], "a").await;

        let audio = b.handle.audio_sender();
        audio.voice_activity(true);
        for p in [&a, &b] {
            eventually("auto grant", || p.handle.room().speaker_id == Some(id("b"))).await;
        }

        audio.voice_activity(false);
        for p in [&a, &b] {
            eventually("auto release", || p.handle.room().speaker_id.is_none()).await;
        }
    }

    #[tokio::test]
    async fn test_auto_release_survives_full_mailbox() {
        let mesh = MemoryMesh::new();
        let a = join(&mesh, "a").await;
        let b = join_with(
            &mesh,
            "b",
            SessionConfig {
                auto_floor: true,
                mailbox_capacity: 2,
                ..config("b")
            },
            None,
        )
        .await;
        converge(&[&a, &b], "a").await;

        let audio = b.handle.audio_sender();
        audio.voice_activity(true);
        for p in [&a, &b] {
            eventually("auto grant", || p.handle.room().speaker_id == Some(id("b"))).await;
        }

        // the coordinator does not run until the next await, so frames pile up
        for _ in 0..5 {
            audio.send_frame(ProcessedFrame {
                samples: vec![0.1; 320],
                sample_rate: WIRE_SAMPLE_RATE,
                volume: 0.1,
                speaking: true,
            });
        }
        audio.voice_activity(false);

        for p in [&a, &b] {
            eventually("auto release", || p.handle.room().speaker_id.is_none()).await;
        }
    }

    #[tokio::test]
    async fn test_host_only_operations() {
        let mesh = MemoryMesh::new();
        let a = join(&mesh, "a").await;
        let b = join(&mesh, "b").await;
        converge(&[&a, &b], "a").await;

        assert!(matches!(
            b.handle.mute_peer(id("a")).await,
            Err(AppError::NotHost)
        ));
        assert!(matches!(
            b.handle.kick_peer(id("a")).await,
            Err(AppError::NotHost)
        ));
        assert!(matches!(
            b.handle.set_languages(LanguageConfig::default()).await,
            Err(AppError::NotHost)
        ));
        assert_err!(a.handle.mute_peer(id("nobody")).await);
        assert!(matches!(
            a.handle.kick_peer(id("a")).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_guests_adopt_host_languages() {
        let mesh = MemoryMesh::new();
        let a = join(&mesh, "a").await;
        let b = join(&mesh, "b").await;
        converge(&[&a, &b], "a").await;

        let languages = LanguageConfig {
            source_language: "de-DE".to_string(),
            target_language: "ja-JP".to_string(),
        };
        a.handle.set_languages(languages.clone()).await.unwrap();
        eventually("languages", || b.handle.room().language_config == languages).await;
    }

    #[tokio::test]
    async fn test_host_mutes_guest() {
        let mesh = MemoryMesh::new();
        let a = join(&mesh, "a").await;
        let b = join(&mesh, "b").await;
        converge(&[&a, &b], "a").await;
        let mut b_events = b.handle.subscribe();

        b.handle.request_floor().await.unwrap();
        eventually("grant", || a.handle.room().speaker_id == Some(id("b"))).await;

        a.handle.mute_peer(id("b")).await.unwrap();
        let event = next_matching(&mut b_events, |e| {
            matches!(e, SessionEvent::MicChanged { .. })
        })
        .await;
        assert_eq!(
            event,
            SessionEvent::MicChanged {
                enabled: false,
                by_host: true
            }
        );
        assert!(!b.handle.room().mic_enabled);
        // the muted speaker released the floor
        eventually("floor freed", || a.handle.room().speaker_id.is_none()).await;
    }

    #[tokio::test]
    async fn test_guest_cannot_moderate_via_raw_signal() {
        let mesh = MemoryMesh::new();
        let a = join(&mesh, "a").await;
        let b = join(&mesh, "b").await;
        let c = join(&mesh, "c").await;
        converge(&[&a, &b, &c], "a").await;

        // only the host may kick
        let z = mesh.transport("zz");
        let _rx = z.join(ROOM).await.unwrap();
        let kick = TranslationEvent::control(id("zz"), 0, ControlSignal::KickPeer, Some(id("b")));
        z.send_to(&id("b"), codec::encode_event(&kick).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.handle.sync().await.unwrap();
        assert!(!b.handle.is_closed());
    }

    #[tokio::test]
    async fn test_host_kicks_guest() {
        let mesh = MemoryMesh::new();
        let a = join(&mesh, "a").await;
        let b = join(&mesh, "b").await;
        converge(&[&a, &b], "a").await;
        let mut b_events = b.handle.subscribe();

        a.handle.kick_peer(id("b")).await.unwrap();
        let event = next_matching(&mut b_events, |e| matches!(e, SessionEvent::Kicked { .. })).await;
        assert_eq!(event, SessionEvent::Kicked { by: id("a") });

        eventually("guest gone", || a.handle.room().peers.len() == 1).await;
        eventually("session closed", || b.handle.is_closed()).await;
        assert!(matches!(b.handle.sync().await, Err(AppError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_transport_loss_resets_to_self() {
        let mesh = MemoryMesh::new();
        let a = join(&mesh, "a").await;
        let b = join(&mesh, "b").await;
        converge(&[&a, &b], "a").await;
        a.handle.request_floor().await.unwrap();
        eventually("grant", || b.handle.room().speaker_id == Some(id("a"))).await;
        let mut b_events = b.handle.subscribe();

        mesh.disconnect(&id("b"), "cable unplugged");

        next_matching(&mut b_events, |e| matches!(e, SessionEvent::TransportLost { .. })).await;
        eventually("reset", || {
            let room = b.handle.room();
            room.peers.len() == 1 && room.is_host() && room.speaker_id.is_none()
        })
        .await;
        eventually("host sees guest leave", || a.handle.room().peers.len() == 1).await;
        // the session itself stays usable
        b.handle.sync().await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_stops_heartbeats() {
        let mesh = MemoryMesh::with_recording();
        let a = join_with(
            &mesh,
            "a",
            SessionConfig {
                heartbeat_interval: Duration::from_millis(20),
                ..config("a")
            },
            None,
        )
        .await;
        let _b = join(&mesh, "b").await;

        let heartbeats = || {
            mesh.sent_frames(&id("a"))
                .iter()
                .filter(|f| matches!(codec::decode(&f.frame), Ok(Inbound::Heartbeat { .. })))
                .count()
        };
        eventually("heartbeats", || heartbeats() >= 2).await;

        assert_ok!(a.handle.leave().await);
        assert!(!mesh.members(ROOM).contains(&id("a")));
        let after_leave = heartbeats();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(heartbeats(), after_leave);

        assert!(matches!(a.handle.request_floor().await, Err(AppError::SessionClosed)));
        assert!(matches!(a.handle.leave().await, Err(AppError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_bridge_runs_on_host_and_relays_bot_output() {
        let mesh = MemoryMesh::new();
        let bridge = Arc::new(MockBridge::default());
        let a = join_with(
            &mesh,
            "a",
            SessionConfig {
                translation_enabled: true,
                ..config("a")
            },
            Some(bridge.clone()),
        )
        .await;
        let b = join(&mesh, "b").await;
        converge(&[&a, &b], "a").await;
        eventually("bridge started", || bridge.is_active()).await;
        assert_eq!(bridge.started.lock()[0], LanguageConfig::default());

        // guest speech reaches the bridge through the host
        b.handle.request_floor().await.unwrap();
        eventually("grant", || b.handle.room().holds_floor()).await;
        b.handle.audio_sender().send_frame(frame(320));
        eventually("audio forwarded", || !bridge.pushed.lock().is_empty()).await;
        assert_eq!(bridge.pushed.lock()[0].len(), 320);

        // synthesized speech is played on the host and re-chunked for guests
        let speech = TranslationEvent::audio(id("engine"), 5, vec![0.2; 10000], 16000, 1)
            .with_sender(PeerId::bot());
        bridge.emit(speech).await;
        eventually("bot audio at guest", || {
            b.output
                .from_stream(&PeerId::bot())
                .iter()
                .map(|f| f.samples.len())
                .sum::<usize>()
                == 10000
        })
        .await;
        let sizes: Vec<usize> = b
            .output
            .from_stream(&PeerId::bot())
            .iter()
            .map(|f| f.samples.len())
            .collect();
        assert_eq!(sizes, vec![4096, 4096, 1808]);
        eventually("bot audio at host", || {
            a.output.from_stream(&PeerId::bot()).len() == 1
        })
        .await;
        // bot audio is never fed back into the bridge
        assert!(bridge.pushed.lock().iter().all(|p| p.len() == 320));

        let text = TranslationEvent::new(
            PeerId::bot(),
            6,
            EventPayload::Translation(TranscriptionPayload {
                text: "guten Tag".to_string(),
                is_final: true,
                original_language: "en-US".to_string(),
            }),
        );
        bridge.emit(text).await;
        for p in [&a, &b] {
            eventually("transcript", || p.handle.transcript().len() == 1).await;
            let entry = &p.handle.transcript()[0];
            assert!(entry.sender_id.is_bot());
            assert_eq!(entry.text, "guten Tag");
        }
    }

    #[tokio::test]
    async fn test_bridge_stops_when_host_changes() {
        let mesh = MemoryMesh::new();
        let bridge = Arc::new(MockBridge::default());
        let b = join_with(
            &mesh,
            "b",
            SessionConfig {
                translation_enabled: true,
                ..config("b")
            },
            Some(bridge.clone()),
        )
        .await;
        eventually("bridge started", || bridge.is_active()).await;

        // a smaller id arrives and takes over as host
        let a = join(&mesh, "a").await;
        converge(&[&a, &b], "a").await;
        eventually("bridge stopped", || !bridge.is_active()).await;

        a.handle.leave().await.unwrap();
        eventually("host again", || b.handle.room().is_host()).await;
        eventually("bridge restarted", || bridge.is_active()).await;
        assert_eq!(bridge.started.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_transcripts_from_peers_are_recorded() {
        let mesh = MemoryMesh::new();
        let a = join(&mesh, "a").await;
        let z = mesh.transport("z");
        let _rx = z.join(ROOM).await.unwrap();
        converge_len(&a, 2).await;

        let mut events = a.handle.subscribe();
        let event = TranslationEvent::new(
            id("z"),
            42,
            EventPayload::Transcription(TranscriptionPayload {
                text: "hello".to_string(),
                is_final: false,
                original_language: "en-US".to_string(),
            }),
        );
        z.broadcast(codec::encode_event(&event).unwrap()).await.unwrap();
        // garbage is dropped without disturbing the session
        z.broadcast(bytes::Bytes::from_static(b"{nope")).await.unwrap();

        let appended = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::TranscriptAppended { .. })
        })
        .await;
        let SessionEvent::TranscriptAppended { entry } = appended else {
            unreachable!()
        };
        assert_eq!(entry.sender_id, id("z"));
        assert_eq!(entry.timestamp, 42);
        assert!(!entry.is_final);
        assert_eq!(a.handle.transcript().len(), 1);
    }
}
