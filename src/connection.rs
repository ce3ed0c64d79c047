//! Per-connection session state and frame routing.
//!
//! One [`ConnectionHandler`] owns the read side of a client stream and the
//! VAD gate; everything the overlapping stages share (flags, dialogue,
//! provider handles) lives in [`SessionShared`] behind `Arc`s. A single
//! writer task owns the socket sink so control messages and audio frames
//! interleave on one ordered channel.

use crate::asr::AsrProvider;
use crate::config::ServerConfig;
use crate::device::DeviceStore;
use crate::dialogue::Dialogue;
use crate::error::Result;
use crate::intent::IntentRecognizer;
use crate::llm::LlmProvider;
use crate::memory::MemoryProvider;
use crate::messages::{InboundControl, ListenMode, OutboundMessage, TtsState};
use crate::pipeline;
use crate::pipeline::messages::{AudioDelivery, OutboundFrame, SynthesisJob};
use crate::plugins::FunctionRegistry;
use crate::proactive::ProactiveDialogue;
use crate::streamer::{PostTurnAction, ResponseStreamer};
use crate::tts::TtsPool;
use crate::vad::{UtteranceBuffer, VadGate};
use crate::voiceprint::VoiceprintProvider;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<TcpStream>;

/// Shared per-connection flags, read by every stage.
///
/// Colocated here so there is exactly one place the turn bookkeeping lives;
/// readers use atomics, never locks.
pub struct ConnState {
    session_id: String,
    device_id: Option<String>,
    client_abort: AtomicBool,
    receiving: AtomicBool,
    llm_finished: AtomicBool,
    first_text_index: AtomicI64,
    last_text_index: AtomicI64,
    close_after_turn: AtomicBool,
}

impl ConnState {
    pub fn new(session_id: String, device_id: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            device_id,
            client_abort: AtomicBool::new(false),
            receiving: AtomicBool::new(true),
            llm_finished: AtomicBool::new(true),
            first_text_index: AtomicI64::new(-1),
            last_text_index: AtomicI64::new(-1),
            close_after_turn: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn abort(&self) {
        self.client_abort.store(true, Ordering::Relaxed);
    }

    pub fn clear_abort(&self) {
        self.client_abort.store(false, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.client_abort.load(Ordering::Relaxed)
    }

    pub fn set_receiving(&self, receiving: bool) {
        self.receiving.store(receiving, Ordering::Relaxed);
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Relaxed)
    }

    /// Begin a new assistant turn: fresh index bookends, model running.
    pub fn start_turn(&self) {
        self.first_text_index.store(-1, Ordering::Relaxed);
        self.last_text_index.store(-1, Ordering::Relaxed);
        self.llm_finished.store(false, Ordering::Relaxed);
    }

    pub fn finish_llm(&self) {
        self.llm_finished.store(true, Ordering::Relaxed);
    }

    pub fn llm_finished(&self) -> bool {
        self.llm_finished.load(Ordering::Relaxed)
    }

    /// Track a dispatched segment: the first index of the turn is recorded
    /// once, the last follows every dispatch.
    pub fn record_segment(&self, index: i64) {
        let _ = self.first_text_index.compare_exchange(
            -1,
            index,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        self.last_text_index.store(index, Ordering::Relaxed);
    }

    pub fn first_index(&self) -> i64 {
        self.first_text_index.load(Ordering::Relaxed)
    }

    pub fn last_index(&self) -> i64 {
        self.last_text_index.load(Ordering::Relaxed)
    }

    /// Reset speak-state after a turn's `stop`: the server accepts audio
    /// again and the index bookends go back to their sentinels.
    pub fn clear_speak_status(&self) {
        self.set_receiving(true);
        self.first_text_index.store(-1, Ordering::Relaxed);
        self.last_text_index.store(-1, Ordering::Relaxed);
    }

    pub fn set_close_after_turn(&self) {
        self.close_after_turn.store(true, Ordering::Relaxed);
    }

    pub fn close_after_turn(&self) -> bool {
        self.close_after_turn.load(Ordering::Relaxed)
    }
}

/// The provider handles one connection consumes.
#[derive(Clone)]
pub struct Providers {
    pub asr: Arc<dyn AsrProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub memory: Arc<dyn MemoryProvider>,
    pub voiceprint: Option<Arc<dyn VoiceprintProvider>>,
}

/// The active role and its upstream voice.
#[derive(Debug, Clone)]
pub struct RoleState {
    pub name: String,
    pub voice: String,
}

/// Everything the per-connection stages share.
pub struct SessionShared {
    pub config: Arc<ServerConfig>,
    pub state: Arc<ConnState>,
    pub dialogue: Arc<Mutex<Dialogue>>,
    pub providers: Providers,
    pub intent: IntentRecognizer,
    pub registry: Arc<FunctionRegistry>,
    pub pool: Arc<TtsPool>,
    pub streamer: Arc<ResponseStreamer>,
    pub proactive: Arc<ProactiveDialogue>,
    pub devices: Arc<DeviceStore>,
    pub role: Mutex<RoleState>,
    pub out_tx: mpsc::Sender<OutboundFrame>,
    pub audio_tx: mpsc::Sender<AudioDelivery>,
    pub tts_tx: mpsc::Sender<SynthesisJob>,
    pub cancel: CancellationToken,
}

impl SessionShared {
    pub async fn send_control(&self, message: OutboundMessage) {
        let _ = self
            .out_tx
            .send(OutboundFrame::Control(message.to_json()))
            .await;
    }

    /// The `stt` / `llm` / `tts start` preamble of a turn. Recognized text
    /// is echoed when present (proactive and farewell turns skip it).
    pub async fn send_turn_preamble(&self, recognized: Option<&str>) {
        let session_id = self.state.session_id();
        self.send_control(OutboundMessage::tts(TtsState::Start, None, session_id))
            .await;
        if let Some(text) = recognized {
            let display = crate::streamer::strip_edge_punctuation(text);
            self.send_control(OutboundMessage::stt(&display, session_id)).await;
            self.send_control(OutboundMessage::emotion(session_id)).await;
        }
    }

    /// Speak one pre-composed line through the normal synthesis path,
    /// bypassing the model.
    pub async fn speak_direct(&self, text: &str) {
        self.state.start_turn();
        self.state.record_segment(1);
        let _ = self
            .tts_tx
            .send(SynthesisJob {
                text: text.to_owned(),
                index: 1,
            })
            .await;
        self.state.finish_llm();
    }

    /// Current voice for the upstream TTS slot.
    pub fn current_voice(&self) -> String {
        lock(&self.role).voice.clone()
    }

    /// Enroll the first identified voice on a fresh device as its owner.
    pub fn enroll_owner_if_missing(&self, speaker_id: Option<&str>) {
        let (Some(device_id), Some(speaker_id)) = (self.state.device_id(), speaker_id) else {
            return;
        };
        let mut config = self.devices.load_or_create(device_id);
        if config.owner_speaker_id.is_none() {
            config.owner_speaker_id = Some(speaker_id.to_owned());
            self.devices.save(device_id, &config);
            info!(device_id, speaker_id, "enrolled device owner");
        }
    }

    /// Whether this speaker is the enrolled device owner. Owner-only tools
    /// (role switching and friends) refuse everyone else.
    pub fn is_admin_speaker(&self, speaker_id: Option<&str>) -> bool {
        let (Some(device_id), Some(speaker_id)) = (self.state.device_id(), speaker_id) else {
            return false;
        };
        self.devices
            .load_or_create(device_id)
            .owner_speaker_id
            .as_deref()
            == Some(speaker_id)
    }

    /// Apply side effects a finished turn asked for.
    pub async fn apply_post_turn_actions(&self, actions: &[PostTurnAction]) {
        for action in actions {
            match action {
                PostTurnAction::SwitchRole { role } => self.switch_role(role).await,
            }
        }
    }

    /// Switch the active role: new system prompt, fresh dialogue, memory
    /// re-bound, voice updated, selection persisted.
    pub async fn switch_role(&self, role_name: &str) {
        let Some(role) = self.config.role(role_name).cloned() else {
            warn!("role {role_name:?} does not exist, keeping current role");
            return;
        };

        {
            let mut dialogue = lock(&self.dialogue);
            *dialogue = Dialogue::new();
            dialogue.set_system(role.rendered_prompt());
        }

        if let Err(e) = self
            .providers
            .memory
            .init(self.state.device_id(), &role.name)
            .await
        {
            warn!("memory re-init on role switch failed: {e}");
        }

        let voice = role
            .voice
            .clone()
            .unwrap_or_else(|| self.config.tts.voice.clone());
        {
            let mut state = lock(&self.role);
            state.name = role.name.clone();
            state.voice = voice.clone();
        }
        self.pool.set_voice(self.state.session_id(), &voice);
        self.proactive.reset();

        if let Some(device_id) = self.state.device_id() {
            let mut device_cfg = self.devices.load_or_create(device_id);
            device_cfg.current_role = Some(role.name.clone());
            self.devices.save(device_id, &device_cfg);
        }

        info!("switched role to {}", role.name);
    }

    /// Release everything the session owns. Safe to call on every exit path.
    pub async fn release(&self) {
        let messages = lock(&self.dialogue).messages().to_vec();
        if let Err(e) = self.providers.memory.save(&messages).await {
            warn!("memory flush on close failed: {e}");
        }
        self.pool.release(self.state.session_id()).await;
        self.cancel.cancel();
        info!(session_id = self.state.session_id(), "session resources released");
    }
}

/// Owns the read loop of one client connection.
pub struct ConnectionHandler {
    shared: Arc<SessionShared>,
    gate: VadGate,
    buffer: UtteranceBuffer,
    listen_mode: ListenMode,
    client_speaking: bool,
    no_voice_since: Option<Instant>,
}

impl ConnectionHandler {
    pub fn new(shared: Arc<SessionShared>, gate: VadGate) -> Self {
        Self {
            shared,
            gate,
            buffer: UtteranceBuffer::new(),
            listen_mode: ListenMode::Auto,
            client_speaking: false,
            no_voice_since: None,
        }
    }

    /// Route inbound frames until end-of-stream.
    pub async fn run(mut self, mut stream: futures_util::stream::SplitStream<WsStream>) {
        let cancel = self.shared.cancel.clone();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                message = stream.next() => {
                    let Some(message) = message else { break };
                    let message = match message {
                        Ok(m) => m,
                        Err(e) => {
                            info!("client stream error: {e}");
                            break;
                        }
                    };
                    match self.route(message).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            error!("frame handling failed: {e}");
                        }
                    }
                }
            }
        }

        self.shared.release().await;
    }

    /// Dispatch one frame. Returns `false` when the stream should end.
    async fn route(&mut self, message: Message) -> Result<bool> {
        match message {
            Message::Text(text) => {
                self.handle_text(&text).await;
                Ok(true)
            }
            Message::Binary(packet) => {
                self.handle_audio(packet).await;
                Ok(true)
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(true),
            Message::Close(_) => {
                info!("client closed the stream");
                Ok(false)
            }
        }
    }

    async fn handle_text(&mut self, raw: &str) {
        match InboundControl::parse(raw) {
            InboundControl::Abort => {
                info!("client barge-in");
                self.shared.state.abort();
                self.shared.state.clear_speak_status();
                self.shared
                    .send_control(OutboundMessage::tts(
                        TtsState::Stop,
                        None,
                        self.shared.state.session_id(),
                    ))
                    .await;
            }
            InboundControl::Listen { mode, speaking } => {
                self.listen_mode = mode;
                if let Some(speaking) = speaking {
                    self.client_speaking = speaking;
                    if !speaking
                        && mode == ListenMode::Manual
                        && self.buffer.len() >= self.shared.config.vad.min_utterance_frames
                    {
                        self.finish_utterance().await;
                    }
                }
            }
            InboundControl::Opaque(text) => {
                debug!("opaque client control message: {text}");
            }
        }
    }

    async fn handle_audio(&mut self, packet: Vec<u8>) {
        if !self.shared.state.is_receiving() {
            debug!("utterance in flight, dropping audio frame");
            return;
        }

        let have_voice = match self.listen_mode {
            ListenMode::Auto => self.gate.process_packet(&packet),
            ListenMode::Manual => {
                // The client reports voice boundaries itself; keep the gate
                // fed so its segment state stays coherent.
                let _ = self.gate.process_packet(&packet);
                self.client_speaking
            }
        };

        if !have_voice && !self.gate.have_voice() {
            self.check_no_voice_timeout().await;
            self.buffer
                .push_pre_roll(packet, self.shared.config.vad.pre_roll_frames);
            return;
        }

        self.no_voice_since = None;
        self.buffer.push(packet);

        if self.listen_mode == ListenMode::Auto && self.gate.voice_stop() {
            if self.buffer.len() < self.shared.config.vad.min_utterance_frames {
                // Too short to mean anything; stay in receive mode.
                self.buffer.clear();
                self.gate.reset();
                return;
            }
            self.finish_utterance().await;
        }
    }

    /// Hand the buffered utterance to the recognition pipeline. The
    /// pipeline owns the whole turn; it runs as its own task so the read
    /// loop keeps servicing barge-in controls meanwhile.
    async fn finish_utterance(&mut self) {
        self.shared.state.clear_abort();
        self.shared.state.set_receiving(false);

        let frames = self.buffer.take();
        self.gate.reset();

        tokio::spawn(pipeline::handle_utterance(Arc::clone(&self.shared), frames));
    }

    /// After long total silence, say goodbye and close once the farewell
    /// turn has played out.
    async fn check_no_voice_timeout(&mut self) {
        let limit = self.shared.config.server.close_connection_no_voice_secs;
        if limit == 0 || self.shared.state.close_after_turn() {
            return;
        }
        let since = *self.no_voice_since.get_or_insert_with(Instant::now);
        if since.elapsed().as_secs() < limit {
            return;
        }

        info!("no voice for {limit}s, starting farewell turn");
        self.shared.state.set_close_after_turn();
        self.shared.state.clear_abort();
        self.shared.state.set_receiving(false);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.send_turn_preamble(None).await;
            let summary = shared
                .streamer
                .run_turn(
                    "The user has been quiet for a while. Say a warm, brief goodbye.",
                    None,
                    None,
                    false,
                )
                .await;
            shared.apply_post_turn_actions(&summary.actions).await;
        });
    }
}

/// Write side of the socket: a single task owns the sink and drains the
/// outbound channel in order.
pub async fn run_writer(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let result = match frame {
                    OutboundFrame::Control(json) => sink.send(Message::Text(json)).await,
                    OutboundFrame::Audio(bytes) => sink.send(Message::Binary(bytes)).await,
                    OutboundFrame::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        cancel.cancel();
                        break;
                    }
                };
                if result.is_err() {
                    debug!("client write failed, stopping writer");
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// The synthesis dispatch loop: consumes segments in index order and routes
/// them to the session's pool slot. A failed segment still produces an
/// empty delivery so the sink's bracketing and stop bookkeeping hold.
pub async fn run_synthesis_dispatch(shared: Arc<SessionShared>, mut rx: mpsc::Receiver<SynthesisJob>) {
    let cancel = shared.cancel.clone();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            job = rx.recv() => {
                let Some(job) = job else { break };
                if shared.state.is_aborted() {
                    debug!(index = job.index, "skipping synthesis after barge-in");
                    continue;
                }
                let session_id = shared.state.session_id().to_owned();
                let fallback = AudioDelivery {
                    frames: Vec::new(),
                    text: Some(job.text.clone()),
                    index: job.index,
                };
                if let Err(e) = shared.pool.synthesize(&session_id, job).await {
                    warn!(%session_id, "synthesis failed, sending silent segment: {e}");
                    let _ = shared.audio_tx.send(fallback).await;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_segment_tracks_first_and_last() {
        let state = ConnState::new("s".to_owned(), None);
        assert_eq!(state.first_index(), -1);
        state.record_segment(1);
        state.record_segment(2);
        state.record_segment(3);
        assert_eq!(state.first_index(), 1);
        assert_eq!(state.last_index(), 3);
    }

    #[test]
    fn clear_speak_status_restores_receive_mode() {
        let state = ConnState::new("s".to_owned(), None);
        state.set_receiving(false);
        state.record_segment(4);
        state.clear_speak_status();
        assert!(state.is_receiving());
        assert_eq!(state.first_index(), -1);
        assert_eq!(state.last_index(), -1);
    }

    #[test]
    fn abort_flag_round_trips() {
        let state = ConnState::new("s".to_owned(), None);
        assert!(!state.is_aborted());
        state.abort();
        assert!(state.is_aborted());
        state.clear_abort();
        assert!(!state.is_aborted());
    }
}
