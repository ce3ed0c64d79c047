//! WebSocket listener and session assembly.
//!
//! Accepts client streams, authenticates the handshake headers, and wires
//! up the per-connection task set: reader (frame router), writer, audio
//! sink, synthesis dispatch, and the proactive loop.

use crate::asr::{AsrProvider, HttpAsr};
use crate::audio;
use crate::config::ServerConfig;
use crate::connection::{
    ConnState, ConnectionHandler, Providers, RoleState, SessionShared, run_synthesis_dispatch,
    run_writer,
};
use crate::device::DeviceStore;
use crate::dialogue::Dialogue;
use crate::error::{DialogueError, Result};
use crate::intent::IntentRecognizer;
use crate::llm::LlmProvider;
use crate::llm::api::OpenAiLlm;
use crate::memory::{FileMemory, MemoryProvider};
use crate::messages::OutboundMessage;
use crate::pipeline::messages::{AudioDelivery, OutboundFrame, SynthesisJob};
use crate::plugins::{FunctionRegistry, builtin::register_builtins};
use crate::proactive::{ProactiveDialogue, run_proactive_loop};
use crate::streamer::ResponseStreamer;
use crate::tts::TtsPool;
use crate::vad::{EnergyDetector, VadGate};
use crate::voiceprint::{SpectralVoiceprint, VoiceprintProvider};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Per-connection channel capacities.
const OUTBOUND_CHANNEL_SIZE: usize = 256;
const DELIVERY_CHANNEL_SIZE: usize = 16;
const SYNTHESIS_CHANNEL_SIZE: usize = 8;

/// Headers captured during the WebSocket handshake.
#[derive(Debug, Default, Clone)]
struct HandshakeHeaders {
    device_id: Option<String>,
    authorization: Option<String>,
}

/// The dialogue server: shared providers plus the accept loop.
pub struct Server {
    config: Arc<ServerConfig>,
    pool: Arc<TtsPool>,
    asr: Arc<dyn AsrProvider>,
    llm: Arc<dyn LlmProvider>,
    voiceprint: Option<Arc<dyn VoiceprintProvider>>,
    devices: Arc<DeviceStore>,
    stop_clip: Option<Vec<Vec<u8>>>,
    cancel: CancellationToken,
}

impl Server {
    /// Build the shared provider set from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when a provider client cannot be constructed.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let asr: Arc<dyn AsrProvider> = Arc::new(HttpAsr::new(&config.asr)?);
        let llm: Arc<dyn LlmProvider> = Arc::new(OpenAiLlm::new(&config.llm)?);
        let voiceprint: Option<Arc<dyn VoiceprintProvider>> = config
            .voiceprint
            .enabled
            .then(|| -> Arc<dyn VoiceprintProvider> {
                Arc::new(SpectralVoiceprint::new(
                    &config.server.data_dir,
                    &config.voiceprint,
                ))
            });
        let devices = Arc::new(DeviceStore::new(&config.server.data_dir));
        let pool = TtsPool::new(config.tts.clone());
        let stop_clip = load_stop_clip(&config);

        Ok(Self {
            config: Arc::new(config),
            pool,
            asr,
            llm,
            voiceprint,
            devices,
            stop_clip,
            cancel: CancellationToken::new(),
        })
    }

    /// Token for coordinated shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept connections until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn run(&self) -> Result<()> {
        self.pool.preconnect().await;
        let _reaper = self.pool.spawn_reaper(self.cancel.child_token());

        let listener = TcpListener::bind(&self.config.server.bind_addr)
            .await
            .map_err(|e| {
                DialogueError::Config(format!(
                    "cannot bind {}: {e}",
                    self.config.server.bind_addr
                ))
            })?;
        info!("listening on {}", self.config.server.bind_addr);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let session = SessionDeps {
                                config: Arc::clone(&self.config),
                                pool: Arc::clone(&self.pool),
                                asr: Arc::clone(&self.asr),
                                llm: Arc::clone(&self.llm),
                                voiceprint: self.voiceprint.clone(),
                                devices: Arc::clone(&self.devices),
                                stop_clip: self.stop_clip.clone(),
                                cancel: self.cancel.child_token(),
                            };
                            tokio::spawn(async move {
                                handle_socket(session, stream, addr).await;
                            });
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
            }
        }

        self.pool.shutdown().await;
        info!("server stopped");
        Ok(())
    }
}

/// Everything a new connection needs from the server.
struct SessionDeps {
    config: Arc<ServerConfig>,
    pool: Arc<TtsPool>,
    asr: Arc<dyn AsrProvider>,
    llm: Arc<dyn LlmProvider>,
    voiceprint: Option<Arc<dyn VoiceprintProvider>>,
    devices: Arc<DeviceStore>,
    stop_clip: Option<Vec<Vec<u8>>>,
    cancel: CancellationToken,
}

async fn handle_socket(deps: SessionDeps, stream: TcpStream, addr: SocketAddr) {
    let captured = Arc::new(Mutex::new(HandshakeHeaders::default()));
    let capture = Arc::clone(&captured);
    let callback = move |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        let mut headers = capture.lock().unwrap_or_else(|e| e.into_inner());
        headers.device_id = header_string(request, "device-id");
        headers.authorization = header_string(request, "authorization");
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            info!(%addr, "handshake failed: {e}");
            return;
        }
    };
    let headers = captured.lock().unwrap_or_else(|e| e.into_inner()).clone();

    if !authorized(&deps.config, headers.authorization.as_deref()) {
        // No notification beyond the transport close.
        warn!(%addr, device_id = ?headers.device_id, "authentication failed, closing");
        return;
    }

    let session_id = Uuid::new_v4().to_string();
    info!(%addr, %session_id, device_id = ?headers.device_id, "connection accepted");

    if let Err(e) = run_session(deps, ws, session_id, headers.device_id).await {
        error!("session ended with error: {e}");
    }
}

async fn run_session(
    deps: SessionDeps,
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    session_id: String,
    device_id: Option<String>,
) -> Result<()> {
    let config = deps.config;
    let state = ConnState::new(session_id, device_id);

    // Role selection: the device's persisted choice, else the first
    // configured role.
    let device_cfg = state.device_id().map(|id| deps.devices.load_or_create(id));
    let role = device_cfg
        .as_ref()
        .and_then(|cfg| cfg.current_role.as_deref())
        .and_then(|name| config.role(name))
        .or_else(|| config.default_role())
        .cloned()
        .unwrap_or_else(|| crate::config::RoleConfig {
            name: "assistant".to_owned(),
            prompt: "You are a helpful voice assistant. Keep replies short and speakable."
                .to_owned(),
            voice: None,
        });
    let voice = role.voice.clone().unwrap_or_else(|| config.tts.voice.clone());

    let dialogue = Arc::new(Mutex::new(Dialogue::new()));
    {
        let mut guard = dialogue.lock().unwrap_or_else(|e| e.into_inner());
        guard.set_system(role.rendered_prompt());
    }

    let memory: Arc<dyn MemoryProvider> =
        Arc::new(FileMemory::new(&config.server.data_dir, &config.memory));
    memory.init(state.device_id(), &role.name).await?;

    let mut registry = FunctionRegistry::new();
    register_builtins(&mut registry);
    let registry = Arc::new(registry);

    let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_CHANNEL_SIZE);
    let (audio_tx, audio_rx) = mpsc::channel::<AudioDelivery>(DELIVERY_CHANNEL_SIZE);
    let (tts_tx, tts_rx) = mpsc::channel::<SynthesisJob>(SYNTHESIS_CHANNEL_SIZE);

    let providers = Providers {
        asr: deps.asr,
        llm: deps.llm,
        memory,
        voiceprint: deps.voiceprint,
    };

    let streamer = Arc::new(ResponseStreamer::new(
        Arc::clone(&state),
        Arc::clone(&dialogue),
        Arc::clone(&providers.llm),
        Arc::clone(&providers.memory),
        Arc::clone(&registry),
        tts_tx.clone(),
        config.llm.function_calling,
    ));

    let shared = Arc::new(SessionShared {
        config: Arc::clone(&config),
        state: Arc::clone(&state),
        dialogue,
        providers,
        intent: IntentRecognizer::new(&config.intent),
        registry,
        pool: deps.pool,
        streamer,
        proactive: ProactiveDialogue::new(config.proactive.clone()),
        devices: deps.devices,
        role: Mutex::new(RoleState {
            name: role.name.clone(),
            voice,
        }),
        out_tx,
        audio_tx,
        tts_tx,
        cancel: deps.cancel,
    });

    let (sink, read_stream) = ws.split();

    let writer = tokio::spawn(run_writer(sink, out_rx, shared.cancel.clone()));
    let audio_sink = tokio::spawn(crate::audio::sink::run_audio_sink(
        config.audio.clone(),
        Arc::clone(&state),
        audio_rx,
        shared.out_tx.clone(),
        deps.stop_clip,
        shared.cancel.clone(),
    ));
    let dispatch = tokio::spawn(run_synthesis_dispatch(Arc::clone(&shared), tts_rx));
    let proactive = tokio::spawn(run_proactive_loop(Arc::clone(&shared)));

    shared
        .send_control(OutboundMessage::hello(state.session_id()))
        .await;

    let gate = VadGate::new(config.vad.clone(), Box::new(EnergyDetector::new()))?;
    ConnectionHandler::new(Arc::clone(&shared), gate)
        .run(read_stream)
        .await;

    // The handler released session resources and cancelled the token; the
    // stage tasks unwind on their own.
    let _ = tokio::join!(writer, audio_sink, dispatch, proactive);
    info!(session_id = state.session_id(), "session closed");
    Ok(())
}

fn header_string(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Token allow-list auth. An empty list disables the check.
fn authorized(config: &ServerConfig, authorization: Option<&str>) -> bool {
    if config.server.auth_tokens.is_empty() {
        return true;
    }
    let Some(raw) = authorization else {
        return false;
    };
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw);
    config.server.auth_tokens.iter().any(|t| t == token)
}

/// Decode the configured stop-notify clip into downlink opus frames.
fn load_stop_clip(config: &ServerConfig) -> Option<Vec<Vec<u8>>> {
    let path = config.audio.stop_notify_clip.as_ref()?;
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("cannot read stop notify clip {}: {e}", path.display());
            return None;
        }
    };
    let pcm = match audio::decode_mp3(bytes) {
        Ok(pcm) => pcm,
        Err(e) => {
            warn!("cannot decode stop notify clip: {e}");
            return None;
        }
    };
    match audio::FrameEncoder::new().and_then(|mut enc| enc.frames(&pcm)) {
        Ok(frames) => Some(frames),
        Err(e) => {
            warn!("cannot encode stop notify clip: {e}");
            None
        }
    }
}
