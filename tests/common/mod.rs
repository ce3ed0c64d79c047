#![allow(dead_code)]

//! Shared mock providers and session harness for the integration suites.

use async_trait::async_trait;
use selkie::config::ServerConfig;
use selkie::connection::{ConnState, Providers, RoleState, SessionShared};
use selkie::device::DeviceStore;
use selkie::dialogue::{Dialogue, LlmMessage, Message};
use selkie::error::{DialogueError, Result};
use selkie::intent::IntentRecognizer;
use selkie::llm::{ChunkStream, FunctionSpec, LlmChunk, LlmProvider, ToolCallDelta};
use selkie::memory::MemoryProvider;
use selkie::pipeline::messages::{AudioDelivery, OutboundFrame, SynthesisJob};
use selkie::plugins::FunctionRegistry;
use selkie::proactive::ProactiveDialogue;
use selkie::streamer::ResponseStreamer;
use selkie::tts::TtsPool;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One scripted model round: either a chunk sequence or an open failure.
pub type LlmRound = std::result::Result<Vec<LlmChunk>, String>;

/// LLM provider that replays scripted rounds.
pub struct MockLlm {
    rounds: Mutex<VecDeque<LlmRound>>,
}

impl MockLlm {
    pub fn new(rounds: Vec<LlmRound>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
        })
    }

    fn next_stream(&self) -> Result<ChunkStream> {
        let round = self
            .rounds
            .lock()
            .expect("mock lock")
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()));
        match round {
            Ok(chunks) => Ok(Box::pin(futures_util::stream::iter(
                chunks.into_iter().map(Ok::<LlmChunk, DialogueError>),
            ))),
            Err(message) => Err(DialogueError::Llm(message)),
        }
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn stream_chat(
        &self,
        _session_id: &str,
        _messages: Vec<LlmMessage>,
    ) -> Result<ChunkStream> {
        self.next_stream()
    }

    async fn stream_chat_with_functions(
        &self,
        _session_id: &str,
        _messages: Vec<LlmMessage>,
        _functions: &[FunctionSpec],
    ) -> Result<ChunkStream> {
        self.next_stream()
    }
}

/// Split `text` into single-character content chunks, the way a streaming
/// model trickles tokens.
pub fn content_chunks(text: &str) -> Vec<LlmChunk> {
    text.chars().map(|c| LlmChunk::text(c.to_string())).collect()
}

/// A tool-call delta chunk.
pub fn tool_chunk(id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> LlmChunk {
    LlmChunk {
        content: None,
        tool_call: Some(ToolCallDelta {
            id: id.map(str::to_owned),
            name: name.map(str::to_owned),
            arguments: arguments.map(str::to_owned),
        }),
    }
}

/// ASR provider that replays scripted transcripts.
pub struct MockAsr {
    transcripts: Mutex<VecDeque<String>>,
}

impl MockAsr {
    pub fn new(transcripts: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            transcripts: Mutex::new(transcripts.iter().map(|t| (*t).to_owned()).collect()),
        })
    }
}

#[async_trait]
impl selkie::asr::AsrProvider for MockAsr {
    async fn speech_to_text(
        &self,
        _frames: &[Vec<u8>],
        _session_id: &str,
    ) -> Result<(String, Option<PathBuf>)> {
        let text = self
            .transcripts
            .lock()
            .expect("mock lock")
            .pop_front()
            .unwrap_or_default();
        Ok((text, None))
    }
}

/// Memory provider that records appends and returns no context.
#[derive(Default)]
pub struct MockMemory {
    pub added: Mutex<Vec<String>>,
}

#[async_trait]
impl MemoryProvider for MockMemory {
    async fn init(&self, _device_id: Option<&str>, _role_id: &str) -> Result<()> {
        Ok(())
    }

    async fn query(&self, _query: &str, _speaker_id: Option<&str>) -> Result<String> {
        Ok(String::new())
    }

    async fn add(
        &self,
        text: &str,
        _metadata: serde_json::Value,
        _speaker_id: Option<&str>,
    ) -> Result<()> {
        self.added.lock().expect("mock lock").push(text.to_owned());
        Ok(())
    }

    async fn save(&self, _messages: &[Message]) -> Result<()> {
        Ok(())
    }

    fn last_seen_speaker_id(&self) -> Option<String> {
        None
    }
}

/// A fully wired session around mock providers, plus the receivers the
/// tests observe.
pub struct TestSession {
    pub shared: Arc<SessionShared>,
    pub out_rx: mpsc::Receiver<OutboundFrame>,
    pub data_dir: tempfile::TempDir,
}

/// Build a session harness. The synthesis dispatcher and audio sink run as
/// real tasks; the TTS pool points at a dead endpoint so every segment
/// degrades to a silent (bracket-only) delivery.
pub fn build_session(
    mut config: ServerConfig,
    asr: Arc<MockAsr>,
    llm: Arc<MockLlm>,
    registry: FunctionRegistry,
) -> TestSession {
    let data_dir = tempfile::tempdir().expect("tempdir");
    config.server.data_dir = data_dir.path().to_path_buf();
    // Dead endpoint: synthesis fails fast instead of dialling out.
    config.tts.url = "ws://127.0.0.1:9".to_owned();
    let config = Arc::new(config);

    let state = ConnState::new("test-session".to_owned(), Some("dev-1".to_owned()));
    let dialogue = Arc::new(Mutex::new(Dialogue::new()));
    dialogue
        .lock()
        .expect("dialogue lock")
        .set_system("You are a test assistant.");

    let memory: Arc<dyn MemoryProvider> = Arc::new(MockMemory::default());
    let registry = Arc::new(registry);
    let pool = TtsPool::new(config.tts.clone());

    let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(256);
    let (audio_tx, audio_rx) = mpsc::channel::<AudioDelivery>(16);
    let (tts_tx, tts_rx) = mpsc::channel::<SynthesisJob>(8);

    let providers = Providers {
        asr,
        llm,
        memory,
        voiceprint: None,
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
        pool,
        streamer,
        proactive: ProactiveDialogue::new(config.proactive.clone()),
        devices: Arc::new(DeviceStore::new(data_dir.path())),
        role: Mutex::new(RoleState {
            name: "test".to_owned(),
            voice: "test-voice".to_owned(),
        }),
        out_tx,
        audio_tx,
        tts_tx,
        cancel: CancellationToken::new(),
    });

    tokio::spawn(selkie::connection::run_synthesis_dispatch(
        Arc::clone(&shared),
        tts_rx,
    ));
    tokio::spawn(selkie::audio::sink::run_audio_sink(
        config.audio.clone(),
        state,
        audio_rx,
        shared.out_tx.clone(),
        None,
        shared.cancel.clone(),
    ));

    TestSession {
        shared,
        out_rx,
        data_dir,
    }
}

/// Collected control messages, parsed back from the outbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutEvent {
    Control(serde_json::Value),
    Audio(usize),
}

/// Drain outbound frames until a `tts stop` control arrives (or a timeout).
pub async fn collect_until_stop(out_rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<OutEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), out_rx.recv()).await {
            Ok(Some(OutboundFrame::Control(json))) => {
                let value: serde_json::Value = serde_json::from_str(&json).expect("control json");
                let is_stop = value["type"] == "tts" && value["state"] == "stop";
                events.push(OutEvent::Control(value));
                if is_stop {
                    break;
                }
            }
            Ok(Some(OutboundFrame::Audio(bytes))) => events.push(OutEvent::Audio(bytes.len())),
            Ok(Some(OutboundFrame::Close)) => break,
            Ok(None) | Err(_) => break,
        }
    }
    events
}

/// The `(type, state-or-text)` shape of every control message, for compact
/// sequence assertions.
pub fn control_shapes(events: &[OutEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            OutEvent::Control(value) => {
                let kind = value["type"].as_str().unwrap_or_default().to_owned();
                let detail = match kind.as_str() {
                    "tts" => value["state"].as_str().unwrap_or_default().to_owned(),
                    _ => value["text"].as_str().unwrap_or_default().to_owned(),
                };
                Some((kind, detail))
            }
            OutEvent::Audio(_) => None,
        })
        .collect()
}
