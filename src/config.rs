//! Configuration types for the dialogue server.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener / transport settings.
    pub server: ListenConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Speech recognition settings.
    pub asr: AsrConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Text-to-speech backend and pool settings.
    pub tts: TtsConfig,
    /// Downlink audio pacing settings.
    pub audio: AudioConfig,
    /// Memory settings (per-device rolling short memory).
    pub memory: MemoryConfig,
    /// Speaker identification settings.
    pub voiceprint: VoiceprintConfig,
    /// User-intent shortcuts (exit commands and friends).
    pub intent: IntentConfig,
    /// Proactive follow-up settings.
    pub proactive: ProactiveConfig,
    /// Selectable assistant roles. The first entry is the default role.
    pub roles: Vec<RoleConfig>,
}

impl ServerConfig {
    /// Look up a role by name.
    pub fn role(&self, name: &str) -> Option<&RoleConfig> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// The default role: the persisted selection is resolved against this
    /// list, falling back to the first configured role.
    pub fn default_role(&self) -> Option<&RoleConfig> {
        self.roles.first()
    }
}

/// Listener / transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Bind address for the client WebSocket listener.
    pub bind_addr: String,
    /// Bearer tokens accepted during the handshake. Empty list disables auth.
    pub auth_tokens: Vec<String>,
    /// Seconds of total silence after which the connection says goodbye and
    /// closes. 0 disables.
    pub close_connection_no_voice_secs: u64,
    /// Root directory for per-device persisted state.
    pub data_dir: PathBuf,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_owned(),
            auth_tokens: Vec::new(),
            close_connection_no_voice_secs: 120,
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("selkie")
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Speech probability threshold. Chunks scoring at or above this value
    /// are classified as speech.
    pub threshold: f32,
    /// Minimum silence duration in ms to declare end of utterance.
    pub min_silence_duration_ms: u64,
    /// Opus frames of pre-roll retained while a segment has no speech yet,
    /// so the first syllable of the next utterance is not lost.
    pub pre_roll_frames: usize,
    /// Minimum buffered frames for an utterance to be worth recognizing.
    pub min_utterance_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_silence_duration_ms: 700,
            pre_roll_frames: 3,
            min_utterance_frames: 8,
        }
    }
}

/// Speech recognition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// Transcription endpoint (OpenAI-compatible `/v1/audio/transcriptions`).
    pub api_url: String,
    /// API key. Empty means no Authorization header.
    pub api_key: String,
    /// Model name passed to the endpoint.
    pub model: String,
    /// End-to-end recognition deadline in seconds.
    pub timeout_secs: u64,
    /// Directory where recognized utterances are archived as WAV, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<PathBuf>,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:9000".to_owned(),
            api_key: String::new(),
            model: "whisper-1".to_owned(),
            timeout_secs: 10,
            archive_dir: None,
        }
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions base URL.
    pub api_url: String,
    /// API key. Empty means no Authorization header.
    pub api_key: String,
    /// Model name.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling cutoff.
    pub top_p: f32,
    /// Response token budget.
    pub max_tokens: u32,
    /// Whether chat turns advertise registered functions to the model.
    pub function_calling: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434".to_owned(),
            api_key: String::new(),
            model: "qwen2.5:7b".to_owned(),
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 512,
            function_calling: true,
        }
    }
}

/// Text-to-speech backend and pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Upstream bidirectional TTS WebSocket URL.
    pub url: String,
    /// Application id sent in the upstream handshake headers.
    pub app_id: String,
    /// Access token sent in the upstream handshake headers.
    pub access_token: String,
    /// Default speaker voice, used until a role selects its own.
    pub voice: String,
    /// Audio container requested from the backend.
    pub audio_format: String,
    /// Sample rate requested from the backend.
    pub audio_sample_rate: u32,
    /// Number of long-lived upstream connections in the pool.
    pub pool_capacity: usize,
    /// Seconds an acquired slot may sit unused before the reaper reclaims it.
    pub idle_timeout_secs: u64,
    /// Reaper wake interval in seconds.
    pub reap_interval_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: "wss://openspeech.bytedance.com/api/v3/tts/bidirection".to_owned(),
            app_id: String::new(),
            access_token: String::new(),
            voice: "zh_female_shuangkuaisisi_moon_bigtts".to_owned(),
            audio_format: "mp3".to_owned(),
            audio_sample_rate: 24_000,
            pool_capacity: 3,
            // Slots are scarce; idle sessions give theirs back quickly.
            idle_timeout_secs: 3,
            reap_interval_secs: 3,
        }
    }
}

/// Downlink audio pacing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Downlink opus frame duration in ms.
    pub frame_duration_ms: u64,
    /// Frames sent immediately before pacing starts.
    pub pre_buffer_frames: usize,
    /// Frames per paced batch.
    pub batch_frames: usize,
    /// Optional notification clip (MP3) appended after the `stop` marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_notify_clip: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            frame_duration_ms: 60,
            pre_buffer_frames: 8,
            batch_frames: 3,
            stop_notify_clip: None,
        }
    }
}

/// Memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Rolling short-memory entries kept per speaker.
    pub short_memory_limit: usize,
    /// Entries of memory context injected into the system prompt.
    pub query_limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_memory_limit: 20,
            query_limit: 5,
        }
    }
}

/// Speaker identification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceprintConfig {
    /// Whether speaker identification runs at all.
    pub enabled: bool,
    /// Cosine similarity required to match an enrolled profile.
    pub similarity_threshold: f32,
    /// Identification deadline in ms; it must never hold up recognition.
    pub timeout_ms: u64,
    /// Unknown voices are enrolled automatically when true.
    pub auto_enroll: bool,
}

impl Default for VoiceprintConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            similarity_threshold: 0.82,
            timeout_ms: 1500,
            auto_enroll: true,
        }
    }
}

/// User-intent shortcut configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// Phrases that end the conversation without a chat round.
    pub exit_commands: Vec<String>,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            exit_commands: vec![
                "exit".to_owned(),
                "goodbye".to_owned(),
                "再见".to_owned(),
                "退出".to_owned(),
            ],
        }
    }
}

/// Proactive follow-up configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProactiveConfig {
    /// Whether the silence-triggered follow-up loop runs.
    pub enabled: bool,
    /// Seconds of silence before a follow-up may fire.
    pub silence_threshold_secs: u64,
    /// Minimum user interactions before the first follow-up.
    pub min_interaction_count: u32,
    /// Seconds between consecutive follow-ups.
    pub cooldown_secs: u64,
    /// Recent user turns included in the follow-up prompt.
    pub recent_window: usize,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            silence_threshold_secs: 60,
            min_interaction_count: 3,
            cooldown_secs: 300,
            recent_window: 5,
        }
    }
}

/// One selectable assistant role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    /// Role name, referenced by persisted device config and role switching.
    pub name: String,
    /// System prompt. `{{assistant_name}}` expands to the role name.
    pub prompt: String,
    /// Upstream TTS voice used while this role is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl RoleConfig {
    /// The system prompt with the assistant name substituted in.
    pub fn rendered_prompt(&self) -> String {
        self.prompt.replace("{{assistant_name}}", &self.name)
    }
}
