//! JSON control messages exchanged with the client over the audio stream.
//!
//! Outbound messages bracket recognition and synthesis so the device can
//! drive its own UI state machine. Inbound text is mostly opaque; the few
//! recognized control types gate listening and barge-in.

use serde::{Deserialize, Serialize};

/// Downlink audio parameters advertised in the `hello` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration: u64,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".to_owned(),
            sample_rate: 16_000,
            channels: 1,
            frame_duration: 60,
        }
    }
}

/// Synthesis bracketing state carried by `tts` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    SentenceEnd,
    Stop,
}

/// Server-to-client control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    /// Sent once after a successful handshake.
    Hello {
        session_id: String,
        transport: String,
        audio_params: AudioParams,
    },
    /// Recognized user text.
    Stt { text: String, session_id: String },
    /// Sentiment tag for the upcoming reply.
    Llm {
        text: String,
        emotion: String,
        session_id: String,
    },
    /// Synthesis bracketing.
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        session_id: String,
    },
}

impl OutboundMessage {
    pub fn hello(session_id: &str) -> Self {
        Self::Hello {
            session_id: session_id.to_owned(),
            transport: "websocket".to_owned(),
            audio_params: AudioParams::default(),
        }
    }

    pub fn stt(text: &str, session_id: &str) -> Self {
        Self::Stt {
            text: text.to_owned(),
            session_id: session_id.to_owned(),
        }
    }

    /// Sentiment placeholder, sent before the reply streams.
    pub fn emotion(session_id: &str) -> Self {
        Self::Llm {
            text: "\u{1F60A}".to_owned(),
            emotion: "happy".to_owned(),
            session_id: session_id.to_owned(),
        }
    }

    pub fn tts(state: TtsState, text: Option<String>, session_id: &str) -> Self {
        Self::Tts {
            state,
            text,
            session_id: session_id.to_owned(),
        }
    }

    /// Encode for the wire.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

/// Client listening mode reported via `listen` control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// Server-side VAD decides utterance boundaries.
    #[default]
    Auto,
    /// The client reports start/stop explicitly.
    Manual,
}

/// The inbound control messages the core recognizes. Anything else is
/// opaque and forwarded to the text handler as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundControl {
    /// Barge-in: stop the ongoing reply.
    Abort,
    /// Listening state report.
    Listen {
        mode: ListenMode,
        speaking: Option<bool>,
    },
    /// Unrecognized control message, kept verbatim.
    Opaque(String),
}

impl InboundControl {
    /// Classify one inbound text frame. Invalid JSON is opaque, not an error:
    /// the device firmware is allowed to send things the core does not know.
    pub fn parse(raw: &str) -> Self {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
            return Self::Opaque(raw.to_owned());
        };
        match value.get("type").and_then(|t| t.as_str()) {
            Some("abort") => Self::Abort,
            Some("listen") => {
                let mode = match value.get("mode").and_then(|m| m.as_str()) {
                    Some("manual") => ListenMode::Manual,
                    _ => ListenMode::Auto,
                };
                let speaking = match value.get("state").and_then(|s| s.as_str()) {
                    Some("start") => Some(true),
                    Some("stop") => Some(false),
                    _ => None,
                };
                Self::Listen { mode, speaking }
            }
            _ => Self::Opaque(raw.to_owned()),
        }
    }
}
