//! Error types for the dialogue server.

/// Top-level error type for the voice dialogue pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DialogueError {
    /// Connection handshake failed authentication.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Malformed or unexpected client frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Speech recognition error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Language model inference error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// No idle slot available in the TTS pool.
    #[error("TTS pool exhausted")]
    PoolExhausted,

    /// A provider call exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Long-lived upstream connection dropped mid-session.
    #[error("upstream connection closed: {0}")]
    UpstreamClosed(String),

    /// Tool invocation requested by the LLM failed.
    #[error("tool call error: {0}")]
    ToolCall(String),

    /// Memory / profile storage error.
    #[error("memory error: {0}")]
    Memory(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Anything that should never happen in a healthy process.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, DialogueError>;
