//! Language model provider interface.
//!
//! A chat turn is a lazy, finite, non-restartable stream of chunks. The
//! response streamer is the single consumer; it slices content into TTS
//! segments and accumulates tool-call deltas.

pub mod api;
pub mod sse;

use crate::dialogue::LlmMessage;
use crate::error::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Incremental piece of a tool invocation. Providers emit the id and name
/// early and the arguments as concatenable fragments.
#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One streamed piece of a chat response.
#[derive(Debug, Clone, Default)]
pub struct LlmChunk {
    /// Text fragment, when the model is speaking.
    pub content: Option<String>,
    /// Tool-call fragment, when the model is calling a function.
    pub tool_call: Option<ToolCallDelta>,
}

impl LlmChunk {
    /// A plain content chunk. Handy for mocks and canned replies.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_call: None,
        }
    }
}

/// The streamed response: lazy, finite, single-consumer.
pub type ChunkStream = BoxStream<'static, Result<LlmChunk>>;

/// Function descriptor advertised to the model, in the provider's wire
/// schema (name / description / JSON-schema parameters).
pub type FunctionSpec = serde_json::Value;

/// Streaming chat provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Open a streaming chat completion.
    async fn stream_chat(&self, session_id: &str, messages: Vec<LlmMessage>)
    -> Result<ChunkStream>;

    /// Open a streaming chat completion with function calling enabled.
    async fn stream_chat_with_functions(
        &self,
        session_id: &str,
        messages: Vec<LlmMessage>,
        functions: &[FunctionSpec],
    ) -> Result<ChunkStream>;
}
