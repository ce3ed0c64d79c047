//! OpenAI-compatible chat completions backend.
//!
//! Works against any server implementing the streaming chat completions
//! API: Ollama, vLLM, llama.cpp server, or the hosted endpoints. Responses
//! arrive as Server-Sent Events and are surfaced chunk by chunk.

use crate::config::LlmConfig;
use crate::dialogue::LlmMessage;
use crate::error::{DialogueError, Result};
use crate::llm::sse::SseParser;
use crate::llm::{ChunkStream, FunctionSpec, LlmChunk, LlmProvider, ToolCallDelta};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

/// Streaming chat provider over an OpenAI-compatible HTTP API.
pub struct OpenAiLlm {
    config: LlmConfig,
    client: reqwest::Client,
}

impl OpenAiLlm {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        // No total timeout: streamed completions legitimately run long.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DialogueError::Llm(format!("http client init failed: {e}")))?;
        info!("LLM configured: {} model={}", config.api_url, config.model);
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn completions_url(&self) -> String {
        let base = self.config.api_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        format!("{base}/v1/chat/completions")
    }

    async fn open_stream(
        &self,
        session_id: &str,
        messages: Vec<LlmMessage>,
        functions: Option<&[FunctionSpec]>,
    ) -> Result<ChunkStream> {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": true,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "max_tokens": self.config.max_tokens,
        });
        if let Some(functions) = functions.filter(|f| !f.is_empty()) {
            body["tools"] = functions
                .iter()
                .map(|spec| serde_json::json!({"type": "function", "function": spec}))
                .collect();
        }

        let mut request = self.client.post(self.completions_url()).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DialogueError::Llm(format!("chat request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(DialogueError::Llm(format!(
                "chat endpoint returned {}",
                response.status()
            )));
        }

        debug!(session_id, "chat stream open");
        let mut byte_stream = response.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut parser = SseParser::new();
            'read: while let Some(bytes) = byte_stream.next().await {
                let bytes = bytes
                    .map_err(|e| DialogueError::Llm(format!("chat stream read failed: {e}")))?;
                for event in parser.push(&bytes) {
                    if event.is_done() {
                        break 'read;
                    }
                    let value: serde_json::Value = serde_json::from_str(&event.data)
                        .map_err(|e| DialogueError::Llm(format!("chat chunk parse failed: {e}")))?;
                    let (chunk, finished) = parse_delta(&value);
                    if let Some(chunk) = chunk {
                        yield chunk;
                    }
                    if finished {
                        break 'read;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl LlmProvider for OpenAiLlm {
    async fn stream_chat(
        &self,
        session_id: &str,
        messages: Vec<LlmMessage>,
    ) -> Result<ChunkStream> {
        self.open_stream(session_id, messages, None).await
    }

    async fn stream_chat_with_functions(
        &self,
        session_id: &str,
        messages: Vec<LlmMessage>,
        functions: &[FunctionSpec],
    ) -> Result<ChunkStream> {
        self.open_stream(session_id, messages, Some(functions)).await
    }
}

/// Map one history record onto the chat completions wire shape.
fn wire_message(m: &LlmMessage) -> serde_json::Value {
    let mut obj = serde_json::json!({ "role": m.role });
    if let Some(content) = &m.content {
        obj["content"] = serde_json::Value::String(content.clone());
    }
    if let Some(calls) = &m.tool_calls {
        obj["tool_calls"] = calls
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments },
                })
            })
            .collect();
    }
    if let Some(id) = &m.tool_call_id {
        obj["tool_call_id"] = serde_json::Value::String(id.clone());
    }
    obj
}

/// Extract the interesting parts of one streamed delta.
fn parse_delta(value: &serde_json::Value) -> (Option<LlmChunk>, bool) {
    let choice = &value["choices"][0];
    let delta = &choice["delta"];

    let content = delta["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_owned);

    let tool_call = delta["tool_calls"][0].as_object().map(|call| ToolCallDelta {
        id: call.get("id").and_then(|v| v.as_str()).map(str::to_owned),
        name: call
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_owned),
        arguments: call
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(|v| v.as_str())
            .map(str::to_owned),
    });

    let finished = choice["finish_reason"].as_str().is_some();
    let chunk = if content.is_some() || tool_call.is_some() {
        Some(LlmChunk { content, tool_call })
    } else {
        None
    };
    (chunk, finished)
}
