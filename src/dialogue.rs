//! Ordered message history for one connection.
//!
//! The dialogue is append-only with a single writer (the connection task).
//! The system message is special: at most one exists, always at index 0, and
//! updates mutate it in place.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCall {
    /// Correlation id, echoed back in the tool result message.
    pub id: String,
    /// Registered function name.
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them.
    pub arguments: String,
}

/// Message payload, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    /// Plain conversational text.
    Text(String),
    /// Assistant message that carries tool calls instead of text.
    ToolCalls(Vec<ToolCall>),
    /// Result of a tool invocation, keyed by the originating call id.
    ToolResult {
        call_id: String,
        content: String,
    },
}

/// Per-message metadata recorded alongside the content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMetadata {
    pub speaker_id: Option<String>,
    pub emotion: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub is_admin: bool,
}

/// An immutable record in the dialogue history.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message id.
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    pub metadata: MessageMetadata,
}

impl Message {
    fn new(role: Role, content: MessageContent, metadata: MessageMetadata) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            metadata,
        }
    }

    /// A user utterance.
    pub fn user(text: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self::new(Role::User, MessageContent::Text(text.into()), metadata)
    }

    /// An assistant reply.
    pub fn assistant(text: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self::new(Role::Assistant, MessageContent::Text(text.into()), metadata)
    }

    /// An assistant message carrying tool calls.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::new(
            Role::Assistant,
            MessageContent::ToolCalls(calls),
            MessageMetadata::default(),
        )
    }

    /// A tool result keyed by the originating call id.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            Role::Tool,
            MessageContent::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
            },
            MessageMetadata::default(),
        )
    }

    /// Textual content, when this message has any.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::ToolResult { content, .. } => Some(content),
            MessageContent::ToolCalls(_) => None,
        }
    }

    fn carries_tool_calls(&self) -> bool {
        matches!(self.content, MessageContent::ToolCalls(_))
    }
}

/// Wire-facing record handed to the LLM provider.
#[derive(Debug, Clone, Serialize)]
pub struct LlmMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl LlmMessage {
    fn from_message(m: &Message) -> Self {
        match &m.content {
            MessageContent::Text(t) => Self {
                role: m.role,
                content: Some(t.clone()),
                tool_calls: None,
                tool_call_id: None,
            },
            MessageContent::ToolCalls(calls) => Self {
                role: m.role,
                content: None,
                tool_calls: Some(calls.clone()),
                tool_call_id: None,
            },
            MessageContent::ToolResult { call_id, content } => Self {
                role: m.role,
                content: Some(content.clone()),
                tool_calls: None,
                tool_call_id: Some(call_id.clone()),
            },
        }
    }

    /// A plain record, used when building ad-hoc prompts.
    pub fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Nudges the model to place its first punctuation mark early, so the first
/// TTS segment is on the wire quickly.
const EARLY_PUNCTUATION_HINT: &str =
    "Open every reply with a very short clause: place the first punctuation \
     mark within the first four words.";

/// Ordered message history plus a rolling metadata view.
#[derive(Debug, Default)]
pub struct Dialogue {
    messages: Vec<Message>,
    last_speaker_id: Option<String>,
}

impl Dialogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a non-system message in insertion order.
    pub fn push(&mut self, message: Message) {
        debug_assert!(message.role != Role::System, "use set_system for the system prompt");
        if let Some(id) = &message.metadata.speaker_id {
            self.last_speaker_id = Some(id.clone());
        }
        self.messages.push(message);
    }

    /// Install or replace the system prompt. The message stays at index 0
    /// and is mutated in place on update.
    pub fn set_system(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => {
                first.content = MessageContent::Text(prompt);
            }
            _ => {
                self.messages.insert(
                    0,
                    Message::new(
                        Role::System,
                        MessageContent::Text(prompt),
                        MessageMetadata::default(),
                    ),
                );
            }
        }
    }

    /// All messages, in insertion order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages, system prompt included.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Speaker id of the most recent attributed message.
    pub fn last_speaker_id(&self) -> Option<&str> {
        self.last_speaker_id.as_deref()
    }

    /// The most recent user turns, newest last. Used by the proactive loop.
    pub fn recent_user_texts(&self, limit: usize) -> Vec<&str> {
        let mut texts: Vec<&str> = self
            .messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .filter_map(Message::text)
            .take(limit)
            .collect();
        texts.reverse();
        texts
    }

    /// Render the history for the LLM.
    ///
    /// Without memory context every message is mapped one-to-one. With
    /// memory context the system prompt is enriched (memory plus the
    /// early-punctuation hint) and tool traffic is filtered out, leaving
    /// only the conversational turns.
    pub fn llm_view(&self, memory_context: Option<&str>) -> Vec<LlmMessage> {
        let memory = memory_context.filter(|s| !s.is_empty());
        let Some(memory) = memory else {
            return self.messages.iter().map(LlmMessage::from_message).collect();
        };

        let mut view = Vec::with_capacity(self.messages.len());
        if let Some(system) = self
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .and_then(Message::text)
        {
            view.push(LlmMessage::plain(
                Role::System,
                format!("{system}\n\n{EARLY_PUNCTUATION_HINT}\n\nRelevant memory:\n{memory}\n"),
            ));
        }
        view.extend(
            self.messages
                .iter()
                .filter(|m| m.role != Role::System && m.role != Role::Tool)
                .filter(|m| !m.carries_tool_calls())
                .map(LlmMessage::from_message),
        );
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_is_single_and_updated_in_place() {
        let mut dialogue = Dialogue::new();
        dialogue.set_system("first");
        dialogue.push(Message::user("hi", MessageMetadata::default()));
        dialogue.set_system("second");

        assert_eq!(dialogue.len(), 2);
        assert_eq!(dialogue.messages()[0].text(), Some("second"));
        assert_eq!(dialogue.messages()[0].role, Role::System);
    }

    #[test]
    fn llm_view_preserves_roles_and_content() {
        let mut dialogue = Dialogue::new();
        dialogue.set_system("prompt");
        dialogue.push(Message::user("question", MessageMetadata::default()));
        dialogue.push(Message::tool_calls(vec![ToolCall {
            id: "call-1".to_owned(),
            name: "get_time".to_owned(),
            arguments: "{}".to_owned(),
        }]));
        dialogue.push(Message::tool_result("call-1", "14:05"));
        dialogue.push(Message::assistant("answer", MessageMetadata::default()));

        let view = dialogue.llm_view(None);
        assert_eq!(view.len(), 5);
        assert_eq!(view[1].content.as_deref(), Some("question"));
        let calls = view[2].tool_calls.as_ref().expect("tool calls present");
        assert_eq!(calls[0].name, "get_time");
        assert_eq!(view[3].tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(view[4].content.as_deref(), Some("answer"));
    }

    #[test]
    fn memory_view_filters_tool_traffic_and_enriches_system() {
        let mut dialogue = Dialogue::new();
        dialogue.set_system("prompt");
        dialogue.push(Message::user("question", MessageMetadata::default()));
        dialogue.push(Message::tool_calls(vec![ToolCall {
            id: "call-1".to_owned(),
            name: "get_time".to_owned(),
            arguments: "{}".to_owned(),
        }]));
        dialogue.push(Message::tool_result("call-1", "14:05"));
        dialogue.push(Message::assistant("answer", MessageMetadata::default()));

        let view = dialogue.llm_view(Some("user likes tea"));
        assert_eq!(view.len(), 3);
        assert!(view[0].content.as_deref().expect("system").contains("user likes tea"));
        assert!(view.iter().all(|m| m.tool_calls.is_none() && m.tool_call_id.is_none()));
    }

    #[test]
    fn empty_memory_context_is_the_plain_view() {
        let mut dialogue = Dialogue::new();
        dialogue.set_system("prompt");
        dialogue.push(Message::user("question", MessageMetadata::default()));
        let view = dialogue.llm_view(Some(""));
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].content.as_deref(), Some("prompt"));
    }

    #[test]
    fn recent_user_texts_returns_newest_last() {
        let mut dialogue = Dialogue::new();
        for text in ["one", "two", "three"] {
            dialogue.push(Message::user(text, MessageMetadata::default()));
            dialogue.push(Message::assistant("ok", MessageMetadata::default()));
        }
        assert_eq!(dialogue.recent_user_texts(2), vec!["two", "three"]);
    }
}
