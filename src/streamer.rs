//! Drives one assistant turn: streams the model, slices the reply into
//! punctuation-bounded segments, dispatches them to synthesis in order, and
//! settles tool calls.
//!
//! Segment indices are strictly increasing within a turn and
//! `first_text_index` / `last_text_index` bookend the audio `stop`
//! signalling, so the sink can close the turn even when individual segments
//! fail to synthesize.

use crate::connection::ConnState;
use crate::dialogue::{Dialogue, Message, MessageMetadata, ToolCall};
use crate::error::DialogueError;
use crate::llm::{LlmProvider, ToolCallDelta};
use crate::memory::MemoryProvider;
use crate::pipeline::messages::SynthesisJob;
use crate::plugins::{FunctionRegistry, ToolAction, ToolContext};
use chrono::Utc;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Spoken when the model cannot be reached or produces nothing.
const APOLOGY: &str = "Sorry, I can't answer right now. Please try again in a moment.";

/// Spoken when a tool call arrives in a shape we cannot execute.
const TOOL_APOLOGY: &str = "Sorry, I couldn't complete that request.";

/// Punctuation that closes a speakable segment.
const BOUNDARIES: [char; 12] = ['。', '，', '？', '！', '；', '：', '.', ',', '?', '!', ';', ':'];

/// Characters that make a good early split point for the first segment.
const PIVOTS: [char; 8] = ['我', '你', '他', '的', '是', '她', '它', '有'];

/// Side effects the connection applies once the turn has fully settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostTurnAction {
    /// A tool asked to switch the active role.
    SwitchRole { role: String },
}

/// What one turn produced.
#[derive(Debug, Default)]
pub struct TurnSummary {
    /// Full assistant text, tool rounds concatenated.
    pub text: String,
    /// Deferred side effects for the connection.
    pub actions: Vec<PostTurnAction>,
}

/// Per-connection turn driver.
pub struct ResponseStreamer {
    state: Arc<ConnState>,
    dialogue: Arc<Mutex<Dialogue>>,
    llm: Arc<dyn LlmProvider>,
    memory: Arc<dyn MemoryProvider>,
    registry: Arc<FunctionRegistry>,
    tts_tx: mpsc::Sender<SynthesisJob>,
    function_calling: bool,
}

/// One round's worth of segment bookkeeping, shared across tool re-entries.
struct TurnCursor {
    text_index: i64,
}

/// Tool-call fragments accumulated while the model streams.
#[derive(Default)]
struct ToolCallDraft {
    seen: bool,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    /// Content that arrived after the first tool delta; some models put the
    /// whole call here as inline JSON.
    content: String,
}

impl ToolCallDraft {
    fn accumulate(&mut self, delta: &ToolCallDelta) {
        if let Some(id) = &delta.id {
            self.id = Some(id.clone());
        }
        if let Some(name) = &delta.name {
            self.name = Some(name.clone());
        }
        if let Some(arguments) = &delta.arguments {
            self.arguments.push_str(arguments);
        }
    }
}

enum RoundResult {
    /// Turn complete.
    Done,
    /// A tool asked for a follow-up model round with this query.
    Requery(String),
}

impl ResponseStreamer {
    pub fn new(
        state: Arc<ConnState>,
        dialogue: Arc<Mutex<Dialogue>>,
        llm: Arc<dyn LlmProvider>,
        memory: Arc<dyn MemoryProvider>,
        registry: Arc<FunctionRegistry>,
        tts_tx: mpsc::Sender<SynthesisJob>,
        function_calling: bool,
    ) -> Self {
        Self {
            state,
            dialogue,
            llm,
            memory,
            registry,
            tts_tx,
            function_calling,
        }
    }

    /// Run one user→assistant turn to completion.
    ///
    /// `is_admin` says whether `speaker_id` is the enrolled device owner;
    /// privileged tools refuse everyone else. Never fails outward: model
    /// and tool errors degrade into spoken apologies so the turn's `stop`
    /// envelope is always emitted.
    pub async fn run_turn(
        &self,
        query: &str,
        emotion: Option<&str>,
        speaker_id: Option<&str>,
        is_admin: bool,
    ) -> TurnSummary {
        let mut summary = TurnSummary::default();
        let mut cursor = TurnCursor { text_index: 0 };
        let context = ToolContext {
            speaker_id: speaker_id.map(str::to_owned),
            is_admin,
        };

        let mut pending = query.to_owned();
        let mut tool_round = false;
        loop {
            match self
                .chat_round(&pending, tool_round, emotion, &context, &mut cursor, &mut summary)
                .await
            {
                RoundResult::Done => break,
                RoundResult::Requery(next) => {
                    pending = next;
                    tool_round = true;
                }
            }
        }

        self.state.finish_llm();
        summary
    }

    async fn chat_round(
        &self,
        query: &str,
        tool_round: bool,
        emotion: Option<&str>,
        context: &ToolContext,
        cursor: &mut TurnCursor,
        summary: &mut TurnSummary,
    ) -> RoundResult {
        let metadata = MessageMetadata {
            speaker_id: context.speaker_id.clone(),
            emotion: emotion.map(str::to_owned),
            timestamp: Some(Utc::now()),
            is_admin: context.is_admin,
        };

        if !tool_round {
            lock(&self.dialogue).push(Message::user(query, metadata.clone()));
        }

        let memory_context = match self.memory.query(query, context.speaker_id.as_deref()).await {
            Ok(memory_context) => memory_context,
            Err(e) => {
                warn!("memory query failed, continuing without context: {e}");
                String::new()
            }
        };

        let messages = lock(&self.dialogue).llm_view(Some(&memory_context));
        let functions = self.registry.specs();
        let session_id = self.state.session_id().to_owned();

        let stream = if self.function_calling && !functions.is_empty() {
            self.llm
                .stream_chat_with_functions(&session_id, messages, &functions)
                .await
        } else {
            self.llm.stream_chat(&session_id, messages).await
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!(%session_id, "LLM open failed: {e}");
                self.speak_apology(cursor, summary, APOLOGY).await;
                return RoundResult::Done;
            }
        };

        // Accumulators for the round.
        let mut full_text: Vec<char> = Vec::new();
        let mut processed_chars = 0usize;
        let mut draft = ToolCallDraft::default();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    error!(%session_id, "LLM stream failed mid-turn: {e}");
                    break;
                }
            };

            if let Some(content) = &chunk.content
                && !content.is_empty()
            {
                if draft.seen {
                    draft.content.push_str(content);
                } else {
                    full_text.extend(content.chars());
                    if self.state.is_aborted() {
                        info!(%session_id, "barge-in: truncating model stream");
                        break;
                    }
                    processed_chars = self
                        .dispatch_ready_segments(&full_text, processed_chars, cursor)
                        .await;
                }
            }

            if let Some(delta) = &chunk.tool_call {
                draft.seen = true;
                draft.accumulate(delta);
                if let Some(content) = &chunk.content {
                    draft.content.push_str(content);
                }
            }
        }

        // Flush the tail, unless a barge-in cut the round short.
        if !self.state.is_aborted() && processed_chars < full_text.len() {
            let tail = strip_edge_punctuation(&chars_to_string(&full_text[processed_chars..]));
            if !tail.is_empty() {
                cursor.text_index += 1;
                self.dispatch(&tail, cursor.text_index).await;
            }
        }

        let round_text = chars_to_string(&full_text);
        if !round_text.is_empty() {
            if !summary.text.is_empty() {
                summary.text.push(' ');
            }
            summary.text.push_str(&round_text);
            lock(&self.dialogue).push(Message::assistant(round_text, metadata));
        }

        if self.state.is_aborted() {
            return RoundResult::Done;
        }

        if draft.seen {
            return self.settle_tool_call(draft, context, cursor, summary).await;
        }

        // A turn that produced nothing at all still owes the client a
        // closed envelope; apologize instead of leaving it hanging.
        if cursor.text_index == 0 && summary.text.is_empty() {
            self.speak_apology(cursor, summary, APOLOGY).await;
        }
        RoundResult::Done
    }

    /// Cut and dispatch every completed segment in `full_text` past
    /// `processed`. Returns the new processed offset (in chars).
    async fn dispatch_ready_segments(
        &self,
        full_text: &[char],
        processed: usize,
        cursor: &mut TurnCursor,
    ) -> usize {
        let unprocessed = &full_text[processed..];
        let Some(boundary) = rightmost_boundary(unprocessed) else {
            return processed;
        };

        let raw_len = boundary + 1;
        let segment = strip_edge_punctuation(&chars_to_string(&unprocessed[..raw_len]));
        if segment.is_empty() {
            return processed + raw_len;
        }

        cursor.text_index += 1;

        if self.state.first_index() == -1 {
            // First-segment fast path: put a short prefix on the wire before
            // the rest of the sentence finishes synthesizing.
            let segment_chars: Vec<char> = segment.chars().collect();
            let split = first_segment_split(&segment_chars, boundary);
            let head = chars_to_string(&segment_chars[..split.min(segment_chars.len())]);
            let rest = chars_to_string(&segment_chars[split.min(segment_chars.len())..]);

            self.dispatch(&head, cursor.text_index).await;
            if !rest.is_empty() {
                cursor.text_index += 1;
                self.dispatch(&rest, cursor.text_index).await;
            }
        } else {
            self.dispatch(&segment, cursor.text_index).await;
        }

        processed + raw_len
    }

    async fn settle_tool_call(
        &self,
        draft: ToolCallDraft,
        context: &ToolContext,
        cursor: &mut TurnCursor,
        summary: &mut TurnSummary,
    ) -> RoundResult {
        // Some models emit the call as inline JSON content instead of a
        // structured delta; recover it before giving up.
        let (id, name, arguments) = match (draft.id, draft.name) {
            (Some(id), Some(name)) => (id, name, draft.arguments),
            (id, name) => match extract_json_call(&draft.content) {
                Some((extracted_name, extracted_args)) => (
                    id.unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
                    name.unwrap_or(extracted_name),
                    extracted_args,
                ),
                None => {
                    error!("unparsable tool call: {:?}", draft.content);
                    self.speak_apology(cursor, summary, TOOL_APOLOGY).await;
                    return RoundResult::Done;
                }
            },
        };

        info!("settling tool call {name} ({id})");
        let calls = vec![ToolCall {
            id: id.clone(),
            name: name.clone(),
            arguments: arguments.clone(),
        }];

        match self.registry.invoke(&name, &arguments, context) {
            Ok(ToolAction::Respond(text)) => {
                cursor.text_index += 1;
                self.dispatch(&text, cursor.text_index).await;
                lock(&self.dialogue)
                    .push(Message::assistant(text.as_str(), MessageMetadata::default()));
                append_summary(summary, &text);
                RoundResult::Done
            }
            Ok(ToolAction::RequeryLlm(result)) => {
                let mut dialogue = lock(&self.dialogue);
                dialogue.push(Message::tool_calls(calls));
                dialogue.push(Message::tool_result(id.as_str(), result.as_str()));
                drop(dialogue);
                RoundResult::Requery(result)
            }
            Ok(ToolAction::Exit { farewell }) => {
                cursor.text_index += 1;
                self.dispatch(&farewell, cursor.text_index).await;
                lock(&self.dialogue)
                    .push(Message::assistant(farewell.as_str(), MessageMetadata::default()));
                append_summary(summary, &farewell);
                self.state.set_close_after_turn();
                RoundResult::Done
            }
            Ok(ToolAction::SwitchRole { role }) => {
                let confirmation = format!("Okay, switching to {role}.");
                cursor.text_index += 1;
                self.dispatch(&confirmation, cursor.text_index).await;
                lock(&self.dialogue)
                    .push(Message::assistant(confirmation.as_str(), MessageMetadata::default()));
                append_summary(summary, &confirmation);
                summary.actions.push(PostTurnAction::SwitchRole { role });
                RoundResult::Done
            }
            Err(e) => {
                // Surface the failure to the model and let it phrase the
                // recovery itself.
                let failure = match e {
                    DialogueError::ToolCall(reason) => reason,
                    other => other.to_string(),
                };
                warn!("tool call failed: {failure}");
                let mut dialogue = lock(&self.dialogue);
                dialogue.push(Message::tool_calls(calls));
                dialogue.push(Message::tool_result(id.as_str(), failure.as_str()));
                drop(dialogue);
                RoundResult::Requery(failure)
            }
        }
    }

    async fn speak_apology(&self, cursor: &mut TurnCursor, summary: &mut TurnSummary, text: &str) {
        cursor.text_index += 1;
        self.dispatch(text, cursor.text_index).await;
        lock(&self.dialogue).push(Message::assistant(text, MessageMetadata::default()));
        append_summary(summary, text);
    }

    async fn dispatch(&self, text: &str, index: i64) {
        self.state.record_segment(index);
        debug!(index, "dispatching segment: {text:?}");
        if self
            .tts_tx
            .send(SynthesisJob {
                text: text.to_owned(),
                index,
            })
            .await
            .is_err()
        {
            warn!("synthesis queue closed, segment {index} dropped");
        }
    }
}

fn append_summary(summary: &mut TurnSummary, text: &str) {
    if !summary.text.is_empty() {
        summary.text.push(' ');
    }
    summary.text.push_str(text);
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn chars_to_string(chars: &[char]) -> String {
    chars.iter().collect()
}

/// Rightmost boundary character position in `chars`, if any.
fn rightmost_boundary(chars: &[char]) -> Option<usize> {
    chars.iter().rposition(|c| BOUNDARIES.contains(c))
}

/// Trim punctuation, symbols, and whitespace from both ends, keeping the
/// speakable middle.
pub(crate) fn strip_edge_punctuation(text: &str) -> String {
    text.trim_matches(|c: char| !c.is_alphanumeric()).to_owned()
}

/// Split point for the first-segment fast path.
///
/// Starts from position 10, pulls in to the latest pivot character clamped
/// to [6, 10], and never reaches past the closing boundary.
fn first_segment_split(segment: &[char], boundary: usize) -> usize {
    let mut split = 10usize;
    let pivot_positions: Vec<usize> = PIVOTS
        .iter()
        .filter_map(|p| segment.iter().position(|c| c == p))
        .collect();
    if let Some(&latest) = pivot_positions.iter().max() {
        split = latest.clamp(6, 10);
    }
    split.min(boundary)
}

/// Recover a `{"name": ..., "arguments": ...}` call from inline content.
fn extract_json_call(content: &str) -> Option<(String, String)> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&content[start..=end]).ok()?;
    let name = value.get("name")?.as_str()?.to_owned();
    let arguments = value
        .get("arguments")
        .map(|a| {
            if a.is_string() {
                a.as_str().unwrap_or_default().to_owned()
            } else {
                a.to_string()
            }
        })
        .unwrap_or_else(|| "{}".to_owned());
    Some((name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(text: &str) -> Vec<char> {
        text.chars().collect()
    }

    #[test]
    fn rightmost_boundary_prefers_the_latest_punctuation() {
        assert_eq!(rightmost_boundary(&chars("你好，很高兴。见")), Some(6));
        assert_eq!(rightmost_boundary(&chars("no punctuation")), None);
    }

    #[test]
    fn strip_edge_punctuation_keeps_the_middle() {
        assert_eq!(strip_edge_punctuation("你好，很高兴。"), "你好，很高兴");
        assert_eq!(strip_edge_punctuation("  hi there! "), "hi there");
        assert_eq!(strip_edge_punctuation("？！。"), "");
    }

    #[test]
    fn first_split_defaults_to_ten_without_pivots() {
        let segment = chars("abcdefghijklmnop");
        assert_eq!(first_segment_split(&segment, 15), 10);
    }

    #[test]
    fn first_split_clamps_pivots_into_range() {
        // Pivot at position 2 clamps up to 6.
        let segment = chars("ab我cdefghijkl");
        assert_eq!(first_segment_split(&segment, 12), 6);
        // Pivot at position 12 clamps down to 10.
        let segment = chars("abcdefghijkl我mn");
        assert_eq!(first_segment_split(&segment, 14), 10);
        // Pivot at position 8 is used as-is.
        let segment = chars("abcdefgh我jklmn");
        assert_eq!(first_segment_split(&segment, 14), 8);
    }

    #[test]
    fn first_split_never_passes_the_boundary() {
        let segment = chars("abcdef");
        assert_eq!(first_segment_split(&segment, 4), 4);
    }

    #[test]
    fn json_call_is_recovered_from_inline_content() {
        let content = r#"I'll check. {"name": "get_time", "arguments": {"tz": "UTC"}}"#;
        let (name, args) = extract_json_call(content).expect("call");
        assert_eq!(name, "get_time");
        assert_eq!(args, r#"{"tz":"UTC"}"#);
        assert!(extract_json_call("no json here").is_none());
    }
}
