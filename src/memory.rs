//! Rolling conversational memory, persisted per device and role.
//!
//! The orchestrator only ever talks to [`MemoryProvider`]; the bundled
//! implementation keeps a bounded JSON blob per device/role pair with
//! per-speaker entries and interaction stats. Good enough to make replies
//! feel continuous across sessions without a vector store.

use crate::dialogue::{Message, Role};
use crate::error::{DialogueError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Memory interface consumed by the orchestrator.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    /// Bind the store to a device and role. Called at session start and on
    /// role switches.
    async fn init(&self, device_id: Option<&str>, role_id: &str) -> Result<()>;

    /// Fetch memory context for a prompt. Returns an empty string when
    /// nothing relevant is stored.
    async fn query(&self, query: &str, speaker_id: Option<&str>) -> Result<String>;

    /// Record one user utterance. Fire-and-forget from the pipeline's view.
    async fn add(
        &self,
        text: &str,
        metadata: serde_json::Value,
        speaker_id: Option<&str>,
    ) -> Result<()>;

    /// Flush a dialogue into long-lived storage. Called at session close.
    async fn save(&self, messages: &[Message]) -> Result<()>;

    /// Speaker most recently seen by this store, across sessions.
    fn last_seen_speaker_id(&self) -> Option<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemoryEntry {
    timestamp: i64,
    text: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SpeakerMemory {
    created_at: i64,
    last_seen: i64,
    interaction_count: u64,
    entries: Vec<MemoryEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryBlob {
    speakers: HashMap<String, SpeakerMemory>,
    global: Vec<MemoryEntry>,
    last_seen_speaker_id: Option<String>,
}

#[derive(Debug, Default)]
struct FileMemoryState {
    path: Option<PathBuf>,
    blob: MemoryBlob,
}

/// JSON-file-backed memory store.
pub struct FileMemory {
    root: PathBuf,
    short_memory_limit: usize,
    query_limit: usize,
    state: Mutex<FileMemoryState>,
}

impl FileMemory {
    pub fn new(root: impl Into<PathBuf>, config: &crate::config::MemoryConfig) -> Self {
        Self {
            root: root.into(),
            short_memory_limit: config.short_memory_limit,
            query_limit: config.query_limit,
            state: Mutex::new(FileMemoryState::default()),
        }
    }

    fn blob_path(&self, device_id: Option<&str>, role_id: &str) -> PathBuf {
        let device = device_id.unwrap_or("default");
        self.root
            .join("memory")
            .join(sanitize(device))
            .join(format!("{}.json", sanitize(role_id)))
    }

    fn load_blob(path: &Path) -> MemoryBlob {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("memory blob at {} is corrupt, starting fresh: {e}", path.display());
                MemoryBlob::default()
            }),
            Err(_) => MemoryBlob::default(),
        }
    }

    fn persist(path: &Path, blob: &MemoryBlob) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(blob)
            .map_err(|e| DialogueError::Memory(format!("memory encode failed: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FileMemoryState> {
        // A poisoned lock means another thread panicked mid-update; the blob
        // is still structurally valid, so keep serving.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MemoryProvider for FileMemory {
    async fn init(&self, device_id: Option<&str>, role_id: &str) -> Result<()> {
        let path = self.blob_path(device_id, role_id);
        let mut state = self.lock();
        state.blob = Self::load_blob(&path);
        state.path = Some(path);
        Ok(())
    }

    async fn query(&self, query: &str, speaker_id: Option<&str>) -> Result<String> {
        let state = self.lock();
        let mut lines: Vec<String> = Vec::new();

        // Naive relevance: entries sharing a token with the query first,
        // then recency fills the remainder.
        let query_lower = query.to_lowercase();
        let mut pick = |entries: &[MemoryEntry]| {
            let mut chosen: Vec<&MemoryEntry> = entries
                .iter()
                .rev()
                .filter(|e| {
                    !query_lower.is_empty()
                        && query_lower
                            .split_whitespace()
                            .any(|tok| tok.chars().count() > 1 && e.text.to_lowercase().contains(tok))
                })
                .take(self.query_limit)
                .collect();
            for entry in entries.iter().rev() {
                if chosen.len() >= self.query_limit {
                    break;
                }
                if !chosen.iter().any(|c| std::ptr::eq(*c, entry)) {
                    chosen.push(entry);
                }
            }
            for entry in chosen {
                lines.push(format!("- {}", entry.text));
            }
        };

        pick(&state.blob.global);
        if let Some(id) = speaker_id
            && let Some(speaker) = state.blob.speakers.get(id)
        {
            pick(&speaker.entries);
        }

        Ok(lines.join("\n"))
    }

    async fn add(
        &self,
        text: &str,
        metadata: serde_json::Value,
        speaker_id: Option<&str>,
    ) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let entry = MemoryEntry {
            timestamp: now,
            text: text.to_owned(),
            metadata,
        };

        let mut state = self.lock();
        let limit = self.short_memory_limit;
        match speaker_id {
            Some(id) => {
                state.blob.last_seen_speaker_id = Some(id.to_owned());
                let speaker = state
                    .blob
                    .speakers
                    .entry(id.to_owned())
                    .or_insert_with(|| SpeakerMemory {
                        created_at: now,
                        ..SpeakerMemory::default()
                    });
                speaker.last_seen = now;
                speaker.interaction_count += 1;
                speaker.entries.push(entry);
                if speaker.entries.len() > limit {
                    let excess = speaker.entries.len() - limit;
                    speaker.entries.drain(..excess);
                }
            }
            None => {
                state.blob.global.push(entry);
                if state.blob.global.len() > limit {
                    let excess = state.blob.global.len() - limit;
                    state.blob.global.drain(..excess);
                }
            }
        }

        if let Some(path) = state.path.clone()
            && let Err(e) = Self::persist(&path, &state.blob)
        {
            debug!("memory persist failed (will retry on next write): {e}");
        }
        Ok(())
    }

    async fn save(&self, messages: &[Message]) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut state = self.lock();
        for message in messages {
            let Some(text) = message.text() else { continue };
            if text.trim().is_empty() {
                continue;
            }
            let prefix = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                _ => continue,
            };
            state.blob.global.push(MemoryEntry {
                timestamp: now,
                text: format!("{prefix}: {text}"),
                metadata: serde_json::Value::Null,
            });
        }
        let limit = self.short_memory_limit;
        if state.blob.global.len() > limit {
            let excess = state.blob.global.len() - limit;
            state.blob.global.drain(..excess);
        }

        let Some(path) = state.path.clone() else {
            return Ok(());
        };
        Self::persist(&path, &state.blob)
    }

    fn last_seen_speaker_id(&self) -> Option<String> {
        self.lock().blob.last_seen_speaker_id.clone()
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
