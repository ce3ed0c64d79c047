//! Silence-triggered follow-ups.
//!
//! A cooperative per-connection task that wakes periodically and, when the
//! user has been quiet long enough after real interaction, asks the model
//! for one short follow-up line and plays it through the normal synthesis
//! path. Interest tracking biases the follow-up toward whatever the user
//! actually talks about.

use crate::connection::SessionShared;
use crate::dialogue::{Message, MessageMetadata, Role};
use crate::llm::LlmChunk;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ProactiveConfig;
use crate::connection::ConnState;

/// Topic buckets scanned in user turns. Keyword hits feed the interest
/// weights that steer follow-up prompts.
const TOPICS: &[(&str, &[&str])] = &[
    ("music", &["music", "song", "play", "音乐", "歌曲", "歌"]),
    ("news", &["news", "headline", "新闻", "时事", "热点"]),
    ("weather", &["weather", "rain", "temperature", "天气", "下雨", "温度"]),
    ("technology", &["tech", "technology", "ai", "科技", "技术", "创新"]),
    ("daily life", &["life", "today", "routine", "生活", "日常", "习惯"]),
];

/// Weighting between long-run interests and the recent window.
const HISTORICAL_WEIGHT: f32 = 0.6;
const RECENT_WEIGHT: f32 = 0.4;

/// Per-connection proactive state.
pub struct ProactiveDialogue {
    config: ProactiveConfig,
    last_interaction: Mutex<Instant>,
    last_fired: Mutex<Option<Instant>>,
    interaction_count: AtomicU32,
    historical_interests: Mutex<HashMap<&'static str, f32>>,
}

impl ProactiveDialogue {
    pub fn new(config: ProactiveConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            last_interaction: Mutex::new(Instant::now()),
            last_fired: Mutex::new(None),
            interaction_count: AtomicU32::new(0),
            historical_interests: Mutex::new(HashMap::new()),
        })
    }

    /// Record user activity without content (audio played, turn finished).
    pub fn touch(&self) {
        *lock(&self.last_interaction) = Instant::now();
    }

    /// Record one recognized user turn.
    pub fn note_interaction(&self, text: &str) {
        self.touch();
        self.interaction_count.fetch_add(1, Ordering::Relaxed);
        let mut interests = lock(&self.historical_interests);
        for (topic, hits) in score_topics(text) {
            *interests.entry(topic).or_insert(0.0) += hits;
        }
    }

    /// Reset after a role switch: the new persona starts from scratch.
    pub fn reset(&self) {
        self.interaction_count.store(0, Ordering::Relaxed);
        *lock(&self.last_fired) = Some(Instant::now());
    }

    /// All gating conditions for firing a follow-up.
    pub fn should_fire(&self, state: &ConnState) -> bool {
        if self.interaction_count.load(Ordering::Relaxed) < self.config.min_interaction_count {
            return false;
        }
        if lock(&self.last_interaction).elapsed().as_secs() < self.config.silence_threshold_secs {
            return false;
        }
        if let Some(fired) = *lock(&self.last_fired)
            && fired.elapsed().as_secs() < self.config.cooldown_secs
        {
            return false;
        }
        // Never talk over an in-flight turn.
        state.is_receiving()
    }

    pub fn mark_fired(&self) {
        *lock(&self.last_fired) = Some(Instant::now());
    }

    /// The topic with the highest combined interest, if any stands out.
    pub fn favorite_topic(&self, recent_texts: &[String]) -> Option<&'static str> {
        let mut recent: HashMap<&'static str, f32> = HashMap::new();
        for text in recent_texts {
            for (topic, hits) in score_topics(text) {
                *recent.entry(topic).or_insert(0.0) += hits;
            }
        }
        let historical = lock(&self.historical_interests);
        TOPICS
            .iter()
            .map(|(topic, _)| {
                let combined = historical.get(topic).copied().unwrap_or(0.0) * HISTORICAL_WEIGHT
                    + recent.get(topic).copied().unwrap_or(0.0) * RECENT_WEIGHT;
                (*topic, combined)
            })
            .filter(|(_, score)| *score > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(topic, _)| topic)
    }
}

fn score_topics(text: &str) -> Vec<(&'static str, f32)> {
    let lower = text.to_lowercase();
    TOPICS
        .iter()
        .filter_map(|(topic, keywords)| {
            let hits = keywords.iter().filter(|k| lower.contains(**k)).count();
            (hits > 0).then_some((*topic, hits as f32))
        })
        .collect()
}

/// Run the follow-up loop until the connection closes.
pub async fn run_proactive_loop(shared: Arc<SessionShared>) {
    let config = shared.config.proactive.clone();
    if !config.enabled {
        return;
    }
    let cancel = shared.cancel.clone();
    let interval = Duration::from_secs(config.silence_threshold_secs.max(1));

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        if cancel.is_cancelled() {
            break;
        }
        if !shared.proactive.should_fire(&shared.state) {
            continue;
        }
        if let Err(e) = fire_followup(&shared).await {
            warn!("proactive follow-up failed: {e}");
        }
    }
    debug!("proactive loop stopped");
}

async fn fire_followup(shared: &Arc<SessionShared>) -> crate::error::Result<()> {
    let recent: Vec<String> = {
        let dialogue = lock(&shared.dialogue);
        dialogue
            .recent_user_texts(shared.config.proactive.recent_window)
            .into_iter()
            .map(str::to_owned)
            .collect()
    };

    let speaker = shared.providers.memory.last_seen_speaker_id();
    let memory_extract = shared
        .providers
        .memory
        .query("", speaker.as_deref())
        .await
        .unwrap_or_default();
    let topic = shared.proactive.favorite_topic(&recent);

    let mut prompt = String::from(
        "The user has gone quiet for a while. Offer exactly one short, warm \
         follow-up sentence to gently restart the conversation. Do not ask \
         more than one question.",
    );
    if let Some(topic) = topic {
        prompt.push_str(&format!(" They seem interested in {topic}."));
    }
    if !recent.is_empty() {
        prompt.push_str("\nRecent things they said:\n");
        for text in &recent {
            prompt.push_str(&format!("- {text}\n"));
        }
    }
    if !memory_extract.is_empty() {
        prompt.push_str(&format!("\nWhat you remember about them:\n{memory_extract}\n"));
    }

    let messages = vec![crate::dialogue::LlmMessage::plain(Role::System, prompt)];
    let mut stream = shared
        .providers
        .llm
        .stream_chat(shared.state.session_id(), messages)
        .await?;

    let mut content = String::new();
    while let Some(chunk) = stream.next().await {
        let LlmChunk { content: piece, .. } = chunk?;
        if let Some(piece) = piece {
            content.push_str(&piece);
        }
    }
    let content = content.trim().to_owned();
    if content.is_empty() {
        return Ok(());
    }

    info!("proactive follow-up: {content:?}");

    // Reuse the session's slot; a dry pool just degrades to brackets.
    let _ = shared.pool.acquire(
        shared.state.session_id(),
        shared.audio_tx.clone(),
        &shared.current_voice(),
    );

    shared.send_turn_preamble(None).await;
    lock(&shared.dialogue).push(Message::assistant(content.as_str(), MessageMetadata::default()));
    shared.speak_direct(&content).await;
    shared.proactive.mark_fired();
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
