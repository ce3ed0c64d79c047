//! The utterance pipeline: everything that happens between end-of-speech
//! and the first synthesized reply.
//!
//! Recognition and speaker identification run concurrently; identification
//! is deadline-bounded so it can never hold the transcript back. A usable
//! transcript fans out into a fire-and-forget memory append and the chat
//! turn, which is awaited so the pipeline owns the whole group.

pub mod messages;

use crate::asr::meaningful_len;
use crate::connection::SessionShared;
use crate::error::DialogueError;
use crate::intent::IntentOutcome;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Spoken when an exit phrase shortcuts the turn.
const FAREWELL: &str = "Goodbye!";

/// Process one complete utterance. The caller has already flipped
/// `receiving` off; every early exit restores it, and the normal path hands
/// that duty to the audio sink's `stop` handling.
pub async fn handle_utterance(shared: Arc<SessionShared>, frames: Vec<Vec<u8>>) {
    let state = Arc::clone(&shared.state);
    let session_id = state.session_id().to_owned();

    // Key a pool slot for this turn. Exhaustion degrades the turn to
    // bracketing-only deliveries instead of blocking it.
    match shared
        .pool
        .acquire(&session_id, shared.audio_tx.clone(), &shared.current_voice())
    {
        Ok(()) => {}
        Err(DialogueError::PoolExhausted) => {
            warn!(%session_id, "TTS pool exhausted, turn degrades to text only");
        }
        Err(e) => warn!(%session_id, "TTS slot acquisition failed: {e}"),
    }

    // Recognition and speaker identification in parallel.
    let asr_future = shared.providers.asr.speech_to_text(&frames, &session_id);
    let speaker_future = identify_speaker(&shared, &frames);
    let (asr_result, speaker_id) = tokio::join!(asr_future, speaker_future);

    let (text, artifact) = match asr_result {
        Ok(result) => result,
        Err(e) => {
            // The utterance is lost but the dialogue is untouched; keep
            // listening.
            error!(%session_id, "ASR failed, discarding utterance: {e}");
            state.set_receiving(true);
            return;
        }
    };
    if let Some(path) = artifact {
        debug!(%session_id, "utterance archived at {}", path.display());
    }

    if meaningful_len(&text) == 0 {
        debug!(%session_id, "empty transcript, discarding utterance");
        state.set_receiving(true);
        return;
    }
    info!(%session_id, speaker = ?speaker_id, "utterance recognized: {text:?}");

    // Memory append never gates the reply.
    {
        let memory = Arc::clone(&shared.providers.memory);
        let entry = text.clone();
        let speaker = speaker_id.clone();
        let metadata = serde_json::json!({ "session_id": session_id.clone() });
        tokio::spawn(async move {
            if let Err(e) = memory.add(&entry, metadata, speaker.as_deref()).await {
                warn!("memory append failed: {e}");
            }
        });
    }

    shared.proactive.note_interaction(&text);
    if let Some(device_id) = state.device_id() {
        shared.devices.touch_last_chat(device_id);
    }

    // Owner bookkeeping: a fresh device adopts its first identified voice,
    // and owner-only tools key off the match.
    shared.enroll_owner_if_missing(speaker_id.as_deref());
    let is_admin = shared.is_admin_speaker(speaker_id.as_deref());

    // Intent shortcuts skip the model entirely.
    if let Some(IntentOutcome::Exit) = shared.intent.recognize(&text) {
        info!(%session_id, "exit intent, closing after farewell");
        state.set_close_after_turn();
        shared.send_turn_preamble(Some(&text)).await;
        shared.speak_direct(FAREWELL).await;
        return;
    }

    // The chat turn: preamble, then the streamer drives the rest.
    shared.send_turn_preamble(Some(&text)).await;
    state.start_turn();
    let summary = shared
        .streamer
        .run_turn(&text, None, speaker_id.as_deref(), is_admin)
        .await;
    shared.apply_post_turn_actions(&summary.actions).await;
    shared.proactive.touch();
}

/// Run speaker identification with its deadline, when configured.
async fn identify_speaker(shared: &SessionShared, frames: &[Vec<u8>]) -> Option<String> {
    let config = &shared.config.voiceprint;
    if !config.enabled {
        return None;
    }
    let provider = shared.providers.voiceprint.as_ref()?;
    let deadline = Duration::from_millis(config.timeout_ms);
    match tokio::time::timeout(
        deadline,
        provider.identify_speaker(frames, shared.state.device_id()),
    )
    .await
    {
        Ok(Ok(speaker)) => speaker,
        Ok(Err(e)) => {
            warn!("speaker identification failed: {e}");
            None
        }
        Err(_) => {
            warn!("speaker identification timed out after {deadline:?}");
            None
        }
    }
}
