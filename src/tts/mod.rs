//! Shared pool of long-lived upstream TTS connections.
//!
//! Capacity is fixed; each dialogue session keys at most one slot. Acquire
//! is non-blocking (fail fast when the pool is dry) and an idle reaper gives
//! slots back aggressively, because they are the scarcest resource in the
//! process.

pub mod upstream;
pub mod wire;

use crate::audio::{self, FrameEncoder};
use crate::config::TtsConfig;
use crate::error::{DialogueError, Result};
use crate::pipeline::messages::{AudioDelivery, SynthesisJob};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use upstream::UpstreamTts;

/// The reusable part of a slot: the upstream connection, dialed lazily and
/// kept across sessions.
#[derive(Default)]
struct SlotCore {
    upstream: Option<UpstreamTts>,
}

/// A slot keyed to one dialogue session.
struct AcquiredSlot {
    core: tokio::sync::Mutex<SlotCore>,
    audio_tx: mpsc::Sender<AudioDelivery>,
    voice: Mutex<String>,
    last_used: Mutex<Instant>,
}

impl AcquiredSlot {
    fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    fn idle_for(&self) -> std::time::Duration {
        lock(&self.last_used).elapsed()
    }
}

struct PoolInner {
    idle: VecDeque<SlotCore>,
    in_use: HashMap<String, Arc<AcquiredSlot>>,
    draining: bool,
}

/// Process-wide TTS connection pool.
pub struct TtsPool {
    config: TtsConfig,
    inner: Mutex<PoolInner>,
}

impl TtsPool {
    pub fn new(config: TtsConfig) -> Arc<Self> {
        let mut idle = VecDeque::with_capacity(config.pool_capacity);
        for _ in 0..config.pool_capacity {
            idle.push_back(SlotCore::default());
        }
        info!("TTS pool ready with {} slots", config.pool_capacity);
        Arc::new(Self {
            config,
            inner: Mutex::new(PoolInner {
                idle,
                in_use: HashMap::new(),
                draining: false,
            }),
        })
    }

    /// Dial every idle slot up front so first turns don't pay the handshake.
    /// Failures are logged and left for lazy reconnection.
    pub async fn preconnect(&self) {
        let count = lock(&self.inner).idle.len();
        for _ in 0..count {
            let Some(mut core) = lock(&self.inner).idle.pop_front() else {
                break;
            };
            if core.upstream.is_none() {
                match UpstreamTts::connect(&self.config).await {
                    Ok(conn) => core.upstream = Some(conn),
                    Err(e) => warn!("TTS preconnect failed, slot stays lazy: {e}"),
                }
            }
            lock(&self.inner).idle.push_back(core);
        }
    }

    /// Key a slot to `session_id`, or refresh the one it already holds.
    ///
    /// # Errors
    ///
    /// `PoolExhausted` when no idle slot is available; callers degrade to a
    /// text-only turn and retry on the next utterance.
    pub fn acquire(
        &self,
        session_id: &str,
        audio_tx: mpsc::Sender<AudioDelivery>,
        voice: &str,
    ) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.draining {
            return Err(DialogueError::PoolExhausted);
        }
        if let Some(slot) = inner.in_use.get(session_id) {
            slot.touch();
            return Ok(());
        }
        let Some(core) = inner.idle.pop_front() else {
            warn!(session_id, "no idle TTS slot available");
            return Err(DialogueError::PoolExhausted);
        };
        inner.in_use.insert(
            session_id.to_owned(),
            Arc::new(AcquiredSlot {
                core: tokio::sync::Mutex::new(core),
                audio_tx,
                voice: Mutex::new(voice.to_owned()),
                last_used: Mutex::new(Instant::now()),
            }),
        );
        info!(session_id, "acquired TTS slot");
        Ok(())
    }

    /// Change the voice used by a session's slot.
    pub fn set_voice(&self, session_id: &str, voice: &str) {
        if let Some(slot) = lock(&self.inner).in_use.get(session_id) {
            *lock(&slot.voice) = voice.to_owned();
        }
    }

    /// Whether `session_id` currently holds a slot.
    pub fn is_acquired(&self, session_id: &str) -> bool {
        lock(&self.inner).in_use.contains_key(session_id)
    }

    /// Synthesize one segment on the session's slot and push the framed
    /// audio into the session's delivery queue.
    ///
    /// # Errors
    ///
    /// `Tts` when the session holds no slot, `UpstreamClosed` when the
    /// backend dropped mid-session (the slot reconnects for the next
    /// segment), `Timeout` past the per-segment deadline.
    pub async fn synthesize(&self, session_id: &str, job: SynthesisJob) -> Result<()> {
        let slot = lock(&self.inner)
            .in_use
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                DialogueError::Tts(format!("no TTS slot for session {session_id}"))
            })?;
        slot.touch();
        let voice = lock(&slot.voice).clone();

        let mut core = slot.core.lock().await;
        if core.upstream.is_none() {
            core.upstream = Some(UpstreamTts::connect(&self.config).await?);
        }
        let Some(conn) = core.upstream.as_mut() else {
            return Err(DialogueError::Internal("slot lost its connection".to_owned()));
        };

        let mp3 = match conn.synthesize(&job.text, &voice).await {
            Ok(mp3) => mp3,
            Err(DialogueError::UpstreamClosed(reason)) => {
                // Reconnect now so the next segment finds a live connection.
                core.upstream = None;
                match UpstreamTts::connect(&self.config).await {
                    Ok(fresh) => core.upstream = Some(fresh),
                    Err(e) => warn!("TTS slot reconnect failed: {e}"),
                }
                return Err(DialogueError::UpstreamClosed(reason));
            }
            Err(e) => return Err(e),
        };
        drop(core);
        slot.touch();

        let delivery = if mp3.is_empty() {
            AudioDelivery {
                frames: Vec::new(),
                text: Some(job.text),
                index: job.index,
            }
        } else {
            let pcm = audio::decode_mp3(mp3)?;
            let frames = FrameEncoder::new()?.frames(&pcm)?;
            AudioDelivery {
                frames,
                text: Some(job.text),
                index: job.index,
            }
        };

        slot.audio_tx
            .send(delivery)
            .await
            .map_err(|e| DialogueError::Channel(format!("audio queue closed: {e}")))
    }

    /// Detach the session's slot and return it to the idle queue. Waits for
    /// any in-flight synthesis to finish first.
    pub async fn release(&self, session_id: &str) {
        let slot = lock(&self.inner).in_use.remove(session_id);
        let Some(slot) = slot else { return };
        let upstream = slot.core.lock().await.upstream.take();
        lock(&self.inner).idle.push_back(SlotCore { upstream });
        info!(session_id, "released TTS slot");
    }

    /// One reaper pass: release keyed slots idle past the timeout, skipping
    /// any with a synthesis in flight.
    pub async fn reap_idle(&self) {
        let timeout = std::time::Duration::from_secs(self.config.idle_timeout_secs);
        let expired: Vec<String> = lock(&self.inner)
            .in_use
            .iter()
            .filter(|(_, slot)| slot.idle_for() > timeout && slot.core.try_lock().is_ok())
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in expired {
            info!(%session_id, "reaping idle TTS slot");
            self.release(&session_id).await;
        }
    }

    /// Run the idle reaper until cancelled.
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = std::time::Duration::from_secs(self.config.reap_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => pool.reap_idle().await,
                }
            }
            debug!("TTS pool reaper stopped");
        })
    }

    /// Drain the pool: no further acquires, idle connections closed.
    pub async fn shutdown(&self) {
        let cores: Vec<SlotCore> = {
            let mut inner = lock(&self.inner);
            inner.draining = true;
            inner.idle.drain(..).collect()
        };
        for core in cores {
            if let Some(conn) = core.upstream {
                conn.close().await;
            }
        }
        info!("TTS pool drained");
    }
}

/// Lock a std mutex, riding through poisoning: state behind these locks is
/// plain data that stays valid even if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_capacity(capacity: usize) -> Arc<TtsPool> {
        TtsPool::new(TtsConfig {
            pool_capacity: capacity,
            ..TtsConfig::default()
        })
    }

    fn audio_tx() -> mpsc::Sender<AudioDelivery> {
        mpsc::channel(8).0
    }

    #[tokio::test]
    async fn capacity_bounds_concurrent_sessions() {
        let pool = pool_with_capacity(2);
        assert!(pool.acquire("s1", audio_tx(), "v").is_ok());
        assert!(pool.acquire("s2", audio_tx(), "v").is_ok());
        assert!(matches!(
            pool.acquire("s3", audio_tx(), "v"),
            Err(DialogueError::PoolExhausted)
        ));

        pool.release("s1").await;
        assert!(pool.acquire("s3", audio_tx(), "v").is_ok());
    }

    #[tokio::test]
    async fn reacquire_by_same_session_does_not_consume_a_slot() {
        let pool = pool_with_capacity(1);
        assert!(pool.acquire("s1", audio_tx(), "v").is_ok());
        assert!(pool.acquire("s1", audio_tx(), "v").is_ok());
        assert!(pool.is_acquired("s1"));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = pool_with_capacity(1);
        assert!(pool.acquire("s1", audio_tx(), "v").is_ok());
        pool.release("s1").await;
        pool.release("s1").await;
        assert!(pool.acquire("s2", audio_tx(), "v").is_ok());
    }

    #[tokio::test]
    async fn reaper_reclaims_idle_slots() {
        let pool = TtsPool::new(TtsConfig {
            pool_capacity: 1,
            idle_timeout_secs: 0,
            ..TtsConfig::default()
        });
        assert!(pool.acquire("s1", audio_tx(), "v").is_ok());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        pool.reap_idle().await;
        assert!(!pool.is_acquired("s1"));
        assert!(pool.acquire("s2", audio_tx(), "v").is_ok());
    }

    #[tokio::test]
    async fn draining_pool_rejects_acquires() {
        let pool = pool_with_capacity(1);
        pool.shutdown().await;
        assert!(matches!(
            pool.acquire("s1", audio_tx(), "v"),
            Err(DialogueError::PoolExhausted)
        ));
    }

    #[tokio::test]
    async fn synthesize_without_slot_is_an_error() {
        let pool = pool_with_capacity(1);
        let result = pool
            .synthesize(
                "ghost",
                SynthesisJob {
                    text: "hi".to_owned(),
                    index: 1,
                },
            )
            .await;
        assert!(matches!(result, Err(DialogueError::Tts(_))));
    }
}
