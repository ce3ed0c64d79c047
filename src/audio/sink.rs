//! Paced delivery of synthesized audio to the client.
//!
//! One consumer task per connection. Deliveries arrive in segment-index
//! order; each is bracketed by `sentence_start` / `sentence_end` control
//! messages, and the turn ends with a single `stop` once the last indexed
//! segment of a finished turn has played.

use crate::config::AudioConfig;
use crate::connection::ConnState;
use crate::messages::{OutboundMessage, TtsState};
use crate::pipeline::messages::{AudioDelivery, OutboundFrame};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

enum SegmentOutcome {
    Completed,
    Aborted,
}

/// Run the sink until the connection closes.
pub async fn run_audio_sink(
    config: AudioConfig,
    state: Arc<ConnState>,
    mut rx: mpsc::Receiver<AudioDelivery>,
    out_tx: mpsc::Sender<OutboundFrame>,
    stop_clip: Option<Vec<Vec<u8>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            delivery = rx.recv() => {
                let Some(delivery) = delivery else { break };
                if state.is_aborted() {
                    // The abort path already emitted `stop`; everything
                    // queued for this turn is stale.
                    debug!(index = delivery.index, "discarding delivery after barge-in");
                    drain(&mut rx);
                    continue;
                }
                deliver(&config, &state, &delivery, &mut rx, &out_tx, stop_clip.as_deref(), &cancel).await;
            }
        }
    }
}

async fn deliver(
    config: &AudioConfig,
    state: &ConnState,
    delivery: &AudioDelivery,
    rx: &mut mpsc::Receiver<AudioDelivery>,
    out_tx: &mpsc::Sender<OutboundFrame>,
    stop_clip: Option<&[Vec<u8>]>,
    cancel: &CancellationToken,
) {
    if delivery.index == state.first_index() {
        info!(text = ?delivery.text, "sending first audio segment of the turn");
    }

    send_control(
        out_tx,
        OutboundMessage::tts(TtsState::SentenceStart, delivery.text.clone(), state.session_id()),
    )
    .await;

    let outcome = pace_frames(config, state, &delivery.frames, out_tx).await;

    send_control(
        out_tx,
        OutboundMessage::tts(TtsState::SentenceEnd, delivery.text.clone(), state.session_id()),
    )
    .await;

    if matches!(outcome, SegmentOutcome::Aborted) {
        drain(rx);
        return;
    }

    // The model may still be streaming when the last queued segment has
    // played; wait for the turn to settle (or for a later segment to take
    // over the last index) before deciding on `stop`.
    while !state.llm_finished()
        && delivery.index == state.last_index()
        && !state.is_aborted()
        && !cancel.is_cancelled()
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Exactly one stop per turn: after the last indexed segment, once the
    // model has finished producing text.
    if state.llm_finished() && delivery.index >= 0 && delivery.index == state.last_index() {
        if let Some(clip) = stop_clip {
            let _ = pace_frames(config, state, clip, out_tx).await;
        }
        state.clear_speak_status();
        send_control(
            out_tx,
            OutboundMessage::tts(TtsState::Stop, None, state.session_id()),
        )
        .await;
        if state.close_after_turn() {
            let _ = out_tx.send(OutboundFrame::Close).await;
        }
    }
}

/// Send opus frames with flow control: a pre-buffer burst, then fixed-size
/// batches paced to the nominal frame duration.
async fn pace_frames(
    config: &AudioConfig,
    state: &ConnState,
    frames: &[Vec<u8>],
    out_tx: &mpsc::Sender<OutboundFrame>,
) -> SegmentOutcome {
    let frame_ms = config.frame_duration_ms;
    let base = Duration::from_millis(frame_ms);
    let start = Instant::now();
    let mut play_position_ms: u64 = 0;

    let pre_buffer = config.pre_buffer_frames.min(frames.len());
    for frame in &frames[..pre_buffer] {
        if out_tx.send(OutboundFrame::Audio(frame.clone())).await.is_err() {
            return SegmentOutcome::Completed;
        }
    }

    for batch in frames[pre_buffer..].chunks(config.batch_frames.max(1)) {
        if state.is_aborted() {
            return SegmentOutcome::Aborted;
        }

        if let Some(delay) = batch_delay(
            Duration::from_millis(play_position_ms),
            start.elapsed(),
            base,
        ) {
            tokio::time::sleep(delay).await;
        }

        for frame in batch {
            if out_tx.send(OutboundFrame::Audio(frame.clone())).await.is_err() {
                return SegmentOutcome::Completed;
            }
        }
        play_position_ms += frame_ms * batch.len() as u64;
    }

    SegmentOutcome::Completed
}

/// Delay before the next batch.
///
/// Targets the nominal play position; when the sender has slipped so far
/// behind that the computed wait exceeds 1.1x the frame duration, it skips
/// to 0.7x instead of amplifying the lag.
fn batch_delay(expected_elapsed: Duration, actual_elapsed: Duration, base: Duration) -> Option<Duration> {
    if actual_elapsed >= expected_elapsed {
        return None;
    }
    let delay = expected_elapsed - actual_elapsed;
    let max_delay = base.mul_f64(1.1);
    let min_delay = base.mul_f64(0.7);
    if delay > max_delay {
        Some(min_delay)
    } else {
        Some(delay)
    }
}

async fn send_control(out_tx: &mpsc::Sender<OutboundFrame>, message: OutboundMessage) {
    let _ = out_tx.send(OutboundFrame::Control(message.to_json())).await;
}

fn drain(rx: &mut mpsc::Receiver<AudioDelivery>) {
    while rx.try_recv().is_ok() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(60);

    #[test]
    fn no_delay_when_already_behind_schedule() {
        assert_eq!(
            batch_delay(Duration::from_millis(100), Duration::from_millis(150), BASE),
            None
        );
    }

    #[test]
    fn short_gaps_sleep_exactly_the_gap() {
        assert_eq!(
            batch_delay(Duration::from_millis(150), Duration::from_millis(120), BASE),
            Some(Duration::from_millis(30))
        );
    }

    #[test]
    fn excessive_gaps_collapse_to_the_minimum() {
        // 300ms ahead of schedule exceeds 1.1 * 60ms, so slip to 0.7 * 60ms.
        assert_eq!(
            batch_delay(Duration::from_millis(400), Duration::from_millis(100), BASE),
            Some(BASE.mul_f64(0.7))
        );
    }
}
