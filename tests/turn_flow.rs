//! Response streamer scenarios: segment ordering, barge-in, tool calls.
//!
//! A fake synthesizer stands in for the TTS pool, turning every dispatched
//! segment into a fixed number of dummy opus frames so the sink's pacing
//! and bracketing run for real.

mod common;

use common::*;
use selkie::config::AudioConfig;
use selkie::connection::ConnState;
use selkie::dialogue::{Dialogue, MessageContent, Role};
use selkie::memory::MemoryProvider;
use selkie::pipeline::messages::{AudioDelivery, OutboundFrame, SynthesisJob};
use selkie::plugins::{FunctionRegistry, ToolAction};
use selkie::streamer::ResponseStreamer;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct TurnHarness {
    state: Arc<ConnState>,
    dialogue: Arc<Mutex<Dialogue>>,
    streamer: Arc<ResponseStreamer>,
    out_rx: mpsc::Receiver<OutboundFrame>,
    out_tx: mpsc::Sender<OutboundFrame>,
    jobs: Arc<Mutex<Vec<(i64, String)>>>,
}

/// Wire a streamer to a fake synthesizer and a real audio sink.
fn build_turn_harness(
    llm: Arc<MockLlm>,
    registry: FunctionRegistry,
    frames_per_segment: usize,
) -> TurnHarness {
    let state = ConnState::new("turn-test".to_owned(), None);
    let dialogue = Arc::new(Mutex::new(Dialogue::new()));
    dialogue
        .lock()
        .expect("dialogue lock")
        .set_system("You are a test assistant.");

    let memory: Arc<dyn MemoryProvider> = Arc::new(MockMemory::default());
    let registry = Arc::new(registry);
    let function_calling = !registry.is_empty();

    let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(1024);
    let (audio_tx, audio_rx) = mpsc::channel::<AudioDelivery>(16);
    let (tts_tx, mut tts_rx) = mpsc::channel::<SynthesisJob>(8);

    let jobs = Arc::new(Mutex::new(Vec::new()));

    // Fake synthesizer: every job becomes dummy frames, order preserved.
    {
        let jobs = Arc::clone(&jobs);
        let audio_tx = audio_tx.clone();
        tokio::spawn(async move {
            while let Some(job) = tts_rx.recv().await {
                jobs.lock().expect("jobs lock").push((job.index, job.text.clone()));
                let delivery = AudioDelivery {
                    frames: vec![vec![0u8; 32]; frames_per_segment],
                    text: Some(job.text),
                    index: job.index,
                };
                if audio_tx.send(delivery).await.is_err() {
                    break;
                }
            }
        });
    }

    tokio::spawn(selkie::audio::sink::run_audio_sink(
        AudioConfig::default(),
        Arc::clone(&state),
        audio_rx,
        out_tx.clone(),
        None,
        CancellationToken::new(),
    ));

    let streamer = Arc::new(ResponseStreamer::new(
        Arc::clone(&state),
        Arc::clone(&dialogue),
        llm,
        memory,
        registry,
        tts_tx,
        function_calling,
    ));

    TurnHarness {
        state,
        dialogue,
        streamer,
        out_rx,
        out_tx,
        jobs,
    }
}

#[tokio::test]
async fn segment_indices_form_a_strictly_increasing_prefix() {
    let llm = MockLlm::new(vec![Ok(content_chunks(
        "First thought. Second thought. Third one, with a clause. Done!",
    ))]);
    let mut harness = build_turn_harness(llm, FunctionRegistry::new(), 2);

    harness.state.start_turn();
    harness.streamer.run_turn("go", None, None, false).await;

    let events = collect_until_stop(&mut harness.out_rx).await;
    assert_eq!(
        control_shapes(&events).last().map(|s| s.1.clone()),
        Some("stop".to_owned())
    );

    let jobs = harness.jobs.lock().expect("jobs lock");
    let indices: Vec<i64> = jobs.iter().map(|(i, _)| *i).collect();
    let expected: Vec<i64> = (1..=indices.len() as i64).collect();
    assert_eq!(indices, expected);
    assert!(jobs.len() >= 4);
}

#[tokio::test]
async fn one_stop_follows_every_sentence_end() {
    let llm = MockLlm::new(vec![Ok(content_chunks("你好，很高兴见到你。"))]);
    let mut harness = build_turn_harness(llm, FunctionRegistry::new(), 3);

    harness.state.start_turn();
    harness.streamer.run_turn("你好", None, None, false).await;

    let events = collect_until_stop(&mut harness.out_rx).await;
    let shapes = control_shapes(&events);

    let stops = shapes.iter().filter(|s| s.1 == "stop").count();
    assert_eq!(stops, 1);
    let last_sentence_end = shapes.iter().rposition(|s| s.1 == "sentence_end");
    let stop_pos = shapes.iter().rposition(|s| s.1 == "stop");
    assert!(last_sentence_end < stop_pos);

    // Each delivery emitted its frames between its brackets.
    let audio_frames = events.iter().filter(|e| matches!(e, OutEvent::Audio(_))).count();
    assert_eq!(audio_frames, 6);
}

#[tokio::test]
async fn barge_in_cuts_audio_within_one_batch() {
    let llm = MockLlm::new(vec![Ok(content_chunks("你好，很高兴见到你。"))]);
    // Enough frames that the second segment is still pacing when we abort.
    let mut harness = build_turn_harness(llm, FunctionRegistry::new(), 40);

    harness.state.start_turn();
    harness.streamer.run_turn("你好", None, None, false).await;
    let full_text = {
        let dialogue = harness.dialogue.lock().expect("dialogue");
        dialogue.messages().last().expect("assistant").text().expect("text").to_owned()
    };

    // Watch the downlink; abort mid-playback of the second segment, well
    // past its pre-buffer burst.
    let mut aborted = false;
    let mut frames_after_abort = 0usize;
    let mut saw_stop = false;
    let mut sentence_starts = 0usize;
    let mut segment2_frames = 0usize;
    loop {
        let event = match tokio::time::timeout(Duration::from_secs(10), harness.out_rx.recv()).await
        {
            Ok(Some(event)) => event,
            _ => break,
        };
        match &event {
            OutboundFrame::Control(json) => {
                let value: serde_json::Value = serde_json::from_str(json).expect("json");
                if value["state"] == "sentence_start" {
                    sentence_starts += 1;
                }
                if value["state"] == "stop" && aborted {
                    saw_stop = true;
                }
                if value["state"] == "sentence_end" && aborted {
                    // Bracket close still arrives, then the sink goes quiet.
                    break;
                }
            }
            OutboundFrame::Audio(_) => {
                if aborted {
                    frames_after_abort += 1;
                } else if sentence_starts == 2 {
                    segment2_frames += 1;
                    if segment2_frames == 12 {
                        // What the frame router does on an abort control.
                        harness.state.abort();
                        harness.state.clear_speak_status();
                        let stop = selkie::messages::OutboundMessage::tts(
                            selkie::messages::TtsState::Stop,
                            None,
                            "turn-test",
                        );
                        let _ = harness
                            .out_tx
                            .send(OutboundFrame::Control(stop.to_json()))
                            .await;
                        aborted = true;
                    }
                }
            }
            OutboundFrame::Close => break,
        }
    }

    assert!(aborted, "second segment never started");
    assert!(saw_stop, "no stop after barge-in");
    // At most the batch already queued plus one racing batch escapes.
    assert!(frames_after_abort <= 6, "{frames_after_abort} frames leaked");
    // The dialogue keeps the full assistant text.
    assert_eq!(full_text, "你好，很高兴见到你。");
    // Nothing further arrives for this turn.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), harness.out_rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn tool_call_round_trip_speaks_only_the_final_answer() {
    let llm = MockLlm::new(vec![
        Ok(vec![
            tool_chunk(Some("call-7"), Some("get_time"), None),
            tool_chunk(None, None, Some("{}")),
        ]),
        Ok(content_chunks("现在是十四点零五分。")),
    ]);
    let mut registry = FunctionRegistry::new();
    registry.register(
        serde_json::json!({"name": "get_time", "parameters": {}}),
        |_context, _args| Ok(ToolAction::RequeryLlm("14:05".to_owned())),
    );
    let mut harness = build_turn_harness(llm, registry, 2);

    harness.state.start_turn();
    harness.streamer.run_turn("现在几点", None, None, false).await;

    let events = collect_until_stop(&mut harness.out_rx).await;
    assert_eq!(
        control_shapes(&events).last().map(|s| s.1.clone()),
        Some("stop".to_owned())
    );

    // Dialogue: system, user, tool-call carrier, tool result, final answer.
    let dialogue = harness.dialogue.lock().expect("dialogue");
    let roles: Vec<Role> = dialogue.messages().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    match &dialogue.messages()[2].content {
        MessageContent::ToolCalls(calls) => {
            assert_eq!(calls[0].id, "call-7");
            assert_eq!(calls[0].name, "get_time");
        }
        other => panic!("expected tool calls, got {other:?}"),
    }
    match &dialogue.messages()[3].content {
        MessageContent::ToolResult { call_id, content } => {
            assert_eq!(call_id, "call-7");
            assert_eq!(content, "14:05");
        }
        other => panic!("expected tool result, got {other:?}"),
    }
    assert_eq!(dialogue.messages()[4].text(), Some("现在是十四点零五分。"));

    // Audio was dispatched only for the final answer.
    let jobs = harness.jobs.lock().expect("jobs lock");
    let spoken: String = jobs.iter().map(|(_, t)| t.as_str()).collect();
    assert_eq!(spoken, "现在是十四点零五分");
    let indices: Vec<i64> = jobs.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![1, 2]);
}

#[tokio::test]
async fn first_segment_fast_path_splits_long_openings() {
    let llm = MockLlm::new(vec![Ok(content_chunks(
        "this opening sentence is quite long indeed, and continues.",
    ))]);
    let mut harness = build_turn_harness(llm, FunctionRegistry::new(), 1);

    harness.state.start_turn();
    harness.streamer.run_turn("go", None, None, false).await;
    let _ = collect_until_stop(&mut harness.out_rx).await;

    let jobs = harness.jobs.lock().expect("jobs lock");
    // The first dispatched piece is the 10-char prefix of the opening.
    assert_eq!(jobs[0].1.chars().count(), 10);
    assert_eq!(jobs[0].0, 1);
    // The remainder of the opening clause follows as its own index.
    assert_eq!(jobs[1].0, 2);
    let rebuilt: String = format!("{}{}", jobs[0].1, jobs[1].1);
    assert_eq!(rebuilt, "this opening sentence is quite long indeed");
}

#[tokio::test]
async fn change_role_is_refused_for_non_owner_speakers() {
    let llm = MockLlm::new(vec![Ok(vec![tool_chunk(
        Some("call-3"),
        Some("change_role"),
        Some(r#"{"role":"Pirate"}"#),
    )])]);
    let mut registry = FunctionRegistry::new();
    selkie::plugins::builtin::register_builtins(&mut registry);
    let mut harness = build_turn_harness(llm, registry, 1);

    harness.state.start_turn();
    let summary = harness
        .streamer
        .run_turn("switch to the pirate role", None, Some("speaker_1"), false)
        .await;
    let events = collect_until_stop(&mut harness.out_rx).await;

    // The refusal is spoken and the envelope closes, but no switch happens.
    assert!(summary.actions.is_empty());
    assert_eq!(
        control_shapes(&events).last().map(|s| s.1.clone()),
        Some("stop".to_owned())
    );
    let dialogue = harness.dialogue.lock().expect("dialogue");
    let last = dialogue
        .messages()
        .last()
        .expect("assistant message")
        .text()
        .expect("text");
    assert!(last.contains("owner"));
    assert!(!dialogue.messages().iter().any(|m| m.role == Role::Tool));
}
