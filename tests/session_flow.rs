//! End-to-end utterance pipeline scenarios over mock providers.
//!
//! The synthesis dispatcher and audio sink run for real; the pool points at
//! a dead endpoint, so every segment degrades to a bracket-only delivery
//! and the control-message envelope is fully observable.

mod common;

use common::*;
use selkie::config::ServerConfig;
use selkie::pipeline::handle_utterance;
use selkie::plugins::FunctionRegistry;
use std::sync::Arc;
use std::time::Duration;

fn fake_frames(count: usize) -> Vec<Vec<u8>> {
    vec![vec![0u8; 40]; count]
}

#[tokio::test]
async fn single_utterance_produces_the_full_downlink_envelope() {
    let asr = MockAsr::new(vec!["你好"]);
    let llm = MockLlm::new(vec![Ok(content_chunks("你好，很高兴见到你。"))]);
    let mut session = build_session(ServerConfig::default(), asr, llm, FunctionRegistry::new());

    session.shared.state.set_receiving(false);
    handle_utterance(Arc::clone(&session.shared), fake_frames(12)).await;

    let events = collect_until_stop(&mut session.out_rx).await;
    let shapes = control_shapes(&events);

    assert_eq!(
        shapes,
        vec![
            ("tts".to_owned(), "start".to_owned()),
            ("stt".to_owned(), "你好".to_owned()),
            ("llm".to_owned(), "\u{1F60A}".to_owned()),
            ("tts".to_owned(), "sentence_start".to_owned()),
            ("tts".to_owned(), "sentence_end".to_owned()),
            ("tts".to_owned(), "sentence_start".to_owned()),
            ("tts".to_owned(), "sentence_end".to_owned()),
            ("tts".to_owned(), "stop".to_owned()),
        ]
    );

    // Segment texts ride on the sentence_start markers.
    let starts: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            OutEvent::Control(v) if v["state"] == "sentence_start" => {
                Some(v["text"].as_str().unwrap_or_default().to_owned())
            }
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec!["你好", "很高兴见到你"]);

    // The turn settled: receiving restored, both turns in the dialogue.
    assert!(session.shared.state.is_receiving());
    let dialogue = session.shared.dialogue.lock().expect("dialogue");
    assert_eq!(dialogue.len(), 3);
    assert_eq!(dialogue.messages()[1].text(), Some("你好"));
    assert_eq!(dialogue.messages()[2].text(), Some("你好，很高兴见到你。"));
}

#[tokio::test]
async fn empty_transcript_discards_the_utterance() {
    let asr = MockAsr::new(vec![""]);
    let llm = MockLlm::new(vec![]);
    let mut session = build_session(ServerConfig::default(), asr, llm, FunctionRegistry::new());

    session.shared.state.set_receiving(false);
    handle_utterance(Arc::clone(&session.shared), fake_frames(12)).await;

    // Receiving is restored and nothing reached the client.
    assert!(session.shared.state.is_receiving());
    assert!(
        tokio::time::timeout(Duration::from_millis(200), session.out_rx.recv())
            .await
            .is_err()
    );
    assert_eq!(session.shared.dialogue.lock().expect("dialogue").len(), 1);
}

#[tokio::test]
async fn exhausted_pool_degrades_to_a_text_turn() {
    let asr = MockAsr::new(vec!["hello there"]);
    let llm = MockLlm::new(vec![Ok(content_chunks("Hi. Nice to meet you."))]);
    let mut config = ServerConfig::default();
    config.tts.pool_capacity = 1;
    let mut session = build_session(config, asr, llm, FunctionRegistry::new());

    // Another session holds the only slot.
    let (other_tx, _other_rx) = tokio::sync::mpsc::channel(4);
    session
        .shared
        .pool
        .acquire("other-session", other_tx, "v")
        .expect("other session takes the slot");

    session.shared.state.set_receiving(false);
    handle_utterance(Arc::clone(&session.shared), fake_frames(12)).await;

    let events = collect_until_stop(&mut session.out_rx).await;
    let shapes = control_shapes(&events);

    // No audio, but the text flow and the envelope are intact.
    assert!(events.iter().all(|e| !matches!(e, OutEvent::Audio(_))));
    assert_eq!(shapes.first().map(|s| s.1.as_str()), Some("start"));
    assert_eq!(shapes.last().map(|s| s.1.as_str()), Some("stop"));
    assert!(session.shared.dialogue.lock().expect("dialogue").len() >= 3);

    // A release by the other connection frees the slot for this one.
    session.shared.pool.release("other-session").await;
    let (tx, _rx) = tokio::sync::mpsc::channel(4);
    assert!(session.shared.pool.acquire("test-session", tx, "v").is_ok());
}

#[tokio::test]
async fn exit_phrase_short_circuits_the_model() {
    let asr = MockAsr::new(vec!["再见"]);
    // No model rounds: recognizing the exit intent must not consult it.
    let llm = MockLlm::new(vec![]);
    let mut session = build_session(ServerConfig::default(), asr, llm, FunctionRegistry::new());

    session.shared.state.set_receiving(false);
    handle_utterance(Arc::clone(&session.shared), fake_frames(12)).await;

    let events = collect_until_stop(&mut session.out_rx).await;
    let shapes = control_shapes(&events);
    assert!(shapes.contains(&("stt".to_owned(), "再见".to_owned())));
    assert!(shapes.contains(&("tts".to_owned(), "sentence_start".to_owned())));
    assert_eq!(shapes.last().map(|s| s.1.as_str()), Some("stop"));
    assert!(session.shared.state.close_after_turn());
}

#[tokio::test]
async fn model_failure_still_closes_the_envelope_with_an_apology() {
    let asr = MockAsr::new(vec!["tell me something"]);
    let llm = MockLlm::new(vec![Err("connection refused".to_owned())]);
    let mut session = build_session(ServerConfig::default(), asr, llm, FunctionRegistry::new());

    session.shared.state.set_receiving(false);
    handle_utterance(Arc::clone(&session.shared), fake_frames(12)).await;

    let events = collect_until_stop(&mut session.out_rx).await;
    let shapes = control_shapes(&events);
    assert_eq!(shapes.last().map(|s| s.1.as_str()), Some("stop"));

    let dialogue = session.shared.dialogue.lock().expect("dialogue");
    let last = dialogue.messages().last().expect("assistant message");
    assert!(last.text().expect("text").contains("Sorry"));
}

#[tokio::test]
async fn silence_triggers_one_proactive_turn_then_cools_down() {
    let asr = MockAsr::new(vec![]);
    let llm = MockLlm::new(vec![Ok(content_chunks("还在吗？"))]);
    let mut config = ServerConfig::default();
    config.proactive.silence_threshold_secs = 1;
    config.proactive.min_interaction_count = 3;
    config.proactive.cooldown_secs = 600;
    let mut session = build_session(config, asr, llm, FunctionRegistry::new());

    for text in ["one", "two", "three"] {
        session.shared.proactive.note_interaction(text);
    }
    tokio::spawn(selkie::proactive::run_proactive_loop(Arc::clone(&session.shared)));

    let events = collect_until_stop(&mut session.out_rx).await;
    let shapes = control_shapes(&events);
    // One short follow-up: start, one sentence bracket, stop; no stt echo.
    assert_eq!(
        shapes,
        vec![
            ("tts".to_owned(), "start".to_owned()),
            ("tts".to_owned(), "sentence_start".to_owned()),
            ("tts".to_owned(), "sentence_end".to_owned()),
            ("tts".to_owned(), "stop".to_owned()),
        ]
    );

    let dialogue_len = session.shared.dialogue.lock().expect("dialogue").len();
    assert_eq!(dialogue_len, 2); // system + proactive assistant line

    // Cooldown: the next wake produces nothing.
    assert!(
        tokio::time::timeout(Duration::from_millis(1500), session.out_rx.recv())
            .await
            .is_err()
    );
}
