//! Selkie: real-time full-duplex voice dialogue server.
//!
//! Each client holds one WebSocket carrying opus microphone audio upstream
//! and synthesized opus speech downstream. In between, the server runs a
//! per-connection streaming pipeline:
//!
//! Client frames → VAD gate → utterance pipeline (ASR + speaker-ID +
//! memory + chat) → response streamer → TTS pool → paced audio sink →
//! client.
//!
//! # Architecture
//!
//! - **Frame routing / session lifecycle**: [`connection`] and [`server`]
//! - **Voice activity gating**: [`vad`], with pre-roll retention
//! - **Recognition and identification**: [`asr`], [`voiceprint`]
//! - **Turn driving**: [`streamer`] slices the model stream into
//!   punctuation-bounded segments and settles tool calls via [`plugins`]
//! - **Synthesis**: [`tts`] pools a fixed number of long-lived upstream
//!   connections speaking a binary event protocol
//! - **Delivery**: [`audio`] paces opus frames and brackets every turn
//!   with control messages; barge-in cuts it short

pub mod asr;
pub mod audio;
pub mod config;
pub mod connection;
pub mod device;
pub mod dialogue;
pub mod error;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod messages;
pub mod pipeline;
pub mod plugins;
pub mod proactive;
pub mod server;
pub mod streamer;
pub mod tts;
pub mod vad;
pub mod voiceprint;

pub use config::ServerConfig;
pub use error::{DialogueError, Result};
pub use server::Server;
