//! One long-lived connection to the bidirectional TTS backend.
//!
//! The connection is negotiated once (`StartConnection` → `ConnectionStarted`)
//! and then reused for many synthesis sessions, each with a fresh request
//! session id: `StartSession` → `SessionStarted`, one or more `TaskRequest`
//! frames, `FinishSession`, then audio until `SessionFinished`.

use crate::config::TtsConfig;
use crate::error::{DialogueError, Result};
use crate::tts::wire::{Event, Frame, MessageType};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An established upstream TTS connection.
pub struct UpstreamTts {
    ws: WsStream,
    config: TtsConfig,
}

impl UpstreamTts {
    /// Dial the backend and complete the connection handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be opened or the backend
    /// answers with anything but `ConnectionStarted`.
    pub async fn connect(config: &TtsConfig) -> Result<Self> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| DialogueError::Tts(format!("bad TTS url: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("X-Api-App-Key", header_value(&config.app_id)?);
        headers.insert("X-Api-Access-Key", header_value(&config.access_token)?);
        headers.insert("X-Api-Resource-Id", header_value("volc.service_type.10029")?);
        headers.insert("X-Api-Connect-Id", header_value(&Uuid::new_v4().to_string())?);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| DialogueError::Tts(format!("TTS connect failed: {e}")))?;
        let mut upstream = Self {
            ws,
            config: config.clone(),
        };

        upstream
            .send(Frame::request(Event::StartConnection, None, Some(b"{}")))
            .await?;
        let frame = upstream.recv().await?;
        if frame.event != Event::ConnectionStarted {
            return Err(DialogueError::Tts(format!(
                "TTS connection refused: {:?} {:?}",
                frame.event, frame.meta
            )));
        }
        info!(connection_id = ?frame.connection_id, "TTS upstream connected");
        Ok(upstream)
    }

    /// Synthesize one text segment, returning the concatenated MP3 payload.
    ///
    /// Uses a fresh per-request session id, distinct from any dialogue
    /// session. The read loop is bounded by a soft deadline scaled to the
    /// text length.
    ///
    /// # Errors
    ///
    /// `UpstreamClosed` when the socket drops mid-session (callers should
    /// reconnect the slot), `Timeout` past the deadline, `Tts` for backend
    /// failures.
    pub async fn synthesize(&mut self, text: &str, voice: &str) -> Result<Vec<u8>> {
        let session_id = Uuid::new_v4().simple().to_string();
        let deadline = synthesis_deadline(text);

        self.send(Frame::request(
            Event::StartSession,
            Some(&session_id),
            Some(&self.request_payload(Event::StartSession, "", voice)),
        ))
        .await?;
        let started = tokio::time::timeout(deadline, self.recv())
            .await
            .map_err(|_| DialogueError::Timeout("TTS session start timed out".to_owned()))??;
        if started.event != Event::SessionStarted {
            return Err(DialogueError::Tts(format!(
                "TTS session refused: {:?} {:?}",
                started.event, started.meta
            )));
        }

        self.send(Frame::request(
            Event::TaskRequest,
            Some(&session_id),
            Some(&self.request_payload(Event::TaskRequest, text, voice)),
        ))
        .await?;
        self.send(Frame::request(
            Event::FinishSession,
            Some(&session_id),
            Some(b"{}"),
        ))
        .await?;

        let mut audio = Vec::new();
        loop {
            let frame = tokio::time::timeout(deadline, self.recv())
                .await
                .map_err(|_| DialogueError::Timeout("TTS synthesis timed out".to_owned()))??;
            match frame.event {
                Event::TtsResponse if frame.message_type == MessageType::AudioOnlyResponse => {
                    if let Some(payload) = frame.payload {
                        audio.extend_from_slice(&payload);
                    }
                }
                Event::TtsSentenceStart | Event::TtsSentenceEnd => {}
                Event::SessionFinished => break,
                Event::SessionFailed => {
                    return Err(DialogueError::Tts(format!(
                        "TTS session failed: {:?}",
                        frame.meta
                    )));
                }
                other => {
                    debug!("unexpected TTS frame {other:?} during synthesis, stopping read");
                    break;
                }
            }
        }
        Ok(audio)
    }

    /// Politely tear the connection down.
    pub async fn close(mut self) {
        if let Err(e) = self
            .send(Frame::request(Event::FinishConnection, None, Some(b"{}")))
            .await
        {
            debug!("TTS finish-connection send failed: {e}");
            return;
        }
        match self.recv().await {
            Ok(frame) if frame.event == Event::ConnectionFinished => {
                debug!("TTS upstream closed cleanly");
            }
            Ok(frame) => debug!("TTS upstream close answered with {:?}", frame.event),
            Err(e) => debug!("TTS upstream close: {e}"),
        }
        let _ = self.ws.close(None).await;
    }

    fn request_payload(&self, event: Event, text: &str, voice: &str) -> Vec<u8> {
        serde_json::json!({
            "user": { "uid": Uuid::new_v4().to_string() },
            "event": event.code(),
            "namespace": "BidirectionalTTS",
            "req_params": {
                "text": text,
                "speaker": voice,
                "audio_params": {
                    "format": self.config.audio_format,
                    "sample_rate": self.config.audio_sample_rate,
                },
            },
        })
        .to_string()
        .into_bytes()
    }

    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.ws
            .send(Message::Binary(frame.encode()))
            .await
            .map_err(|e| DialogueError::UpstreamClosed(format!("TTS send failed: {e}")))
    }

    async fn recv(&mut self) -> Result<Frame> {
        loop {
            let message = self
                .ws
                .next()
                .await
                .ok_or_else(|| DialogueError::UpstreamClosed("TTS stream ended".to_owned()))?
                .map_err(|e| DialogueError::UpstreamClosed(format!("TTS recv failed: {e}")))?;
            match message {
                Message::Binary(bytes) => {
                    let frame = Frame::decode(&bytes)?;
                    if frame.message_type == MessageType::ErrorInformation {
                        warn!(code = ?frame.error_code, "TTS backend error frame");
                        return Err(DialogueError::Tts(format!(
                            "TTS backend error {:?}: {}",
                            frame.error_code,
                            String::from_utf8_lossy(frame.payload.as_deref().unwrap_or_default())
                        )));
                    }
                    return Ok(frame);
                }
                Message::Text(text) => {
                    return Err(DialogueError::Tts(format!("unexpected text frame: {text}")));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(_) => {
                    return Err(DialogueError::UpstreamClosed(
                        "TTS backend closed the connection".to_owned(),
                    ));
                }
            }
        }
    }
}

/// Soft per-segment deadline: a floor plus headroom per character.
fn synthesis_deadline(text: &str) -> Duration {
    let chars = text.chars().count() as u64;
    Duration::from_millis(5_000 + chars * 200)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| DialogueError::Tts(format!("invalid TTS header value: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_scales_with_text_length() {
        assert_eq!(synthesis_deadline(""), Duration::from_millis(5_000));
        let long = "字".repeat(50);
        assert_eq!(synthesis_deadline(&long), Duration::from_millis(15_000));
    }
}
