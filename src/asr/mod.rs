//! Speech recognition provider interface.
//!
//! The orchestrator hands over the buffered opus frames of one utterance and
//! gets back a transcript. The bundled implementation posts WAV audio to an
//! OpenAI-compatible transcription endpoint.

use crate::audio::{self, PacketDecoder, SAMPLE_RATE};
use crate::config::AsrConfig;
use crate::error::{DialogueError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Recognizes one buffered utterance.
#[async_trait]
pub trait AsrProvider: Send + Sync {
    /// Transcribe the utterance's opus frames.
    ///
    /// Returns the transcript and, when archiving is configured, the path of
    /// the stored WAV artifact.
    async fn speech_to_text(
        &self,
        frames: &[Vec<u8>],
        session_id: &str,
    ) -> Result<(String, Option<PathBuf>)>;
}

/// HTTP recognition provider against `/v1/audio/transcriptions`.
pub struct HttpAsr {
    config: AsrConfig,
    client: reqwest::Client,
}

impl HttpAsr {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &AsrConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DialogueError::Asr(format!("http client init failed: {e}")))?;
        info!("ASR configured: {} model={}", config.api_url, config.model);
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    /// Decode the utterance's opus frames into one contiguous PCM run.
    /// Frames that fail to decode are skipped; the rest of the utterance
    /// still transcribes.
    fn frames_to_pcm(frames: &[Vec<u8>]) -> Result<Vec<i16>> {
        let mut decoder = PacketDecoder::new()?;
        let mut pcm = Vec::with_capacity(frames.len() * audio::FRAME_SAMPLES);
        for frame in frames {
            match decoder.decode(frame) {
                Ok(samples) => pcm.extend_from_slice(&samples),
                Err(e) => debug!("skipping undecodable frame in utterance: {e}"),
            }
        }
        Ok(pcm)
    }

    fn archive(&self, wav: &[u8], session_id: &str) -> Option<PathBuf> {
        let dir = self.config.archive_dir.as_ref()?;
        if let Err(e) = std::fs::create_dir_all(dir) {
            debug!("cannot create ASR archive dir: {e}");
            return None;
        }
        let path = dir.join(format!("{session_id}-{}.wav", uuid::Uuid::new_v4()));
        match std::fs::write(&path, wav) {
            Ok(()) => Some(path),
            Err(e) => {
                debug!("cannot archive utterance WAV: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl AsrProvider for HttpAsr {
    async fn speech_to_text(
        &self,
        frames: &[Vec<u8>],
        session_id: &str,
    ) -> Result<(String, Option<PathBuf>)> {
        let pcm = Self::frames_to_pcm(frames)?;
        if pcm.is_empty() {
            return Ok((String::new(), None));
        }
        let wav = audio::pcm_to_wav(&pcm, SAMPLE_RATE)?;
        let artifact = self.archive(&wav, session_id);

        let base = self.config.api_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        let url = format!("{base}/v1/audio/transcriptions");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name(format!("{session_id}.wav"))
            .mime_str("audio/wav")
            .map_err(|e| DialogueError::Asr(format!("bad multipart mime: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.config.model.clone())
            .part("file", part);

        let mut request = self.client.post(&url).multipart(form);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DialogueError::Timeout(format!("ASR request timed out: {e}"))
            } else {
                DialogueError::Asr(format!("ASR request failed: {e}"))
            }
        })?;
        if !response.status().is_success() {
            return Err(DialogueError::Asr(format!(
                "ASR endpoint returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DialogueError::Asr(format!("ASR response parse failed: {e}")))?;
        let text = body
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .trim()
            .to_owned();

        info!(session_id, "recognized text: {text:?}");
        Ok((text, artifact))
    }
}

/// Count the characters of a transcript that carry meaning, ignoring
/// punctuation and whitespace. Utterances that reduce to zero are discarded
/// without touching the dialogue.
pub fn meaningful_len(text: &str) -> usize {
    text.chars().filter(|c| c.is_alphanumeric()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meaningful_len_ignores_punctuation() {
        assert_eq!(meaningful_len("你好。"), 2);
        assert_eq!(meaningful_len("..., !"), 0);
        assert_eq!(meaningful_len("ok then"), 6);
    }
}
