//! Best-effort speaker identification from spectral voiceprints.
//!
//! Not speaker verification: a lightweight log-spectrum feature with cosine
//! matching, enough to attribute utterances to household voices without an
//! embedding model. Expect misses in noisy rooms.

use crate::audio::PacketDecoder;
use crate::config::VoiceprintConfig;
use crate::error::{DialogueError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rustfft::FftPlanner;
use rustfft::num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Feature vector length. Small on purpose: profiles live in JSON blobs.
pub const VOICEPRINT_DIMS: usize = 32;

/// Identifies the speaker of one buffered utterance.
#[async_trait]
pub trait VoiceprintProvider: Send + Sync {
    /// Match the utterance against enrolled profiles. `None` means no
    /// confident match (and auto-enroll is off or failed).
    async fn identify_speaker(
        &self,
        frames: &[Vec<u8>],
        device_id: Option<&str>,
    ) -> Result<Option<String>>;
}

/// One enrolled voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerProfile {
    pub speaker_id: String,
    pub voiceprint: Vec<f32>,
    pub created_at: i64,
    pub last_seen: i64,
    pub interaction_count: u64,
    /// Seconds of audio attributed to this speaker.
    pub total_duration: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProfileBlob {
    profiles: HashMap<String, SpeakerProfile>,
}

/// Spectral voiceprint matcher with a JSON profile store per device.
pub struct SpectralVoiceprint {
    root: PathBuf,
    config: VoiceprintConfig,
    cache: Mutex<HashMap<String, ProfileBlob>>,
}

impl SpectralVoiceprint {
    pub fn new(root: impl Into<PathBuf>, config: &VoiceprintConfig) -> Self {
        Self {
            root: root.into(),
            config: config.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn blob_path(&self, device_id: Option<&str>) -> PathBuf {
        let device = device_id.unwrap_or("default");
        self.root
            .join("voiceprint")
            .join(format!("{device}.json"))
    }

    fn load(&self, path: &Path) -> ProfileBlob {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => ProfileBlob::default(),
        }
    }

    fn persist(path: &Path, blob: &ProfileBlob) {
        if let Some(parent) = path.parent()
            && std::fs::create_dir_all(parent).is_ok()
            && let Ok(text) = serde_json::to_string_pretty(blob)
            && let Err(e) = std::fs::write(path, text)
        {
            debug!("voiceprint persist failed: {e}");
        }
    }

    fn frames_to_samples(frames: &[Vec<u8>]) -> Result<Vec<f32>> {
        let mut decoder = PacketDecoder::new()?;
        let mut samples = Vec::new();
        for frame in frames {
            if let Ok(pcm) = decoder.decode(frame) {
                samples.extend(pcm.iter().map(|&s| f32::from(s) / 32768.0));
            }
        }
        Ok(samples)
    }
}

#[async_trait]
impl VoiceprintProvider for SpectralVoiceprint {
    async fn identify_speaker(
        &self,
        frames: &[Vec<u8>],
        device_id: Option<&str>,
    ) -> Result<Option<String>> {
        let samples = Self::frames_to_samples(frames)?;
        let Ok(voiceprint) = compute_voiceprint(&samples) else {
            return Ok(None);
        };
        let duration = samples.len() as f64 / f64::from(crate::audio::SAMPLE_RATE);
        let now = Utc::now().timestamp();

        let path = self.blob_path(device_id);
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let blob = cache
            .entry(path.display().to_string())
            .or_insert_with(|| self.load(&path));

        let mut best: Option<(String, f32)> = None;
        for (id, profile) in &blob.profiles {
            if let Some(score) = cosine_similarity(&voiceprint, &profile.voiceprint)
                && best.as_ref().is_none_or(|(_, b)| score > *b)
            {
                best = Some((id.clone(), score));
            }
        }

        if let Some((id, score)) = best
            && score >= self.config.similarity_threshold
        {
            debug!("voiceprint matched {id} (score {score:.3})");
            if let Some(profile) = blob.profiles.get_mut(&id) {
                profile.last_seen = now;
                profile.interaction_count += 1;
                profile.total_duration += duration;
            }
            Self::persist(&path, blob);
            return Ok(Some(id));
        }

        if !self.config.auto_enroll {
            return Ok(None);
        }

        let speaker_id = format!("speaker_{}", blob.profiles.len());
        info!("enrolling new voiceprint as {speaker_id}");
        blob.profiles.insert(
            speaker_id.clone(),
            SpeakerProfile {
                speaker_id: speaker_id.clone(),
                voiceprint,
                created_at: now,
                last_seen: now,
                interaction_count: 1,
                total_duration: duration,
            },
        );
        Self::persist(&path, blob);
        Ok(Some(speaker_id))
    }
}

/// Compute a normalized voiceprint over 16 kHz mono samples.
///
/// Averaged log-magnitude spectrum in the 300–3400 Hz speech band, grouped
/// into [`VOICEPRINT_DIMS`] buckets and L2-normalized.
///
/// # Errors
///
/// Returns an error when there is not enough audio to fill one frame.
pub fn compute_voiceprint(samples: &[f32]) -> Result<Vec<f32>> {
    const FRAME_LEN: usize = 400; // 25 ms
    const HOP: usize = 160; // 10 ms
    const FFT_LEN: usize = 512;

    if samples.len() < FRAME_LEN {
        return Err(DialogueError::Memory(
            "not enough audio to compute a voiceprint".to_owned(),
        ));
    }

    let hz_per_bin = crate::audio::SAMPLE_RATE as f32 / FFT_LEN as f32;
    let min_bin = (300.0 / hz_per_bin).floor() as usize;
    let max_bin = ((3400.0 / hz_per_bin).ceil() as usize).min(FFT_LEN / 2);
    let band_bins = max_bin - min_bin;

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(FFT_LEN);

    let window: Vec<f32> = (0..FRAME_LEN)
        .map(|i| {
            let x = i as f32 / (FRAME_LEN - 1) as f32;
            0.54 - 0.46 * (2.0 * std::f32::consts::PI * x).cos()
        })
        .collect();

    let mut acc = vec![0.0f32; VOICEPRINT_DIMS];
    let mut buf = vec![Complex32::new(0.0, 0.0); FFT_LEN];
    let mut frames = 0usize;

    let mut pos = 0usize;
    while pos + FRAME_LEN <= samples.len() {
        for (i, w) in window.iter().enumerate() {
            buf[i] = Complex32::new(samples[pos + i] * w, 0.0);
        }
        for c in buf.iter_mut().skip(FRAME_LEN) {
            *c = Complex32::new(0.0, 0.0);
        }
        fft.process(&mut buf);

        for (b, acc_b) in acc.iter_mut().enumerate() {
            let start = min_bin + (b * band_bins) / VOICEPRINT_DIMS;
            let end = min_bin + ((b + 1) * band_bins) / VOICEPRINT_DIMS;
            if end <= start {
                continue;
            }
            let mut sum = 0.0f32;
            for c in &buf[start..end] {
                sum += (1.0 + c.norm()).ln();
            }
            *acc_b += sum / (end - start) as f32;
        }

        frames += 1;
        pos += HOP;
    }

    for v in &mut acc {
        *v /= frames as f32;
    }

    let norm = acc.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut acc {
            *v /= norm;
        }
    }
    Ok(acc)
}

/// Cosine similarity of two normalized voiceprints.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    Some(a.iter().zip(b).map(|(x, y)| x * y).sum())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, seconds: f32) -> Vec<f32> {
        let rate = crate::audio::SAMPLE_RATE as f32;
        (0..(rate * seconds) as usize)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin() * 0.3)
            .collect()
    }

    #[test]
    fn voiceprint_is_normalized() {
        let print = compute_voiceprint(&tone(440.0, 0.5)).expect("voiceprint");
        assert_eq!(print.len(), VOICEPRINT_DIMS);
        let norm: f32 = print.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[test]
    fn same_signal_matches_itself_better_than_a_different_one() {
        let a = compute_voiceprint(&tone(440.0, 0.5)).expect("a");
        let a2 = compute_voiceprint(&tone(440.0, 0.6)).expect("a2");
        let b = compute_voiceprint(&tone(1800.0, 0.5)).expect("b");
        let same = cosine_similarity(&a, &a2).expect("same");
        let different = cosine_similarity(&a, &b).expect("different");
        assert!(same > different);
    }

    #[test]
    fn too_little_audio_is_an_error() {
        assert!(compute_voiceprint(&[0.0; 100]).is_err());
    }
}
