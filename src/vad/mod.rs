//! Voice activity gating for the uplink audio stream.
//!
//! Each inbound opus packet is decoded to 16 kHz mono PCM and scored in
//! fixed 512-sample chunks by a [`SpeechDetector`]. The gate tracks whether
//! the current segment has seen speech and flips `voice_stop` once silence
//! has lasted long enough, which hands the buffered utterance to the
//! recognition pipeline.

use crate::audio::PacketDecoder;
use crate::config::VadConfig;
use crate::error::Result;
use std::time::Instant;
use tracing::debug;

/// Fixed chunk length the detector model expects. Shorter runs are buffered
/// across packets, never scored.
pub const SAMPLES_PER_CHUNK: usize = 512;

/// Scores one PCM chunk for speech.
pub trait SpeechDetector: Send {
    /// Speech probability in `[0, 1]` for exactly [`SAMPLES_PER_CHUNK`]
    /// samples of 16 kHz mono audio.
    fn speech_probability(&mut self, chunk: &[f32]) -> Result<f32>;
}

/// RMS-energy detector. Model-free stand-in with the same shape as a real
/// detector: probability scales linearly with RMS up to a reference level.
pub struct EnergyDetector {
    /// RMS mapped to probability 1.0.
    reference_rms: f32,
}

impl EnergyDetector {
    pub fn new() -> Self {
        Self { reference_rms: 0.02 }
    }
}

impl Default for EnergyDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechDetector for EnergyDetector {
    fn speech_probability(&mut self, chunk: &[f32]) -> Result<f32> {
        if chunk.is_empty() {
            return Ok(0.0);
        }
        let sum_sq: f32 = chunk.iter().map(|s| s * s).sum();
        let rms = (sum_sq / chunk.len() as f32).sqrt();
        Ok((rms / self.reference_rms).clamp(0.0, 1.0))
    }
}

/// Per-connection VAD state machine.
pub struct VadGate {
    decoder: PacketDecoder,
    detector: Box<dyn SpeechDetector>,
    config: VadConfig,
    /// PCM carried over until a full chunk accumulates.
    pcm_buffer: Vec<i16>,
    /// Whether any chunk of the current segment scored as speech.
    have_voice: bool,
    /// When speech was last heard.
    last_voice_at: Option<Instant>,
    /// Set once silence after speech exceeds the configured minimum.
    voice_stop: bool,
}

impl VadGate {
    /// # Errors
    ///
    /// Returns an error if the opus decoder cannot be created.
    pub fn new(config: VadConfig, detector: Box<dyn SpeechDetector>) -> Result<Self> {
        Ok(Self {
            decoder: PacketDecoder::new()?,
            detector,
            config,
            pcm_buffer: Vec::with_capacity(SAMPLES_PER_CHUNK * 4),
            have_voice: false,
            last_voice_at: None,
            voice_stop: false,
        })
    }

    /// Feed one opus packet. Returns whether the packet contained speech.
    ///
    /// Malformed packets are logged and ignored; they never disturb the
    /// segment state.
    pub fn process_packet(&mut self, packet: &[u8]) -> bool {
        match self.decoder.decode(packet) {
            Ok(pcm) => self.process_pcm(&pcm),
            Err(e) => {
                debug!("dropping undecodable audio packet: {e}");
                false
            }
        }
    }

    /// Score decoded PCM. Split out from packet handling so tests can drive
    /// the state machine without crafting opus payloads.
    pub fn process_pcm(&mut self, pcm: &[i16]) -> bool {
        self.pcm_buffer.extend_from_slice(pcm);

        let mut chunk_has_voice = false;
        while self.pcm_buffer.len() >= SAMPLES_PER_CHUNK {
            let chunk: Vec<f32> = self
                .pcm_buffer
                .drain(..SAMPLES_PER_CHUNK)
                .map(|s| f32::from(s) / 32768.0)
                .collect();

            let prob = match self.detector.speech_probability(&chunk) {
                Ok(p) => p,
                Err(e) => {
                    debug!("speech detector failed on chunk: {e}");
                    continue;
                }
            };
            chunk_has_voice = prob >= self.config.threshold;

            if self.have_voice && !chunk_has_voice {
                let silent_for = self
                    .last_voice_at
                    .map(|t| t.elapsed().as_millis() as u64)
                    .unwrap_or(0);
                if silent_for >= self.config.min_silence_duration_ms {
                    self.voice_stop = true;
                    break;
                }
            }

            if chunk_has_voice {
                self.have_voice = true;
                self.last_voice_at = Some(Instant::now());
            }
        }

        chunk_has_voice
    }

    /// Whether the current segment has heard speech at all.
    pub fn have_voice(&self) -> bool {
        self.have_voice
    }

    /// Whether end of utterance has been declared.
    pub fn voice_stop(&self) -> bool {
        self.voice_stop
    }

    /// Reset segment state after an utterance was handed off or discarded.
    pub fn reset(&mut self) {
        self.pcm_buffer.clear();
        self.have_voice = false;
        self.last_voice_at = None;
        self.voice_stop = false;
        debug!("VAD state reset");
    }

    #[cfg(test)]
    fn force_silence_elapsed(&mut self) {
        self.last_voice_at = Some(
            Instant::now()
                - std::time::Duration::from_millis(self.config.min_silence_duration_ms + 1),
        );
    }
}

/// Bounded buffer of inbound opus frames for the current utterance.
///
/// While the segment has never had speech only the last `pre_roll` frames
/// are retained, so the first syllable of the next utterance survives the
/// gate latency.
#[derive(Debug, Default)]
pub struct UtteranceBuffer {
    frames: Vec<Vec<u8>>,
}

impl UtteranceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame of an active segment.
    pub fn push(&mut self, frame: Vec<u8>) {
        self.frames.push(frame);
    }

    /// Append a frame while no speech has been seen, dropping everything but
    /// the most recent `pre_roll` frames.
    pub fn push_pre_roll(&mut self, frame: Vec<u8>, pre_roll: usize) {
        self.frames.push(frame);
        if self.frames.len() > pre_roll {
            let excess = self.frames.len() - pre_roll;
            self.frames.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Atomically hand the buffered utterance off, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.frames)
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedDetector {
        probs: Vec<f32>,
        at: usize,
    }

    impl ScriptedDetector {
        fn new(probs: Vec<f32>) -> Self {
            Self { probs, at: 0 }
        }
    }

    impl SpeechDetector for ScriptedDetector {
        fn speech_probability(&mut self, _chunk: &[f32]) -> Result<f32> {
            let p = self.probs.get(self.at).copied().unwrap_or(0.0);
            self.at += 1;
            Ok(p)
        }
    }

    fn gate_with(probs: Vec<f32>) -> VadGate {
        VadGate::new(VadConfig::default(), Box::new(ScriptedDetector::new(probs)))
            .expect("gate init")
    }

    #[test]
    fn short_input_is_buffered_not_scored() {
        let mut gate = gate_with(vec![1.0]);
        // 300 samples < one chunk: the detector must not run.
        assert!(!gate.process_pcm(&vec![0i16; 300]));
        assert!(!gate.have_voice());
        // The next 300 complete one chunk and score it.
        assert!(gate.process_pcm(&vec![0i16; 300]));
        assert!(gate.have_voice());
    }

    #[test]
    fn voice_stop_requires_elapsed_silence() {
        let mut gate = gate_with(vec![1.0, 0.0, 0.0]);
        assert!(gate.process_pcm(&vec![0i16; SAMPLES_PER_CHUNK]));
        // Immediate silence: not enough elapsed time yet.
        gate.process_pcm(&vec![0i16; SAMPLES_PER_CHUNK]);
        assert!(!gate.voice_stop());
        // Backdate the last voice time past the threshold.
        gate.force_silence_elapsed();
        gate.process_pcm(&vec![0i16; SAMPLES_PER_CHUNK]);
        assert!(gate.voice_stop());
    }

    #[test]
    fn reset_clears_segment_state() {
        let mut gate = gate_with(vec![1.0, 0.0]);
        gate.process_pcm(&vec![0i16; SAMPLES_PER_CHUNK]);
        gate.force_silence_elapsed();
        gate.process_pcm(&vec![0i16; SAMPLES_PER_CHUNK]);
        assert!(gate.voice_stop());
        gate.reset();
        assert!(!gate.have_voice());
        assert!(!gate.voice_stop());
    }

    #[test]
    fn pre_roll_keeps_only_recent_frames() {
        let mut buffer = UtteranceBuffer::new();
        for i in 0..10u8 {
            buffer.push_pre_roll(vec![i], 3);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.take(), vec![vec![7], vec![8], vec![9]]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn energy_detector_scales_with_level() {
        let mut detector = EnergyDetector::new();
        let quiet = vec![0.0f32; SAMPLES_PER_CHUNK];
        let loud = vec![0.5f32; SAMPLES_PER_CHUNK];
        let p_quiet = detector.speech_probability(&quiet).expect("quiet");
        let p_loud = detector.speech_probability(&loud).expect("loud");
        assert!(p_quiet < 0.01);
        assert!((p_loud - 1.0).abs() < f32::EPSILON);
    }
}
