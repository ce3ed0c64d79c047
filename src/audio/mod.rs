//! Audio packaging for the stream edges.
//!
//! Uplink packets and downlink frames are opus; the TTS backend hands back
//! MP3. Everything in between is 16 kHz mono s16 PCM.

pub mod sink;

use crate::error::{DialogueError, Result};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// PCM sample rate used throughout the pipeline.
pub const SAMPLE_RATE: u32 = 16_000;

/// Samples per downlink opus frame (60 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 960;

/// Decode one uplink opus packet to 16 kHz mono PCM.
pub struct PacketDecoder {
    decoder: opus::Decoder,
    scratch: Vec<i16>,
}

impl PacketDecoder {
    /// # Errors
    ///
    /// Returns an error if the opus decoder cannot be created.
    pub fn new() -> Result<Self> {
        let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| DialogueError::Vad(format!("opus decoder init failed: {e}")))?;
        Ok(Self {
            // Large enough for the maximum 120 ms opus frame.
            scratch: vec![0i16; FRAME_SAMPLES * 2],
            decoder,
        })
    }

    /// Decode a packet, returning however many samples it carried.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed opus data.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let n = self
            .decoder
            .decode(packet, &mut self.scratch, false)
            .map_err(|e| DialogueError::Vad(format!("opus decode failed: {e}")))?;
        Ok(self.scratch[..n].to_vec())
    }
}

/// Encode 16 kHz mono PCM into fixed 60 ms opus frames for the downlink.
pub struct FrameEncoder {
    encoder: opus::Encoder,
}

impl FrameEncoder {
    /// # Errors
    ///
    /// Returns an error if the opus encoder cannot be created.
    pub fn new() -> Result<Self> {
        let encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                .map_err(|e| DialogueError::Tts(format!("opus encoder init failed: {e}")))?;
        Ok(Self { encoder })
    }

    /// Package PCM into 960-sample frames; the final partial frame is
    /// zero-padded so the client always receives whole frames.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn frames(&mut self, pcm: &[i16]) -> Result<Vec<Vec<u8>>> {
        let mut frames = Vec::with_capacity(pcm.len() / FRAME_SAMPLES + 1);
        let mut padded;
        for chunk in pcm.chunks(FRAME_SAMPLES) {
            let chunk = if chunk.len() == FRAME_SAMPLES {
                chunk
            } else {
                padded = vec![0i16; FRAME_SAMPLES];
                padded[..chunk.len()].copy_from_slice(chunk);
                &padded[..]
            };
            let frame = self
                .encoder
                .encode_vec(chunk, 4000)
                .map_err(|e| DialogueError::Tts(format!("opus encode failed: {e}")))?;
            frames.push(frame);
        }
        Ok(frames)
    }
}

/// Decode an MP3 payload to 16 kHz mono s16 PCM.
///
/// The backend synthesizes at its own rate (typically 24 kHz); the result is
/// downmixed and linearly resampled to the pipeline rate.
///
/// # Errors
///
/// Returns an error if the container cannot be probed or decoded.
pub fn decode_mp3(data: Vec<u8>) -> Result<Vec<i16>> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(data)), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| DialogueError::Tts(format!("mp3 probe failed: {e}")))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| DialogueError::Tts("mp3 payload has no audio track".to_owned()))?;
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DialogueError::Tts(format!("mp3 decoder init failed: {e}")))?;

    let mut interleaved: Vec<f32> = Vec::new();
    let mut source_rate = 0u32;
    let mut channels = 1usize;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(_)) => break,
            Err(symphonia::core::errors::Error::ResetRequired) => break,
            Err(e) => return Err(DialogueError::Tts(format!("mp3 read failed: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                if source_rate == 0 {
                    source_rate = spec.rate;
                    channels = spec.channels.count().max(1);
                }
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                interleaved.extend_from_slice(buf.samples());
            }
            // A corrupt frame is skippable; the rest of the payload stands.
            Err(symphonia::core::errors::Error::DecodeError(_)) => continue,
            Err(e) => return Err(DialogueError::Tts(format!("mp3 decode failed: {e}"))),
        }
    }

    if interleaved.is_empty() || source_rate == 0 {
        return Err(DialogueError::Tts("mp3 payload decoded to no audio".to_owned()));
    }

    let mono = downmix(&interleaved, channels);
    let resampled = if source_rate == SAMPLE_RATE {
        mono
    } else {
        resample_linear(&mono, source_rate, SAMPLE_RATE)
    };

    Ok(resampled
        .into_iter()
        .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect())
}

/// Package s16 PCM as a mono WAV blob for the recognition endpoint.
///
/// # Errors
///
/// Returns an error if WAV encoding fails.
pub fn pcm_to_wav(pcm: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| DialogueError::Asr(format!("wav writer init failed: {e}")))?;
        for &s in pcm {
            writer
                .write_sample(s)
                .map_err(|e| DialogueError::Asr(format!("wav write failed: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| DialogueError::Asr(format!("wav finalize failed: {e}")))?;
    }
    Ok(cursor.into_inner())
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Naive linear resampler. Good enough for speech payloads.
fn resample_linear(samples: &[f32], in_rate: u32, out_rate: u32) -> Vec<f32> {
    if samples.is_empty() || in_rate == 0 || out_rate == 0 {
        return Vec::new();
    }
    let ratio = out_rate as f64 / in_rate as f64;
    let out_len = ((samples.len() as f64) * ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = (i as f64) / ratio;
        let idx = src.floor() as usize;
        let frac = (src - src.floor()) as f32;
        let s0 = samples.get(idx).copied().unwrap_or(samples[samples.len() - 1]);
        let s1 = samples
            .get(idx + 1)
            .copied()
            .unwrap_or(samples[samples.len() - 1]);
        out.push(s0 + (s1 - s0) * frac);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5];
        assert_eq!(downmix(&stereo, 2), vec![0.5, 0.5]);
    }

    #[test]
    fn resample_preserves_duration_ratio() {
        let samples = vec![0.0f32; 24_000];
        let out = resample_linear(&samples, 24_000, 16_000);
        assert_eq!(out.len(), 16_000);
    }

    #[test]
    fn wav_blob_has_riff_header_and_length() {
        let pcm = vec![0i16; 320];
        let wav = pcm_to_wav(&pcm, SAMPLE_RATE).expect("wav");
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 320 * 2);
    }
}
