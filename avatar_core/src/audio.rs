//! Audio clip model, WAV decoding and resampling.
//!
//! Everything downstream of this module works on mono `f32` samples in
//! [-1, 1]. Compressed formats are expected to be transcoded to WAV by the
//! caller; this module only understands RIFF/WAVE payloads.

use std::io::Cursor;

use base64::Engine;
use rubato::{FftFixedInOut, Resampler};

use crate::error::AnimatorError;

/// Frames per rubato processing block. Fixed so resampled output is reproducible.
const RESAMPLE_CHUNK: usize = 1024;

/// Accepted sample rates. Outside this range resampler buffers scale with
/// the rate itself, so a forged header could exhaust memory.
pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 192_000;

fn check_rate(rate: u32) -> Result<(), AnimatorError> {
    if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
        return Err(AnimatorError::InvalidAudioFormat(format!(
            "sample rate {rate} Hz outside {MIN_SAMPLE_RATE}..={MAX_SAMPLE_RATE} Hz"
        )));
    }
    Ok(())
}

/// Mono audio at a known sample rate. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioClip {
    /// Build a clip from mono samples. Values are clamped into [-1, 1].
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Result<Self, AnimatorError> {
        check_rate(sample_rate)?;
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(AnimatorError::InvalidAudioFormat(
                "samples contain NaN or infinite values".to_string(),
            ));
        }
        let samples = samples.into_iter().map(|s| s.clamp(-1.0, 1.0)).collect();
        Ok(Self { samples, sample_rate })
    }

    /// Build a clip from interleaved multi-channel samples by averaging channels.
    pub fn from_interleaved(
        interleaved: &[f32],
        channels: u16,
        sample_rate: u32,
    ) -> Result<Self, AnimatorError> {
        if channels == 0 {
            return Err(AnimatorError::InvalidAudioFormat(
                "channel count must be positive".to_string(),
            ));
        }
        let ch = channels as usize;
        if interleaved.len() % ch != 0 {
            return Err(AnimatorError::InvalidAudioFormat(format!(
                "{} samples do not divide into {} channels",
                interleaved.len(),
                ch
            )));
        }
        let mono = if ch == 1 {
            interleaved.to_vec()
        } else {
            interleaved
                .chunks_exact(ch)
                .map(|frame| frame.iter().sum::<f32>() / ch as f32)
                .collect()
        };
        Self::new(mono, sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Return a clip at `target_rate`, resampling only when the rates differ.
    pub fn resampled(&self, target_rate: u32) -> Result<AudioClip, AnimatorError> {
        if target_rate == self.sample_rate {
            return Ok(self.clone());
        }
        let samples = resample(&self.samples, self.sample_rate, target_rate)?;
        AudioClip::new(samples, target_rate)
    }
}

/// Decode a WAV payload into a mono clip.
///
/// Accepts integer PCM at 16, 24 or 32 bits and 32-bit float.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioClip, AnimatorError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    // Before reading samples: the header alone decides whether to go on
    check_rate(spec.sample_rate)?;
    if spec.channels == 0 {
        return Err(AnimatorError::InvalidAudioFormat(
            "WAV header declares zero channels".to_string(),
        ));
    }

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .into_samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32_768.0))
            .collect::<Result<_, _>>()?,
        (hound::SampleFormat::Int, 24) => reader
            .into_samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 8_388_608.0))
            .collect::<Result<_, _>>()?,
        (hound::SampleFormat::Int, 32) => reader
            .into_samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 2_147_483_648.0))
            .collect::<Result<_, _>>()?,
        (hound::SampleFormat::Float, 32) => {
            reader.into_samples::<f32>().collect::<Result<_, _>>()?
        }
        (format, bits) => {
            return Err(AnimatorError::InvalidAudioFormat(format!(
                "unsupported sample layout: {bits}-bit {format:?}"
            )));
        }
    };

    AudioClip::from_interleaved(&interleaved, spec.channels, spec.sample_rate)
}

/// Decode a base64-wrapped WAV payload.
pub fn decode_wav_base64(encoded: &str) -> Result<AudioClip, AnimatorError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| AnimatorError::InvalidAudioFormat(format!("invalid base64: {e}")))?;
    decode_wav(&bytes)
}

/// Encode a clip as 16-bit mono PCM WAV.
pub fn encode_wav(clip: &AudioClip) -> Result<Vec<u8>, AnimatorError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: clip.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    // WAV header (44 bytes) + 2 bytes per sample
    let mut cursor = Cursor::new(Vec::<u8>::with_capacity(44 + clip.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| AnimatorError::InvalidAudioFormat(format!("wav write err: {e}")))?;
        const I16_MAX_F32: f32 = i16::MAX as f32;
        for &s in &clip.samples {
            writer
                .write_sample((s.clamp(-1.0, 1.0) * I16_MAX_F32) as i16)
                .map_err(|e| AnimatorError::InvalidAudioFormat(format!("wav sample err: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| AnimatorError::InvalidAudioFormat(format!("wav finalize err: {e}")))?;
    }
    Ok(cursor.into_inner())
}

/// Resample mono samples with rubato's FFT resampler.
///
/// The resampler delay is trimmed so sample `n` of the output lines up with
/// time `n / to` of the input. Output length is `floor(len * to / from)`.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>, AnimatorError> {
    check_rate(from)?;
    check_rate(to)?;
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let expected = (samples.len() as u64 * to as u64 / from as u64) as usize;
    let mut resampler = FftFixedInOut::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 1)?;
    let delay = resampler.output_delay();
    let mut out: Vec<f32> = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut pos = 0usize;
    while pos + resampler.input_frames_next() <= samples.len() {
        let n = resampler.input_frames_next();
        let chunk: [&[f32]; 1] = [&samples[pos..pos + n]];
        let block = resampler.process(&chunk[..], None)?;
        out.extend_from_slice(&block[0]);
        pos += n;
    }
    if pos < samples.len() {
        let tail: [&[f32]; 1] = [&samples[pos..]];
        let block = resampler.process_partial(Some(&tail[..]), None)?;
        out.extend_from_slice(&block[0]);
    }
    // Flush the delay line with silence until the tail is out.
    while out.len() < expected + delay {
        let block = resampler.process_partial(None::<&[&[f32]]>, None)?;
        if block[0].is_empty() {
            break;
        }
        out.extend_from_slice(&block[0]);
    }

    out.drain(..delay.min(out.len()));
    out.truncate(expected);
    Ok(out.into_iter().map(|s| s.clamp(-1.0, 1.0)).collect())
}
