//! Log-magnitude mel spectrogram extraction.
//!
//! Parameters follow the usual talking-head front end: 16 kHz input, 80 mel
//! bands between 50 and 7600 Hz, a 400-sample Hann window and a 160-sample
//! hop (one column every 10 ms). Frames are centered, so column `t` describes
//! the audio around `t * hop` samples.

use std::f64::consts::PI;
use std::ops::Range;
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView2};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tracing::debug;

use crate::audio::AudioClip;
use crate::error::AnimatorError;

/// Extraction parameters. The defaults are the fixed working parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureConfig {
    pub sample_rate: u32,
    pub n_mels: usize,
    pub n_fft: usize,
    pub hop_size: usize,
    pub win_length: usize,
    pub f_min: f64,
    pub f_max: f64,
    /// Magnitudes below this are raised to it before the log.
    pub floor: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            n_mels: 80,
            n_fft: 400,
            hop_size: 160,
            win_length: 400,
            f_min: 50.0,
            f_max: 7_600.0,
            floor: 1e-6,
        }
    }
}

impl FeatureConfig {
    /// Feature columns per second of audio.
    pub fn column_rate(&self) -> f64 {
        self.sample_rate as f64 / self.hop_size as f64
    }

    fn validate(&self) -> Result<(), AnimatorError> {
        if self.sample_rate == 0 || self.hop_size == 0 || self.n_mels == 0 {
            return Err(AnimatorError::InvalidConfig(
                "sample rate, hop size and band count must be positive".to_string(),
            ));
        }
        if self.win_length == 0 || self.win_length > self.n_fft {
            return Err(AnimatorError::InvalidConfig(format!(
                "window length {} must be in 1..={}",
                self.win_length, self.n_fft
            )));
        }
        if !(self.f_min >= 0.0 && self.f_min < self.f_max && self.f_max <= self.sample_rate as f64 / 2.0) {
            return Err(AnimatorError::InvalidConfig(format!(
                "band range {}..{} Hz is not inside 0..{} Hz",
                self.f_min,
                self.f_max,
                self.sample_rate / 2
            )));
        }
        Ok(())
    }
}

/// Log-compressed mel magnitudes, shape `[bands, T]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSequence {
    values: Array2<f32>,
    column_rate: f64,
}

impl FeatureSequence {
    pub fn new(values: Array2<f32>, column_rate: f64) -> Self {
        Self { values, column_rate }
    }

    pub fn bands(&self) -> usize {
        self.values.nrows()
    }

    /// Number of time steps (columns).
    pub fn len(&self) -> usize {
        self.values.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.values.ncols() == 0
    }

    pub fn column_rate(&self) -> f64 {
        self.column_rate
    }

    pub fn values(&self) -> ArrayView2<'_, f32> {
        self.values.view()
    }

    /// Columns `range`, clipped to the sequence.
    pub fn window(&self, range: Range<usize>) -> ArrayView2<'_, f32> {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        self.values.slice(ndarray::s![.., start..end])
    }

    /// Mean over bands for every column.
    pub fn column_energy(&self) -> Vec<f32> {
        column_energy(self.values.view())
    }

    /// Smallest and largest value in the sequence, `None` when empty.
    pub fn min_max(&self) -> Option<(f32, f32)> {
        if self.values.is_empty() {
            return None;
        }
        let (lo, hi) = self
            .values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        Some((lo, hi))
    }
}

/// Per-column band mean of a `[bands, T]` view.
///
/// Accumulates in band order so a column scores the same whether it is
/// read from the whole sequence or from a window of it.
pub fn column_energy(values: ArrayView2<'_, f32>) -> Vec<f32> {
    let bands = values.nrows();
    if bands == 0 {
        return vec![0.0; values.ncols()];
    }
    values
        .columns()
        .into_iter()
        .map(|col| (col.iter().map(|&v| v as f64).sum::<f64>() / bands as f64) as f32)
        .collect()
}

/// Converts clips into [`FeatureSequence`]s. Cheap to share; the FFT plan,
/// window and filterbank are built once.
#[derive(Clone)]
pub struct FeatureExtractor {
    cfg: FeatureConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    filters: Array2<f32>,
}

impl std::fmt::Debug for FeatureExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("cfg", &self.cfg)
            .field("fft", &"<rustfft plan>")
            .field("filters", &self.filters.dim())
            .finish()
    }
}

impl FeatureExtractor {
    pub fn new(cfg: FeatureConfig) -> Result<Self, AnimatorError> {
        cfg.validate()?;
        let fft = FftPlanner::<f32>::new().plan_fft_forward(cfg.n_fft);
        let window = padded_hann(cfg.win_length, cfg.n_fft);
        let filters = mel_filterbank(cfg.sample_rate, cfg.n_fft, cfg.n_mels, cfg.f_min, cfg.f_max);
        Ok(Self { cfg, fft, window, filters })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.cfg
    }

    /// Compute the feature sequence for a clip, resampling to the working rate first.
    pub fn extract(&self, clip: &AudioClip) -> Result<FeatureSequence, AnimatorError> {
        let clip = clip.resampled(self.cfg.sample_rate)?;
        let values = self.log_mel(clip.samples());
        debug!(
            columns = values.ncols(),
            duration_secs = clip.duration_secs(),
            "extracted features"
        );
        Ok(FeatureSequence::new(values, self.cfg.column_rate()))
    }

    fn log_mel(&self, samples: &[f32]) -> Array2<f32> {
        let cfg = &self.cfg;
        if samples.is_empty() {
            return Array2::zeros((cfg.n_mels, 0));
        }

        let n_fft = cfg.n_fft;
        let pad = n_fft / 2;
        let n_frames = 1 + samples.len() / cfg.hop_size;
        let n_freqs = n_fft / 2 + 1;

        // Zero-padded signal so frame t is centered on sample t * hop.
        let mut padded = vec![0.0f32; samples.len() + 2 * pad];
        padded[pad..pad + samples.len()].copy_from_slice(samples);

        let mut out = Array2::<f32>::zeros((cfg.n_mels, n_frames));
        let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.fft.get_inplace_scratch_len()];
        let mut magnitude = Array1::<f32>::zeros(n_freqs);

        for t in 0..n_frames {
            let start = t * cfg.hop_size;
            for (i, slot) in buffer.iter_mut().enumerate() {
                let s = padded.get(start + i).copied().unwrap_or(0.0);
                *slot = Complex::new(s * self.window[i], 0.0);
            }
            self.fft.process_with_scratch(&mut buffer, &mut scratch);
            for (k, m) in magnitude.iter_mut().enumerate() {
                *m = buffer[k].norm();
            }

            let mel = self.filters.dot(&magnitude);
            for (band, &v) in mel.iter().enumerate() {
                out[[band, t]] = v.max(cfg.floor).ln();
            }
        }
        out
    }
}

/// Periodic Hann window of `win_length`, centered inside `n_fft` zeros.
fn padded_hann(win_length: usize, n_fft: usize) -> Vec<f32> {
    let mut window = vec![0.0f32; n_fft];
    let offset = (n_fft - win_length) / 2;
    for i in 0..win_length {
        let w = 0.5 - 0.5 * (2.0 * PI * i as f64 / win_length as f64).cos();
        window[offset + i] = w as f32;
    }
    window
}

// Slaney mel scale: linear below 1 kHz, logarithmic above.
const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1_000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn logstep() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / logstep()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (logstep() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Triangular, area-normalised mel filters. Shape `[n_mels, n_fft / 2 + 1]`.
pub(crate) fn mel_filterbank(
    sample_rate: u32,
    n_fft: usize,
    n_mels: usize,
    f_min: f64,
    f_max: f64,
) -> Array2<f32> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let lo = hz_to_mel(f_min);
    let hi = hz_to_mel(f_max);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(lo + (hi - lo) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut weights = Array2::<f32>::zeros((n_mels, n_freqs));
    for m in 0..n_mels {
        let (left, center, right) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
        let norm = 2.0 / (right - left);
        for (k, &f) in fft_freqs.iter().enumerate() {
            let rising = (f - left) / (center - left);
            let falling = (right - f) / (right - center);
            let w = rising.min(falling).max(0.0);
            weights[[m, k]] = (w * norm) as f32;
        }
    }
    weights
}
