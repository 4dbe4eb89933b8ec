//! Energy-driven mouth compositing.
//!
//! No model involved: the loudness of each feature window decides how far an
//! elliptical mouth opens on top of the base avatar.

use image::{Rgb, RgbImage};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::avatar::AvatarResource;
use crate::features::{column_energy, FeatureSequence};

use super::Frame;

/// Openness at zero energy. Keeps an idle mouth visible.
pub const MIN_OPENNESS: f32 = 0.15;

const FLOOR_PERCENTILE: f32 = 10.0;
const CEILING_PERCENTILE: f32 = 98.0;
const CEILING_EPSILON: f32 = 1e-4;

/// Where and how the mouth is drawn, as fractions of the frame size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouthStyle {
    pub center_x_frac: f32,
    pub center_y_frac: f32,
    pub half_width_frac: f32,
    /// Vertical semi-axis of the cavity at openness 1.0.
    pub max_half_height_frac: f32,
    /// Thickness of the outline ring.
    pub ring_frac: f32,
    pub ring_color: [u8; 3],
    pub ring_alpha: f32,
    pub cavity_color: [u8; 3],
    pub cavity_alpha: f32,
}

impl Default for MouthStyle {
    fn default() -> Self {
        Self {
            center_x_frac: 0.5,
            center_y_frac: 0.67,
            half_width_frac: 0.11,
            max_half_height_frac: 0.06,
            ring_frac: 0.012,
            ring_color: [120, 20, 28],
            ring_alpha: 0.55,
            cavity_color: [40, 6, 10],
            cavity_alpha: 0.92,
        }
    }
}

/// Maps raw window energy into [0, 1] using percentiles of the whole sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyNormalizer {
    floor: f32,
    ceiling: f32,
}

impl EnergyNormalizer {
    pub fn new(floor: f32, ceiling: f32) -> Self {
        let ceiling = if ceiling <= floor { floor + CEILING_EPSILON } else { ceiling };
        Self { floor, ceiling }
    }

    /// 10th/98th percentile of per-column energy.
    pub fn from_sequence(seq: &FeatureSequence) -> Self {
        let mut energies = seq.column_energy();
        if energies.is_empty() {
            return Self::new(0.0, 0.0);
        }
        energies.sort_by(|a, b| a.total_cmp(b));
        Self::new(
            percentile(&energies, FLOOR_PERCENTILE),
            percentile(&energies, CEILING_PERCENTILE),
        )
    }

    pub fn floor(&self) -> f32 {
        self.floor
    }

    pub fn ceiling(&self) -> f32 {
        self.ceiling
    }

    pub fn normalize(&self, energy: f32) -> f32 {
        ((energy - self.floor) / (self.ceiling - self.floor)).clamp(0.0, 1.0)
    }
}

/// Linear-interpolated percentile of an ascending slice.
fn percentile(sorted: &[f32], p: f32) -> f32 {
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Mean of the window's column energies. `None` for an empty window.
pub fn window_energy(window: ArrayView2<'_, f32>) -> Option<f32> {
    let energies = column_energy(window);
    if energies.is_empty() {
        return None;
    }
    let sum: f64 = energies.iter().map(|&e| e as f64).sum();
    Some((sum / energies.len() as f64) as f32)
}

/// `0.15 + 0.85 * normalized`, clamped to [0.15, 1.0].
pub fn openness_from_normalized(normalized: f32) -> f32 {
    (MIN_OPENNESS + (1.0 - MIN_OPENNESS) * normalized).clamp(MIN_OPENNESS, 1.0)
}

/// Heuristic synthesizer bound to one feature sequence.
#[derive(Debug, Clone)]
pub struct HeuristicSynth {
    normalizer: EnergyNormalizer,
    style: MouthStyle,
}

impl HeuristicSynth {
    pub fn new(normalizer: EnergyNormalizer, style: MouthStyle) -> Self {
        Self { normalizer, style }
    }

    pub fn for_sequence(seq: &FeatureSequence, style: MouthStyle) -> Self {
        Self::new(EnergyNormalizer::from_sequence(seq), style)
    }

    pub fn openness(&self, window: ArrayView2<'_, f32>) -> f32 {
        let normalized = window_energy(window)
            .map(|e| self.normalizer.normalize(e))
            .unwrap_or(0.0);
        openness_from_normalized(normalized)
    }

    pub fn synthesize(&self, resource: &AvatarResource, window: ArrayView2<'_, f32>) -> Frame {
        draw_mouth(resource.base(), self.openness(window), &self.style)
    }
}

/// Composite the mouth at `openness` onto a copy of `base`.
pub fn draw_mouth(base: &RgbImage, openness: f32, style: &MouthStyle) -> Frame {
    let mut frame = base.clone();
    let (w, h) = frame.dimensions();
    if w == 0 || h == 0 {
        return frame;
    }

    let openness = openness.clamp(MIN_OPENNESS, 1.0);
    let cx = w as f32 * style.center_x_frac;
    let cy = h as f32 * style.center_y_frac;
    let rx = (w as f32 * style.half_width_frac).max(1.0);
    let ry = (h as f32 * style.max_half_height_frac * openness).max(1.0);
    let ring = (w.min(h) as f32 * style.ring_frac).max(1.0);
    let (orx, ory) = (rx + ring, ry + ring);

    let x0 = (cx - orx).floor().max(0.0) as u32;
    let x1 = ((cx + orx).ceil().max(0.0) as u32).min(w);
    let y0 = (cy - ory).floor().max(0.0) as u32;
    let y1 = ((cy + ory).ceil().max(0.0) as u32).min(h);

    for y in y0..y1 {
        let dy = y as f32 + 0.5 - cy;
        for x in x0..x1 {
            let dx = x as f32 + 0.5 - cx;
            let inner = (dx / rx).powi(2) + (dy / ry).powi(2);
            let outer = (dx / orx).powi(2) + (dy / ory).powi(2);
            let px = frame.get_pixel_mut(x, y);
            if inner <= 1.0 {
                blend(px, style.cavity_color, style.cavity_alpha);
            } else if outer <= 1.0 {
                blend(px, style.ring_color, style.ring_alpha);
            }
        }
    }
    frame
}

fn blend(px: &mut Rgb<u8>, color: [u8; 3], alpha: f32) {
    let a = alpha.clamp(0.0, 1.0);
    for c in 0..3 {
        let v = a * color[c] as f32 + (1.0 - a) * px[c] as f32;
        px[c] = v.round().clamp(0.0, 255.0) as u8;
    }
}
