//! Learned lip-sync synthesis.
//!
//! The network takes a normalised mel window `[1, 1, 80, 16]` and a face
//! tensor `[1, 6, 96, 96]` (masked face stacked on the reference face), and
//! returns a `[1, 3, 96, 96]` patch that is pasted back into the face region.
//! Exported graphs disagree on input order, so the order is detected on the
//! first call and remembered for the lifetime of the model.

use std::sync::{Arc, OnceLock};

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{concatenate, Array3, Array4, ArrayD, ArrayView2, ArrayView4, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::avatar::AvatarResource;
use crate::error::AnimatorError;
use crate::features::FeatureSequence;

use super::Frame;

const MEL_SCALE_EPSILON: f32 = 1e-8;

/// Anything that can evaluate the two-input lip-sync network.
///
/// Inputs are passed in graph declaration order; the caller decides which
/// tensor goes first.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, first: ArrayView4<'_, f32>, second: ArrayView4<'_, f32>)
        -> anyhow::Result<ArrayD<f32>>;
}

/// Order in which the network expects its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallingConvention {
    MelFirst,
    FaceFirst,
}

/// Range of the raw network output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputRange {
    /// `[-1, 1]`
    Signed,
    /// `[0, 1]`
    Unit,
}

impl OutputRange {
    fn to_u8(self, v: f32) -> u8 {
        let unit = match self {
            OutputRange::Signed => (v.clamp(-1.0, 1.0) + 1.0) * 0.5,
            OutputRange::Unit => v.clamp(0.0, 1.0),
        };
        (unit * 255.0).round() as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Mel columns per inference window.
    pub window: usize,
    /// Feed `[masked, reference]` (6 channels) rather than the reference alone.
    pub pair_with_mask: bool,
    pub output_range: OutputRange,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            window: 16,
            pair_with_mask: true,
            output_range: OutputRange::Signed,
        }
    }
}

/// A ready-to-run network plus its detected calling convention.
pub struct LoadedModel {
    backend: Box<dyn InferenceBackend>,
    config: ModelConfig,
    convention: OnceLock<CallingConvention>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("convention", &self.convention.get())
            .finish()
    }
}

impl LoadedModel {
    pub fn new(backend: Box<dyn InferenceBackend>, config: ModelConfig) -> Self {
        Self {
            backend,
            config,
            convention: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// `None` until the first successful inference.
    pub fn convention(&self) -> Option<CallingConvention> {
        self.convention.get().copied()
    }

    /// Run one window and return the `[3, h, w]` patch.
    pub fn infer(
        &self,
        mel: ArrayView4<'_, f32>,
        face: ArrayView4<'_, f32>,
    ) -> Result<Array3<f32>, AnimatorError> {
        if let Some(conv) = self.convention.get() {
            return self
                .call(*conv, mel, face)
                .map_err(|e| AnimatorError::SynthesisUnavailable(format!("{e:#}")));
        }

        let mel_first = match self.call(CallingConvention::MelFirst, mel, face) {
            Ok(patch) => {
                self.remember(CallingConvention::MelFirst);
                return Ok(patch);
            }
            Err(e) => e,
        };
        debug!(error = %mel_first, "mel-first call failed, trying face-first");
        match self.call(CallingConvention::FaceFirst, mel, face) {
            Ok(patch) => {
                self.remember(CallingConvention::FaceFirst);
                Ok(patch)
            }
            Err(face_first) => Err(AnimatorError::SynthesisUnavailable(format!(
                "no calling convention accepted: mel-first: {mel_first:#}; face-first: {face_first:#}"
            ))),
        }
    }

    fn remember(&self, conv: CallingConvention) {
        if self.convention.set(conv).is_ok() {
            info!(backend = self.backend.name(), convention = ?conv, "detected model calling convention");
        }
    }

    fn call(
        &self,
        conv: CallingConvention,
        mel: ArrayView4<'_, f32>,
        face: ArrayView4<'_, f32>,
    ) -> anyhow::Result<Array3<f32>> {
        let out = match conv {
            CallingConvention::MelFirst => self.backend.run(mel, face)?,
            CallingConvention::FaceFirst => self.backend.run(face, mel)?,
        };
        to_patch(out)
    }
}

/// Accepts `[1, 3, h, w]` or `[3, h, w]`.
fn to_patch(out: ArrayD<f32>) -> anyhow::Result<Array3<f32>> {
    let (h, w) = match out.shape() {
        [1, 3, h, w] | [3, h, w] if *h > 0 && *w > 0 => (*h, *w),
        other => anyhow::bail!("unexpected output shape {other:?}"),
    };
    let data: Vec<f32> = out.iter().copied().collect();
    Ok(Array3::from_shape_vec((3, h, w), data)?)
}

/// Model-backed synthesizer bound to one feature sequence.
#[derive(Debug, Clone)]
pub struct ModelSynth {
    model: Arc<LoadedModel>,
    mel_min: f32,
    mel_span: f32,
}

impl ModelSynth {
    /// Mel windows are min-max scaled with the bounds of the whole sequence.
    pub fn for_sequence(model: Arc<LoadedModel>, seq: &FeatureSequence) -> Self {
        let (lo, hi) = seq.min_max().unwrap_or((0.0, 0.0));
        Self {
            model,
            mel_min: lo,
            mel_span: hi - lo + MEL_SCALE_EPSILON,
        }
    }

    pub fn window_size(&self) -> usize {
        self.model.config().window
    }

    pub fn synthesize(
        &self,
        resource: &AvatarResource,
        window: ArrayView2<'_, f32>,
    ) -> Result<Frame, AnimatorError> {
        let need = self.window_size();
        if window.ncols() < need {
            return Err(AnimatorError::SynthesisUnavailable(format!(
                "window has {} columns, model needs {need}",
                window.ncols()
            )));
        }

        let mel = Array4::from_shape_fn((1, 1, window.nrows(), need), |(_, _, b, t)| {
            (window[[b, t]] - self.mel_min) / self.mel_span
        });
        let face = face_input(resource, self.model.config().pair_with_mask)?;
        let patch = self.model.infer(mel.view(), face.view())?;
        let rgb = patch_to_image(&patch, self.model.config().output_range);
        Ok(composite(resource, &rgb))
    }
}

fn face_input(resource: &AvatarResource, pair_with_mask: bool) -> Result<Array4<f32>, AnimatorError> {
    let tensors = resource.face_tensors();
    let face = if pair_with_mask {
        concatenate(Axis(0), &[tensors.masked.view(), tensors.reference.view()])
            .map_err(|e| AnimatorError::SynthesisUnavailable(e.to_string()))?
    } else {
        tensors.reference.clone()
    };
    Ok(face.insert_axis(Axis(0)))
}

fn patch_to_image(patch: &Array3<f32>, range: OutputRange) -> RgbImage {
    let (_, h, w) = patch.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        image::Rgb([
            range.to_u8(patch[[0, y, x]]),
            range.to_u8(patch[[1, y, x]]),
            range.to_u8(patch[[2, y, x]]),
        ])
    })
}

/// Scale the patch to the face region and paste it over a copy of the base.
fn composite(resource: &AvatarResource, patch: &RgbImage) -> Frame {
    let r = resource.region();
    let mut frame = resource.base().clone();
    let scaled = if patch.dimensions() == (r.width, r.height) {
        patch.clone()
    } else {
        imageops::resize(patch, r.width, r.height, FilterType::CatmullRom)
    };
    imageops::replace(&mut frame, &scaled, r.x as i64, r.y as i64);
    frame
}
