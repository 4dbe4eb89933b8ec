//! Frame synthesis strategies.
//!
//! A [`SynthesisStrategy`] is chosen once per stream. The stream binds it to
//! its feature sequence as a [`HeuristicSynth`] or a [`ModelSynth`], each of
//! which turns one feature window into one frame at the avatar's resolution.

pub mod heuristic;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx;

use std::sync::Arc;

use image::RgbImage;
use serde::Serialize;

pub use heuristic::{EnergyNormalizer, HeuristicSynth, MouthStyle};
pub use model::{CallingConvention, InferenceBackend, LoadedModel, ModelConfig, ModelSynth, OutputRange};

/// One output picture, always the avatar resource's dimensions.
pub type Frame = RgbImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Heuristic,
    ModelBacked,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Heuristic => "heuristic",
            StrategyKind::ModelBacked => "model_backed",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SynthesisStrategy {
    Heuristic,
    ModelBacked(Arc<LoadedModel>),
}

impl SynthesisStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            SynthesisStrategy::Heuristic => StrategyKind::Heuristic,
            SynthesisStrategy::ModelBacked(_) => StrategyKind::ModelBacked,
        }
    }
}
