//! Audio-driven talking-head animation.
//!
//! Audio is turned into a log-mel [`FeatureSequence`], an avatar image into
//! an [`AvatarResource`], and a [`FrameCursor`] releases one synthesized
//! frame per feature window at the requested frame rate. Synthesis is
//! model-backed when weights are available and falls back to an energy
//! heuristic otherwise, per process or mid-stream. A [`VisemeTimeline`] can
//! drive the same heuristic mouth in place of audio.

pub mod audio;
pub mod avatar;
pub mod error;
pub mod features;
pub mod selector;
pub mod stream;
pub mod synth;
pub mod viseme;

use std::sync::Arc;

use image::{DynamicImage, Rgb, RgbImage};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use audio::{decode_wav, decode_wav_base64, encode_wav, AudioClip};
pub use avatar::{AvatarCache, AvatarKey, AvatarOrigin, AvatarPreprocessor, AvatarResource, CropGeometry};
pub use error::AnimatorError;
pub use features::{FeatureConfig, FeatureExtractor, FeatureSequence};
pub use selector::{ModelService, ModelStatus, StrategySelector};
pub use stream::{FrameCursor, PacedFrame, PacedStreamer, StreamState, StreamStats, WindowPlan};
pub use synth::{
    Frame, InferenceBackend, LoadedModel, ModelConfig, MouthStyle, OutputRange, StrategyKind,
    SynthesisStrategy,
};
pub use viseme::{Viseme, VisemeTimeline};

/// Fill used when a stream has no avatar image.
pub const BLANK_BACKGROUND: [u8; 3] = [11, 11, 13];

/// Everything tunable in the pipeline.
#[derive(Debug, Clone)]
pub struct AnimatorConfig {
    pub features: FeatureConfig,
    pub crop: CropGeometry,
    pub mouth: MouthStyle,
    pub model: ModelConfig,
    pub avatar_cache_size: usize,
}

impl Default for AnimatorConfig {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            crop: CropGeometry::default(),
            mouth: MouthStyle::default(),
            model: ModelConfig::default(),
            avatar_cache_size: 32,
        }
    }
}

/// Where a request's avatar comes from.
#[derive(Debug, Clone, Copy)]
pub enum AvatarSource<'a> {
    /// Encoded image with a stable name, e.g. a storage key.
    Named { key: &'a str, bytes: &'a [u8] },
    /// Encoded image with no name; cached by content hash.
    Inline(&'a [u8]),
    /// No image: a flat [`BLANK_BACKGROUND`] canvas.
    Blank,
}

/// Shared entry point. One per process, cheap to clone.
#[derive(Debug, Clone)]
pub struct Animator {
    extractor: Arc<FeatureExtractor>,
    preprocessor: AvatarPreprocessor,
    cache: Arc<AvatarCache>,
    models: Arc<ModelService>,
    selector: StrategySelector,
    streamer: PacedStreamer,
}

impl Animator {
    pub fn new(config: AnimatorConfig, models: ModelService) -> Result<Self, AnimatorError> {
        let models = Arc::new(models);
        let extractor = FeatureExtractor::new(config.features)?;
        info!(
            column_rate = extractor.config().column_rate(),
            avatar_cache_size = config.avatar_cache_size,
            "animator initialised"
        );
        Ok(Self {
            extractor: Arc::new(extractor),
            preprocessor: AvatarPreprocessor::new(config.crop),
            cache: Arc::new(AvatarCache::new(config.avatar_cache_size)),
            selector: StrategySelector::new(models.clone()),
            models,
            streamer: PacedStreamer::new(config.mouth),
        })
    }

    pub fn cache(&self) -> &AvatarCache {
        &self.cache
    }

    pub fn models(&self) -> &ModelService {
        &self.models
    }

    pub fn model_status(&self) -> ModelStatus {
        self.models.status()
    }

    pub fn extract_features(&self, clip: &AudioClip) -> Result<FeatureSequence, AnimatorError> {
        self.extractor.extract(clip)
    }

    /// Decode and resize an avatar, reusing a cached copy when one exists.
    pub fn prepare_avatar(
        &self,
        source: AvatarSource<'_>,
        width: u32,
        height: u32,
    ) -> Result<Arc<AvatarResource>, AnimatorError> {
        let (key, bytes) = match source {
            AvatarSource::Named { key, bytes } => (AvatarKey::new(key, width, height), bytes),
            AvatarSource::Inline(bytes) => (AvatarKey::for_bytes(bytes, width, height), bytes),
            AvatarSource::Blank => {
                let key = AvatarKey { source: AvatarOrigin::Blank, width, height };
                return self.cache.get_or_prepare(key, || {
                    let canvas = RgbImage::from_pixel(width.max(1), height.max(1), Rgb(BLANK_BACKGROUND));
                    self.preprocessor
                        .prepare(&DynamicImage::ImageRgb8(canvas), width, height)
                });
            }
        };
        self.cache
            .get_or_prepare(key, || self.preprocessor.prepare_bytes(bytes, width, height))
    }

    pub fn select(&self, prefer_model: bool) -> SynthesisStrategy {
        self.selector.select(prefer_model)
    }

    /// Validate inputs and open a paced stream.
    ///
    /// Audio and avatar problems are reported here, before any frame exists.
    /// Blocks while extracting features and, on first use, loading the model.
    pub fn open_stream(
        &self,
        avatar: Arc<AvatarResource>,
        audio: &AudioClip,
        fps: u32,
        prefer_model: bool,
        cancel: CancellationToken,
    ) -> Result<FrameCursor, AnimatorError> {
        let features = Arc::new(self.extract_features(audio)?);
        let strategy = self.select(prefer_model);
        let (w, h) = (avatar.width(), avatar.height());
        self.streamer
            .stream(strategy, avatar, features, w, h, fps, cancel)
    }

    /// Open a paced stream whose mouth follows `timeline` instead of audio.
    /// Always heuristic; no features are extracted and no model is loaded.
    pub fn open_viseme_stream(
        &self,
        avatar: Arc<AvatarResource>,
        timeline: Arc<VisemeTimeline>,
        fps: u32,
        cancel: CancellationToken,
    ) -> Result<FrameCursor, AnimatorError> {
        let (w, h) = (avatar.width(), avatar.height());
        self.streamer.visemes(avatar, timeline, w, h, fps, cancel)
    }
}
