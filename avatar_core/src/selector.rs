//! Process-wide model loading and per-request strategy choice.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::AnimatorError;
use crate::synth::{LoadedModel, ModelConfig, SynthesisStrategy};

type Loader = Box<dyn Fn() -> Result<LoadedModel, AnimatorError> + Send + Sync>;

enum ModelState {
    Loaded(Arc<LoadedModel>),
    Failed(String),
}

/// Readiness of the model-backed path, as reported by `/ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelStatus {
    NotAttempted,
    Ready { backend: String },
    Unavailable { reason: String },
}

/// Owns the single lazily-loaded model of the process.
///
/// The load runs at most once. A failure is kept as a negative result and
/// every later call gets the same error without touching the loader again.
pub struct ModelService {
    loader: Option<Loader>,
    state: OnceLock<ModelState>,
    attempts: AtomicUsize,
}

impl std::fmt::Debug for ModelService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelService")
            .field("status", &self.status())
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl ModelService {
    /// No weights configured; every load reports `ModelLoadFailure`.
    pub fn disabled() -> Self {
        Self {
            loader: None,
            state: OnceLock::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn with_loader<F>(loader: F) -> Self
    where
        F: Fn() -> Result<LoadedModel, AnimatorError> + Send + Sync + 'static,
    {
        Self {
            loader: Some(Box::new(loader)),
            state: OnceLock::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Load ONNX weights from `path` on first use.
    #[cfg(feature = "onnx")]
    pub fn onnx(path: PathBuf, intra_threads: usize, config: ModelConfig) -> Self {
        Self::with_loader(move || {
            if !path.is_file() {
                return Err(AnimatorError::ModelLoadFailure(format!(
                    "weights not found at {}",
                    path.display()
                )));
            }
            let backend = crate::synth::onnx::OnnxBackend::load(&path, intra_threads)
                .map_err(|e| AnimatorError::ModelLoadFailure(format!("{e:#}")))?;
            Ok(LoadedModel::new(Box::new(backend), config.clone()))
        })
    }

    #[cfg(not(feature = "onnx"))]
    pub fn onnx(path: PathBuf, _intra_threads: usize, _config: ModelConfig) -> Self {
        Self::with_loader(move || {
            Err(AnimatorError::ModelLoadFailure(format!(
                "built without onnx support, cannot load {}",
                path.display()
            )))
        })
    }

    /// The loaded model, loading it if this is the first call.
    pub fn load(&self) -> Result<Arc<LoadedModel>, AnimatorError> {
        let state = self.state.get_or_init(|| {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let result = match &self.loader {
                Some(load) => load(),
                None => Err(AnimatorError::ModelLoadFailure("no model configured".into())),
            };
            match result {
                Ok(model) => {
                    info!(backend = model.backend_name(), "lip-sync model ready");
                    ModelState::Loaded(Arc::new(model))
                }
                Err(e) => {
                    warn!(error = %e, "lip-sync model unavailable, using heuristic synthesis");
                    ModelState::Failed(e.to_string())
                }
            }
        });
        match state {
            ModelState::Loaded(model) => Ok(model.clone()),
            ModelState::Failed(reason) => Err(AnimatorError::ModelLoadFailure(reason.clone())),
        }
    }

    pub fn status(&self) -> ModelStatus {
        match self.state.get() {
            None => ModelStatus::NotAttempted,
            Some(ModelState::Loaded(m)) => ModelStatus::Ready {
                backend: m.backend_name().to_string(),
            },
            Some(ModelState::Failed(reason)) => ModelStatus::Unavailable {
                reason: reason.clone(),
            },
        }
    }

    /// How many times the loader has run. Never exceeds one.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Picks the synthesis strategy for a new stream.
#[derive(Debug, Clone)]
pub struct StrategySelector {
    models: Arc<ModelService>,
}

impl StrategySelector {
    pub fn new(models: Arc<ModelService>) -> Self {
        Self { models }
    }

    /// Model-backed only when requested and the model loads. Never fails.
    pub fn select(&self, prefer_model: bool) -> SynthesisStrategy {
        if !prefer_model {
            return SynthesisStrategy::Heuristic;
        }
        match self.models.load() {
            Ok(model) => SynthesisStrategy::ModelBacked(model),
            Err(e) => {
                debug!(error = %e, "model-backed synthesis requested but unavailable");
                SynthesisStrategy::Heuristic
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{InferenceBackend, StrategyKind};
    use ndarray::{ArrayD, ArrayView4, IxDyn};

    struct Echo;

    impl InferenceBackend for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn run(&self, _: ArrayView4<'_, f32>, _: ArrayView4<'_, f32>) -> anyhow::Result<ArrayD<f32>> {
            Ok(ArrayD::zeros(IxDyn(&[1, 3, 96, 96])))
        }
    }

    fn working() -> Arc<ModelService> {
        Arc::new(ModelService::with_loader(|| {
            Ok(LoadedModel::new(Box::new(Echo), ModelConfig::default()))
        }))
    }

    fn failing() -> Arc<ModelService> {
        Arc::new(ModelService::with_loader(|| {
            Err(AnimatorError::ModelLoadFailure("checkpoint schema mismatch".into()))
        }))
    }

    #[test]
    fn test_heuristic_when_not_preferred() {
        let models = working();
        let selector = StrategySelector::new(models.clone());
        assert_eq!(selector.select(false).kind(), StrategyKind::Heuristic);
        // Not preferring the model never triggers a load
        assert_eq!(models.attempts(), 0);
        assert_eq!(models.status(), ModelStatus::NotAttempted);
    }

    #[test]
    fn test_model_when_preferred_and_loaded() {
        let models = working();
        let selector = StrategySelector::new(models.clone());
        assert_eq!(selector.select(true).kind(), StrategyKind::ModelBacked);
        assert_eq!(models.status(), ModelStatus::Ready { backend: "echo".into() });
    }

    #[test]
    fn test_load_failure_falls_back_and_is_not_retried() {
        let models = failing();
        let selector = StrategySelector::new(models.clone());
        for _ in 0..5 {
            assert_eq!(selector.select(true).kind(), StrategyKind::Heuristic);
        }
        assert_eq!(models.attempts(), 1);
        assert!(matches!(models.status(), ModelStatus::Unavailable { reason } if reason.contains("schema")));
    }

    #[test]
    fn test_loaded_model_is_shared() {
        let models = working();
        let a = models.load().unwrap();
        let b = models.load().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(models.attempts(), 1);
    }

    #[test]
    fn test_disabled_service() {
        let models = ModelService::disabled();
        assert!(matches!(models.load(), Err(AnimatorError::ModelLoadFailure(_))));
        assert_eq!(models.attempts(), 1);
    }

    #[test]
    fn test_missing_weights_file() {
        let models = ModelService::onnx(
            PathBuf::from("/nonexistent/lipsync.onnx"),
            1,
            ModelConfig::default(),
        );
        assert!(matches!(models.load(), Err(AnimatorError::ModelLoadFailure(_))));
    }

    #[test]
    fn test_concurrent_first_load_runs_once() {
        let models = working();
        std::thread::scope(|s| {
            for _ in 0..8 {
                let models = models.clone();
                s.spawn(move || {
                    let selector = StrategySelector::new(models);
                    assert_eq!(selector.select(true).kind(), StrategyKind::ModelBacked);
                });
            }
        });
        assert_eq!(models.attempts(), 1);
    }
}
