use thiserror::Error;

/// Errors produced by the audio-to-frame pipeline.
///
/// A consumer disconnecting mid-stream is not an error; it ends the cursor in
/// [`StreamState::Aborted`](crate::stream::StreamState::Aborted).
#[derive(Debug, Error)]
pub enum AnimatorError {
    /// Unsupported sample width/channel layout, or a payload that is not a waveform.
    #[error("invalid audio format: {0}")]
    InvalidAudioFormat(String),

    /// Corrupt or zero-area avatar source, or a target size that does not match.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// Weights missing or incompatible. Recovered by running heuristic-only.
    #[error("model load failed: {0}")]
    ModelLoadFailure(String),

    /// A single inference call could not produce a frame.
    #[error("synthesis unavailable: {0}")]
    SynthesisUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("resampling failed: {0}")]
    Resample(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AnimatorError {
    /// True for errors that must reject a request before any frame is sent.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            AnimatorError::InvalidAudioFormat(_) | AnimatorError::InvalidImage(_)
        )
    }
}

impl From<rubato::ResamplerConstructionError> for AnimatorError {
    fn from(e: rubato::ResamplerConstructionError) -> Self {
        AnimatorError::Resample(e.to_string())
    }
}

impl From<rubato::ResampleError> for AnimatorError {
    fn from(e: rubato::ResampleError) -> Self {
        AnimatorError::Resample(e.to_string())
    }
}

impl From<hound::Error> for AnimatorError {
    fn from(e: hound::Error) -> Self {
        AnimatorError::InvalidAudioFormat(e.to_string())
    }
}

impl From<image::ImageError> for AnimatorError {
    fn from(e: image::ImageError) -> Self {
        AnimatorError::InvalidImage(e.to_string())
    }
}
