use crate::config::ServerConfig;
use crate::error::ApiError;

pub const MIN_WIDTH: u32 = 64;
pub const MAX_WIDTH: u32 = 1920;
pub const MIN_HEIGHT: u32 = 64;
pub const MAX_HEIGHT: u32 = 1080;
pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 30;
/// Longest accepted media key
const MAX_KEY_LENGTH: usize = 512;

/// Output geometry and rate for one stream, already range-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub use_model: bool,
}

/// Fill unset values from the server defaults, then validate.
pub fn resolve_stream_params(
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    use_model: Option<bool>,
    defaults: &ServerConfig,
) -> Result<StreamParams, ApiError> {
    let params = StreamParams {
        width: width.unwrap_or(defaults.default_width),
        height: height.unwrap_or(defaults.default_height),
        fps: fps.unwrap_or(defaults.default_fps),
        use_model: use_model.unwrap_or(defaults.use_model_backend),
    };
    validate_dimensions(params.width, params.height)?;
    validate_fps(params.fps)?;
    Ok(params)
}

pub fn validate_dimensions(width: u32, height: u32) -> Result<(), ApiError> {
    if !(MIN_WIDTH..=MAX_WIDTH).contains(&width) {
        return Err(ApiError::InvalidInput(format!(
            "Width {} out of range ({}-{})",
            width, MIN_WIDTH, MAX_WIDTH
        )));
    }
    if !(MIN_HEIGHT..=MAX_HEIGHT).contains(&height) {
        return Err(ApiError::InvalidInput(format!(
            "Height {} out of range ({}-{})",
            height, MIN_HEIGHT, MAX_HEIGHT
        )));
    }
    Ok(())
}

pub fn validate_fps(fps: u32) -> Result<(), ApiError> {
    if !(MIN_FPS..=MAX_FPS).contains(&fps) {
        return Err(ApiError::InvalidInput(format!(
            "FPS {} out of range ({}-{})",
            fps, MIN_FPS, MAX_FPS
        )));
    }
    Ok(())
}

/// Media keys are relative paths below the media root: no `..`, no leading
/// slash, no backslashes.
pub fn validate_media_key(key: &str) -> Result<(), ApiError> {
    if key.is_empty() {
        return Err(ApiError::InvalidInput("Media key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Media key too long (max {} characters)",
            MAX_KEY_LENGTH
        )));
    }
    if key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(ApiError::InvalidInput(format!("Invalid media key: {}", key)));
    }
    if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(ApiError::InvalidInput(format!("Invalid media key: {}", key)));
    }
    Ok(())
}
