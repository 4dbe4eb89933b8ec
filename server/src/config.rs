// Configuration for the server, read from the environment

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use avatar_core::AnimatorConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    /// Bounds producing the response head; the streamed body is not timed.
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    /// Directory standing in for the object store.
    pub media_root: PathBuf,
    /// ONNX lip-sync weights. Unset means heuristic synthesis only.
    pub model_path: Option<PathBuf>,
    pub model_threads: usize,
    pub avatar_cache_size: usize,
    pub default_width: u32,
    pub default_height: u32,
    pub default_fps: u32,
    pub use_model_backend: bool,
    /// Unclaimed viseme sessions expire after this long.
    pub session_ttl_secs: u64,
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8090,
            rate_limit_per_minute: 120,
            request_timeout_secs: 30,
            cors_allowed_origins: None,
            media_root: PathBuf::from("media"),
            model_path: None,
            model_threads: 1,
            avatar_cache_size: 32,
            default_width: 512,
            default_height: 512,
            default_fps: 15,
            use_model_backend: true,
            session_ttl_secs: 60,
            max_sessions: 256,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    /// Unset or unparseable variables keep their defaults.
    pub fn from_env() -> Self {
        let d = Self::default();

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS").ok().map(|origins| {
            origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

        let model_path = std::env::var("LIPSYNC_MODEL_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        Self {
            port: env_or("PORT", d.port),
            rate_limit_per_minute: env_or("RATE_LIMIT_PER_MINUTE", d.rate_limit_per_minute),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", d.request_timeout_secs),
            cors_allowed_origins,
            media_root: std::env::var("MEDIA_ROOT").map(PathBuf::from).unwrap_or(d.media_root),
            model_path,
            model_threads: env_or("MODEL_THREADS", d.model_threads),
            avatar_cache_size: env_or("AVATAR_CACHE_SIZE", d.avatar_cache_size),
            default_width: env_or("DEFAULT_WIDTH", d.default_width),
            default_height: env_or("DEFAULT_HEIGHT", d.default_height),
            default_fps: env_or("DEFAULT_FPS", d.default_fps),
            use_model_backend: env_or("USE_MODEL_BACKEND", d.use_model_backend),
            session_ttl_secs: env_or("SESSION_TTL_SECS", d.session_ttl_secs),
            max_sessions: env_or("MAX_SESSIONS", d.max_sessions),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn animator_config(&self) -> AnimatorConfig {
        AnimatorConfig {
            avatar_cache_size: self.avatar_cache_size,
            ..AnimatorConfig::default()
        }
    }
}
