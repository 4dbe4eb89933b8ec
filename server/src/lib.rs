pub mod config;
pub mod error;
pub mod media;
pub mod metrics;
pub mod mjpeg;
pub mod routes;
pub mod sessions;
pub mod validation;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use avatar_core::{Animator, ModelService};
use axum::{
    extract::Request,
    http::{HeaderValue, Method},
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::media::MediaStore;
use crate::metrics::AppMetrics;
use crate::sessions::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub animator: Animator,
    pub media: Arc<MediaStore>,
    pub metrics: Arc<AppMetrics>,
    pub sessions: Arc<SessionStore>,
    pub request_count: Arc<AtomicU64>,
    pub config: ServerConfig,
    pub started_at: Instant,
}

impl AppState {
    /// Model weights come from `config.model_path`; none means heuristic only.
    pub fn from_config(config: ServerConfig) -> anyhow::Result<Self> {
        let models = match &config.model_path {
            Some(path) => ModelService::onnx(
                path.clone(),
                config.model_threads,
                config.animator_config().model,
            ),
            None => ModelService::disabled(),
        };
        Self::with_models(config, models)
    }

    pub fn with_models(config: ServerConfig, models: ModelService) -> anyhow::Result<Self> {
        let animator = Animator::new(config.animator_config(), models)?;
        Ok(Self {
            animator,
            media: Arc::new(MediaStore::new(config.media_root.clone())),
            metrics: Arc::new(AppMetrics::default()),
            sessions: Arc::new(SessionStore::new(config.session_ttl(), config.max_sessions)),
            request_count: Arc::new(AtomicU64::new(0)),
            config,
            started_at: Instant::now(),
        })
    }
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_credentials(false);

    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .flatten()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();

    if origins.is_empty() {
        if config.cors_allowed_origins.is_some() {
            warn!("CORS_ALLOWED_ORIGINS has no usable origins, allowing all origins");
        }
        base.allow_origin(Any)
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        base.allow_origin(AllowOrigin::list(origins))
    }
}

// Request ID middleware for tracing
async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let value = HeaderValue::from_str(&request_id).ok();
    if let Some(v) = &value {
        request.headers_mut().insert("x-request-id", v.clone());
    }
    let mut response = next.run(request).await;
    if let Some(v) = value {
        response.headers_mut().insert("x-request-id", v);
    }
    response
}

/// Build the router with its middleware stack.
pub fn app(state: AppState) -> anyhow::Result<Router> {
    let config = &state.config;

    // Global key: every client shares one budget, which holds behind proxies
    let per_minute = config.rate_limit_per_minute.max(1);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond((60_000 / per_minute as u64).max(1))
            .burst_size(per_minute)
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration"))?,
    );

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors_layer(config))
        .into_inner();

    let api = Router::new()
        .route("/health", get(routes::health_check))
        .route("/healthz", get(routes::health_check))
        .route("/ready", get(routes::ready))
        .route("/mjpeg", get(routes::mjpeg_from_media).post(routes::mjpeg_from_body))
        .route("/render/start", post(routes::render_start))
        .route("/stream/{id}", get(routes::stream_session))
        .route("/metrics", get(routes::metrics_endpoint));

    Ok(Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state))
}
