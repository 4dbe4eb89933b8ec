use std::net::SocketAddr;

use server::{app, config::ServerConfig, AppState};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting avatar stream server...");

    let config = ServerConfig::from_env();
    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, media_root={}, model={}",
        config.port,
        config.rate_limit_per_minute,
        config.media_root.display(),
        config
            .model_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".into())
    );
    if !config.media_root.is_dir() {
        warn!("MEDIA_ROOT {} does not exist, GET /mjpeg will return 404", config.media_root.display());
    }

    let state = AppState::from_config(config.clone())?;

    // Load the model before serving so the first stream does not pay for it
    if config.use_model_backend && config.model_path.is_some() {
        let animator = state.animator.clone();
        let loaded = tokio::task::spawn_blocking(move || animator.models().load().is_ok()).await?;
        info!(loaded, "model warm-up finished");
    }

    let router = app(state)?;
    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, router).await?;
    Ok(())
}
