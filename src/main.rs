use anyhow::{Context, Result};
use tangllm::config::AppConfig;
use tangllm::server::{self, AppState};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tangllm=debug,tower_http=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting TangLLM chat backend");

    let config = AppConfig::load().context("loading configuration")?;
    let addr = config.server.socket_addr()?;

    let state = AppState::from_config(&config).context("initializing services")?;
    let app = server::router(state, &config);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
