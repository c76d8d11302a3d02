use anyhow::Result;
use export_progress_api::{config::Config, reaper::spawn_reaper, router, AppState};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "export_progress_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let state = AppState::new(config.clone());

    let _reaper = spawn_reaper(
        state.registry.clone(),
        config.reaper_period,
        config.session_timeout,
    );

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        session_timeout_secs = config.session_timeout.as_secs(),
        "export-progress-api listening on {}",
        config.bind_addr
    );
    axum::serve(listener, app).await?;
    Ok(())
}
