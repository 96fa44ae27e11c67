use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use pagetally_server::config::Config;
use pagetally_server::state::AppState;

/// Upper bound on the final flush after the listener stops.
const SHUTDOWN_FLUSH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise structured JSON logging. Level controlled via RUST_LOG env var.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pagetally=info".parse()?),
        )
        .json()
        .init();

    let cfg = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    // Ensure data directory exists before opening DuckDB.
    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = format!("{}/pagetally.db", cfg.data_dir);
    let db = pagetally_duckdb::DuckDbBackend::open(&db_path, &cfg.duckdb_memory_limit)?;

    let state = Arc::new(AppState::new(db, cfg.clone()));
    state.register_configured_domains().await;
    state.aggregator.start().await;

    let addr = format!("0.0.0.0:{}", cfg.port);
    let app = pagetally_server::app::build_app(Arc::clone(&state));

    info!(port = cfg.port, "pagetally listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, state.aggregator.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Final flush timed out; pending aggregates were not written");
    }

    Ok(())
}
