use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};

use sprintsync::config::Config;
use sprintsync::engine::ReconciliationEngine;
use sprintsync::gitlab::GitLabClient;
use sprintsync::store::SqliteStore;
use sprintsync::{app, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting sprint sync service");

    let config =
        Config::from_env().expect("Failed to load configuration from environment variables");

    let gitlab = Arc::new(
        GitLabClient::new(config.gitlab_base_url.clone(), config.oauth.clone())
            .expect("Failed to construct GitLab client"),
    );

    let db_path = config.state_dir.join("sprintsync.db");
    info!("Using state database: {}", db_path.display());
    let store = Arc::new(SqliteStore::new(&db_path).expect("Failed to initialize SQLite database"));

    let engine = ReconciliationEngine::new(
        store.clone(),
        gitlab.clone(),
        config.default_branch.clone(),
    );

    let state = Arc::new(AppState {
        store,
        gitlab,
        engine,
        config,
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", state.config.port)).await?;
    info!("Server listening on port {}", state.config.port);

    axum::serve(listener, app(state)).await?;

    Ok(())
}
