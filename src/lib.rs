pub mod config;
pub mod engine;
pub mod error;
pub mod gitlab;
pub mod handlers;
pub mod issue_ref;
pub mod status;
pub mod store;
pub mod webhook;

use std::sync::Arc;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use engine::ReconciliationEngine;
pub use gitlab::GitLabClient;
pub use status::IssueStatus;
pub use store::SprintStore;

pub struct AppState {
    pub store: Arc<dyn SprintStore>,
    pub gitlab: Arc<GitLabClient>,
    pub engine: ReconciliationEngine,
    pub config: Config,
}

/// The complete application router. The UI this serves may be hosted
/// anywhere, hence the permissive CORS layer.
pub fn app(state: Arc<AppState>) -> Router {
    handlers::api_router()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
