pub mod api;
pub mod broadcaster;
pub mod codec;
pub mod config;
pub mod error;
pub mod job;
pub mod models;
pub mod reaper;
pub mod registry;
pub mod sse;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use config::Config;
use registry::ExportSessionRegistry;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ExportSessionRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ExportSessionRegistry::new(&config));
        Self { config, registry }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/export/sessions", post(api::create_session))
        .route("/export/upload-strategy", get(api::upload_strategy))
        .route("/export/progress/{export_id}", get(api::get_progress))
        .route(
            "/export/progress/{export_id}/stream",
            get(api::stream_progress),
        )
        .route(
            "/export/progress/{export_id}/cancel",
            post(api::cancel_export),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
