//! Façades over `zimage-core`: HTTP API, command line and agent tools.

pub mod api;
pub mod cli;
pub mod error;
pub mod mcp;

use std::path::Path;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::info;
use zimage_core::Worker;

pub use error::{ApiError, ApiResult};

/// Upload cap for LoRA files; adapters for large transformers run to hundreds of MB.
pub const MAX_LORA_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub worker: Worker,
    /// Base URL advertised in agent-protocol resource links. When unset the
    /// request's `Host` header is used.
    pub public_url: Option<String>,
}

impl AppState {
    pub fn new(worker: Worker) -> Self {
        Self {
            worker,
            public_url: None,
        }
    }

    pub fn with_public_url(mut self, url: Option<String>) -> Self {
        self.public_url = url.map(|u| u.trim_end_matches('/').to_string());
        self
    }
}

/// Builds the HTTP application. Generated images are served under
/// `/outputs`; `static_dir`, when given, is the fallback for everything else.
pub fn router(state: AppState, static_dir: Option<&Path>) -> Router {
    let outputs = ServeDir::new(state.worker.outputs_dir());
    let mut app = Router::new()
        .route("/generate", post(api::generate))
        .route("/models", get(api::models))
        .route("/history", get(api::history))
        .route("/history/{id}", delete(api::delete_history))
        .route(
            "/loras",
            get(api::list_loras)
                .post(api::upload_lora)
                .layer(DefaultBodyLimit::max(MAX_LORA_UPLOAD_BYTES)),
        )
        .route("/loras/{id}", delete(api::delete_lora))
        .route("/download/{filename}", get(api::download))
        .route("/mcp", post(mcp::http_handler))
        .nest_service("/outputs", outputs);

    if let Some(dir) = static_dir {
        info!("Serving web UI from {}", dir.display());
        let index = ServeFile::new(dir.join("index.html"));
        app = app.fallback_service(ServeDir::new(dir).not_found_service(index));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}
