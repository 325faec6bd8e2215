//! Tool-call server.
//!
//! Exposes the orchestration operations to an external conversation
//! driver as a JSON-RPC 2.0 surface over HTTP (POST `/`).

pub mod handlers;
pub mod types;

use axum::routing::post;
use axum::Router;
use std::sync::Arc;
use tracing::info;

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::services::runtime::OrchflowRuntime;

pub use handlers::ServerState;
pub use types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Build the router for the tool-call surface.
pub fn router(runtime: Arc<OrchflowRuntime>) -> Router {
    Router::new()
        .route("/", post(handlers::handle_request))
        .with_state(ServerState { runtime })
}

/// Bind and serve until the process is stopped.
pub async fn serve(runtime: Arc<OrchflowRuntime>, host: &str, port: u16) -> OrchResult<()> {
    let app = router(runtime);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| OrchestratorError::Transport(format!("bind {addr}: {e}")))?;

    info!("tool-call server listening on {addr}");
    axum::serve(listener, app)
        .await
        .map_err(|e| OrchestratorError::Transport(format!("serve: {e}")))
}
