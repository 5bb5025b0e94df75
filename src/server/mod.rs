//! HTTP listener: the `/v1/messages` data plane plus the two metadata
//! routes, and the bind / drain / rebind lifecycle.

use crate::models::ClaudeRequest;
use crate::proxy::{EngineError, ProxyEngine, ProxyResponse};
use crate::providers::error::error_kind_for_status;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Model id advertised for Claude upstreams that pin no default model.
pub const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-5-20250929";

/// How long a draining listener waits for in-flight requests.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Application state shared across handlers.
pub struct AppState {
    pub engine: ProxyEngine,
}

/// Commands accepted by a running listener.
#[derive(Debug, Clone, Copy)]
pub enum ServerCommand {
    ReloadPort(u16),
    Shutdown,
}

/// Control handle for a running listener.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<ServerCommand>,
}

impl ServerHandle {
    pub async fn reload_port(&self, port: u16) {
        let _ = self.tx.send(ServerCommand::ReloadPort(port)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(ServerCommand::Shutdown).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn server_channel() -> (ServerHandle, mpsc::Receiver<ServerCommand>) {
    let (tx, rx) = mpsc::channel(4);
    (ServerHandle { tx }, rx)
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/models", get(get_models))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
}

/// Run the listener until a `Shutdown` command. `ReloadPort` drains the
/// live listener (up to [`DRAIN_GRACE`]) and rebinds on the new port.
pub async fn run(
    host: &str,
    port: u16,
    state: Arc<AppState>,
    mut commands: mpsc::Receiver<ServerCommand>,
) -> Result<(), ServerError> {
    let mut port = port;
    loop {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr).await.map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        info!(%addr, "listening");

        let (close_tx, mut close_rx) = watch::channel(false);
        let app = router(state.clone());
        let mut serve = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = close_rx.changed().await;
                })
                .await
        });

        let command = tokio::select! {
            command = commands.recv() => command.unwrap_or(ServerCommand::Shutdown),
            result = &mut serve => {
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(ServerError::Io(e)),
                    Err(e) => Err(ServerError::Io(std::io::Error::other(e))),
                };
            }
        };

        let _ = close_tx.send(true);
        if tokio::time::timeout(DRAIN_GRACE, &mut serve).await.is_err() {
            warn!("drain deadline exceeded, abandoning in-flight responses");
            serve.abort();
        }

        match command {
            ServerCommand::ReloadPort(new_port) => {
                info!(old = port, new = new_port, "rebinding on new port");
                port = new_port;
            }
            ServerCommand::Shutdown => return Ok(()),
        }
    }
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    body: bytes::Bytes,
) -> Result<Response, ApiError> {
    let request: ClaudeRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::InvalidRequest(format!("invalid request body: {e}")))?;

    match state.engine.handle(request).await {
        Ok(ProxyResponse::Message(message)) => Ok(Json(*message).into_response()),
        Ok(ProxyResponse::Stream(stream)) => {
            let response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .body(Body::from_stream(stream))
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            Ok(response)
        }
        Err(e) => Err(e.into()),
    }
}

/// Synthesize a Claude-style model list: one entry per eligible upstream.
async fn get_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let eligible = state.engine.pool().eligible();
    let data: Vec<serde_json::Value> = eligible
        .iter()
        .map(|u| {
            let id = u
                .default_model
                .as_deref()
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_CLAUDE_MODEL);
            serde_json::json!({
                "type": "model",
                "id": id,
                "display_name": u.name,
                "created_at": chrono::Utc::now().to_rfc3339(),
            })
        })
        .collect();

    let first_id = data.first().and_then(|m| m.get("id").cloned());
    let last_id = data.last().and_then(|m| m.get("id").cloned());
    Json(serde_json::json!({
        "data": data,
        "has_more": false,
        "first_id": first_id,
        "last_id": last_id,
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    if state.engine.pool().eligible().is_empty() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "no_upstream_available"})),
        )
            .into_response()
    } else {
        Json(serde_json::json!({"status": "ok"})).into_response()
    }
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

/// Errors shaped for the wire in Claude's error envelope.
#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    NoUpstreamAvailable,
    AllUpstreamsFailed(Vec<crate::proxy::AttemptFailure>),
    Upstream { status: u16, message: String },
    NotFound,
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::BadRequest(msg) => ApiError::InvalidRequest(msg),
            EngineError::NoUpstreams => ApiError::NoUpstreamAvailable,
            EngineError::AllFailed(failures) => ApiError::AllUpstreamsFailed(failures),
            EngineError::Upstream { status, message } => ApiError::Upstream { status, message },
        }
    }
}

fn error_body(kind: &str, message: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "error",
        "error": {"type": kind, "message": message}
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                error_body("invalid_request_error", &message),
            ),
            ApiError::NoUpstreamAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                error_body("overloaded_error", "no upstream available"),
            ),
            ApiError::AllUpstreamsFailed(failures) => {
                let mut body = error_body("api_error", "all upstreams failed");
                body["error"]["attempts"] =
                    serde_json::to_value(&failures).unwrap_or_default();
                (StatusCode::BAD_GATEWAY, body)
            }
            ApiError::Upstream { status, message } => {
                let kind = error_kind_for_status(status);
                let status = StatusCode::from_u16(status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status, error_body(kind, &message))
            }
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                error_body("not_found_error", "not found"),
            ),
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("api_error", &message),
            ),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::error::ErrorClass;
    use crate::proxy::AttemptFailure;

    #[test]
    fn error_bodies_use_claude_shape() {
        let body = error_body("rate_limit_error", "slow down");
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["message"], "slow down");
    }

    #[test]
    fn exhausted_failover_lists_attempts() {
        let err = ApiError::AllUpstreamsFailed(vec![
            AttemptFailure {
                name: "A".to_string(),
                error: ErrorClass::UpstreamTransient,
            },
            AttemptFailure {
                name: "B".to_string(),
                error: ErrorClass::UpstreamTransient,
            },
        ]);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn permanent_upstream_errors_keep_their_status() {
        let response = ApiError::Upstream {
            status: 401,
            message: "bad key".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
