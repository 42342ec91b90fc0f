//! Thin HTTP surface over the session gateway.
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /health` | liveness and store location |
//! | `POST /chat` | blocking step |
//! | `POST /chat/stream` | streaming step as `text/event-stream` |
//! | `POST /reset` | delete a session |
//! | `GET /state` | inspect a session |

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ChatRequest, SessionGateway, SessionRef, SessionSnapshot};
use crate::models::event::ErrorDetail;
use crate::{AppError, Result};

/// Response body of `POST /reset`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetResponse {
    /// Session key that was reset.
    pub session_id: String,
    /// Whether a checkpoint existed.
    pub reset: bool,
}

/// Build the router for `gateway`.
pub fn router(gateway: Arc<SessionGateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/reset", post(reset))
        .route("/state", get(state))
        .with_state(gateway)
}

/// Serve `router(gateway)` on `addr` until `cancel` fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener cannot bind, or `AppError::Io`
/// if the server fails.
pub async fn serve(
    gateway: Arc<SessionGateway>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {addr}: {err}")))?;
    info!(%addr, "session gateway listening");

    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("http server error: {err}")))?;

    info!("session gateway shut down");
    Ok(())
}

async fn health(State(gateway): State<Arc<SessionGateway>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "checkpoints_path": gateway.store_path().display().to_string(),
    }))
}

async fn chat(
    State(gateway): State<Arc<SessionGateway>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let session_id = gateway.session_id(&request.user_id, &request.conversation_id);
    match gateway.chat(request, None).await {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => error_response(&err, &session_id),
    }
}

async fn chat_stream(
    State(gateway): State<Arc<SessionGateway>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let events = gateway.chat_stream(request).into_stream().map(|event| {
        let json = event.to_json().unwrap_or_else(|err| {
            warn!(%err, "failed to encode stream event");
            r#"{"type":"progress","message":"event dropped"}"#.to_owned()
        });
        Ok::<String, Infallible>(format!("data: {json}\n\n"))
    });

    let mut response = Body::from_stream(events).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

async fn reset(
    State(gateway): State<Arc<SessionGateway>>,
    Json(target): Json<SessionRef>,
) -> Json<ResetResponse> {
    let reset = gateway
        .reset(&target.user_id, &target.conversation_id)
        .await;
    Json(ResetResponse {
        session_id: gateway.session_id(&target.user_id, &target.conversation_id),
        reset,
    })
}

async fn state(
    State(gateway): State<Arc<SessionGateway>>,
    Query(target): Query<SessionRef>,
) -> Json<SessionSnapshot> {
    Json(
        gateway
            .inspect(&target.user_id, &target.conversation_id)
            .await,
    )
}

fn error_response(err: &AppError, session_id: &str) -> Response {
    let status = match err {
        AppError::StepTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let detail = ErrorDetail::from_error(err, session_id);
    (status, Json(json!({ "detail": detail }))).into_response()
}
