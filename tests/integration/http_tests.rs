//! HTTP router over the gateway.

use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use session_runtime::gateway::http::{router, serve};
use session_runtime::AppError;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use super::test_helpers::{gateway, test_config, EchoStep};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn health_reports_store_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let expected = config.store_path.display().to_string();
    let app = router(gateway(config, EchoStep::default().shared()));

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"status": "ok", "checkpoints_path": expected})
    );
}

#[tokio::test]
async fn chat_returns_reply() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = router(gateway(test_config(dir.path()), EchoStep::default().shared()));

    let response = app
        .oneshot(post_json(
            "/chat",
            &json!({"user_id": "alice", "message": "hello"}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"session_id": "chat::alice::default", "reply": "echo: hello"})
    );
}

#[tokio::test]
async fn chat_failure_is_structured() {
    let dir = tempfile::tempdir().expect("tempdir");
    let step = EchoStep {
        fail_with: Some(AppError::step("ModelError", "bad gateway")),
        ..EchoStep::default()
    };
    let app = router(gateway(test_config(dir.path()), step.shared()));

    let response = app
        .oneshot(post_json(
            "/chat",
            &json!({"user_id": "alice", "conversation_id": "c1", "message": "hello"}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_json(response).await,
        json!({"detail": {
            "error_type": "ModelError",
            "error_message": "bad gateway",
            "session_id": "chat::alice::c1"
        }})
    );
}

#[tokio::test]
async fn chat_timeout_maps_to_gateway_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.bridge.step_timeout_seconds = 0;
    let step = EchoStep {
        delay: Duration::from_millis(200),
        ..EchoStep::default()
    };
    let app = router(gateway(config, step.shared()));

    let response = app
        .oneshot(post_json(
            "/chat",
            &json!({"user_id": "alice", "message": "slow"}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(response).await["detail"]["error_type"], "StepTimeout");
}

#[tokio::test]
async fn chat_stream_emits_sse_frames() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = router(gateway(test_config(dir.path()), EchoStep::default().shared()));

    let response = app
        .oneshot(post_json(
            "/chat/stream",
            &json!({"user_id": "alice", "message": "hi"}),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).expect("content type"),
        "text/event-stream"
    );

    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let text = String::from_utf8(bytes.to_vec()).expect("utf8");
    let events: Vec<Value> = text
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| {
            let payload = frame.strip_prefix("data: ").expect("data frame");
            serde_json::from_str(payload).expect("event json")
        })
        .collect();

    assert_eq!(events.first(), Some(&json!({"type": "progress", "message": "thinking"})));
    assert!(events.contains(&json!({"type": "delta", "text": "echo: hi"})));
    assert_eq!(events.last(), Some(&json!({"type": "final", "text": "echo: hi"})));
}

#[tokio::test]
async fn reset_and_state_routes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(test_config(dir.path()), EchoStep::default().shared());
    gw.chat(super::test_helpers::request("alice", "hello"), None)
        .await
        .expect("chat");

    let state = router(gw.clone())
        .oneshot(
            Request::get("/state?user_id=alice")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(state.status(), StatusCode::OK);
    let snapshot = body_json(state).await;
    assert_eq!(snapshot["session_id"], "chat::alice::default");
    assert_eq!(snapshot["message_count"], 2);
    assert_eq!(snapshot["milestones"]["greeted"], true);

    let reset = router(gw.clone())
        .oneshot(post_json("/reset", &json!({"user_id": "alice"})))
        .await
        .expect("response");
    assert_eq!(
        body_json(reset).await,
        json!({"session_id": "chat::alice::default", "reset": true})
    );

    let state = router(gw)
        .oneshot(
            Request::get("/state?user_id=alice&conversation_id=default")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(body_json(state).await["message_count"], 0);
}

#[tokio::test]
async fn serve_reports_bind_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = occupied.local_addr().expect("addr");

    let err = serve(
        gateway(test_config(dir.path()), EchoStep::default().shared()),
        addr,
        CancellationToken::new(),
    )
    .await
    .expect_err("port in use");
    assert!(matches!(err, AppError::Config(_)));
}

#[tokio::test]
async fn serve_shuts_down_on_cancel() {
    let dir = tempfile::tempdir().expect("tempdir");
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = probe.local_addr().expect("addr");
    drop(probe);

    let cancel = CancellationToken::new();
    let server = tokio::spawn(serve(
        gateway(test_config(dir.path()), EchoStep::default().shared()),
        addr,
        cancel.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("server stops")
        .expect("join");
    assert!(result.is_ok());
}
