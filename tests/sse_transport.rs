//! SSE transport against a small in-process axum server.
//!
//! The server answers every POSTed request on the event stream, tagging the
//! result with the path it was posted to, so tests can see which message
//! endpoint the client used.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use mcp_tester::mcp_client::sse::SseClient;
use mcp_tester::mcp_client::{CallMode, LogBroadcaster, McpClient, McpError};

/// Events pushed before the client's GET arrives are queued, not lost.
#[derive(Clone)]
struct TestState {
    events: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    receiver: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
    posted: Arc<Mutex<Vec<(String, Value)>>>,
    stream_status: Option<StatusCode>,
}

impl TestState {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            events: Arc::new(Mutex::new(Some(tx))),
            receiver: Arc::new(Mutex::new(Some(rx))),
            posted: Arc::default(),
            stream_status: None,
        }
    }

    fn push(&self, data: impl Into<String>) -> bool {
        match self.events.lock().unwrap().as_ref() {
            Some(tx) => tx.send(data.into()).is_ok(),
            None => false,
        }
    }

    fn posted_methods(&self) -> Vec<String> {
        self.posted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| body["method"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

async fn sse_stream(
    State(state): State<TestState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, &'static str)> {
    if let Some(status) = state.stream_status {
        return Err((status, "denied"));
    }
    let rx = state
        .receiver
        .lock()
        .unwrap()
        .take()
        .ok_or((StatusCode::CONFLICT, "stream already open"))?;
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|data| (Ok::<_, Infallible>(Event::default().data(data)), rx))
    });
    Ok(Sse::new(stream))
}

async fn message(State(state): State<TestState>, uri: Uri, body: Bytes) -> impl IntoResponse {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state
        .posted
        .lock()
        .unwrap()
        .push((uri.path().to_string(), body.clone()));

    if body["method"] == "tools/fail" {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    if let Some(id) = body.get("id") {
        let reply = json!({"jsonrpc": "2.0", "id": id, "result": {"via": uri.path()}});
        state.push(reply.to_string());
    }
    StatusCode::ACCEPTED
}

async fn serve(state: TestState) -> String {
    let app = Router::new()
        .route("/sse", get(sse_stream))
        .route("/message", post(message))
        .route("/live", post(message))
        .route("/other", post(message))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn sse_client(base: &str, message_url: Option<&str>) -> (SseClient, Arc<LogBroadcaster>) {
    let logs = LogBroadcaster::new("sse");
    let client = SseClient::new(
        "sse",
        &format!("{base}/sse"),
        message_url,
        &HashMap::new(),
        logs.sink(),
    )
    .unwrap();
    (client, logs)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_fallback_then_live_endpoint_switches_once() {
    let state = TestState::new();
    let base = serve(state.clone()).await;
    let (client, logs) = sse_client(&base, None);

    // No endpoint event yet: after the wait the derived /message is used.
    let first = client
        .request("tools/list", None, CallMode::Unwrapped)
        .await
        .unwrap();
    assert_eq!(first["via"], "/message");
    assert!(logs
        .snapshot()
        .iter()
        .any(|e| e.line.contains("using fallback")));

    // The server announces its endpoint; later calls use it.
    assert!(state.push("/live"));
    wait_until(|| client.message_endpoint().is_some()).await;
    let second = client
        .request("tools/list", None, CallMode::Unwrapped)
        .await
        .unwrap();
    assert_eq!(second["via"], "/live");

    // A second announcement is ignored.
    assert!(state.push(format!("{base}/other")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let third = client
        .request("prompts/list", None, CallMode::Unwrapped)
        .await
        .unwrap();
    assert_eq!(third["via"], "/live");
    assert_eq!(client.message_endpoint().unwrap(), format!("{base}/live"));
}

#[tokio::test]
async fn test_configured_message_url_skips_wait() {
    let state = TestState::new();
    let base = serve(state.clone()).await;
    let (client, _) = sse_client(&base, Some(&format!("{base}/live")));
    let client = McpClient::Sse(client);

    let started = Instant::now();
    let result = client.initialize(None).await.unwrap();
    assert_eq!(result["via"], "/live");
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(state.posted_methods(), vec!["initialize", "initialized"]);
}

#[tokio::test]
async fn test_post_failure_fails_only_that_call() {
    let state = TestState::new();
    let base = serve(state.clone()).await;
    let (client, _) = sse_client(&base, Some(&format!("{base}/message")));

    let err = client
        .request("tools/fail", None, CallMode::Unwrapped)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::HttpStatus { status: 500, .. }));
    assert_eq!(client.pending_count(), 0);

    let ok = client
        .request("tools/list", None, CallMode::Unwrapped)
        .await
        .unwrap();
    assert_eq!(ok["via"], "/message");
}

#[tokio::test]
async fn test_stream_rejected_fails_pending_calls() {
    let state = TestState {
        stream_status: Some(StatusCode::UNAUTHORIZED),
        ..TestState::new()
    };
    let base = serve(state.clone()).await;
    let (client, logs) = sse_client(&base, None);

    let err = client
        .request("tools/list", None, CallMode::Unwrapped)
        .await
        .unwrap_err();
    assert!(err.is_transport_fatal(), "unexpected error: {err}");
    assert!(err.to_string().contains("401"));
    assert!(logs.snapshot().iter().any(|e| e.line.contains("HTTP 401")));
}

#[tokio::test]
async fn test_stream_end_sweeps_and_refuses_new_calls() {
    let state = TestState::new();
    let base = serve(state.clone()).await;
    let (client, _) = sse_client(&base, Some(&format!("{base}/message")));

    client
        .request("tools/list", None, CallMode::Unwrapped)
        .await
        .unwrap();

    // Dropping the server-side sender ends the event stream.
    state.events.lock().unwrap().take();
    let mut refused = None;
    for _ in 0..100 {
        match client.request("tools/list", None, CallMode::Unwrapped).await {
            Err(e) if e.is_transport_fatal() => {
                refused = Some(e);
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let err = refused.expect("calls should be refused after the stream ends");
    assert!(err.to_string().contains("SSE stream ended"));
}

#[tokio::test]
async fn test_concurrent_first_calls_open_one_stream() {
    let state = TestState::new();
    let base = serve(state.clone()).await;
    let (client, logs) = sse_client(&base, Some(&format!("{base}/message")));

    let calls = (0..6).map(|_| client.request("tools/list", None, CallMode::Unwrapped));
    let results = futures::future::join_all(calls).await;
    for result in results {
        assert_eq!(result.unwrap()["via"], "/message");
    }

    let lines: Vec<String> = logs.snapshot().into_iter().map(|e| e.line).collect();
    let connects = lines.iter().filter(|l| l.starts_with("SSE connected")).count();
    assert_eq!(connects, 1, "{lines:?}");
    assert!(!lines.iter().any(|l| l.contains("HTTP 409")), "{lines:?}");
}

#[tokio::test]
async fn test_fallback_wait_is_paid_once() {
    let state = TestState::new();
    let base = serve(state.clone()).await;
    let (client, logs) = sse_client(&base, None);

    let first = client
        .request("tools/list", None, CallMode::Unwrapped)
        .await
        .unwrap();
    assert_eq!(first["via"], "/message");

    let started = Instant::now();
    let second = client
        .request("resources/list", None, CallMode::Unwrapped)
        .await
        .unwrap();
    assert_eq!(second["via"], "/message");
    assert!(started.elapsed() < Duration::from_millis(500));

    let fallbacks = logs
        .snapshot()
        .iter()
        .filter(|e| e.line.contains("using fallback"))
        .count();
    assert_eq!(fallbacks, 1);
    assert!(client.message_endpoint().is_none());
}
