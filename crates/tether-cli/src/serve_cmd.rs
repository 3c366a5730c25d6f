use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;

use tether_core::{
    AgentConfig, ConfigStore, LogSubscription, StartOutcome, StopOutcome, Supervisor,
    SupervisorStatus,
};

use crate::settings::Settings;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Shared handler state. The supervisor owns the config store.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
}

impl AppState {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    fn store(&self) -> &ConfigStore {
        self.supervisor.config_store()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/config", get(get_config).post(update_config))
        .route("/start", post(start_worker))
        .route("/stop", post(stop_worker))
        .route("/status", get(get_status))
        .route("/logs", get(stream_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(settings: &Settings, store: ConfigStore) -> Result<()> {
    let supervisor = Supervisor::new(
        store,
        settings.launch_registry(),
        settings.supervisor_config(),
    );
    let app = build_router(AppState::new(supervisor.clone()));

    let addr: SocketAddr = format!("{}:{}", settings.bind, settings.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", settings.bind, settings.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("tether serve listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor.clone()))
        .await?;

    // Covers a worker started after the signal fired.
    supervisor.shutdown().await;
    tracing::info!("tether serve shut down");
    Ok(())
}

/// Wait for Ctrl+C, then stop the worker. Stopping closes every open log
/// stream, which lets graceful shutdown finish.
async fn shutdown_signal(supervisor: Supervisor) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
    supervisor.shutdown().await;
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_config(State(state): State<AppState>) -> Json<AgentConfig> {
    Json(state.store().get())
}

async fn update_config(
    State(state): State<AppState>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<AgentConfig>, AppError> {
    let Json(value) = body.map_err(|e| AppError::bad_request(e.body_text()))?;
    let merged = state
        .store()
        .update_json(value)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    Ok(Json(merged))
}

async fn start_worker(State(state): State<AppState>) -> Result<Json<StartOutcome>, AppError> {
    let outcome = state
        .supervisor
        .start()
        .await
        .map_err(|e| AppError::internal(e.into()))?;
    Ok(Json(outcome))
}

async fn stop_worker(State(state): State<AppState>) -> Json<StopOutcome> {
    Json(state.supervisor.stop().await)
}

async fn get_status(State(state): State<AppState>) -> Json<SupervisorStatus> {
    Json(state.supervisor.status().await)
}

/// `GET /logs`: 409 while idle. A client that connects while the worker is
/// stopping still gets the final lines before the close frame.
async fn stream_logs(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(subscription) = state.supervisor.subscribe().await else {
        return AppError::conflict("not_running").into_response();
    };
    match upgrade {
        Ok(ws) => ws.on_upgrade(move |socket| forward_lines(socket, subscription)),
        Err(rejection) => rejection.into_response(),
    }
}

/// One text frame per line, then a close frame when the run's output ends.
/// A client that closes early just detaches its subscription.
async fn forward_lines(socket: WebSocket, mut subscription: LogSubscription) {
    let id = subscription.id();
    let (mut sender, mut receiver) = socket.split();
    tracing::debug!(subscriber = id, "log websocket opened");

    loop {
        tokio::select! {
            line = subscription.next_line() => match line {
                Some(line) => {
                    let frame = Message::Text(line.text().to_string().into());
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                None => {
                    let close = CloseFrame {
                        code: close_code::NORMAL,
                        reason: "worker output ended".into(),
                    };
                    let _ = sender.send(Message::Close(Some(close))).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    if let Some(overflow) = subscription.overflow() {
        tracing::info!(
            subscriber = id,
            dropped = overflow.dropped,
            "log websocket fell behind and lost lines"
        );
    }
    tracing::debug!(subscriber = id, "log websocket closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use futures::StreamExt;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tower::ServiceExt;

    use tether_core::{
        BroadcastConfig, ConfigStore, LaunchRegistry, Supervisor, SupervisorConfig,
        WorkerProgram,
    };
    use tether_test_utils::FakeWorker;

    use super::AppState;

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn test_state(worker: &FakeWorker) -> AppState {
        let program = WorkerProgram::new(worker.program()).with_args(worker.args());
        let supervisor = Supervisor::new(
            ConfigStore::new(),
            LaunchRegistry::with_program(program),
            SupervisorConfig {
                grace_period: Duration::from_secs(2),
                poll_interval: Duration::from_millis(50),
                broadcast: BroadcastConfig {
                    backlog_lines: 16,
                    ..Default::default()
                },
            },
        );
        AppState::new(supervisor)
    }

    async fn send(state: &AppState, method: &str, uri: &str, body: Option<&str>) -> axum::response::Response {
        let app = super::build_router(state.clone());
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
        app.oneshot(builder.body(body).unwrap()).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // -----------------------------------------------------------------------
    // Config
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_get_config_returns_defaults() {
        let worker = FakeWorker::long_running();
        let state = test_state(&worker);

        let resp = send(&state, "GET", "/config", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["pipeline_type"], "realtime");
        assert_eq!(body["voice"], "alloy");
        assert_eq!(body["speech_rate"], 1.0);
        assert_eq!(body["api_keys"], json!({}));
    }

    #[tokio::test]
    async fn test_post_config_merges_credentials() {
        let worker = FakeWorker::long_running();
        let state = test_state(&worker);

        let resp = send(&state, "POST", "/config", Some(r#"{"api_keys":{"openai":"X"}}"#)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = send(&state, "POST", "/config", Some(r#"{"api_keys":{"deepgram":"Y"}}"#)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["api_keys"], json!({ "openai": "X", "deepgram": "Y" }));
    }

    #[tokio::test]
    async fn test_post_config_rejects_invalid_updates() {
        let worker = FakeWorker::long_running();
        let state = test_state(&worker);

        for bad in [
            r#"{"pipeline_type":"telepathy"}"#,
            r#"{"speech_rate":9.0}"#,
            r#"{"not_a_field":1}"#,
            r#"["not","an","object"]"#,
            "{not json",
        ] {
            let resp = send(&state, "POST", "/config", Some(bad)).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body: {bad}");
            let body = body_json(resp).await;
            assert!(body["error"].is_string(), "body: {bad}");
        }

        let body = body_json(send(&state, "GET", "/config", None).await).await;
        assert_eq!(body["pipeline_type"], "realtime");
        assert_eq!(body["speech_rate"], 1.0);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_stop_when_idle_reports_not_running() {
        let worker = FakeWorker::long_running();
        let state = test_state(&worker);

        let resp = send(&state, "POST", "/stop", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({ "status": "not_running" }));
    }

    #[tokio::test]
    async fn test_start_twice_reports_already_running() {
        let worker = FakeWorker::long_running();
        let state = test_state(&worker);

        let first = body_json(send(&state, "POST", "/start", None).await).await;
        assert_eq!(first["status"], "started");
        assert!(first["pid"].as_u64().is_some());

        let second = body_json(send(&state, "POST", "/start", None).await).await;
        assert_eq!(second, json!({ "status": "already_running" }));

        let status = body_json(send(&state, "GET", "/status", None).await).await;
        assert_eq!(status["state"], "running");
        assert_eq!(status["run"]["run_id"], first["run_id"]);

        state.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_start_failure_is_internal_error() {
        let state = AppState::new(Supervisor::new(
            ConfigStore::new(),
            LaunchRegistry::with_program(WorkerProgram::new("/nonexistent/tether-worker")),
            SupervisorConfig::default(),
        ));

        let resp = send(&state, "POST", "/start", None).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert!(
            body["error"].as_str().unwrap().contains("/nonexistent/tether-worker"),
            "unexpected error: {body}"
        );

        let status = body_json(send(&state, "GET", "/status", None).await).await;
        assert_eq!(status["state"], "idle");
    }

    #[tokio::test]
    async fn test_logs_when_idle_is_conflict() {
        let worker = FakeWorker::long_running();
        let state = test_state(&worker);

        let resp = send(&state, "GET", "/logs", None).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await, json!({ "error": "not_running" }));
    }

    #[tokio::test]
    async fn test_end_to_end_config_start_logs_stop_restart() {
        let worker = FakeWorker::echoes_config();
        let state = test_state(&worker);

        let resp = send(
            &state,
            "POST",
            "/config",
            Some(r#"{"pipeline_type":"cascading","llm_model":"gpt-4o"}"#),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let started = body_json(send(&state, "POST", "/start", None).await).await;
        assert_eq!(started["status"], "started");

        let mut logs = state.supervisor.subscribe().await.expect("worker should be running");
        let line = tokio::time::timeout(Duration::from_secs(5), logs.next_line())
            .await
            .expect("timed out waiting for a log line")
            .expect("log stream ended early");
        let echoed: serde_json::Value = serde_json::from_str(line.text()).unwrap();
        assert_eq!(echoed["pipeline_type"], "cascading");
        assert_eq!(echoed["llm_model"], "gpt-4o");

        let stopped = body_json(send(&state, "POST", "/stop", None).await).await;
        assert_eq!(stopped, json!({ "status": "stopped", "forced": false }));

        let restarted = body_json(send(&state, "POST", "/start", None).await).await;
        assert_eq!(restarted["status"], "started");
        assert_ne!(restarted["run_id"], started["run_id"]);

        let status = body_json(send(&state, "GET", "/status", None).await).await;
        assert_eq!(status["last_exit"]["reason"], json!({ "kind": "stopped", "forced": false }));
        assert_eq!(status["run"]["mode"], "cascading");

        state.supervisor.stop().await;
    }

    // -----------------------------------------------------------------------
    // WebSocket
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_logs_websocket_streams_lines_then_closes() {
        let worker = FakeWorker::new("echo one\necho two\nsleep 1\nexit 0");
        let state = test_state(&worker);
        state.supervisor.start().await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = super::build_router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let (mut ws, response) = connect_async(format!("ws://{addr}/logs")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

        let (texts, close) = tokio::time::timeout(Duration::from_secs(5), async {
            let mut texts = Vec::new();
            while let Some(message) = ws.next().await {
                match message.unwrap() {
                    WsMessage::Text(text) => texts.push(text.as_str().to_string()),
                    WsMessage::Close(frame) => return (texts, frame),
                    _ => {}
                }
            }
            panic!("connection ended without a close frame");
        })
        .await
        .expect("websocket should close when the worker exits");

        assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(close.map(|frame| frame.code), Some(CloseCode::Normal));
    }
}
