//! Tutor Web 前端（SSE）
//!
//! 启动: cargo run --bin tutor-web --features web
//! POST /api/tutor/chat   {"message": "...", "session_id": "...", "difficulty": "beginner", "context": "briefing:42"}
//! GET  /api/tutor/sessions/:id
//!
//! 客户端断开即丢弃 TurnStream，进行中的轮次随之取消。

#![cfg(feature = "web")]

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use tutor::config::load_config;
use tutor::core::{
    CheckpointStoreCleanup, ContextRef, Difficulty, ShutdownCoordinator, ShutdownManager, TurnDrainCleanup,
};
use tutor::react::{EventPayload, TurnEvent};
use tutor::{encode, TurnRequest, TutorError, TutorOrchestrator};

#[derive(Clone)]
struct AppState {
    orchestrator: TutorOrchestrator,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    difficulty: Option<Difficulty>,
    /// `<type>:<id>`，如 `briefing:42`
    #[serde(default)]
    context: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tutor::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let orchestrator = TutorOrchestrator::from_config(&cfg)
        .await
        .context("Failed to create orchestrator")?
        .with_shutdown_token(shutdown.token());

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(TurnDrainCleanup::new(orchestrator.gate().clone()));
    coordinator.register(CheckpointStoreCleanup::new(orchestrator.store()));

    let state = Arc::new(AppState { orchestrator });
    let app = Router::new()
        .route("/api/tutor/chat", post(api_chat))
        .route("/api/tutor/sessions/:id", get(api_session))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(state);

    let addr = cfg.web.socket_addr().context("Invalid web.bind")?;
    tracing::info!("Tutor Web: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let wait = Arc::clone(&shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { wait.wait_for_shutdown().await })
        .await?;

    coordinator.run_cleanup().await;
    Ok(())
}

/// POST /api/tutor/chat：SSE，每个事件一帧，以 done / error 结束
async fn api_chat(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> Response {
    let mut request = TurnRequest::new(req.message);
    if let Some(id) = req.session_id {
        request = request.with_session(id);
    }
    if let Some(d) = req.difficulty {
        request = request.with_difficulty(d);
    }
    if let Some(raw) = req.context.filter(|s| !s.trim().is_empty()) {
        match raw.parse::<ContextRef>() {
            Ok(ctx) => request = request.with_context(ctx),
            Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
        }
    }

    match state.orchestrator.handle_turn(request) {
        Ok(stream) => sse(stream).into_response(),
        Err(err) => {
            let status = match err {
                TutorError::Validation(_) => StatusCode::BAD_REQUEST,
                TutorError::SessionBusy(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let session_id = match &err {
                TutorError::SessionBusy(id) => id.clone(),
                _ => String::new(),
            };
            let frame = encode(&TurnEvent::new(
                session_id,
                EventPayload::Error {
                    message: err.user_message(),
                },
            ));
            (status, Json(frame)).into_response()
        }
    }
}

fn sse(stream: tutor::TurnStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream.map(|event| {
        let frame = encode(&event);
        Ok(Event::default().event(frame.kind).data(frame.to_json()))
    });
    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// GET /api/tutor/sessions/:id：最近一次持久化的会话
async fn api_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.orchestrator.session(&id).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "session not found").into_response(),
        Err(e) => {
            tracing::error!(session_id = %id, "failed to load session: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.user_message()).into_response()
        }
    }
}
