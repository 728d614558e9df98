//! Per-client session controller.
//!
//! Each accepted WebSocket becomes a session: a receive loop that parses
//! and routes request envelopes, a single writer task that serializes all
//! outbound frames (so frames on one session are totally ordered), a
//! keepalive task emitting `ping` frames, and a supervised task group for
//! long-running requests. Disconnect cancels the session token, which
//! cascades into every in-flight dispatch of that session and nothing
//! else.

pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::HeaderValue;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::external::{DocGenerator, ImprovementGenerator, ModelDetector, SourceValidator};
use crate::generate::GenerationCoordinator;
use crate::link::TestExecutor;
use crate::protocol::{
    Outbound, PingMessage, RequestKind, RequestMessage, ResponseMessage, salvage_request_id,
};

/// Handle for sending frames on one session. All clones feed the same
/// single writer task, so sends from concurrent request handlers are
/// serialized onto the socket.
#[derive(Clone)]
pub struct SessionWriter {
    tx: mpsc::Sender<Outbound>,
}

impl SessionWriter {
    pub(crate) fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// Queues a response frame. Errors (session gone) are swallowed: a
    /// handler racing a disconnect has nowhere to report to anyway.
    pub async fn send(&self, msg: ResponseMessage) {
        let _ = self.tx.send(Outbound::Response(msg)).await;
    }

    /// Queues a keepalive ping. Returns `false` once the session is gone.
    async fn ping(&self) -> bool {
        self.tx.send(Outbound::Ping(PingMessage::now())).await.is_ok()
    }
}

/// Live-session bookkeeping.
pub struct SessionEntry {
    pub connect_time: DateTime<Utc>,
    pub last_activity: std::sync::Mutex<DateTime<Utc>>,
    pub cancel: CancellationToken,
}

impl SessionEntry {
    fn new(cancel: CancellationToken) -> Self {
        let now = Utc::now();
        Self {
            connect_time: now,
            last_activity: std::sync::Mutex::new(now),
            cancel,
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Utc::now();
    }
}

/// Shared orchestrator state: configuration, the runner link, and the
/// external collaborators, injected once at startup. Sessions are tracked
/// by id; they share nothing with each other.
pub struct SessionState {
    pub config: OrchestratorConfig,
    pub executor: Arc<dyn TestExecutor>,
    pub detector: Arc<dyn ModelDetector>,
    pub validator: Arc<dyn SourceValidator>,
    pub coordinator: GenerationCoordinator,
    pub docs: Arc<dyn DocGenerator>,
    pub improvements: Arc<dyn ImprovementGenerator>,
    sessions: std::sync::Mutex<HashMap<Uuid, Arc<SessionEntry>>>,
}

impl SessionState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        executor: Arc<dyn TestExecutor>,
        detector: Arc<dyn ModelDetector>,
        validator: Arc<dyn SourceValidator>,
        coordinator: GenerationCoordinator,
        docs: Arc<dyn DocGenerator>,
        improvements: Arc<dyn ImprovementGenerator>,
    ) -> Self {
        Self {
            config,
            executor,
            detector,
            validator,
            coordinator,
            docs,
            improvements,
            sessions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, id: Uuid, cancel: CancellationToken) -> Arc<SessionEntry> {
        let entry = Arc::new(SessionEntry::new(cancel));
        self.sessions.lock().unwrap().insert(id, Arc::clone(&entry));
        entry
    }

    fn unregister(&self, id: Uuid) {
        self.sessions.lock().unwrap().remove(&id);
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Cancels every live session's in-flight work. Called when the
    /// orchestrator drains at shutdown.
    pub fn shutdown_sessions(&self) {
        for entry in self.sessions.lock().unwrap().values() {
            entry.cancel.cancel();
        }
    }
}

/// Everything a request handler needs, cloneable into spawned tasks.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub state: Arc<SessionState>,
    pub writer: SessionWriter,
    pub cancel: CancellationToken,
}

/// Builds the orchestrator router: the session endpoint plus liveness
/// routes, with the configured CORS policy.
pub fn router(state: Arc<SessionState>) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "crucible orchestrator" }))
}

async fn health(State(state): State<Arc<SessionState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "active_sessions": state.active_sessions(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<SessionState>>) -> Response {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

/// Drives one client session from accept to teardown.
async fn handle_session(socket: WebSocket, state: Arc<SessionState>) {
    let session_id = Uuid::new_v4();
    let cancel = CancellationToken::new();
    let entry = state.register(session_id, cancel.clone());
    info!(session = %session_id, "client session connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);
    let writer = SessionWriter::new(out_tx);

    // Single writer: the only code that touches the socket sink.
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "failed to serialize outbound frame");
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let keepalive = {
        let writer = writer.clone();
        let interval = Duration::from_secs(state.config.keepalive_interval_s.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !writer.ping().await {
                    break;
                }
            }
        })
    };

    let ctx = SessionContext {
        state: Arc::clone(&state),
        writer: writer.clone(),
        cancel: cancel.clone(),
    };

    // Supervised task group: long-running requests live here so that
    // session teardown cancels and reaps them.
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        entry.touch();
                        handle_frame(&ctx, text.as_str(), &mut tasks).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined
                    && !e.is_cancelled()
                {
                    error!(session = %session_id, error = %e, "request handler died");
                }
            }
        }
    }

    // Teardown: cancel in-flight work for this session only.
    cancel.cancel();
    keepalive.abort();
    tasks.shutdown().await;
    drop(ctx);
    drop(writer);
    let _ = writer_task.await;
    state.unregister(session_id);
    info!(session = %session_id, "client session closed");
}

/// Parses one inbound frame and routes it.
///
/// Malformed JSON or envelopes get an `error` response (with the id when
/// one can be salvaged); a well-formed envelope with an unknown `type`
/// gets a logged warning and no response.
async fn handle_frame(ctx: &SessionContext, raw: &str, tasks: &mut JoinSet<()>) {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "invalid JSON frame");
            // No readable id: the error goes out uncorrelated.
            ctx.writer
                .send(ResponseMessage::error(None, "Invalid JSON format."))
                .await;
            return;
        }
    };

    let known_kind = value
        .get("type")
        .cloned()
        .and_then(|t| serde_json::from_value::<RequestKind>(t).ok());
    let Some(kind) = known_kind else {
        warn!(kind = ?value.get("type"), "unknown request type");
        return;
    };

    let request: RequestMessage = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "invalid request envelope");
            ctx.writer
                .send(ResponseMessage::error(
                    salvage_request_id(raw),
                    "Invalid message format.",
                ))
                .await;
            return;
        }
    };

    debug!(id = %request.id, kind = ?kind, "routing request");

    match kind {
        RequestKind::Pong => {
            // Activity already recorded by the receive loop.
            debug!("pong received");
        }
        RequestKind::TestAi => handlers::handle_test_ai(ctx, request).await,
        RequestKind::VerifyCode => handlers::handle_verify_code(ctx, request).await,
        RequestKind::GenerateTests => {
            let ctx = ctx.clone();
            tasks.spawn(async move { handlers::handle_generate_tests(&ctx, request).await });
        }
        RequestKind::GenerateDocs => {
            let ctx = ctx.clone();
            tasks.spawn(async move { handlers::handle_generate_docs(&ctx, request).await });
        }
        RequestKind::GenerateImprovements => {
            let ctx = ctx.clone();
            tasks.spawn(async move { handlers::handle_generate_improvements(&ctx, request).await });
        }
        RequestKind::RunTests => {
            let ctx = ctx.clone();
            tasks.spawn(async move { handlers::handle_run_tests(&ctx, request).await });
        }
    }
}
