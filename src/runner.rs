//! Runner service: the sandbox-facing WebSocket endpoint.
//!
//! The orchestrator connects here to dispatch batches of tests. Each
//! inbound request is executed via the [`Dispatcher`], either streamed
//! (one `test_result` frame per test as it completes) or batched (one
//! `results` frame). Liveness `ping` frames are answered with `pong`.
//! Closing the connection cancels that connection's in-flight dispatches;
//! sandbox cleanup still runs.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;
use crate::protocol::runner::{ControlKind, RunnerInbound, RunnerReply, RunnerRequest};

/// Builds the runner service router.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    // The runner is an internal service; it accepts any origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(dispatcher)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "crucible test runner" }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(dispatcher): State<Arc<Dispatcher>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, dispatcher))
}

/// Drives one orchestrator connection.
async fn handle_connection(socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    info!("orchestrator connected");

    let cancel = CancellationToken::new();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<RunnerReply>(64);

    // Single writer for the connection; reply frames from concurrent
    // dispatches are serialized here.
    let writer_task = tokio::spawn(async move {
        while let Some(reply) = out_rx.recv().await {
            let json = match serde_json::to_string(&reply) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "failed to serialize runner reply");
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut dispatches: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(text.as_str(), &dispatcher, &out_tx, &cancel, &mut dispatches)
                            .await;
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            Some(joined) = dispatches.join_next(), if !dispatches.is_empty() => {
                if let Err(e) = joined
                    && !e.is_cancelled()
                {
                    error!(error = %e, "dispatch task died");
                }
            }
        }
    }

    // Connection gone: cancel in-flight dispatches. The sandbox driver
    // still performs cleanup under cancellation.
    cancel.cancel();
    dispatches.shutdown().await;
    drop(out_tx);
    let _ = writer_task.await;
    info!("orchestrator connection closed");
}

async fn handle_frame(
    raw: &str,
    dispatcher: &Arc<Dispatcher>,
    out: &mpsc::Sender<RunnerReply>,
    cancel: &CancellationToken,
    dispatches: &mut JoinSet<()>,
) {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "invalid JSON from orchestrator");
            let _ = out
                .send(RunnerReply::Error {
                    error: "Invalid JSON format".to_string(),
                    details: Some(e.to_string()),
                })
                .await;
            return;
        }
    };

    let inbound: RunnerInbound = match serde_json::from_value(value) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(error = %e, "invalid message from orchestrator");
            let _ = out
                .send(RunnerReply::Error {
                    error: "Invalid message format".to_string(),
                    details: Some(e.to_string()),
                })
                .await;
            return;
        }
    };

    match inbound {
        RunnerInbound::Control {
            kind: ControlKind::Ping,
            message_id,
        } => {
            let _ = out
                .send(RunnerReply::Control {
                    kind: ControlKind::Pong,
                    message_id,
                })
                .await;
        }
        RunnerInbound::Control {
            kind: ControlKind::Pong,
            ..
        } => {}
        RunnerInbound::Request(request) => {
            info!(
                message_id = %request.message_id,
                tests = request.tests.len(),
                streaming = request.streaming,
                "processing dispatch"
            );

            let dispatcher = Arc::clone(dispatcher);
            let out = out.clone();
            let cancel = cancel.child_token();
            dispatches.spawn(async move {
                run_dispatch(dispatcher, request, out, cancel).await;
            });
        }
    }
}

/// Executes one dispatch and writes its reply frame(s).
async fn run_dispatch(
    dispatcher: Arc<Dispatcher>,
    request: RunnerRequest,
    out: mpsc::Sender<RunnerReply>,
    cancel: CancellationToken,
) {
    let message_id = request.message_id.clone();

    if request.streaming {
        let (tx, mut rx) = mpsc::channel(request.tests.len().max(1));
        let run = dispatcher.execute_streaming(&request.tests, tx, &cancel);
        let forward = async {
            while let Some(result) = rx.recv().await {
                let _ = out
                    .send(RunnerReply::Single {
                        message_id: message_id.clone(),
                        test_result: result,
                    })
                    .await;
            }
        };
        tokio::join!(run, forward);
        info!(message_id = %message_id, "completed streaming dispatch");
    } else {
        let results = dispatcher.execute_batch(&request.tests, &cancel).await;
        let count = results.len();
        let _ = out
            .send(RunnerReply::Batch {
                message_id: message_id.clone(),
                results,
            })
            .await;
        info!(message_id = %message_id, count, "completed batched dispatch");
    }
}
