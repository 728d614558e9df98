//! Client for the runner service link.
//!
//! The orchestrator talks to the sandbox runner service over a WebSocket.
//! Each dispatch gets a fresh connection and a fresh `message_id`, so two
//! concurrent dispatches can never interleave frames of one stream.
//! Connection establishment uses bounded exponential backoff; everything
//! after a successful connect is single-shot and any failure is fatal for
//! that dispatch only.
//!
//! Fatal dispatch errors never propagate upward as errors: both entry
//! points synthesize a failed [`TestResult`] for every test that has not
//! received one, so callers always see exactly one terminal result per
//! dispatched test.

use std::collections::HashSet;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::protocol::Test;
use crate::protocol::runner::{RunnerReply, RunnerRequest, TestResult};

/// Prefix on every synthesized failure caused by link trouble, so clients
/// can tell infrastructure failures from test failures.
pub const COMM_ERROR_PREFIX: &str = "Test runner communication error";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors fatal to one dispatch.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("cannot connect to test runner after {attempts} attempts: {last_error}")]
    ConnectExhausted { attempts: u32, last_error: String },

    #[error("invalid response from test runner: {0}")]
    Decode(String),

    #[error("test execution timed out")]
    Timeout,

    #[error("test runner error: {0}")]
    Runner(String),

    #[error("test runner closed the connection")]
    Closed,
}

/// The dispatch surface the orchestrator core depends on.
///
/// [`RunnerClient`] is the production implementation; tests substitute
/// scripted executors.
#[async_trait::async_trait]
pub trait TestExecutor: Send + Sync {
    /// Batched dispatch: one result per test, aligned with input order.
    async fn execute_tests(&self, tests: &[Test]) -> Vec<TestResult>;

    /// Streaming dispatch: results delivered through `sink` as they land.
    async fn execute_tests_streaming(&self, tests: &[Test], sink: mpsc::Sender<TestResult>);
}

/// Persistent handle on the runner service endpoint.
///
/// The client itself is cheap and stateless; it opens one socket per
/// dispatch and closes it when the dispatch completes.
pub struct RunnerClient {
    config: LinkConfig,
}

#[async_trait::async_trait]
impl TestExecutor for RunnerClient {
    async fn execute_tests(&self, tests: &[Test]) -> Vec<TestResult> {
        RunnerClient::execute_tests(self, tests).await
    }

    async fn execute_tests_streaming(&self, tests: &[Test], sink: mpsc::Sender<TestResult>) {
        RunnerClient::execute_tests_streaming(self, tests, sink).await
    }
}

impl RunnerClient {
    pub fn new(config: LinkConfig) -> Self {
        Self { config }
    }

    /// Executes tests in batched mode. Returns one result per input test,
    /// aligned with input order; missing or failed entries are synthesized.
    pub async fn execute_tests(&self, tests: &[Test]) -> Vec<TestResult> {
        if tests.is_empty() {
            return Vec::new();
        }

        let request = RunnerRequest::new(tests, false);
        match self.batch_dispatch(&request).await {
            Ok(results) => {
                let mut by_id: std::collections::HashMap<String, TestResult> = results
                    .into_iter()
                    .map(|r| (r.test_id.clone(), r))
                    .collect();
                tests
                    .iter()
                    .map(|test| {
                        by_id.remove(&test.id).unwrap_or_else(|| {
                            TestResult::infra_failure(
                                &test.id,
                                format!("{COMM_ERROR_PREFIX}: missing result"),
                            )
                        })
                    })
                    .collect()
            }
            Err(e) => {
                error!(error = %e, "batched dispatch failed");
                tests
                    .iter()
                    .map(|test| {
                        TestResult::infra_failure(&test.id, format!("{COMM_ERROR_PREFIX}: {e}"))
                    })
                    .collect()
            }
        }
    }

    /// Executes tests in streaming mode, delivering each result through
    /// `sink` as it arrives. Completes once every test has a result.
    pub async fn execute_tests_streaming(&self, tests: &[Test], sink: mpsc::Sender<TestResult>) {
        if tests.is_empty() {
            return;
        }

        let request = RunnerRequest::new(tests, true);
        let mut pending: HashSet<String> = tests.iter().map(|t| t.id.clone()).collect();

        let outcome = self.stream_dispatch(&request, &mut pending, &sink).await;
        if let Err(e) = &outcome {
            error!(error = %e, message_id = %request.message_id, "streaming dispatch failed");
        }

        // Whatever is still pending (fatal error, partial batch) gets a
        // synthesized failure so no test is left without a terminal result.
        let reason = match outcome {
            Ok(()) => format!("{COMM_ERROR_PREFIX}: missing result"),
            Err(e) => format!("{COMM_ERROR_PREFIX}: {e}"),
        };
        for test_id in pending {
            let _ = sink
                .send(TestResult::infra_failure(test_id, reason.clone()))
                .await;
        }
    }

    /// Connects with bounded exponential backoff: `connect_backoff_initial_s`
    /// doubling per attempt, `connect_max_attempts` attempts, each bounded
    /// by `connect_timeout_s`.
    async fn connect(&self) -> Result<WsStream, LinkError> {
        let max_attempts = self.config.connect_max_attempts.max(1);
        let mut delay = Duration::from_secs(self.config.connect_backoff_initial_s);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            info!(
                attempt,
                max_attempts,
                url = %self.config.runner_url,
                "connecting to test runner"
            );

            let connect = connect_async(&self.config.runner_url);
            match tokio::time::timeout(
                Duration::from_secs(self.config.connect_timeout_s),
                connect,
            )
            .await
            {
                Ok(Ok((ws, _))) => {
                    info!(url = %self.config.runner_url, "connected to test runner");
                    return Ok(ws);
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "test runner connection failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(attempt, "test runner connection attempt timed out");
                    last_error = "connection attempt timed out".to_string();
                }
            }

            if attempt < max_attempts {
                debug!(delay_s = delay.as_secs(), "backing off before retry");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(LinkError::ConnectExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn batch_dispatch(&self, request: &RunnerRequest) -> Result<Vec<TestResult>, LinkError> {
        let mut ws = self.connect().await?;
        self.send_request(&mut ws, request).await?;

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.dispatch_timeout_s);

        loop {
            let reply = self.next_reply(&mut ws, deadline).await?;
            match reply {
                RunnerReply::Batch {
                    message_id,
                    results,
                } if message_id == request.message_id => {
                    debug!(count = results.len(), "received batch results");
                    let _ = ws.close(None).await;
                    return Ok(results);
                }
                RunnerReply::Error { error, details } => {
                    return Err(LinkError::Runner(match details {
                        Some(details) => format!("{error}: {details}"),
                        None => error,
                    }));
                }
                other => self.note_stray_frame(&other, &request.message_id),
            }
        }
    }

    async fn stream_dispatch(
        &self,
        request: &RunnerRequest,
        pending: &mut HashSet<String>,
        sink: &mpsc::Sender<TestResult>,
    ) -> Result<(), LinkError> {
        let mut ws = self.connect().await?;
        self.send_request(&mut ws, request).await?;

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.dispatch_timeout_s);

        while !pending.is_empty() {
            let reply = self.next_reply(&mut ws, deadline).await?;
            match reply {
                RunnerReply::Single {
                    message_id,
                    test_result,
                } if message_id == request.message_id => {
                    if pending.remove(&test_result.test_id) {
                        debug!(test_id = %test_result.test_id, "received streamed result");
                        let _ = sink.send(test_result).await;
                    } else {
                        warn!(test_id = %test_result.test_id, "duplicate streamed result ignored");
                    }
                }
                // A runner may answer a streaming request with one batch.
                RunnerReply::Batch {
                    message_id,
                    results,
                } if message_id == request.message_id => {
                    for result in results {
                        if pending.remove(&result.test_id) {
                            let _ = sink.send(result).await;
                        }
                    }
                    break;
                }
                RunnerReply::Error { error, details } => {
                    return Err(LinkError::Runner(match details {
                        Some(details) => format!("{error}: {details}"),
                        None => error,
                    }));
                }
                other => self.note_stray_frame(&other, &request.message_id),
            }
        }

        let _ = ws.close(None).await;
        Ok(())
    }

    async fn send_request(
        &self,
        ws: &mut WsStream,
        request: &RunnerRequest,
    ) -> Result<(), LinkError> {
        let json =
            serde_json::to_string(request).map_err(|e| LinkError::Decode(e.to_string()))?;
        ws.send(Message::Text(json.into()))
            .await
            .map_err(|_| LinkError::Closed)?;
        info!(
            message_id = %request.message_id,
            tests = request.tests.len(),
            streaming = request.streaming,
            "sent dispatch to test runner"
        );
        Ok(())
    }

    /// Reads the next decoded reply frame, honoring the dispatch deadline.
    async fn next_reply(
        &self,
        ws: &mut WsStream,
        deadline: tokio::time::Instant,
    ) -> Result<RunnerReply, LinkError> {
        loop {
            let frame = tokio::time::timeout_at(deadline, ws.next())
                .await
                .map_err(|_| LinkError::Timeout)?
                .ok_or(LinkError::Closed)?
                .map_err(|_| LinkError::Closed)?;

            match frame {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .map_err(|e| LinkError::Decode(e.to_string()));
                }
                Message::Close(_) => return Err(LinkError::Closed),
                // Transport-level ping/pong handled by tungstenite.
                _ => continue,
            }
        }
    }

    /// Stale or interleaved traffic on a shared endpoint: log and drop.
    fn note_stray_frame(&self, reply: &RunnerReply, expected: &str) {
        match reply {
            RunnerReply::Control { kind, .. } => {
                debug!(kind = ?kind, "runner liveness frame");
            }
            RunnerReply::Single { message_id, .. } | RunnerReply::Batch { message_id, .. } => {
                warn!(
                    got = %message_id,
                    expected = %expected,
                    "message id mismatch, ignoring frame"
                );
            }
            RunnerReply::Error { .. } => {}
        }
    }
}
