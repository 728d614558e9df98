//! Test-generation coordinator.
//!
//! For one `generate_tests` request, the coordinator runs the three test
//! kinds concurrently. Each kind synthesizes its tests, emits the list
//! twice (first with `pending` status, then `running` — the client shows
//! the tests while execution is in flight), hands the list to the runner
//! link in streaming mode, and emits one `test_result_update` per
//! completed test. A failure in one kind ends that kind's branch only.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::external::{FunctionInfo, TestSynthesizer};
use crate::link::TestExecutor;
use crate::protocol::{ResponseMessage, TestStatus};
use crate::session::SessionWriter;

/// Coordinates synthesis, status snapshots, and streaming execution for
/// one `generate_tests` request.
pub struct GenerationCoordinator {
    synthesizers: Vec<Arc<dyn TestSynthesizer>>,
    executor: Arc<dyn TestExecutor>,
}

impl GenerationCoordinator {
    pub fn new(
        synthesizers: Vec<Arc<dyn TestSynthesizer>>,
        executor: Arc<dyn TestExecutor>,
    ) -> Self {
        Self {
            synthesizers,
            executor,
        }
    }

    /// Runs every kind to completion. Returns once all branches have
    /// finished or the session has been cancelled.
    pub async fn generate_all(
        &self,
        request_id: &str,
        function: &FunctionInfo,
        source: &str,
        writer: SessionWriter,
        cancel: CancellationToken,
    ) {
        let mut branches = JoinSet::new();

        for synthesizer in &self.synthesizers {
            let synthesizer = Arc::clone(synthesizer);
            let executor = Arc::clone(&self.executor);
            let writer = writer.clone();
            let cancel = cancel.clone();
            let request_id = request_id.to_string();
            let function = function.clone();
            let source = source.to_string();

            branches.spawn(async move {
                let kind = synthesizer.kind();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(kind = %kind, "generation branch cancelled");
                    }
                    _ = run_kind(synthesizer, executor, writer, request_id, function, source) => {}
                }
            });
        }

        while let Some(joined) = branches.join_next().await {
            if let Err(e) = joined
                && !e.is_cancelled()
            {
                error!(error = %e, "generation branch died");
            }
        }
    }
}

/// One kind's full lifecycle: synthesize, snapshot twice, execute, stream
/// updates.
async fn run_kind(
    synthesizer: Arc<dyn TestSynthesizer>,
    executor: Arc<dyn TestExecutor>,
    writer: SessionWriter,
    request_id: String,
    function: FunctionInfo,
    source: String,
) {
    let kind = synthesizer.kind();

    let mut tests = match synthesizer.synthesize(&function, &source).await {
        Ok(tests) => tests,
        Err(e) => {
            warn!(kind = %kind, error = %e, "test synthesis failed");
            writer
                .send(ResponseMessage::error(
                    request_id.clone(),
                    format!("Failed to generate {kind} tests: {e}"),
                ))
                .await;
            return;
        }
    };

    info!(kind = %kind, count = tests.len(), "synthesized tests");

    // Pending snapshot: the client renders the list while execution runs.
    writer
        .send(ResponseMessage::kind_tests(&request_id, kind, tests.clone()))
        .await;

    for test in &mut tests {
        test.advance(TestStatus::Running);
    }
    writer
        .send(ResponseMessage::kind_tests(&request_id, kind, tests.clone()))
        .await;

    let dispatched = tests.clone();
    let (tx, mut rx) = mpsc::channel(dispatched.len().max(1));
    let dispatch = executor.execute_tests_streaming(&dispatched, tx);

    let updates = async {
        while let Some(result) = rx.recv().await {
            match tests.iter_mut().find(|t| t.id == result.test_id) {
                Some(test) => {
                    test.record_result(&result);
                    writer
                        .send(ResponseMessage::result_update(&request_id, test.clone()))
                        .await;
                }
                None => {
                    warn!(test_id = %result.test_id, "result for unknown test ignored");
                }
            }
        }
    };

    tokio::join!(dispatch, updates);
    info!(kind = %kind, "completed streaming execution");
}
