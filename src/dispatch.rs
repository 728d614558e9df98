//! Fan-out/fan-in dispatch of test batches onto sandbox backends.
//!
//! The dispatcher maps N tests to N concurrent backend executions, bounded
//! by a configurable parallelism cap. Results come back either as an
//! ordered batch (aligned 1:1 with the input) or streamed through a
//! channel as each test completes.
//!
//! The dispatcher upholds the delivery invariant: every dispatched test
//! produces exactly one terminal result. A backend task that dies (panic,
//! abort) gets a synthesized failure result with the original test id
//! rather than a dropped entry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::protocol::runner::{TestResult, TestSpec};
use crate::sandbox::SandboxBackend;

/// Error string for results synthesized when a sandbox task vanished.
const TASK_LOST: &str = "sandbox task failed before producing a result";

/// Dispatches batches of tests onto a sandbox backend.
pub struct Dispatcher {
    backend: Arc<dyn SandboxBackend>,
    max_parallel: usize,
}

impl Dispatcher {
    /// Creates a dispatcher. `max_parallel` of `0` means no ceiling: one
    /// sandbox per test.
    pub fn new(backend: Arc<dyn SandboxBackend>, max_parallel: usize) -> Self {
        Self {
            backend,
            max_parallel,
        }
    }

    fn permits(&self, batch_len: usize) -> usize {
        if self.max_parallel == 0 {
            batch_len.max(1)
        } else {
            self.max_parallel.min(batch_len.max(1))
        }
    }

    fn spawn_all(
        &self,
        tests: &[TestSpec],
        cancel: &CancellationToken,
    ) -> JoinSet<TestResult> {
        let semaphore = Arc::new(Semaphore::new(self.permits(tests.len())));
        let mut set = JoinSet::new();

        for test in tests {
            let backend = Arc::clone(&self.backend);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let test = test.clone();

            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                backend.execute(&test, &cancel).await
            });
        }

        set
    }

    /// Runs all tests and returns results aligned 1:1 with the input order.
    pub async fn execute_batch(
        &self,
        tests: &[TestSpec],
        cancel: &CancellationToken,
    ) -> Vec<TestResult> {
        debug!(count = tests.len(), backend = self.backend.name(), "dispatching batch");

        let mut set = self.spawn_all(tests, cancel);
        let mut by_id: HashMap<String, TestResult> = HashMap::with_capacity(tests.len());

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    by_id.insert(result.test_id.clone(), result);
                }
                Err(e) => error!(error = %e, "sandbox task died"),
            }
        }

        tests
            .iter()
            .map(|test| {
                by_id
                    .remove(&test.id)
                    .unwrap_or_else(|| TestResult::infra_failure(&test.id, TASK_LOST))
            })
            .collect()
    }

    /// Runs all tests, delivering each result through `sink` as soon as it
    /// is available. Order is not guaranteed; completeness is.
    pub async fn execute_streaming(
        &self,
        tests: &[TestSpec],
        sink: mpsc::Sender<TestResult>,
        cancel: &CancellationToken,
    ) {
        debug!(
            count = tests.len(),
            backend = self.backend.name(),
            "dispatching streaming batch"
        );

        let mut set = self.spawn_all(tests, cancel);
        let mut delivered: std::collections::HashSet<String> = std::collections::HashSet::new();

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    delivered.insert(result.test_id.clone());
                    if sink.send(result).await.is_err() {
                        // Receiver gone: the dispatch was abandoned. Let
                        // remaining tasks finish so cleanup still runs.
                        debug!("result sink closed, discarding remaining results");
                    }
                }
                Err(e) => error!(error = %e, "sandbox task died"),
            }
        }

        for test in tests {
            if !delivered.contains(&test.id) {
                let _ = sink
                    .send(TestResult::infra_failure(&test.id, TASK_LOST))
                    .await;
            }
        }
    }
}
