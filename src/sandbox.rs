//! Sandbox backends for isolated test execution.
//!
//! A sandbox is an ephemeral, resource-capped environment that runs one
//! test and is destroyed afterwards. Two backends implement the same
//! interface: one ephemeral Docker container per test, or one Kubernetes
//! Job+ConfigMap per test.
//!
//! Backends are infallible at the trait boundary: every failure mode
//! (non-zero exit, wall timeout, missing image, API errors) is folded into
//! the returned [`TestResult`], so a dispatched test always produces
//! exactly one terminal result. Cleanup of the sandbox resource is reached
//! on every exit path; cleanup failures are logged and never override the
//! primary result.
//!
//! Per-sandbox lifecycle:
//!
//! ```text
//! Creating -> Running -> (Succeeded | Failed | TimedOut) -> Cleaning -> Done
//! ```

pub mod docker;
pub mod kubernetes;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{BackendConfig, SandboxLimits};
use crate::protocol::runner::{TestResult, TestSpec};

/// Where the staged source lands inside the sandbox.
pub const SOURCE_PATH: &str = "/test/test_code.py";

/// Marker appended to logs cut at the configured byte cap.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Interval between sandbox status polls.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Errors internal to the backends. Mapped to [`TestResult`] fields at the
/// trait boundary via [`failure_result`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Failed to create sandbox: {0}")]
    CreateFailed(String),

    #[error("Sandbox image not found: {0}")]
    ImageMissing(String),

    #[error("timeout")]
    Timeout {
        /// Whatever logs could still be captured when the limit fired.
        partial_output: String,
    },

    #[error("Sandbox API error: {0}")]
    Api(String),

    #[error("execution cancelled")]
    Cancelled,
}

/// What a finished sandbox produced.
#[derive(Debug)]
pub(crate) struct SandboxOutcome {
    pub exit_code: i64,
    pub output: String,
    pub wall_time: f64,
}

/// An execution backend: runs one test in a fresh sandbox and guarantees
/// the sandbox is gone (or at worst leaked-and-logged) by the time the
/// result is returned.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Executes one test. Infallible: failures become failed results.
    ///
    /// Cancelling `cancel` aborts the wait but still performs cleanup.
    async fn execute(&self, test: &TestSpec, cancel: &CancellationToken) -> TestResult;

    /// Backend name, for logging.
    fn name(&self) -> &'static str;
}

/// Constructs the configured backend.
pub async fn build_backend(config: &BackendConfig) -> anyhow::Result<Arc<dyn SandboxBackend>> {
    match config {
        BackendConfig::Docker(cfg) => Ok(Arc::new(docker::DockerBackend::new(cfg.clone())?)),
        BackendConfig::Kubernetes(cfg) => {
            Ok(Arc::new(kubernetes::KubernetesBackend::new(cfg.clone()).await?))
        }
    }
}

/// Unique sandbox name: test id plus a random suffix so that retries of
/// the same test never collide.
pub(crate) fn sandbox_name(test_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("test-{}-{}", test_id.to_lowercase(), &suffix[..8])
}

/// Caps captured logs at `cap` bytes, appending a marker when cut.
/// Truncation is not a failure.
pub(crate) fn truncate_logs(logs: String, cap: usize) -> String {
    if logs.len() <= cap {
        return logs;
    }
    let mut cut = cap;
    while cut > 0 && !logs.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = logs[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// The command executed inside the sandbox. The staged source file is
/// referenced by a fixed path; user source never passes through a shell.
pub(crate) fn executor_command(install_deps: bool) -> Vec<String> {
    if install_deps {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "pip install --quiet hypothesis pytest memory-profiler psutil && python {SOURCE_PATH}"
            ),
        ]
    } else {
        vec!["python".to_string(), SOURCE_PATH.to_string()]
    }
}

/// Whether the active image is the opt-in generic fallback, which has no
/// test dependencies preinstalled.
pub(crate) fn needs_dep_install(active_image: &str, limits: &SandboxLimits) -> bool {
    !limits.fallback_image.is_empty() && active_image == limits.fallback_image
}

/// Maps a successful sandbox run to its wire result. Exit code decides
/// success; output rides along either way.
pub(crate) fn outcome_result(test_id: &str, outcome: SandboxOutcome) -> TestResult {
    let success = outcome.exit_code == 0;
    TestResult {
        test_id: test_id.to_string(),
        success,
        output: outcome.output,
        error: if success {
            None
        } else {
            Some(format!("exit code {}", outcome.exit_code))
        },
        execution_time: Some(outcome.wall_time),
    }
}

/// Maps a backend error to a failed wire result.
pub(crate) fn failure_result(test_id: &str, err: SandboxError) -> TestResult {
    match err {
        SandboxError::Timeout { partial_output } => TestResult {
            test_id: test_id.to_string(),
            success: false,
            output: partial_output,
            error: Some("timeout".to_string()),
            execution_time: None,
        },
        other => TestResult::infra_failure(test_id, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_names_are_unique_per_call() {
        let a = sandbox_name("ABC-123");
        let b = sandbox_name("ABC-123");
        assert_ne!(a, b);
        assert!(a.starts_with("test-abc-123-"));
    }

    #[test]
    fn logs_below_cap_pass_through() {
        let logs = "short output".to_string();
        assert_eq!(truncate_logs(logs.clone(), 1024), logs);
    }

    #[test]
    fn logs_above_cap_get_marker() {
        let logs = "x".repeat(100);
        let capped = truncate_logs(logs, 10);
        assert!(capped.starts_with("xxxxxxxxxx"));
        assert!(capped.ends_with(TRUNCATION_MARKER));
        assert_eq!(capped.len(), 10 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let logs = "héllo wörld".repeat(10);
        let capped = truncate_logs(logs, 7);
        assert!(capped.ends_with(TRUNCATION_MARKER));
        // Must not panic and must still be valid UTF-8 (guaranteed by String).
    }

    #[test]
    fn zero_exit_maps_to_success() {
        let result = outcome_result(
            "t1",
            SandboxOutcome {
                exit_code: 0,
                output: "all good".to_string(),
                wall_time: 1.5,
            },
        );
        assert!(result.success);
        assert!(result.error.is_none());
        assert_eq!(result.output, "all good");
        assert_eq!(result.execution_time, Some(1.5));
    }

    #[test]
    fn nonzero_exit_maps_to_exit_code_error() {
        let result = outcome_result(
            "t2",
            SandboxOutcome {
                exit_code: 3,
                output: "assertion failed".to_string(),
                wall_time: 0.1,
            },
        );
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("exit code 3"));
        assert_eq!(result.output, "assertion failed");
    }

    #[test]
    fn timeout_maps_to_timeout_error_with_partial_logs() {
        let result = failure_result(
            "t3",
            SandboxError::Timeout {
                partial_output: "got this far".to_string(),
            },
        );
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timeout"));
        assert_eq!(result.output, "got this far");
    }

    #[test]
    fn infra_errors_keep_description() {
        let result = failure_result("t4", SandboxError::ImageMissing("executor:v1".to_string()));
        assert!(!result.success);
        assert!(result.error.unwrap().contains("executor:v1"));
        assert!(result.output.is_empty());
    }

    #[test]
    fn dep_install_only_on_explicit_fallback() {
        let mut limits = SandboxLimits::default();
        assert!(!needs_dep_install(&limits.image.clone(), &limits));

        limits.fallback_image = "python:3.12-alpine".to_string();
        assert!(needs_dep_install("python:3.12-alpine", &limits));
        assert!(!needs_dep_install(&limits.image.clone(), &limits));
    }

    #[test]
    fn executor_command_references_staged_file() {
        let plain = executor_command(false);
        assert_eq!(plain, vec!["python".to_string(), SOURCE_PATH.to_string()]);

        let with_deps = executor_command(true);
        assert_eq!(with_deps[0], "sh");
        assert!(with_deps[2].contains(SOURCE_PATH));
        assert!(with_deps[2].contains("pip install"));
    }
}
