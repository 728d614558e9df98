//! Kubernetes sandbox backend.
//!
//! One Job plus one ConfigMap per test. The ConfigMap carries the test
//! source; the Job mounts it read-only at `/test` and runs the fixed
//! executor command with resource limits. The driver deletes both
//! resources explicitly on every exit path; `ttlSecondsAfterFinished` is
//! set as defense in depth for the paths it never reaches.

use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    POLL_INTERVAL, SandboxBackend, SandboxError, SandboxOutcome, executor_command,
    failure_result, needs_dep_install, outcome_result, sandbox_name, truncate_logs,
};
use crate::config::KubernetesBackendConfig;
use crate::protocol::runner::{TestResult, TestSpec};

const EXECUTOR_CONTAINER: &str = "test-executor";

/// Sandbox backend running each test as a Kubernetes Job.
pub struct KubernetesBackend {
    jobs: Api<Job>,
    configmaps: Api<ConfigMap>,
    pods: Api<Pod>,
    config: KubernetesBackendConfig,
}

impl KubernetesBackend {
    /// Connects using the inferred configuration (in-cluster when
    /// available, kubeconfig otherwise).
    pub async fn new(config: KubernetesBackendConfig) -> Result<Self, SandboxError> {
        let client = Client::try_default()
            .await
            .map_err(|e| SandboxError::Api(format!("kubernetes config: {e}")))?;

        Ok(Self {
            jobs: Api::namespaced(client.clone(), &config.namespace),
            configmaps: Api::namespaced(client.clone(), &config.namespace),
            pods: Api::namespaced(client, &config.namespace),
            config,
        })
    }

    async fn create_source_configmap(
        &self,
        job_name: &str,
        code: &str,
    ) -> Result<(), SandboxError> {
        let configmap: ConfigMap = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": format!("{job_name}-code"),
                "namespace": self.config.namespace,
            },
            "data": { "test_code.py": code },
        }))
        .map_err(|e| SandboxError::CreateFailed(format!("configmap body: {e}")))?;

        self.configmaps
            .create(&PostParams::default(), &configmap)
            .await
            .map_err(|e| SandboxError::CreateFailed(format!("configmap: {e}")))?;
        Ok(())
    }

    async fn create_job(&self, job_name: &str) -> Result<(), SandboxError> {
        let limits = &self.config.limits;
        let cmd = executor_command(needs_dep_install(&limits.image, limits));
        let cpu = format!("{}m", (limits.cpu_limit * 1000.0) as i64);
        let memory = format!("{}Mi", limits.mem_limit_bytes / (1024 * 1024));

        let job: Job = serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": job_name,
                "namespace": self.config.namespace,
            },
            "spec": {
                "ttlSecondsAfterFinished": self.config.ttl_after_finished_s,
                "backoffLimit": 0,
                "template": {
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": EXECUTOR_CONTAINER,
                            "image": limits.image,
                            "command": cmd,
                            "volumeMounts": [{
                                "name": "test-code",
                                "mountPath": "/test",
                            }],
                            "resources": {
                                "limits": { "cpu": cpu, "memory": memory },
                                "requests": { "cpu": "100m", "memory": "128Mi" },
                            },
                        }],
                        "volumes": [{
                            "name": "test-code",
                            "configMap": { "name": format!("{job_name}-code") },
                        }],
                    },
                },
            },
        }))
        .map_err(|e| SandboxError::CreateFailed(format!("job body: {e}")))?;

        self.jobs
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| SandboxError::CreateFailed(format!("job: {e}")))?;
        Ok(())
    }

    /// Polls job status until a terminal condition, the wall limit, or
    /// cancellation.
    async fn wait_for_job(
        &self,
        job_name: &str,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, SandboxError> {
        let wall_timeout = std::time::Duration::from_secs(self.config.limits.wall_timeout_s);
        let start = Instant::now();

        loop {
            if start.elapsed() > wall_timeout {
                return Err(SandboxError::Timeout {
                    partial_output: self.pod_logs(job_name).await.unwrap_or_default(),
                });
            }

            let job = self
                .jobs
                .get_status(job_name)
                .await
                .map_err(|e| SandboxError::Api(format!("job status: {e}")))?;
            let status = job.status.unwrap_or_default();

            if status.succeeded.unwrap_or(0) > 0 {
                return Ok(SandboxOutcome {
                    exit_code: 0,
                    output: self.pod_logs(job_name).await?,
                    wall_time: start.elapsed().as_secs_f64(),
                });
            }
            if status.failed.unwrap_or(0) > 0 {
                // The job API does not expose the container exit code
                // directly; a failed job reports a generic non-zero exit.
                return Ok(SandboxOutcome {
                    exit_code: 1,
                    output: self.pod_logs(job_name).await?,
                    wall_time: start.elapsed().as_secs_f64(),
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Logs from the job's pod, found by the `job-name` label.
    async fn pod_logs(&self, job_name: &str) -> Result<String, SandboxError> {
        let params = ListParams::default().labels(&format!("job-name={job_name}"));
        let pods = self
            .pods
            .list(&params)
            .await
            .map_err(|e| SandboxError::Api(format!("pod list: {e}")))?;

        let Some(pod_name) = pods
            .items
            .first()
            .and_then(|p| p.metadata.name.clone())
        else {
            return Ok(String::new());
        };

        let logs = self
            .pods
            .logs(
                &pod_name,
                &LogParams {
                    container: Some(EXECUTOR_CONTAINER.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Api(format!("pod logs: {e}")))?;

        Ok(truncate_logs(logs, self.config.limits.log_cap_bytes))
    }

    /// Deletes the Job (background propagation takes its pods) and the
    /// ConfigMap. Failures are logged; the TTL window is the safety net.
    async fn cleanup(&self, job_name: &str) {
        if let Err(e) = self.jobs.delete(job_name, &DeleteParams::background()).await {
            warn!(job = %job_name, error = %e, "failed to delete sandbox job");
        }
        let configmap_name = format!("{job_name}-code");
        if let Err(e) = self
            .configmaps
            .delete(&configmap_name, &DeleteParams::default())
            .await
        {
            warn!(configmap = %configmap_name, error = %e, "failed to delete source configmap");
        }
    }

    async fn run_job(
        &self,
        job_name: &str,
        test: &TestSpec,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, SandboxError> {
        self.create_source_configmap(job_name, &test.code).await?;
        self.create_job(job_name).await?;
        self.wait_for_job(job_name, cancel).await
    }
}

#[async_trait]
impl SandboxBackend for KubernetesBackend {
    async fn execute(&self, test: &TestSpec, cancel: &CancellationToken) -> TestResult {
        let job_name = sandbox_name(&test.id);
        debug!(test_id = %test.id, job = %job_name, "starting kubernetes sandbox");

        let outcome = self.run_job(&job_name, test, cancel).await;
        self.cleanup(&job_name).await;

        match outcome {
            Ok(outcome) => outcome_result(&test.id, outcome),
            Err(e) => failure_result(&test.id, e),
        }
    }

    fn name(&self) -> &'static str {
        "kubernetes"
    }
}
