//! Docker sandbox backend.
//!
//! One ephemeral container per test. The test source is staged into the
//! container as a tar archive upload (never through a shell pipeline), the
//! container runs the fixed executor command under CPU/memory limits, and
//! is force-removed on every exit path once logs have been captured.

use std::time::Instant;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    SandboxBackend, SandboxError, SandboxOutcome, executor_command, failure_result,
    needs_dep_install, outcome_result, sandbox_name, truncate_logs,
};
use crate::config::DockerBackendConfig;
use crate::protocol::runner::{TestResult, TestSpec};

/// Sandbox backend running each test in its own Docker container.
pub struct DockerBackend {
    docker: Docker,
    config: DockerBackendConfig,
}

impl DockerBackend {
    /// Connects to the Docker daemon (local defaults, or `docker_host`
    /// when configured).
    pub fn new(config: DockerBackendConfig) -> Result<Self, SandboxError> {
        let docker = if let Some(host) = &config.docker_host {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| SandboxError::Api(e.to_string()))?
        } else {
            Docker::connect_with_local_defaults()
                .map_err(|e| SandboxError::Api(e.to_string()))?
        };

        Ok(Self { docker, config })
    }

    /// Picks the image to run: the configured one if present, otherwise
    /// the opt-in fallback. A missing image with no fallback is an error.
    async fn resolve_image(&self) -> Result<String, SandboxError> {
        let limits = &self.config.limits;
        if self.docker.inspect_image(&limits.image).await.is_ok() {
            return Ok(limits.image.clone());
        }

        if limits.fallback_image.is_empty() {
            return Err(SandboxError::ImageMissing(limits.image.clone()));
        }

        warn!(
            image = %limits.image,
            fallback = %limits.fallback_image,
            "sandbox image not found, using fallback with runtime dependency install"
        );
        Ok(limits.fallback_image.clone())
    }

    /// Create, stage, start, and wait. Cleanup happens in [`Self::cleanup`]
    /// regardless of what this returns.
    async fn run_container(
        &self,
        name: &str,
        test: &TestSpec,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, SandboxError> {
        let limits = &self.config.limits;
        let image = self.resolve_image().await?;
        let cmd = executor_command(needs_dep_install(&image, limits));

        let host_config = bollard::models::HostConfig {
            memory: Some(limits.mem_limit_bytes),
            cpu_period: Some(100_000),
            cpu_quota: Some((limits.cpu_limit * 100_000.0) as i64),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(image),
            cmd: Some(cmd),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| SandboxError::CreateFailed(e.to_string()))?;

        // Stage the source before the container starts. The archive holds
        // exactly one file; the code string is written verbatim.
        let archive = source_archive(&test.code)
            .map_err(|e| SandboxError::CreateFailed(format!("source archive: {e}")))?;
        self.docker
            .upload_to_container(
                name,
                Some(UploadToContainerOptions {
                    path: "/",
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| SandboxError::CreateFailed(format!("source upload: {e}")))?;

        let start = Instant::now();
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::CreateFailed(e.to_string()))?;

        let wall_timeout = std::time::Duration::from_secs(limits.wall_timeout_s);
        let mut wait = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);

        let exit_code = tokio::select! {
            _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
            waited = tokio::time::timeout(wall_timeout, wait.next()) => match waited {
                Err(_) => {
                    return Err(SandboxError::Timeout {
                        partial_output: self.collect_logs(name).await.unwrap_or_default(),
                    });
                }
                // Non-zero exits surface as an Err carrying the wait body.
                Ok(Some(Ok(body))) => body.status_code,
                Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => code,
                Ok(Some(Err(e))) => return Err(SandboxError::Api(e.to_string())),
                Ok(None) => return Err(SandboxError::Api("wait stream ended early".to_string())),
            },
        };

        let wall_time = start.elapsed().as_secs_f64();
        let output = self.collect_logs(name).await?;

        Ok(SandboxOutcome {
            exit_code,
            output,
            wall_time,
        })
    }

    /// Captures combined stdout/stderr, capped at the configured limit.
    async fn collect_logs(&self, name: &str) -> Result<String, SandboxError> {
        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message } | LogOutput::StdErr { message }) => {
                    logs.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(SandboxError::Api(format!("log read: {e}"))),
            }
            // Stop reading well past the cap; truncation handles the rest.
            if logs.len() > self.config.limits.log_cap_bytes * 2 {
                break;
            }
        }

        Ok(truncate_logs(logs, self.config.limits.log_cap_bytes))
    }

    /// Force-removes the container. Failures are logged, never propagated:
    /// a leaked container must not change the test's result.
    async fn cleanup(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            warn!(container = %name, error = %e, "failed to remove sandbox container");
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn execute(&self, test: &TestSpec, cancel: &CancellationToken) -> TestResult {
        let name = sandbox_name(&test.id);
        debug!(test_id = %test.id, container = %name, "starting docker sandbox");

        let outcome = self.run_container(&name, test, cancel).await;
        self.cleanup(&name).await;

        match outcome {
            Ok(outcome) => outcome_result(&test.id, outcome),
            Err(e) => failure_result(&test.id, e),
        }
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

/// Builds an in-memory tar archive holding the test source at
/// `test/test_code.py`, extracted against `/` inside the container.
fn source_archive(code: &str) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(code.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "test/test_code.py", code.as_bytes())?;

    builder.into_inner()
}
