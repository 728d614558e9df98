//! Configuration schema definitions.
//!
//! All settings are deserialized from TOML with serde. Every knob has a
//! default, so an empty file (or no file at all) yields a working local
//! configuration. The sandbox backend is selected by a tagged enum on the
//! `type` field.
//!
//! ```text
//! Config (root)
//! ├── OrchestratorConfig   - client channel (bind, keepalive, CORS)
//! ├── LinkConfig           - orchestrator -> runner link policy
//! └── RunnerConfig         - runner service (bind, dispatch cap)
//!     └── BackendConfig    - tagged enum selecting the sandbox backend
//!         ├── Docker       - one ephemeral container per test
//!         └── Kubernetes   - one Job+ConfigMap per test
//! ```

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Client-facing orchestrator settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Address the client WebSocket endpoint listens on.
    #[serde(default = "default_orchestrator_bind")]
    pub bind: String,

    /// Seconds between keepalive `ping` frames on each session.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_s: u64,

    /// Allowed CORS origins for the client channel. `["*"]` allows any.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind: default_orchestrator_bind(),
            keepalive_interval_s: default_keepalive_interval(),
            cors_origins: default_cors_origins(),
        }
    }
}

fn default_orchestrator_bind() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

/// Policy for the orchestrator -> runner service link.
///
/// Connection attempts use bounded exponential backoff: the first retry
/// waits `connect_backoff_initial_s`, doubling on each subsequent attempt,
/// up to `connect_max_attempts` attempts total.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkConfig {
    /// WebSocket endpoint of the runner service.
    #[serde(default = "default_runner_url")]
    pub runner_url: String,

    /// Timeout for a single connection attempt, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_s: u64,

    /// Maximum connection attempts before a dispatch is declared failed.
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,

    /// Initial backoff delay between attempts, in seconds. Doubles.
    #[serde(default = "default_connect_backoff_initial")]
    pub connect_backoff_initial_s: u64,

    /// Overall bound on one dispatch, from send to last result, in seconds.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_s: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            runner_url: default_runner_url(),
            connect_timeout_s: default_connect_timeout(),
            connect_max_attempts: default_connect_max_attempts(),
            connect_backoff_initial_s: default_connect_backoff_initial(),
            dispatch_timeout_s: default_dispatch_timeout(),
        }
    }
}

fn default_runner_url() -> String {
    "ws://crucible-runner:8001/ws".to_string()
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_connect_max_attempts() -> u32 {
    3
}

fn default_connect_backoff_initial() -> u64 {
    2
}

fn default_dispatch_timeout() -> u64 {
    300
}

/// Runner service settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Address the runner WebSocket endpoint listens on.
    #[serde(default = "default_runner_bind")]
    pub bind: String,

    /// Cap on concurrent sandboxes per dispatch. `0` means one sandbox
    /// per test with no ceiling.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_per_dispatch: usize,

    /// Sandbox backend selection and limits.
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            bind: default_runner_bind(),
            max_parallel_per_dispatch: default_max_parallel(),
            backend: BackendConfig::default(),
        }
    }
}

fn default_runner_bind() -> String {
    "0.0.0.0:8001".to_string()
}

fn default_max_parallel() -> usize {
    16
}

/// Sandbox backend configuration.
///
/// | Type | Description |
/// |------|-------------|
/// | `docker` | One ephemeral container per test, removed after execution |
/// | `kubernetes` | One Job+ConfigMap per test, TTL as defense in depth |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Docker(DockerBackendConfig),
    Kubernetes(KubernetesBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Docker(DockerBackendConfig::default())
    }
}

/// Resource limits and execution policy shared by both backends.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxLimits {
    /// Image the test executor runs in.
    #[serde(default = "default_image")]
    pub image: String,

    /// Generic base image to fall back to when `image` cannot be found.
    /// The fallback installs test dependencies at runtime, which is slow;
    /// it is therefore opt-in and disabled when empty.
    #[serde(default)]
    pub fallback_image: String,

    /// CPU limit in cores (0.5 = half a core).
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,

    /// Memory limit in bytes.
    #[serde(default = "default_mem_limit")]
    pub mem_limit_bytes: i64,

    /// Wall-clock limit for one test, in seconds.
    #[serde(default = "default_wall_timeout")]
    pub wall_timeout_s: u64,

    /// Cap on captured log bytes; excess is truncated with a marker.
    #[serde(default = "default_log_cap")]
    pub log_cap_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            image: default_image(),
            fallback_image: String::new(),
            cpu_limit: default_cpu_limit(),
            mem_limit_bytes: default_mem_limit(),
            wall_timeout_s: default_wall_timeout(),
            log_cap_bytes: default_log_cap(),
        }
    }
}

fn default_image() -> String {
    "crucible-test-executor:latest".to_string()
}

fn default_cpu_limit() -> f64 {
    0.5
}

fn default_mem_limit() -> i64 {
    512 * 1024 * 1024
}

fn default_wall_timeout() -> u64 {
    120
}

fn default_log_cap() -> usize {
    1024 * 1024
}

/// Docker backend settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DockerBackendConfig {
    #[serde(flatten)]
    pub limits: SandboxLimits,

    /// Docker daemon address; local defaults when unset.
    pub docker_host: Option<String>,
}

/// Kubernetes backend settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KubernetesBackendConfig {
    #[serde(flatten)]
    pub limits: SandboxLimits,

    /// Namespace jobs and configmaps are created in.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// TTL on finished Jobs. The driver deletes resources explicitly; the
    /// TTL covers the case where it never gets the chance.
    #[serde(default = "default_ttl_after_finished")]
    pub ttl_after_finished_s: i32,
}

impl Default for KubernetesBackendConfig {
    fn default() -> Self {
        Self {
            limits: SandboxLimits::default(),
            namespace: default_namespace(),
            ttl_after_finished_s: default_ttl_after_finished(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_ttl_after_finished() -> i32 {
    300
}
