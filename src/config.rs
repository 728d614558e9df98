//! Configuration loading and schema definitions.
//!
//! Configuration lives in a TOML file. Every setting has a default, so a
//! missing or empty file yields a working local setup (Docker backend,
//! localhost bindings). See [`schema`] for the full layout.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains invalid TOML,
/// or does not match the schema.
///
/// # Example
///
/// ```no_run
/// use crucible::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("crucible.toml"))?;
/// println!("runner at {}", config.link.runner_url);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Loads configuration from a TOML string.
///
/// Useful for testing and for embedding configuration.
pub fn load_config_str(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.orchestrator.keepalive_interval_s, 30);
        assert_eq!(config.link.connect_timeout_s, 60);
        assert_eq!(config.link.connect_max_attempts, 3);
        assert_eq!(config.link.connect_backoff_initial_s, 2);
        assert_eq!(config.link.dispatch_timeout_s, 300);
        assert_eq!(config.runner.max_parallel_per_dispatch, 16);
        assert!(matches!(config.runner.backend, BackendConfig::Docker(_)));
    }

    #[test]
    fn docker_backend_defaults() {
        let config = load_config_str(
            r#"
            [runner.backend]
            type = "docker"
            "#,
        )
        .unwrap();

        let BackendConfig::Docker(docker) = config.runner.backend else {
            panic!("expected docker backend");
        };
        assert_eq!(docker.limits.wall_timeout_s, 120);
        assert_eq!(docker.limits.mem_limit_bytes, 512 * 1024 * 1024);
        assert_eq!(docker.limits.cpu_limit, 0.5);
        assert_eq!(docker.limits.log_cap_bytes, 1024 * 1024);
        assert!(docker.limits.fallback_image.is_empty());
        assert!(docker.docker_host.is_none());
    }

    #[test]
    fn kubernetes_backend_parses() {
        let config = load_config_str(
            r#"
            [runner.backend]
            type = "kubernetes"
            image = "executor:v2"
            namespace = "sandbox"
            ttl_after_finished_s = 600
            wall_timeout_s = 60
            "#,
        )
        .unwrap();

        let BackendConfig::Kubernetes(k8s) = config.runner.backend else {
            panic!("expected kubernetes backend");
        };
        assert_eq!(k8s.limits.image, "executor:v2");
        assert_eq!(k8s.limits.wall_timeout_s, 60);
        assert_eq!(k8s.namespace, "sandbox");
        assert_eq!(k8s.ttl_after_finished_s, 600);
    }

    #[test]
    fn link_policy_overrides() {
        let config = load_config_str(
            r#"
            [link]
            runner_url = "ws://localhost:9001/ws"
            connect_max_attempts = 5
            dispatch_timeout_s = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.link.runner_url, "ws://localhost:9001/ws");
        assert_eq!(config.link.connect_max_attempts, 5);
        assert_eq!(config.link.dispatch_timeout_s, 60);
        // Untouched settings keep their defaults.
        assert_eq!(config.link.connect_timeout_s, 60);
    }

    #[test]
    fn invalid_backend_type_is_rejected() {
        let result = load_config_str(
            r#"
            [runner.backend]
            type = "podman"
            "#,
        );
        assert!(result.is_err());
    }
}
