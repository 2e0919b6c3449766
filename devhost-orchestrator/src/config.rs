use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Control-plane settings. Every field falls back to a `DEVHOST_*`
/// environment variable and then to a built-in default.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    #[serde(default = "default_registry")]
    pub registry: String,

    #[serde(default = "default_build_daemon")]
    pub build_daemon: String,

    #[serde(default = "default_tls_secret_name")]
    pub tls_secret_name: String,

    #[serde(default = "default_base_image")]
    pub default_base_image: String,

    #[serde(default = "default_build_root")]
    pub build_root: PathBuf,

    #[serde(default = "default_devcontainer_bin")]
    pub devcontainer_bin: String,

    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    #[serde(default = "default_kubectl_bin")]
    pub kubectl_bin: String,

    #[serde(default = "default_build_concurrency")]
    pub build_concurrency: usize,

    #[serde(default = "default_build_queue_capacity")]
    pub build_queue_capacity: usize,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    #[serde(default = "default_push_timeout")]
    pub push_timeout_secs: u64,

    #[serde(default = "default_build_kill_grace")]
    pub build_kill_grace_secs: u64,

    #[serde(default = "default_cluster_call_timeout")]
    pub cluster_call_timeout_secs: u64,

    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff_ms: u64,

    #[serde(default = "default_teardown_alert_after")]
    pub teardown_alert_after: u32,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn default_namespace() -> String {
    env_string("DEVHOST_NAMESPACE", "vscode-system")
}

fn default_base_domain() -> String {
    env_string("DEVHOST_BASE_DOMAIN", "vscode.local")
}

fn default_registry() -> String {
    env_string("DEVHOST_REGISTRY", "localhost:32000")
}

fn default_build_daemon() -> String {
    env_string("DEVHOST_BUILD_DAEMON", "unix:///var/run/docker.sock")
}

fn default_tls_secret_name() -> String {
    env_string("DEVHOST_TLS_SECRET", "vscode-server-tls")
}

fn default_base_image() -> String {
    env_string("DEVHOST_DEFAULT_BASE_IMAGE", "ubuntu:22.04")
}

fn default_build_root() -> PathBuf {
    PathBuf::from(env_string("DEVHOST_BUILD_ROOT", "/tmp/devcontainer-builds"))
}

fn default_devcontainer_bin() -> String {
    env_string("DEVHOST_DEVCONTAINER_BIN", "devcontainer")
}

fn default_docker_bin() -> String {
    env_string("DEVHOST_DOCKER_BIN", "docker")
}

fn default_kubectl_bin() -> String {
    env_string("DEVHOST_KUBECTL_BIN", "kubectl")
}

fn default_build_concurrency() -> usize {
    env_or("DEVHOST_BUILD_CONCURRENCY", 1usize).max(1)
}

fn default_build_queue_capacity() -> usize {
    env_or("DEVHOST_BUILD_QUEUE_CAPACITY", 64usize)
}

fn default_build_timeout() -> u64 {
    env_or("DEVHOST_BUILD_TIMEOUT", 1800) // 30 minutes
}

fn default_push_timeout() -> u64 {
    env_or("DEVHOST_PUSH_TIMEOUT", 600)
}

fn default_build_kill_grace() -> u64 {
    env_or("DEVHOST_BUILD_KILL_GRACE", 10)
}

fn default_cluster_call_timeout() -> u64 {
    env_or("DEVHOST_CLUSTER_CALL_TIMEOUT", 30)
}

fn default_readiness_timeout() -> u64 {
    env_or("DEVHOST_READINESS_TIMEOUT", 300)
}

fn default_retry_max_attempts() -> u32 {
    env_or("DEVHOST_RETRY_MAX_ATTEMPTS", 5)
}

fn default_retry_initial_backoff() -> u64 {
    env_or("DEVHOST_RETRY_INITIAL_BACKOFF_MS", 500)
}

fn default_retry_max_backoff() -> u64 {
    env_or("DEVHOST_RETRY_MAX_BACKOFF_MS", 30_000)
}

fn default_teardown_alert_after() -> u32 {
    env_or("DEVHOST_TEARDOWN_ALERT_AFTER", 10)
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            base_domain: default_base_domain(),
            registry: default_registry(),
            build_daemon: default_build_daemon(),
            tls_secret_name: default_tls_secret_name(),
            default_base_image: default_base_image(),
            build_root: default_build_root(),
            devcontainer_bin: default_devcontainer_bin(),
            docker_bin: default_docker_bin(),
            kubectl_bin: default_kubectl_bin(),
            build_concurrency: default_build_concurrency(),
            build_queue_capacity: default_build_queue_capacity(),
            build_timeout_secs: default_build_timeout(),
            push_timeout_secs: default_push_timeout(),
            build_kill_grace_secs: default_build_kill_grace(),
            cluster_call_timeout_secs: default_cluster_call_timeout(),
            readiness_timeout_secs: default_readiness_timeout(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_backoff_ms: default_retry_initial_backoff(),
            retry_max_backoff_ms: default_retry_max_backoff(),
            teardown_alert_after: default_teardown_alert_after(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Image tag a build for `instance_id` is pushed under.
    pub fn image_name_for(&self, instance_id: &str) -> String {
        format!(
            "{}/vscode-devcontainer-{}:latest",
            self.registry, instance_id
        )
    }

    pub fn build_logs_url(&self, instance_id: &str) -> String {
        format!(
            "https://{}/api/v1/instances/{}/build-logs",
            self.base_domain, instance_id
        )
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn build_kill_grace(&self) -> Duration {
        Duration::from_secs(self.build_kill_grace_secs)
    }

    pub fn cluster_call_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_call_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    /// Bounded retry for provisioning calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_initial_backoff_ms),
            Duration::from_millis(self.retry_max_backoff_ms),
        )
    }

    /// Unbounded retry for teardown, alerting every `teardown_alert_after` attempts.
    pub fn teardown_policy(&self) -> RetryPolicy {
        RetryPolicy::unbounded(
            Duration::from_millis(self.retry_initial_backoff_ms),
            Duration::from_millis(self.retry_max_backoff_ms),
            self.teardown_alert_after,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_name_and_urls() {
        let config = OrchestratorConfig {
            registry: "registry.internal:5000".to_string(),
            base_domain: "dev.example.com".to_string(),
            ..OrchestratorConfig::default()
        };
        assert_eq!(
            config.image_name_for("alice-0a1b2c3d"),
            "registry.internal:5000/vscode-devcontainer-alice-0a1b2c3d:latest"
        );
        assert_eq!(
            config.build_logs_url("alice-0a1b2c3d"),
            "https://dev.example.com/api/v1/instances/alice-0a1b2c3d/build-logs"
        );
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"namespace": "custom-ns", "build_concurrency": 3}"#)
                .unwrap();
        assert_eq!(config.namespace, "custom-ns");
        assert_eq!(config.build_concurrency, 3);
        assert!(config.build_queue_capacity > 0);
        assert!(config.retry_max_attempts > 0);
    }
}
