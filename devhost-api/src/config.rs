use serde::Deserialize;
use std::path::PathBuf;

/// Which cluster implementation the service drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterBackend {
    Kubectl,
    /// Process-local fake, for running the API without a cluster.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_cluster_backend")]
    pub cluster_backend: ClusterBackend,

    /// Largest accepted workspace upload.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_bind_addr() -> String {
    std::env::var("DEVHOST_API_BIND").unwrap_or_else(|_| "0.0.0.0:3121".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("DEVHOST_API_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".devhost")
        .join("api")
        .join("devhost.db")
}

fn default_reconcile_interval() -> u64 {
    std::env::var("DEVHOST_RECONCILE_INTERVAL")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(60)
}

fn default_cluster_backend() -> ClusterBackend {
    parse_cluster_backend(std::env::var("DEVHOST_CLUSTER").ok().as_deref())
}

fn parse_cluster_backend(value: Option<&str>) -> ClusterBackend {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("memory") => ClusterBackend::Memory,
        _ => ClusterBackend::Kubectl,
    }
}

fn default_max_upload_bytes() -> usize {
    std::env::var("DEVHOST_MAX_UPLOAD_BYTES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(256 * 1024 * 1024)
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            reconcile_interval_secs: default_reconcile_interval(),
            cluster_backend: default_cluster_backend(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        Self::default()
    }
}
