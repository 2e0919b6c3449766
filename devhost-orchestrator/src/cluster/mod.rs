//! Cluster resource API used by the provisioner.
//!
//! The provisioner only ever sees this trait. [`KubectlCluster`] drives a real
//! Kubernetes namespace; [`InMemoryCluster`] backs tests and local runs.

mod kubectl;
mod memory;

pub use kubectl::KubectlCluster;
pub use memory::InMemoryCluster;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::instance::{ResourceKind, ResourceRef};
use crate::retry::Retryable;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("transient cluster error: {0}")]
    Transient(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("rejected by cluster: {0}")]
    Rejected(String),
}

impl ClusterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Transient(_) | ClusterError::Timeout(_))
    }
}

impl Retryable for ClusterError {
    fn is_retryable(&self) -> bool {
        ClusterError::is_retryable(self)
    }
}

/// A fully rendered object (or object group) ready to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSpec {
    pub kind: ResourceKind,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub manifest: serde_json::Value,
}

impl ObjectSpec {
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.kind, self.name.clone())
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create an object. `Conflict` if one with the same kind and name exists.
    async fn create(&self, spec: &ObjectSpec) -> Result<ResourceRef, ClusterError>;

    /// Delete an object. `NotFound` if it is already gone.
    async fn delete(&self, object: &ResourceRef) -> Result<(), ClusterError>;

    async fn exists(&self, object: &ResourceRef) -> Result<bool, ClusterError>;

    /// Wait until the object is ready to serve, or `Timeout`.
    async fn wait_ready(&self, object: &ResourceRef, timeout: Duration)
        -> Result<(), ClusterError>;
}

/// Which cluster backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterBackend {
    Kubectl,
    Memory,
}

impl std::str::FromStr for ClusterBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kubectl" | "kubernetes" | "k8s" => Ok(ClusterBackend::Kubectl),
            "memory" | "in-memory" => Ok(ClusterBackend::Memory),
            other => Err(format!("unknown cluster backend '{other}'")),
        }
    }
}
