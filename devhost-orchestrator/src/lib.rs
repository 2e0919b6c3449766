//! Instance orchestration and build control plane
//!
//! This crate owns the lifecycle of on-demand development environments: it
//! validates create requests, runs DevContainer builds through a bounded FIFO
//! queue, provisions the per-instance cluster objects and tears them down
//! again. It is consumed by the devhost-api HTTP service but has no HTTP
//! dependencies of its own.

pub mod build;
pub mod build_log;
pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod manifests;
pub mod provisioner;
pub mod registry;
pub mod retry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use build::{BuildContext, BuildError, BuildExecutor, BuildQueue, DevcontainerCliExecutor};
pub use build_log::{BuildLog, BuildLogChunk};
pub use cluster::{ClusterApi, ClusterError, InMemoryCluster, KubectlCluster, ObjectSpec};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use instance::{
    CreateInstanceRequest, CreatePayload, CreationMode, InstanceRecord, InstanceState,
    ResourceKind, ResourceRef, ResourceSizing,
};
pub use lifecycle::{DeleteOutcome, InstanceManager, RecoveryReport};
pub use provisioner::ResourceProvisioner;
pub use registry::{InstanceFilters, InstanceRegistry};
pub use retry::{RetryPolicy, Retryable};
