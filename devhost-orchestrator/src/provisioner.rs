//! Creates and removes the per-instance object bundle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterApi, ClusterError, ObjectSpec};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::instance::{ResourceKind, ResourceRef};
use crate::manifests::{self, BundleRequest, ManifestSettings};
use crate::retry::RetryPolicy;

/// A provisioning attempt that did not reach Running.
#[derive(Debug)]
pub struct ProvisionFailure {
    pub error: OrchestratorError,
    /// Instance objects still live after compensation.
    pub leftover: Vec<ResourceRef>,
}

#[derive(Debug)]
pub struct TeardownFailure {
    pub error: OrchestratorError,
    /// Objects not yet deleted, in teardown order.
    pub remaining: Vec<ResourceRef>,
}

#[derive(Clone)]
pub struct ResourceProvisioner {
    cluster: Arc<dyn ClusterApi>,
    settings: ManifestSettings,
    call_timeout: Duration,
    readiness_timeout: Duration,
    retry: RetryPolicy,
    teardown_retry: RetryPolicy,
}

impl ResourceProvisioner {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: &OrchestratorConfig) -> Self {
        Self {
            cluster,
            settings: ManifestSettings::from_config(config),
            call_timeout: config.cluster_call_timeout(),
            readiness_timeout: config.readiness_timeout(),
            retry: config.retry_policy(),
            teardown_retry: config.teardown_policy(),
        }
    }

    /// Every object an instance of `user_id` would own, in creation order.
    pub fn planned_bundle(&self, instance_id: &str, user_id: &str) -> Vec<ResourceRef> {
        manifests::bundle_refs(instance_id, user_id)
    }

    /// Create the whole bundle and wait for the workload to become ready.
    ///
    /// On success returns every object the instance references, the shared
    /// volume included. On failure the objects created by this attempt are
    /// torn down before returning; a cancelled attempt leaves them for the
    /// caller's own teardown.
    #[instrument(skip(self, request, cancel), fields(instance_id = %request.instance_id))]
    pub async fn provision(
        &self,
        request: &BundleRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResourceRef>, ProvisionFailure> {
        let mut created: Vec<ResourceRef> = Vec::new();
        let mut referenced: Vec<ResourceRef> = Vec::new();

        for spec in manifests::render_bundle(&self.settings, request) {
            if cancel.is_cancelled() {
                return Err(self.cancelled(created));
            }

            match self.ensure(&spec).await {
                Ok(newly_created) => {
                    let reference = spec.reference();
                    if newly_created && !reference.kind.is_user_scoped() {
                        created.push(reference.clone());
                    }
                    referenced.push(reference);
                }
                Err(err) => return Err(self.compensate(err.into(), created, cancel).await),
            }
        }

        if cancel.is_cancelled() {
            return Err(self.cancelled(created));
        }

        let workload = ResourceRef::new(ResourceKind::Workload, request.instance_id);
        debug!(timeout_secs = self.readiness_timeout.as_secs(), "waiting for workload");
        let ready = tokio::select! {
            () = cancel.cancelled() => return Err(self.cancelled(created)),
            result = tokio::time::timeout(
                self.readiness_timeout + self.call_timeout,
                self.cluster.wait_ready(&workload, self.readiness_timeout),
            ) => result.unwrap_or_else(|_| {
                Err(ClusterError::Timeout(format!(
                    "{workload} not ready after {}s",
                    self.readiness_timeout.as_secs()
                )))
            }),
        };
        if let Err(err) = ready {
            warn!(error = %err, "workload never became ready");
            return Err(self.compensate(err.into(), created, cancel).await);
        }

        info!(objects = referenced.len(), "instance bundle provisioned");
        Ok(referenced)
    }

    /// Delete `objects` in reverse creation order. The shared volume is never
    /// deleted and objects already gone count as deleted. Transient errors
    /// are retried until they clear.
    #[instrument(skip(self, objects), fields(objects = objects.len()))]
    pub async fn teardown(&self, objects: &[ResourceRef]) -> Result<(), TeardownFailure> {
        self.teardown_with(objects, &self.teardown_retry).await
    }

    /// Remove the objects of an attempt that will never reach Running.
    /// Retries like [`Self::teardown`], but gives up as soon as `cancel`
    /// fires and reports every object as remaining, leaving them to the
    /// delete that cancelled it.
    pub async fn compensating_teardown(
        &self,
        objects: &[ResourceRef],
        cancel: &CancellationToken,
    ) -> Result<(), TeardownFailure> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TeardownFailure {
                error: OrchestratorError::Cancelled("compensation cancelled".to_string()),
                remaining: teardown_order(objects),
            }),
            result = self.teardown_with(objects, &self.teardown_retry) => result,
        }
    }

    async fn teardown_with(
        &self,
        objects: &[ResourceRef],
        policy: &RetryPolicy,
    ) -> Result<(), TeardownFailure> {
        let ordered = teardown_order(objects);

        for (index, object) in ordered.iter().enumerate() {
            let result = self
                .call(policy, "delete cluster object", || self.cluster.delete(object))
                .await;
            match result {
                Ok(()) => debug!(object = %object, "deleted"),
                Err(ClusterError::NotFound(_)) => debug!(object = %object, "already gone"),
                Err(err) => {
                    warn!(object = %object, error = %err, "teardown stopped");
                    return Err(TeardownFailure {
                        error: err.into(),
                        remaining: ordered[index..].to_vec(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Create `spec` unless it already exists. Returns whether this call created it.
    async fn ensure(&self, spec: &ObjectSpec) -> Result<bool, ClusterError> {
        let reference = spec.reference();

        if reference.kind.is_user_scoped() {
            let exists = self
                .call(&self.retry, "check shared volume", || {
                    self.cluster.exists(&reference)
                })
                .await?;
            if exists {
                debug!(object = %reference, "reusing existing object");
                return Ok(false);
            }
        }

        match self
            .call(&self.retry, "create cluster object", || self.cluster.create(spec))
            .await
        {
            Ok(_) => {
                debug!(object = %reference, "created");
                Ok(true)
            }
            // Left by an earlier attempt, or a concurrent create for the same user
            Err(ClusterError::Conflict(_)) => {
                debug!(object = %reference, "object already present");
                Ok(!reference.kind.is_user_scoped())
            }
            Err(err) => Err(err),
        }
    }

    /// One cluster call under `policy`, each attempt bounded by the call timeout.
    async fn call<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        operation: &str,
        mut op: F,
    ) -> Result<T, ClusterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let limit = self.call_timeout;
        policy
            .run(operation, || {
                let attempt = op();
                async move {
                    tokio::time::timeout(limit, attempt)
                        .await
                        .unwrap_or_else(|_| {
                            Err(ClusterError::Timeout(format!(
                                "cluster call exceeded {}s",
                                limit.as_secs()
                            )))
                        })
                }
            })
            .await
    }

    async fn compensate(
        &self,
        error: OrchestratorError,
        created: Vec<ResourceRef>,
        cancel: &CancellationToken,
    ) -> ProvisionFailure {
        warn!(
            error = %error,
            objects = created.len(),
            "provisioning failed, removing created objects"
        );
        match self.compensating_teardown(&created, cancel).await {
            Ok(()) => ProvisionFailure {
                error,
                leftover: Vec::new(),
            },
            Err(failure) if matches!(failure.error, OrchestratorError::Cancelled(_)) => {
                self.cancelled(created)
            }
            Err(failure) => ProvisionFailure {
                error,
                leftover: failure.remaining,
            },
        }
    }

    fn cancelled(&self, created: Vec<ResourceRef>) -> ProvisionFailure {
        info!(objects = created.len(), "provisioning cancelled");
        ProvisionFailure {
            error: OrchestratorError::Cancelled("provisioning cancelled".to_string()),
            leftover: created,
        }
    }
}

/// Instance-scoped objects, latest-created first, without duplicates.
fn teardown_order(objects: &[ResourceRef]) -> Vec<ResourceRef> {
    let mut ordered: Vec<ResourceRef> = objects
        .iter()
        .filter(|o| !o.kind.is_user_scoped())
        .cloned()
        .collect();
    ordered.sort_by(|a, b| {
        b.kind
            .creation_rank()
            .cmp(&a.kind.creation_rank())
            .then_with(|| a.name.cmp(&b.name))
    });
    ordered.dedup();
    ordered
}
