//! The instance lifecycle manager.
//!
//! Every instance runs its pipeline (build, deploy) as its own tokio task.
//! Pipeline steps and deletes for one instance serialise on a per-instance
//! step lock; delete cancels the instance token first, so an in-flight step
//! stops at its next checkpoint and releases the lock. A record is only
//! removed once its pipeline task has exited.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::build::{
    BuildContext, BuildError, BuildExecutor, BuildQueue, BuildSource, BuildWorkspace,
};
use crate::build_log::{BuildLog, BuildLogChunk};
use crate::cluster::ClusterApi;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::instance::{
    generate_access_token, CreateInstanceRequest, CreatePayload, InstanceRecord, InstanceState,
    ResourceRef,
};
use crate::manifests::BundleRequest;
use crate::provisioner::ResourceProvisioner;
use crate::registry::{InstanceFilters, InstanceRegistry};

/// Attempts at drawing an unused instance id.
const MAX_ID_ATTEMPTS: u32 = 5;

pub const INTERRUPTED_BY_RESTART: &str = "interrupted by control-plane restart";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// Unknown id, or the record is already gone.
    AlreadyDeleted,
    /// Teardown is in progress.
    Terminating,
}

/// What [`InstanceManager::recover`] did at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub failed: usize,
    pub compensated: usize,
    pub resumed_teardowns: usize,
}

struct InstanceHandle {
    step: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    teardown_running: AtomicBool,
    /// `true` while a pipeline task is alive.
    pipeline: watch::Sender<bool>,
}

impl InstanceHandle {
    fn new() -> Self {
        Self {
            step: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            teardown_running: AtomicBool::new(false),
            pipeline: watch::channel(false).0,
        }
    }

    async fn pipeline_finished(&self) {
        let mut running = self.pipeline.subscribe();
        // The sender lives as long as the handle, so this cannot fail
        let _ = running.wait_for(|alive| !*alive).await;
    }
}

/// Marks the instance's pipeline as running until dropped.
struct PipelineGuard(Arc<InstanceHandle>);

impl PipelineGuard {
    fn start(handle: Arc<InstanceHandle>) -> Self {
        handle.pipeline.send_replace(true);
        Self(handle)
    }
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        self.0.pipeline.send_replace(false);
    }
}

struct ManagerInner {
    registry: InstanceRegistry,
    queue: BuildQueue,
    executor: Arc<dyn BuildExecutor>,
    provisioner: ResourceProvisioner,
    config: Arc<OrchestratorConfig>,
    handles: Mutex<HashMap<String, Arc<InstanceHandle>>>,
}

#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<ManagerInner>,
}

impl InstanceManager {
    pub fn new(
        pool: SqlitePool,
        config: OrchestratorConfig,
        cluster: Arc<dyn ClusterApi>,
        executor: Arc<dyn BuildExecutor>,
    ) -> Self {
        let provisioner = ResourceProvisioner::new(cluster, &config);
        let queue = BuildQueue::new(config.build_concurrency, config.build_queue_capacity);
        Self {
            inner: Arc::new(ManagerInner {
                registry: InstanceRegistry::new(pool),
                queue,
                executor,
                provisioner,
                config: Arc::new(config),
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &BuildQueue {
        &self.inner.queue
    }

    /// Validate the request, record a Pending instance and start its pipeline.
    /// Returns as soon as the record is stored.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, mode = ?request.payload.mode()))]
    pub async fn create_instance(&self, request: CreateInstanceRequest) -> Result<InstanceRecord> {
        // Workspace archives are decompressed and walked during validation
        let default_image = self.inner.config.default_base_image.clone();
        let (request, base_image) = tokio::task::spawn_blocking(move || {
            let base_image = request.validate(&default_image);
            (request, base_image)
        })
        .await
        .map_err(|e| std::io::Error::other(format!("validation task failed: {e}")))?;
        let base_image = base_image?;

        if let Some(existing) = self.find_idempotent(&request).await? {
            return Ok(existing);
        }

        let mut attempt = 0;
        let record = loop {
            attempt += 1;
            let record = InstanceRecord::pending(&request, base_image.clone());
            match self.inner.registry.insert(&record).await {
                Ok(()) => break record,
                Err(OrchestratorError::Conflict(message)) => {
                    // Lost a race on the idempotency key
                    if let Some(existing) = self.find_idempotent(&request).await? {
                        return Ok(existing);
                    }
                    if attempt >= MAX_ID_ATTEMPTS {
                        return Err(OrchestratorError::Conflict(message));
                    }
                    debug!(
                        instance_id = %record.instance_id,
                        "instance id already issued, drawing another"
                    );
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            instance_id = %record.instance_id,
            base_image = %record.base_image,
            "instance created"
        );

        let manager = self.clone();
        let instance_id = record.instance_id.clone();
        let pipeline = PipelineGuard::start(self.handle(&instance_id));
        let payload = request.payload;
        tokio::spawn(async move {
            if let Err(e) = manager.run_pipeline(&instance_id, payload, &pipeline.0).await {
                error!(instance_id = %instance_id, error = %e, "instance pipeline aborted");
            }
            drop(pipeline);
        });

        Ok(record)
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<InstanceRecord> {
        self.inner.registry.get(instance_id).await
    }

    pub async fn list_instances(&self, filters: &InstanceFilters) -> Result<Vec<InstanceRecord>> {
        self.inner.registry.list(filters).await
    }

    /// Build output from `offset` on. `NotFound` if no build was ever started.
    pub async fn get_build_log(&self, instance_id: &str, offset: usize) -> Result<BuildLogChunk> {
        let record = self.inner.registry.get(instance_id).await?;
        let handle = record.build_log_handle.ok_or_else(|| {
            OrchestratorError::NotFound(format!("no build log for instance {instance_id}"))
        })?;
        BuildLog::open(self.inner.registry.pool().clone(), handle)
            .read(offset)
            .await
    }

    /// Move the instance to Terminating and start teardown. Safe to call
    /// repeatedly and for ids that no longer exist.
    #[instrument(skip(self))]
    pub async fn delete_instance(&self, instance_id: &str) -> Result<DeleteOutcome> {
        let Some(record) = self.inner.registry.find(instance_id).await? else {
            debug!("delete of unknown instance is a no-op");
            return Ok(DeleteOutcome::AlreadyDeleted);
        };

        if record.state != InstanceState::Terminating {
            let handle = self.handle(instance_id);
            handle.cancel.cancel();
            let outcome = self.inner.queue.cancel(instance_id);
            debug!(?outcome, "build queue notified");

            // Waits for the pipeline to reach a checkpoint
            let _step = handle.step.lock().await;
            let Some(current) = self.inner.registry.find(instance_id).await? else {
                return Ok(DeleteOutcome::AlreadyDeleted);
            };
            match current.state {
                InstanceState::Terminating => {}
                InstanceState::Deleted => return Ok(DeleteOutcome::AlreadyDeleted),
                _ => {
                    self.transition(current, InstanceState::Terminating, |_| {})
                        .await?;
                }
            }
        }

        self.spawn_teardown(instance_id);
        Ok(DeleteOutcome::Terminating)
    }

    /// Startup reconciliation. In-flight pipelines did not survive the
    /// restart, so their records fail. Deploying records fail only after a
    /// background teardown of whatever the attempt may have created.
    /// Terminating records resume teardown.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let records = self
            .inner
            .registry
            .list_in_states(&[
                InstanceState::Pending,
                InstanceState::Building,
                InstanceState::Deploying,
                InstanceState::Terminating,
            ])
            .await?;

        let mut report = RecoveryReport::default();
        for record in records {
            let instance_id = record.instance_id.clone();
            match record.state {
                InstanceState::Terminating => {
                    self.spawn_teardown(&instance_id);
                    report.resumed_teardowns += 1;
                }
                InstanceState::Pending | InstanceState::Building => {
                    if let Some(handle) = &record.build_log_handle {
                        BuildLog::open(self.inner.registry.pool().clone(), handle.clone())
                            .append(INTERRUPTED_BY_RESTART)
                            .await;
                    }
                    self.transition(record, InstanceState::Failed, |r| {
                        r.error = Some(INTERRUPTED_BY_RESTART.to_string());
                    })
                    .await?;
                    report.failed += 1;
                }
                InstanceState::Deploying => {
                    self.spawn_compensation(&instance_id);
                    report.compensated += 1;
                }
                _ => {}
            }
        }

        info!(
            failed = report.failed,
            compensated = report.compensated,
            resumed_teardowns = report.resumed_teardowns,
            "recovery complete"
        );
        Ok(report)
    }

    /// Restart teardown for Terminating records that have no live teardown
    /// task. Returns how many were started.
    pub async fn reconcile_terminating(&self) -> Result<usize> {
        let records = self
            .inner
            .registry
            .list_in_states(&[InstanceState::Terminating])
            .await?;

        let started = records
            .iter()
            .filter(|r| self.spawn_teardown(&r.instance_id))
            .count();
        if started > 0 {
            info!(started, "restarted stalled teardowns");
        }
        Ok(started)
    }

    async fn find_idempotent(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<Option<InstanceRecord>> {
        let Some(key) = &request.idempotency_key else {
            return Ok(None);
        };
        let Some(existing) = self
            .inner
            .registry
            .find_by_idempotency_key(&request.user_id, key)
            .await?
        else {
            return Ok(None);
        };

        if existing.creation_mode != request.payload.mode() {
            return Err(OrchestratorError::Conflict(format!(
                "idempotency key already used for a {:?} instance",
                existing.creation_mode
            )));
        }
        debug!(
            instance_id = %existing.instance_id,
            "returning instance for repeated idempotency key"
        );
        Ok(Some(existing))
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<String, Arc<InstanceHandle>>> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, instance_id: &str) -> Arc<InstanceHandle> {
        self.handles()
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(InstanceHandle::new()))
            .clone()
    }

    fn forget(&self, instance_id: &str) {
        self.handles().remove(instance_id);
    }

    /// Apply a state change through the transition table and persist it.
    async fn transition<F>(
        &self,
        mut record: InstanceRecord,
        to: InstanceState,
        apply: F,
    ) -> Result<InstanceRecord>
    where
        F: FnOnce(&mut InstanceRecord),
    {
        let from = record.state;
        if !from.can_transition_to(to) {
            error!(
                instance_id = %record.instance_id,
                from = %from,
                to = %to,
                "rejected invalid state transition"
            );
            return Err(OrchestratorError::InvalidTransition {
                instance_id: record.instance_id,
                from,
                to,
            });
        }

        record.state = to;
        apply(&mut record);
        if to != InstanceState::Running {
            record.access_token = None;
        }
        if matches!(
            to,
            InstanceState::Building | InstanceState::Deploying | InstanceState::Running
        ) {
            record.error = None;
        }

        let saved = self.inner.registry.update(&record).await?;
        info!(instance_id = %saved.instance_id, from = %from, to = %to, "instance state changed");
        Ok(saved)
    }

    async fn run_pipeline(
        &self,
        instance_id: &str,
        payload: CreatePayload,
        handle: &InstanceHandle,
    ) -> Result<()> {
        match BuildSource::from_payload(payload) {
            Some(source) => {
                if !self.build_step(instance_id, source, handle).await? {
                    return Ok(());
                }
            }
            None => {
                let _step = handle.step.lock().await;
                if handle.cancel.is_cancelled() {
                    return Ok(());
                }
                let record = self.inner.registry.get(instance_id).await?;
                self.transition(record, InstanceState::Deploying, |_| {})
                    .await?;
            }
        }

        self.deploy_step(instance_id, handle).await
    }

    /// Returns whether the instance moved on to Deploying.
    async fn build_step(
        &self,
        instance_id: &str,
        source: BuildSource,
        handle: &InstanceHandle,
    ) -> Result<bool> {
        let log = BuildLog::open(
            self.inner.registry.pool().clone(),
            BuildLog::handle_for(instance_id),
        );

        {
            let _step = handle.step.lock().await;
            if handle.cancel.is_cancelled() {
                return Ok(false);
            }
            let record = self.inner.registry.get(instance_id).await?;
            self.transition(record, InstanceState::Building, |r| {
                r.build_log_handle = Some(log.handle().to_string());
            })
            .await?;
        }

        let outcome = self.run_build(instance_id, source, &log, &handle.cancel).await;

        let _step = handle.step.lock().await;
        if handle.cancel.is_cancelled() {
            debug!(instance_id, "instance deleted during build");
            return Ok(false);
        }
        let record = self.inner.registry.get(instance_id).await?;

        match outcome {
            Ok(image) => {
                log.append(format!("build complete: {image}")).await;
                self.transition(record, InstanceState::Deploying, |r| {
                    r.built_image_reference = Some(image);
                })
                .await?;
                Ok(true)
            }
            Err(e) => {
                warn!(instance_id, error = %e, "build failed");
                log.append(format!("build failed: {e}")).await;
                let error = OrchestratorError::from(e).to_string();
                self.transition(record, InstanceState::Failed, |r| r.error = Some(error))
                    .await?;
                Ok(false)
            }
        }
    }

    /// Prepare the build context, wait for a queue slot and run the executor.
    async fn run_build(
        &self,
        instance_id: &str,
        source: BuildSource,
        log: &BuildLog,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, BuildError> {
        let build_root = self.inner.config.build_root.clone();
        let id = instance_id.to_string();
        let workspace = tokio::task::spawn_blocking(move || {
            BuildWorkspace::prepare(&build_root, &id, &source)
        })
        .await
        .map_err(|e| BuildError::Context(format!("build context task failed: {e}")))??;

        let queued = self.inner.queue.submit(instance_id, cancel)?;
        if self.inner.queue.is_running(instance_id) {
            log.append("build slot acquired").await;
        } else {
            log.append(format!(
                "waiting for a build slot ({} builds queued)",
                self.inner.queue.pending_count()
            ))
            .await;
        }

        let slot = tokio::select! {
            () = cancel.cancelled() => return Err(BuildError::Cancelled),
            slot = queued.admitted() => slot?,
        };

        let context = BuildContext {
            instance_id: instance_id.to_string(),
            workspace_folder: workspace.folder().to_path_buf(),
            config_path: workspace.config().to_path_buf(),
            image_name: self.inner.config.image_name_for(instance_id),
        };
        let result = self
            .inner
            .executor
            .run(&context, log, slot.token().clone())
            .await;

        drop(slot);
        drop(workspace);
        result
    }

    async fn deploy_step(&self, instance_id: &str, handle: &InstanceHandle) -> Result<()> {
        let _step = handle.step.lock().await;
        if handle.cancel.is_cancelled() {
            return Ok(());
        }
        let record = self.inner.registry.get(instance_id).await?;
        let token = generate_access_token();

        let outcome = {
            let request = BundleRequest {
                instance_id: &record.instance_id,
                user_id: &record.user_id,
                image: record.runtime_image(),
                access_token: &token,
                resources: &record.resources,
            };
            self.inner.provisioner.provision(&request, &handle.cancel).await
        };

        match outcome {
            Ok(refs) => {
                self.transition(record, InstanceState::Running, |r| {
                    r.access_token = Some(token);
                    r.resource_refs = refs;
                })
                .await?;
            }
            Err(failure) if matches!(failure.error, OrchestratorError::Cancelled(_)) => {
                // Delete is waiting on the step lock and tears these down
                let mut record = record;
                record.resource_refs = failure.leftover;
                self.inner.registry.update(&record).await?;
            }
            Err(failure) => {
                let error = failure.error.to_string();
                self.transition(record, InstanceState::Failed, |r| {
                    r.error = Some(error);
                    r.resource_refs = failure.leftover;
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Everything the instance could own: recorded refs plus its planned bundle.
    fn teardown_targets(&self, record: &InstanceRecord) -> Vec<ResourceRef> {
        let mut targets: BTreeSet<ResourceRef> = record.resource_refs.iter().cloned().collect();
        targets.extend(
            self.inner
                .provisioner
                .planned_bundle(&record.instance_id, &record.user_id),
        );
        targets.into_iter().collect()
    }

    /// Start a teardown task unless one is already running. Returns whether
    /// a task was started.
    fn spawn_teardown(&self, instance_id: &str) -> bool {
        let handle = self.handle(instance_id);
        if handle.teardown_running.swap(true, Ordering::SeqCst) {
            debug!(instance_id, "teardown already running");
            return false;
        }

        let manager = self.clone();
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager.run_teardown(&instance_id).await {
                error!(instance_id = %instance_id, error = %e, "teardown aborted");
            }
            handle.teardown_running.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Tear down an interrupted deployment in the background, then fail it.
    /// A delete arriving meanwhile cancels this and takes the objects over.
    fn spawn_compensation(&self, instance_id: &str) {
        let manager = self.clone();
        let handle = self.handle(instance_id);
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager.run_compensation(&instance_id, &handle).await {
                error!(instance_id = %instance_id, error = %e, "compensation aborted");
            }
        });
    }

    async fn run_compensation(&self, instance_id: &str, handle: &InstanceHandle) -> Result<()> {
        let _step = handle.step.lock().await;
        if handle.cancel.is_cancelled() {
            return Ok(());
        }
        let record = self.inner.registry.get(instance_id).await?;
        let targets = self.teardown_targets(&record);

        let remaining = match self
            .inner
            .provisioner
            .compensating_teardown(&targets, &handle.cancel)
            .await
        {
            Ok(()) => Vec::new(),
            Err(failure) if matches!(failure.error, OrchestratorError::Cancelled(_)) => {
                return Ok(());
            }
            Err(failure) => {
                warn!(
                    instance_id,
                    error = %failure.error,
                    "compensating teardown incomplete"
                );
                failure.remaining
            }
        };

        self.transition(record, InstanceState::Failed, |r| {
            r.error = Some(INTERRUPTED_BY_RESTART.to_string());
            r.resource_refs = remaining;
        })
        .await?;
        Ok(())
    }

    async fn run_teardown(&self, instance_id: &str) -> Result<()> {
        let Some(record) = self.inner.registry.find(instance_id).await? else {
            self.forget(instance_id);
            return Ok(());
        };

        let mut pending = self.teardown_targets(&record);
        let mut rounds: u32 = 0;
        loop {
            match self.inner.provisioner.teardown(&pending).await {
                Ok(()) => break,
                Err(failure) => {
                    rounds += 1;
                    error!(
                        alert = true,
                        instance_id,
                        rounds,
                        remaining = failure.remaining.len(),
                        error = %failure.error,
                        "teardown blocked, operator attention required"
                    );
                    pending = failure.remaining;

                    let mut current = self.inner.registry.get(instance_id).await?;
                    if current.resource_refs != pending {
                        current.resource_refs = pending.clone();
                        self.inner.registry.update(&current).await?;
                    }
                    tokio::time::sleep(self.inner.config.retry_policy().max_backoff).await;
                }
            }
        }

        // A cancelled build may still be writing its log
        self.handle(instance_id).pipeline_finished().await;

        let current = self.inner.registry.get(instance_id).await?;
        self.transition(current, InstanceState::Deleted, |r| r.resource_refs.clear())
            .await?;
        self.inner.registry.remove(instance_id).await?;
        self.forget(instance_id);
        info!(instance_id, "instance deleted");
        Ok(())
    }
}
