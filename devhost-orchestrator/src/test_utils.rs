use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::build::{BuildContext, BuildError, BuildExecutor};
use crate::build_log::BuildLog;
use crate::cluster::{ClusterApi, InMemoryCluster};
use crate::config::OrchestratorConfig;
use crate::instance::{InstanceRecord, InstanceState};
use crate::lifecycle::InstanceManager;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // One connection that never recycles: each new connection would get an
    // empty in-memory database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Defaults with timeouts and backoffs small enough for tests.
pub fn test_config(build_root: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        build_root: build_root.to_path_buf(),
        build_concurrency: 1,
        build_queue_capacity: 16,
        build_timeout_secs: 30,
        push_timeout_secs: 30,
        build_kill_grace_secs: 1,
        cluster_call_timeout_secs: 5,
        readiness_timeout_secs: 1,
        retry_max_attempts: 3,
        retry_initial_backoff_ms: 1,
        retry_max_backoff_ms: 10,
        teardown_alert_after: 5,
        ..OrchestratorConfig::default()
    }
}

/// How [`ScriptedExecutor`] finishes a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Succeed,
    Fail(String),
    /// Block until [`ScriptedExecutor::release`] or cancellation.
    Hold,
}

/// Build executor that never touches a build daemon.
pub struct ScriptedExecutor {
    outcome: Mutex<ScriptedOutcome>,
    gate: Semaphore,
    started: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new(ScriptedOutcome::Succeed)
    }
}

impl ScriptedExecutor {
    pub fn new(outcome: ScriptedOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            gate: Semaphore::new(0),
            started: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn set_outcome(&self, outcome: ScriptedOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    /// Let `builds` held builds finish successfully.
    pub fn release(&self, builds: usize) {
        self.gate.add_permits(builds);
    }

    /// Instance ids in the order their builds started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildExecutor for ScriptedExecutor {
    async fn run(
        &self,
        context: &BuildContext,
        log: &BuildLog,
        cancel: CancellationToken,
    ) -> Result<String, BuildError> {
        log.append(format!("Step 1/2 : building {}", context.image_name))
            .await;
        self.started
            .lock()
            .unwrap()
            .push(context.instance_id.clone());

        let outcome = self.outcome.lock().unwrap().clone();
        match outcome {
            ScriptedOutcome::Succeed => {}
            ScriptedOutcome::Fail(message) => {
                log.append(&message).await;
                return Err(BuildError::ToolFailed {
                    program: "devcontainer".to_string(),
                    code: 1,
                    message,
                });
            }
            ScriptedOutcome::Hold => {
                tokio::select! {
                    () = cancel.cancelled() => {
                        self.cancelled
                            .lock()
                            .unwrap()
                            .push(context.instance_id.clone());
                        return Err(BuildError::Cancelled);
                    }
                    permit = self.gate.acquire() => {
                        permit.expect("Failed to acquire build gate").forget();
                    }
                }
            }
        }

        log.append("Step 2/2 : pushing").await;
        Ok(context.image_name.clone())
    }
}

/// A manager wired to an in-memory cluster and a scripted executor.
pub struct TestHarness {
    pub manager: InstanceManager,
    pub cluster: Arc<InMemoryCluster>,
    pub executor: Arc<ScriptedExecutor>,
    pub pool: SqlitePool,
    pub build_root: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_executor(ScriptedExecutor::default()).await
    }

    pub async fn with_executor(executor: ScriptedExecutor) -> Self {
        let build_root = TempDir::new().expect("Failed to create build root");
        let pool = create_test_db().await;
        let cluster = Arc::new(InMemoryCluster::new());
        let executor = Arc::new(executor);
        let manager = InstanceManager::new(
            pool.clone(),
            test_config(build_root.path()),
            cluster.clone() as Arc<dyn ClusterApi>,
            executor.clone() as Arc<dyn BuildExecutor>,
        );
        Self {
            manager,
            cluster,
            executor,
            pool,
            build_root,
        }
    }

    /// A second manager over the same database and cluster, as after a restart.
    pub fn restarted(&self) -> InstanceManager {
        self.manager_with(
            test_config(self.build_root.path()),
            self.executor.clone() as Arc<dyn BuildExecutor>,
        )
    }

    /// A manager over the same database and cluster that builds with `executor`.
    pub fn manager_with(
        &self,
        config: OrchestratorConfig,
        executor: Arc<dyn BuildExecutor>,
    ) -> InstanceManager {
        InstanceManager::new(
            self.pool.clone(),
            config,
            self.cluster.clone() as Arc<dyn ClusterApi>,
            executor,
        )
    }
}

/// Poll until the instance reaches `state`, panicking after five seconds.
pub async fn wait_for_state(
    manager: &InstanceManager,
    instance_id: &str,
    state: InstanceState,
) -> InstanceRecord {
    let mut last = None;
    for _ in 0..500 {
        if let Ok(record) = manager.get_instance(instance_id).await {
            if record.state == state {
                return record;
            }
            last = Some(record.state);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("instance {instance_id} never reached {state}, last seen {last:?}");
}

/// Poll until the record is gone from the registry.
pub async fn wait_for_removal(manager: &InstanceManager, instance_id: &str) {
    for _ in 0..500 {
        match manager.registry().find(instance_id).await {
            Ok(None) => return,
            Ok(Some(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => panic!("registry lookup failed: {e}"),
        }
    }
    panic!("instance {instance_id} was never removed");
}

/// Poll until `condition` holds, panicking after five seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
