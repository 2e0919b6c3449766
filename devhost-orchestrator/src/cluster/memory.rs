use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ClusterApi, ClusterError, ObjectSpec};
use crate::instance::{ResourceKind, ResourceRef};

/// An object held by [`InMemoryCluster`].
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub kind: ResourceKind,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub manifest: serde_json::Value,
}

#[derive(Default)]
struct Faults {
    create_failures: HashMap<ResourceKind, ClusterError>,
    transient_creates: HashMap<ResourceKind, u32>,
    delete_failures: HashMap<ResourceKind, ClusterError>,
    transient_deletes: u32,
    never_ready: bool,
    create_delay: Option<Duration>,
}

/// Cluster kept in process memory, with fault injection for tests.
#[derive(Default)]
pub struct InMemoryCluster {
    objects: Mutex<BTreeMap<(ResourceKind, String), StoredObject>>,
    faults: Mutex<Faults>,
    operations: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects labelled with `instance=<instance_id>`.
    pub fn objects_for_instance(&self, instance_id: &str) -> Vec<ResourceRef> {
        lock(&self.objects)
            .values()
            .filter(|o| o.labels.get("instance").map(String::as_str) == Some(instance_id))
            .map(|o| ResourceRef::new(o.kind, o.name.clone()))
            .collect()
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        lock(&self.objects).keys().filter(|(k, _)| *k == kind).count()
    }

    pub fn contains(&self, object: &ResourceRef) -> bool {
        lock(&self.objects).contains_key(&(object.kind, object.name.clone()))
    }

    pub fn get(&self, object: &ResourceRef) -> Option<StoredObject> {
        lock(&self.objects)
            .get(&(object.kind, object.name.clone()))
            .cloned()
    }

    /// Every create/delete call in order, e.g. `"create workload/alice-1"`.
    pub fn operations(&self) -> Vec<String> {
        lock(&self.operations).clone()
    }

    /// Fail every create of `kind` with `error` until cleared.
    pub fn fail_creates(&self, kind: ResourceKind, error: ClusterError) {
        lock(&self.faults).create_failures.insert(kind, error);
    }

    /// Fail the next `times` creates of `kind` with a transient error.
    pub fn fail_creates_transiently(&self, kind: ResourceKind, times: u32) {
        lock(&self.faults).transient_creates.insert(kind, times);
    }

    /// Fail every delete of `kind` with `error` until cleared.
    pub fn fail_deletes(&self, kind: ResourceKind, error: ClusterError) {
        lock(&self.faults).delete_failures.insert(kind, error);
    }

    /// Fail the next `times` deletes (any kind) with a transient error.
    pub fn fail_deletes_transiently(&self, times: u32) {
        lock(&self.faults).transient_deletes = times;
    }

    /// Make workloads never become ready.
    pub fn set_never_ready(&self, never_ready: bool) {
        lock(&self.faults).never_ready = never_ready;
    }

    /// Slow down every create call.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        lock(&self.faults).create_delay = delay;
    }

    pub fn clear_faults(&self) {
        *lock(&self.faults) = Faults::default();
    }

    fn record(&self, operation: String) {
        lock(&self.operations).push(operation);
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn create(&self, spec: &ObjectSpec) -> Result<ResourceRef, ClusterError> {
        let delay = lock(&self.faults).create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reference = spec.reference();
        self.record(format!("create {reference}"));
        {
            let mut faults = lock(&self.faults);
            if let Some(err) = faults.create_failures.get(&spec.kind) {
                return Err(err.clone());
            }
            if let Some(remaining) = faults.transient_creates.get_mut(&spec.kind) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ClusterError::Transient(format!(
                        "injected transient failure creating {reference}"
                    )));
                }
            }
        }

        let mut objects = lock(&self.objects);
        let key = (spec.kind, spec.name.clone());
        if objects.contains_key(&key) {
            return Err(ClusterError::Conflict(reference.to_string()));
        }
        objects.insert(
            key,
            StoredObject {
                kind: spec.kind,
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                manifest: spec.manifest.clone(),
            },
        );
        debug!(object = %reference, "in-memory object created");
        Ok(reference)
    }

    async fn delete(&self, object: &ResourceRef) -> Result<(), ClusterError> {
        self.record(format!("delete {object}"));
        {
            let mut faults = lock(&self.faults);
            if let Some(err) = faults.delete_failures.get(&object.kind) {
                return Err(err.clone());
            }
            if faults.transient_deletes > 0 {
                faults.transient_deletes -= 1;
                return Err(ClusterError::Transient(format!(
                    "injected transient failure deleting {object}"
                )));
            }
        }

        match lock(&self.objects).remove(&(object.kind, object.name.clone())) {
            Some(_) => {
                debug!(object = %object, "in-memory object deleted");
                Ok(())
            }
            None => Err(ClusterError::NotFound(object.to_string())),
        }
    }

    async fn exists(&self, object: &ResourceRef) -> Result<bool, ClusterError> {
        Ok(self.contains(object))
    }

    async fn wait_ready(
        &self,
        object: &ResourceRef,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        if !self.contains(object) {
            return Err(ClusterError::NotFound(object.to_string()));
        }
        let never_ready = lock(&self.faults).never_ready;
        if never_ready && object.kind == ResourceKind::Workload {
            tokio::time::sleep(timeout).await;
            return Err(ClusterError::Timeout(format!(
                "{object} not ready after {}s",
                timeout.as_secs()
            )));
        }
        Ok(())
    }
}
