//! Admission control for the shared build daemon.
//!
//! At most `limit` builds hold a [`BuildSlot`] at any time. Everyone else
//! waits in strict submission order: a later submission is never admitted
//! while an earlier one is still waiting. Dropping a [`QueuedBuild`] or a
//! [`BuildSlot`] gives its place back, so a pipeline that bails out early can
//! never leak capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::BuildError;

/// Result of [`BuildQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The build had not started and was removed from the queue.
    Dequeued,
    /// The build was running; its cancellation token was triggered.
    Signalled,
    NotQueued,
}

/// A queued entry as seen by introspection.
#[derive(Debug, Clone, Serialize)]
pub struct WaitingBuild {
    pub instance_id: String,
    pub position: usize,
    pub submitted_at: DateTime<Utc>,
}

struct Waiter {
    ticket: u64,
    instance_id: String,
    submitted_at: DateTime<Utc>,
    token: CancellationToken,
    admit: oneshot::Sender<()>,
}

struct Running {
    ticket: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    next_ticket: u64,
    waiting: VecDeque<Waiter>,
    running: HashMap<String, Running>,
}

struct QueueInner {
    limit: usize,
    capacity: usize,
    state: Mutex<QueueState>,
}

#[derive(Clone)]
pub struct BuildQueue {
    inner: Arc<QueueInner>,
}

impl BuildQueue {
    /// `limit` concurrent builds, at most `capacity` waiting.
    pub fn new(limit: usize, capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                limit: limit.max(1),
                capacity,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The state is only mutated in short non-panicking sections
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a build for `instance_id`. The build's cancellation token is a
    /// child of `parent`, so cancelling the instance cancels the build.
    pub fn submit(
        &self,
        instance_id: &str,
        parent: &CancellationToken,
    ) -> Result<QueuedBuild, BuildError> {
        let mut state = self.lock();

        let duplicate = state.running.contains_key(instance_id)
            || state.waiting.iter().any(|w| w.instance_id == instance_id);
        if duplicate {
            return Err(BuildError::AlreadyQueued(instance_id.to_string()));
        }
        if state.waiting.len() >= self.inner.capacity {
            return Err(BuildError::QueueFull(state.waiting.len()));
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;

        let (admit, admitted) = oneshot::channel();
        let token = parent.child_token();
        state.waiting.push_back(Waiter {
            ticket,
            instance_id: instance_id.to_string(),
            submitted_at: Utc::now(),
            token: token.clone(),
            admit,
        });
        info!(
            instance_id,
            waiting = state.waiting.len(),
            running = state.running.len(),
            "build queued"
        );

        self.admit_waiting(&mut state);

        Ok(QueuedBuild {
            queue: self.clone(),
            ticket,
            instance_id: instance_id.to_string(),
            token,
            admitted: Some(admitted),
            holds_slot: false,
        })
    }

    /// Cancel the build for `instance_id`, whether waiting or running.
    pub fn cancel(&self, instance_id: &str) -> CancelOutcome {
        let mut state = self.lock();

        if let Some(pos) = state
            .waiting
            .iter()
            .position(|w| w.instance_id == instance_id)
        {
            // Dropping the sender wakes the waiter with a cancellation
            if let Some(waiter) = state.waiting.remove(pos) {
                waiter.token.cancel();
            }
            info!(instance_id, "queued build cancelled before start");
            return CancelOutcome::Dequeued;
        }

        if let Some(running) = state.running.get(instance_id) {
            running.token.cancel();
            info!(instance_id, "running build signalled to cancel");
            return CancelOutcome::Signalled;
        }

        CancelOutcome::NotQueued
    }

    pub fn pending_count(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    pub fn is_running(&self, instance_id: &str) -> bool {
        self.lock().running.contains_key(instance_id)
    }

    /// Waiting builds in admission order.
    pub fn waiting(&self) -> Vec<WaitingBuild> {
        self.lock()
            .waiting
            .iter()
            .enumerate()
            .map(|(position, w)| WaitingBuild {
                instance_id: w.instance_id.clone(),
                position,
                submitted_at: w.submitted_at,
            })
            .collect()
    }

    /// Hand free slots to the head of the queue, skipping waiters that gave up.
    fn admit_waiting(&self, state: &mut QueueState) {
        while state.running.len() < self.inner.limit {
            let Some(waiter) = state.waiting.pop_front() else {
                break;
            };
            if waiter.admit.send(()).is_err() {
                debug!(instance_id = %waiter.instance_id, "skipping abandoned build");
                continue;
            }
            debug!(instance_id = %waiter.instance_id, "build admitted");
            state.running.insert(
                waiter.instance_id,
                Running {
                    ticket: waiter.ticket,
                    token: waiter.token,
                },
            );
        }
    }

    /// Return whatever `ticket` holds: its waiting entry or its running slot.
    fn release(&self, ticket: u64, instance_id: &str) {
        let mut state = self.lock();
        state.waiting.retain(|w| w.ticket != ticket);
        if state
            .running
            .get(instance_id)
            .is_some_and(|r| r.ticket == ticket)
        {
            state.running.remove(instance_id);
            debug!(instance_id, "build slot released");
        }
        self.admit_waiting(&mut state);
    }
}

/// A submitted build waiting for admission.
pub struct QueuedBuild {
    queue: BuildQueue,
    ticket: u64,
    instance_id: String,
    token: CancellationToken,
    admitted: Option<oneshot::Receiver<()>>,
    holds_slot: bool,
}

impl QueuedBuild {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Wait until the queue admits this build.
    ///
    /// Returns `Cancelled` if the entry was removed through
    /// [`BuildQueue::cancel`] first.
    pub async fn admitted(mut self) -> Result<BuildSlot, BuildError> {
        let Some(admitted) = self.admitted.take() else {
            return Err(BuildError::Cancelled);
        };
        admitted.await.map_err(|_| BuildError::Cancelled)?;

        self.holds_slot = true;
        Ok(BuildSlot {
            queue: self.queue.clone(),
            ticket: self.ticket,
            instance_id: self.instance_id.clone(),
            token: self.token.clone(),
        })
    }
}

impl Drop for QueuedBuild {
    fn drop(&mut self) {
        if !self.holds_slot {
            self.queue.release(self.ticket, &self.instance_id);
        }
    }
}

/// Permission to run one build against the daemon.
pub struct BuildSlot {
    queue: BuildQueue,
    ticket: u64,
    instance_id: String,
    token: CancellationToken,
}

impl BuildSlot {
    /// Cancelled by [`BuildQueue::cancel`] or by the instance's own token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for BuildSlot {
    fn drop(&mut self) {
        self.queue.release(self.ticket, &self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test]
    async fn test_fifo_admission_with_limit_one() {
        let queue = BuildQueue::new(1, 16);
        let root = CancellationToken::new();
        let order = Arc::new(AsyncMutex::new(Vec::new()));

        let first = queue.submit("a", &root).unwrap();
        let second = queue.submit("b", &root).unwrap();
        let third = queue.submit("c", &root).unwrap();
        assert_eq!(queue.running_count(), 1);
        assert_eq!(queue.pending_count(), 2);

        // Spawn in reverse so task scheduling cannot explain the order
        let mut handles = Vec::new();
        for queued in [third, second, first] {
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let id = queued.instance_id().to_string();
                let slot = queued.admitted().await.unwrap();
                order.lock().await.push(id);
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(slot);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec!["a", "b", "c"]);
        assert_eq!(queue.running_count(), 0);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_waiting_entry_never_starts() {
        let queue = BuildQueue::new(1, 16);
        let root = CancellationToken::new();

        let first = queue.submit("a", &root).unwrap();
        let second = queue.submit("b", &root).unwrap();

        assert_eq!(queue.cancel("b"), CancelOutcome::Dequeued);
        assert!(matches!(second.admitted().await, Err(BuildError::Cancelled)));

        let slot = first.admitted().await.unwrap();
        assert_eq!(queue.pending_count(), 0);
        drop(slot);
        assert_eq!(queue.running_count(), 0);
        assert_eq!(queue.cancel("b"), CancelOutcome::NotQueued);
    }

    #[tokio::test]
    async fn test_cancel_running_build_signals_token() {
        let queue = BuildQueue::new(1, 16);
        let root = CancellationToken::new();

        let slot = queue.submit("a", &root).unwrap().admitted().await.unwrap();
        assert!(!slot.token().is_cancelled());

        assert_eq!(queue.cancel("a"), CancelOutcome::Signalled);
        assert!(slot.token().is_cancelled());
        // Still holds the slot until the executor has actually stopped
        assert!(queue.is_running("a"));
        drop(slot);
        assert!(!queue.is_running("a"));
    }

    #[tokio::test]
    async fn test_parent_token_cancels_build() {
        let queue = BuildQueue::new(2, 16);
        let instance = CancellationToken::new();

        let slot = queue.submit("a", &instance).unwrap().admitted().await.unwrap();
        instance.cancel();
        assert!(slot.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let queue = BuildQueue::new(1, 16);
        let root = CancellationToken::new();

        let first = queue.submit("a", &root).unwrap();
        let second = queue.submit("b", &root).unwrap();
        let third = queue.submit("c", &root).unwrap();

        drop(second);
        assert_eq!(queue.pending_count(), 1);

        let slot = first.admitted().await.unwrap();
        drop(slot);

        let slot = third.admitted().await.unwrap();
        assert!(queue.is_running("c"));
        drop(slot);
    }

    #[tokio::test]
    async fn test_capacity_and_duplicates() {
        let queue = BuildQueue::new(1, 1);
        let root = CancellationToken::new();

        let _running = queue.submit("a", &root).unwrap();
        let _waiting = queue.submit("b", &root).unwrap();

        assert!(matches!(
            queue.submit("c", &root),
            Err(BuildError::QueueFull(1))
        ));
        assert!(matches!(
            queue.submit("a", &root),
            Err(BuildError::AlreadyQueued(_))
        ));

        let waiting = queue.waiting();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].instance_id, "b");
        assert_eq!(waiting[0].position, 0);
    }

    #[tokio::test]
    async fn test_concurrency_limit_two() {
        let queue = BuildQueue::new(2, 16);
        let root = CancellationToken::new();

        let a = queue.submit("a", &root).unwrap();
        let b = queue.submit("b", &root).unwrap();
        let c = queue.submit("c", &root).unwrap();
        assert_eq!(queue.running_count(), 2);
        assert_eq!(queue.pending_count(), 1);

        let slot_a = a.admitted().await.unwrap();
        let _slot_b = b.admitted().await.unwrap();
        drop(slot_a);

        let _slot_c = c.admitted().await.unwrap();
        assert_eq!(queue.running_count(), 2);
    }
}
