//! In-flight and completed task registry
//!
//! For every `task_id` exactly one of three states holds: pending,
//! completed (with an absolute expiry), or absent. The owner recorded at
//! registration never changes; it is evicted together with the completed
//! entry. Listeners registered by synchronous waiters are drained exactly
//! once, in registration order, on the pending -> completed transition,
//! after which the push channel (if any) fires and is cleared.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::task::{Task, TaskResult};

/// Default TTL for completed results, seconds
pub const DEFAULT_RESULT_TTL_S: i64 = 3600;

/// Default interval between expiry sweeps, seconds
pub const SWEEP_INTERVAL_S: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("task id is already in use")]
    DuplicateTaskId,
}

struct PendingEntry {
    task: Task,
    listeners: Vec<oneshot::Sender<TaskResult>>,
    push: Option<mpsc::UnboundedSender<TaskResult>>,
}

struct CompletedEntry {
    result: TaskResult,
    /// Unix seconds after which the entry is evictable
    expires_at: i64,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, PendingEntry>,
    completed: HashMap<String, CompletedEntry>,
    owners: HashMap<String, String>,
}

pub struct TaskRegistry {
    inner: Mutex<Inner>,
    result_ttl_s: i64,
}

impl TaskRegistry {
    pub fn new(result_ttl_s: i64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            result_ttl_s,
        }
    }

    /// Insert a pending task and record its owner.
    ///
    /// Fails when the id is already pending or completed, which also keeps
    /// the recorded owner immutable for the life of the record.
    pub fn register(&self, task: Task, owner: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let id = task.task_id.clone();
        if inner.pending.contains_key(&id) || inner.completed.contains_key(&id) {
            return Err(RegistryError::DuplicateTaskId);
        }
        inner.pending.insert(
            id.clone(),
            PendingEntry {
                task,
                listeners: Vec::new(),
                push: None,
            },
        );
        inner.owners.insert(id.clone(), owner.to_string());
        debug!(task_id = %id, owner = %owner, "Task registered");
        Ok(())
    }

    /// Register a one-shot listener for a pending task's completion.
    /// Returns `None` when the task is not pending.
    pub fn subscribe(&self, task_id: &str) -> Option<oneshot::Receiver<TaskResult>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let entry = inner.pending.get_mut(task_id)?;
        let (tx, rx) = oneshot::channel();
        entry.listeners.push(tx);
        Some(rx)
    }

    /// Attach the push channel used for asynchronous result delivery.
    /// Returns whether the task was pending.
    pub fn attach_push(&self, task_id: &str, sender: mpsc::UnboundedSender<TaskResult>) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        match inner.pending.get_mut(task_id) {
            Some(entry) => {
                entry.push = Some(sender);
                true
            }
            None => false,
        }
    }

    /// Move a task from pending to completed, then notify: listeners are
    /// drained in registration order, then the push channel fires and is
    /// cleared. A second call for the same id is a no-op.
    pub fn complete(&self, task_id: &str, result: TaskResult) {
        let entry = {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            let entry = match inner.pending.remove(task_id) {
                Some(entry) => entry,
                None => return,
            };
            inner.completed.insert(
                task_id.to_string(),
                CompletedEntry {
                    result: result.clone(),
                    expires_at: Utc::now().timestamp() + self.result_ttl_s,
                },
            );
            entry
        };

        // Notification happens outside the lock; this flow is the only one
        // that owns the pending entry at this point.
        for listener in entry.listeners {
            let _ = listener.send(result.clone());
        }
        if let Some(push) = entry.push {
            let _ = push.send(result.clone());
        }
        debug!(task_id = %task_id, status = %result.status, "Task completed");
    }

    /// Pending task descriptor, if any
    pub fn get_pending(&self, task_id: &str) -> Option<Task> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.pending.get(task_id).map(|e| e.task.clone())
    }

    /// Completed result, only while its TTL has not lapsed
    pub fn get_completed_if_fresh(&self, task_id: &str) -> Option<TaskResult> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let entry = inner.completed.get(task_id)?;
        if Utc::now().timestamp() >= entry.expires_at {
            return None;
        }
        Some(entry.result.clone())
    }

    /// Recorded owner identity for a live record
    pub fn get_owner(&self, task_id: &str) -> Option<String> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.owners.get(task_id).cloned()
    }

    /// Cancel a pending task. `cancel_child` is the executor hook; the
    /// pending record and owner are removed only when it reports success.
    pub fn cancel(&self, task_id: &str, cancel_child: impl FnOnce(&str) -> bool) -> bool {
        {
            let inner = self.inner.lock().expect("registry lock poisoned");
            if !inner.pending.contains_key(task_id) {
                return false;
            }
        }
        // The executor call happens without the registry lock held.
        if !cancel_child(task_id) {
            return false;
        }
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.pending.remove(task_id);
        inner.owners.remove(task_id);
        info!(task_id = %task_id, "Task cancelled");
        true
    }

    /// Evict expired completed entries and their owner mappings
    pub fn sweep(&self) {
        let now_s = Utc::now().timestamp();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let expired: Vec<String> = inner
            .completed
            .iter()
            .filter(|(_, e)| e.expires_at <= now_s)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.completed.remove(id);
            inner.owners.remove(id);
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "Swept expired task results");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").pending.len()
    }

    pub fn completed_count(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").completed.len()
    }

    /// Ids of all pending tasks, for drain-time cancellation
    pub fn pending_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.pending.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn force_expire_for_test(&self, task_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.completed.get_mut(task_id) {
            entry.expires_at = Utc::now().timestamp() - 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskStatus, TaskType};

    fn task(id: &str) -> Task {
        Task {
            task_id: id.to_string(),
            task_type: TaskType::Prompt,
            prompt: "hi".to_string(),
            working_dir: None,
            timeout_s: 30,
            client_identity: "did:key:zOwner".to_string(),
            escrow_id: None,
        }
    }

    fn result(id: &str) -> TaskResult {
        TaskResult {
            task_id: id.to_string(),
            status: TaskStatus::Completed,
            output: Some("ok".to_string()),
            error: None,
            duration_ms: 5,
            mock: false,
        }
    }

    #[test]
    fn test_states_are_mutually_exclusive() {
        let registry = TaskRegistry::new(DEFAULT_RESULT_TTL_S);
        registry.register(task("t1"), "owner").unwrap();
        assert!(registry.get_pending("t1").is_some());
        assert!(registry.get_completed_if_fresh("t1").is_none());

        registry.complete("t1", result("t1"));
        assert!(registry.get_pending("t1").is_none());
        assert!(registry.get_completed_if_fresh("t1").is_some());

        // Absent id is neither
        assert!(registry.get_pending("t2").is_none());
        assert!(registry.get_completed_if_fresh("t2").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = TaskRegistry::new(DEFAULT_RESULT_TTL_S);
        registry.register(task("t1"), "owner").unwrap();
        assert_eq!(
            registry.register(task("t1"), "other"),
            Err(RegistryError::DuplicateTaskId)
        );
        // Owner is unchanged by the failed attempt
        assert_eq!(registry.get_owner("t1").as_deref(), Some("owner"));

        // Still rejected after completion: the id remains live
        registry.complete("t1", result("t1"));
        assert!(registry.register(task("t1"), "owner").is_err());
    }

    #[tokio::test]
    async fn test_listeners_drained_once_in_order() {
        let registry = TaskRegistry::new(DEFAULT_RESULT_TTL_S);
        registry.register(task("t1"), "owner").unwrap();

        let rx1 = registry.subscribe("t1").unwrap();
        let rx2 = registry.subscribe("t1").unwrap();

        registry.complete("t1", result("t1"));

        assert_eq!(rx1.await.unwrap().task_id, "t1");
        assert_eq!(rx2.await.unwrap().task_id, "t1");

        // Subscribing after completion is refused
        assert!(registry.subscribe("t1").is_none());
    }

    #[tokio::test]
    async fn test_push_channel_fires_on_completion() {
        let registry = TaskRegistry::new(DEFAULT_RESULT_TTL_S);
        registry.register(task("t1"), "owner").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(registry.attach_push("t1", tx));

        registry.complete("t1", result("t1"));
        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.status, TaskStatus::Completed);
    }

    #[test]
    fn test_second_complete_is_noop() {
        let registry = TaskRegistry::new(DEFAULT_RESULT_TTL_S);
        registry.register(task("t1"), "owner").unwrap();
        registry.complete("t1", result("t1"));

        let mut other = result("t1");
        other.output = Some("overwritten".to_string());
        registry.complete("t1", other);

        assert_eq!(
            registry.get_completed_if_fresh("t1").unwrap().output.unwrap(),
            "ok"
        );
    }

    #[test]
    fn test_dropped_listener_does_not_poison_completion() {
        let registry = TaskRegistry::new(DEFAULT_RESULT_TTL_S);
        registry.register(task("t1"), "owner").unwrap();
        drop(registry.subscribe("t1").unwrap());
        registry.complete("t1", result("t1"));
        assert!(registry.get_completed_if_fresh("t1").is_some());
    }

    #[test]
    fn test_sweep_evicts_expired_with_owner() {
        let registry = TaskRegistry::new(DEFAULT_RESULT_TTL_S);
        registry.register(task("t1"), "owner").unwrap();
        registry.complete("t1", result("t1"));

        registry.force_expire_for_test("t1");
        assert!(registry.get_completed_if_fresh("t1").is_none());
        assert!(registry.get_owner("t1").is_some());

        registry.sweep();
        assert!(registry.get_owner("t1").is_none());
        assert_eq!(registry.completed_count(), 0);

        // Id is reusable once absent
        assert!(registry.register(task("t1"), "owner2").is_ok());
    }

    #[test]
    fn test_cancel_removes_only_on_child_success() {
        let registry = TaskRegistry::new(DEFAULT_RESULT_TTL_S);
        registry.register(task("t1"), "owner").unwrap();

        assert!(!registry.cancel("t1", |_| false));
        assert!(registry.get_pending("t1").is_some());

        assert!(registry.cancel("t1", |_| true));
        assert!(registry.get_pending("t1").is_none());
        assert!(registry.get_owner("t1").is_none());

        // Cancelling an absent task never reaches the executor
        assert!(!registry.cancel("t1", |_| panic!("must not be called")));
    }

    #[test]
    fn test_pending_ids_snapshot() {
        let registry = TaskRegistry::new(DEFAULT_RESULT_TTL_S);
        registry.register(task("a"), "o").unwrap();
        registry.register(task("b"), "o").unwrap();
        let mut ids = registry.pending_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
