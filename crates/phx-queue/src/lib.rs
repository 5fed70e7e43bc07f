//! Durable task queue: dispatch discipline layered on top of
//! `phx-store`'s transactional claim/report primitives.
//!
//! The only thing this crate adds over the store is the long-poll wait and
//! the reaper sweep — everything else (atomic claim, host-ownership check,
//! idempotent terminal reports) already lives in `phx-store::tasks`. A
//! per-host `tokio::sync::Notify` acts as a condition variable indexed by
//! host id: `Enqueue` wakes all waiters for its target host, and a woken
//! waiter simply re-runs `ClaimTasks`, which is authoritative, so a
//! spurious or racing wakeup is always safe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use phx_core::types::Task;
use phx_core::PhoenixResult;
use phx_store::Store;
use tokio::sync::Notify;

pub struct TaskQueue {
    store: Arc<Store>,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
}

impl TaskQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    fn notifier_for(&self, host_id: &str) -> Arc<Notify> {
        let mut waiters = self.waiters.lock().expect("queue waiters lock poisoned");
        waiters
            .entry(host_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Inserts with `status=pending` and wakes any long-poll waiters for
    /// the task's host.
    pub async fn enqueue(&self, task: &Task) -> PhoenixResult<()> {
        self.store.enqueue_task(task).await?;
        self.notifier_for(&task.host_id).notify_waiters();
        Ok(())
    }

    /// `ClaimForHost`: an immediate claim, and if that comes
    /// back empty, one wait on the host's notifier bounded by `wait_max`,
    /// followed by exactly one more claim attempt. The second attempt may
    /// still come back empty if another waiter won the race or the
    /// notification was spurious — that's a correct, documented outcome,
    /// not a bug.
    pub async fn claim_for_host(&self, host_id: &str, max: u32, wait_max: Duration) -> PhoenixResult<Vec<Task>> {
        let claimed = self.store.claim_tasks(host_id, max).await?;
        if !claimed.is_empty() {
            return Ok(claimed);
        }

        let notified = self.notifier_for(host_id).notified();
        let _ = tokio::time::timeout(wait_max, notified).await;

        self.store.claim_tasks(host_id, max).await
    }

    pub async fn report_status(
        &self,
        task_id: &str,
        host_id: &str,
        status: phx_core::types::TaskStatus,
        result: std::collections::HashMap<String, serde_json::Value>,
        error_message: Option<String>,
    ) -> PhoenixResult<Task> {
        self.store
            .update_task_status_with_result(task_id, host_id, status, result, error_message)
            .await
    }

    /// One reaper sweep: reverts/fails stale tasks, notifies any host whose
    /// tasks were reverted to `pending`, and prunes old completed/failed
    /// rows. Returns the number of tasks pruned by retention.
    pub async fn reap_once(
        &self,
        stale_threshold_secs: i64,
        max_retries: u32,
        retention_days: i64,
    ) -> PhoenixResult<u64> {
        let woken_hosts = self
            .store
            .reap_stale_tasks(stale_threshold_secs, max_retries)
            .await?;
        for host_id in &woken_hosts {
            self.notifier_for(host_id).notify_waiters();
        }
        if !woken_hosts.is_empty() {
            tracing::info!(hosts = ?woken_hosts, "reaper reverted stale tasks to pending");
        }
        self.store.prune_completed_tasks(retention_days).await
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phx_core::types::{TaskAction, TaskStatus, TaskType};

    #[tokio::test]
    async fn enqueue_wakes_a_waiting_claim() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let queue = Arc::new(TaskQueue::new(store));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim_for_host("h1", 10, Duration::from_secs(5)).await.unwrap() })
        };

        // give the waiter a moment to register on the notifier before enqueueing
        tokio::time::sleep(Duration::from_millis(20)).await;
        let task = Task::new("h1", TaskType::Collector, TaskAction::Start);
        queue.enqueue(&task).await.unwrap();

        let claimed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, task.id);
    }

    #[tokio::test]
    async fn claim_for_host_times_out_with_empty_result() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let queue = TaskQueue::new(store);

        let claimed = queue.claim_for_host("h_idle", 10, Duration::from_millis(20)).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn reaper_wakes_host_waiter_on_revert() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let queue = Arc::new(TaskQueue::new(store.clone()));

        let task = Task::new("h1", TaskType::Collector, TaskAction::Start);
        queue.enqueue(&task).await.unwrap();
        store.claim_tasks("h1", 10).await.unwrap();
        // a zero-second threshold makes the just-claimed task stale the
        // instant any time at all has elapsed, without reaching into the
        // store's private connection to backdate it.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim_for_host("h1", 10, Duration::from_secs(5)).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.reap_once(0, 3, 7).await.unwrap();

        let claimed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, TaskStatus::Assigned);
    }
}
