//! Load Simulation manager.
//!
//! Load-generation jobs have no dedicated entity in the data model — only
//! `TaskType::Loadsim` tasks exist, normally created as a side effect of
//! `ExperimentController::start`/`stop`. A standalone job is modeled the
//! same way a deployment's per-node state is: a shared tag (`loadsim_id`)
//! carried in `Task::config`, with `LoadSimManager::group` folding the
//! tagged tasks back into one logical job per id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use phx_bus::{BusMessage, EventBus};
use phx_core::types::{Task, TaskAction, TaskStatus, TaskType};
use phx_core::{PhoenixError, PhoenixResult};
use phx_queue::TaskQueue;
use phx_store::Store;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct StartLoadSimRequest {
    pub host_id: String,
    pub profile: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub parameters: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSimJob {
    pub loadsim_id: String,
    pub host_id: String,
    pub profile: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Orchestrates standalone load-simulation jobs outside of an experiment.
/// Dispatch only; no durable entity of its own.
pub struct LoadSimManager {
    store: Arc<Store>,
    queue: Arc<TaskQueue>,
    bus: Arc<EventBus>,
}

impl LoadSimManager {
    pub fn new(store: Arc<Store>, queue: Arc<TaskQueue>, bus: Arc<EventBus>) -> Self {
        Self { store, queue, bus }
    }

    pub async fn start(&self, request: StartLoadSimRequest) -> PhoenixResult<LoadSimJob> {
        let loadsim_id = uuid::Uuid::new_v4().to_string();
        let mut task = Task::new(request.host_id.clone(), TaskType::Loadsim, TaskAction::Start);
        task.priority = 0;
        task.config.insert("loadsim_id".into(), Value::String(loadsim_id.clone()));
        task.config.insert("profile".into(), Value::String(request.profile.clone()));
        for (key, value) in &request.parameters {
            task.config.insert(key.clone(), value.clone());
        }
        let started_at = task.created_at;
        self.queue.enqueue(&task).await?;

        self.bus.publish(BusMessage::new(
            "loadsim_started",
            "loadsim",
            serde_json::json!({ "loadsim_id": loadsim_id, "host_id": request.host_id, "profile": request.profile }),
        ));

        Ok(LoadSimJob {
            loadsim_id,
            host_id: request.host_id,
            profile: request.profile,
            status: TaskStatus::Pending,
            started_at,
            stopped_at: None,
        })
    }

    pub async fn list(&self) -> PhoenixResult<Vec<LoadSimJob>> {
        let tasks = self.store.list_tasks_by_type(TaskType::Loadsim).await?;
        Ok(Self::group(tasks))
    }

    pub async fn get(&self, loadsim_id: &str) -> PhoenixResult<LoadSimJob> {
        let tasks = self.store.list_tasks_by_type(TaskType::Loadsim).await?;
        Self::group(tasks)
            .into_iter()
            .find(|job| job.loadsim_id == loadsim_id)
            .ok_or_else(|| PhoenixError::not_found(format!("load simulation '{loadsim_id}' not found")))
    }

    pub async fn stop(&self, loadsim_id: &str) -> PhoenixResult<LoadSimJob> {
        let job = self.get(loadsim_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        let mut task = Task::new(job.host_id.clone(), TaskType::Loadsim, TaskAction::Stop);
        task.priority = 2;
        task.config.insert("loadsim_id".into(), Value::String(loadsim_id.to_string()));
        self.queue.enqueue(&task).await?;

        self.bus
            .publish(BusMessage::new("loadsim_stopped", "loadsim", serde_json::json!({ "loadsim_id": loadsim_id })));

        let mut stopped = job;
        stopped.stopped_at = Some(Utc::now());
        Ok(stopped)
    }

    /// Folds raw `Loadsim` tasks (ordered by `created_at`) into one job per
    /// `loadsim_id`: the `start` task supplies `profile`/`host_id`, its
    /// status tracks the job while no `stop` task has completed, and a
    /// completed `stop` task marks the job done and stamps `stopped_at`.
    fn group(tasks: Vec<Task>) -> Vec<LoadSimJob> {
        let mut jobs: HashMap<String, LoadSimJob> = HashMap::new();

        for task in tasks {
            let Some(loadsim_id) = task.config.get("loadsim_id").and_then(|v| v.as_str()).map(str::to_string) else {
                continue;
            };

            match task.action {
                TaskAction::Start => {
                    let profile = task.config.get("profile").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    jobs.insert(
                        loadsim_id.clone(),
                        LoadSimJob {
                            loadsim_id,
                            host_id: task.host_id.clone(),
                            profile,
                            status: task.status,
                            started_at: task.created_at,
                            stopped_at: None,
                        },
                    );
                }
                TaskAction::Stop => {
                    if let Some(entry) = jobs.get_mut(&loadsim_id) {
                        if task.status == TaskStatus::Completed {
                            entry.status = TaskStatus::Completed;
                            entry.stopped_at = Some(task.completed_at.unwrap_or(task.created_at));
                        }
                    }
                }
                _ => {}
            }
        }

        let mut out: Vec<LoadSimJob> = jobs.into_values().collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> (LoadSimManager, Arc<TaskQueue>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let queue = Arc::new(TaskQueue::new(store.clone()));
        let bus = Arc::new(EventBus::new(64));
        (LoadSimManager::new(store, queue.clone(), bus), queue)
    }

    fn request() -> StartLoadSimRequest {
        StartLoadSimRequest {
            host_id: "h1".into(),
            profile: "steady-ramp".into(),
            parameters: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn start_then_list_returns_pending_job() {
        let (manager, _queue) = manager().await;
        let job = manager.start(request()).await.unwrap();
        assert_eq!(job.status, TaskStatus::Pending);

        let jobs = manager.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].profile, "steady-ramp");
    }

    #[tokio::test]
    async fn get_unknown_job_is_not_found() {
        let (manager, _queue) = manager().await;
        let err = manager.get("nope").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn stop_enqueues_stop_task_and_is_idempotent_after_completion() {
        let (manager, queue) = manager().await;
        let job = manager.start(request()).await.unwrap();
        manager.stop(&job.loadsim_id).await.unwrap();

        let claimed = queue.claim_for_host("h1", 10, std::time::Duration::from_millis(10)).await.unwrap();
        let stop_task = claimed.iter().find(|t| t.action == TaskAction::Stop).unwrap();
        queue
            .store()
            .update_task_status_with_result(&stop_task.id, "h1", TaskStatus::Running, Default::default(), None)
            .await
            .unwrap();
        queue
            .store()
            .update_task_status_with_result(&stop_task.id, "h1", TaskStatus::Completed, Default::default(), None)
            .await
            .unwrap();

        let done = manager.get(&job.loadsim_id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.stopped_at.is_some());

        // Stopping again is a no-op once terminal.
        let again = manager.stop(&job.loadsim_id).await.unwrap();
        assert_eq!(again.status, TaskStatus::Completed);
    }
}
