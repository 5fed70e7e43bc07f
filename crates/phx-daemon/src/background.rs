//! Background loops no single HTTP request owns: the task-queue reaper,
//! the token-blacklist garbage collector, and the agent expiry sweep.
//! All three are plain periodic `tokio::time::interval` loops, following
//! this codebase's convention of a flat `tokio::select!` against a
//! [`ShutdownSignal`] rather than a dedicated scheduler abstraction —
//! there's nothing here complex enough to warrant one.

use std::sync::Arc;
use std::time::Duration;

use phx_core::config::{AgentsConfig, AuthConfig, QueueConfig};
use phx_harness::ShutdownSignal;
use phx_queue::TaskQueue;
use phx_store::Store;

/// Runs `TaskQueue::reap_once` every `period` until `shutdown` fires.
/// Each sweep reverts stale `assigned`/`running` tasks to `pending` (or
/// fails them past `max_retries`) and prunes completed/failed rows older
/// than the retention horizon. `period` is taken separately from
/// `config` (rather than derived from `config.reaper_period_secs`
/// inside this function) so tests can drive the loop on a sub-second
/// cadence without a zero-duration `tokio::time::interval` panicking.
pub async fn reaper_loop(queue: Arc<TaskQueue>, config: QueueConfig, period: Duration, shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(period);
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match queue
                    .reap_once(config.stale_task_threshold_secs, config.max_retries, config.task_retention_days)
                    .await
                {
                    Ok(pruned) if pruned > 0 => {
                        tracing::info!(pruned, "reaper pruned retention-expired tasks");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "reaper sweep failed"),
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("reaper loop shutting down");
                return;
            }
        }
    }
}

/// Runs `Store::cleanup_expired_tokens` every `period` until `shutdown`
/// fires.
pub async fn token_gc_loop(store: Arc<Store>, _config: AuthConfig, period: Duration, shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(period);
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.cleanup_expired_tokens().await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "garbage-collected expired blacklist entries");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "token blacklist gc failed"),
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("token gc loop shutting down");
                return;
            }
        }
    }
}

/// Runs `Store::mark_expired_agents_offline` every `period` until
/// `shutdown` fires, flipping any agent whose last heartbeat is older
/// than `config.heartbeat_expiry_secs` to `offline`.
pub async fn agent_expiry_loop(store: Arc<Store>, config: AgentsConfig, period: Duration, shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(period);
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.mark_expired_agents_offline(config.heartbeat_expiry_secs).await {
                    Ok(expired) if !expired.is_empty() => {
                        tracing::info!(count = expired.len(), "marked expired agents offline");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "agent expiry sweep failed"),
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("agent expiry loop shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phx_core::types::{TaskAction, TaskStatus, TaskType};

    #[tokio::test]
    async fn reaper_loop_reverts_stale_tasks_and_stops_on_shutdown() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let queue = Arc::new(TaskQueue::new(store.clone()));

        let task = phx_core::types::Task::new("h1", TaskType::Collector, TaskAction::Start);
        queue.enqueue(&task).await.unwrap();
        store.claim_tasks("h1", 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut config = QueueConfig::default();
        config.stale_task_threshold_secs = 0;

        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(reaper_loop(queue, config, Duration::from_millis(10), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let updated = store.get_task(&task.id).await.unwrap();
        assert_eq!(updated.status, TaskStatus::Pending);
        assert_eq!(updated.retry_count, 1);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn token_gc_loop_removes_expired_entries_and_stops_on_shutdown() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let expired = phx_core::types::TokenBlacklistEntry {
            jti: "jti-1".into(),
            user_id: "user-1".into(),
            expires_at: chrono::Utc::now() - chrono::Duration::seconds(5),
            reason: "test".into(),
        };
        store.blacklist_token(&expired).await.unwrap();

        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(token_gc_loop(
            store.clone(),
            AuthConfig::default(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.is_token_blacklisted("jti-1").await.unwrap());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn agent_expiry_loop_marks_stale_agents_offline_and_stops_on_shutdown() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut agent = phx_core::types::Agent::minimal("h1");
        agent.last_heartbeat = chrono::Utc::now() - chrono::Duration::seconds(120);
        store.upsert_agent(&agent).await.unwrap();

        let mut config = AgentsConfig::default();
        config.heartbeat_expiry_secs = 1;

        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(agent_expiry_loop(store.clone(), config, Duration::from_millis(10), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let updated = store.get_agent("h1").await.unwrap();
        assert_eq!(updated.status, phx_core::types::AgentStatus::Offline);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
