use phx_core::types::{Task, TaskAction, TaskStatus, TaskType};
use phx_core::{PhoenixError, PhoenixResult};
use rusqlite::Row;

use crate::{enum_from_sql, enum_to_sql, from_json_col, from_rfc3339, json_col, map_err, to_rfc3339, Store};

impl Store {
    pub async fn enqueue_task(&self, task: &Task) -> PhoenixResult<()> {
        let t = task.clone();
        self.conn
            .call(move |conn| {
                insert_task(conn, &t)?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }

    pub async fn get_task(&self, id: &str) -> PhoenixResult<Task> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_TASK} WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(map_err)?
            .ok_or_else(|| PhoenixError::not_found("task not found"))
    }

    pub async fn list_tasks_for_experiment(&self, experiment_id: &str) -> PhoenixResult<Vec<Task>> {
        let experiment_id = experiment_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{SELECT_TASK} WHERE experiment_id = ?1 ORDER BY created_at"))?;
                let mut rows = stmt.query(rusqlite::params![experiment_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(map_err)
    }

    /// Used by the Load Simulation manager, which has no entity of its own
    /// to key a query on — load-sim jobs are identified purely by the
    /// `loadsim_id` carried in `Task::config`.
    pub async fn list_tasks_by_type(&self, task_type: TaskType) -> PhoenixResult<Vec<Task>> {
        let type_str = enum_to_sql(&task_type);
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{SELECT_TASK} WHERE task_type = ?1 ORDER BY created_at"))?;
                let mut rows = stmt.query(rusqlite::params![type_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(map_err)
    }

    /// Used by the Deployment Manager's `GetStatus` to aggregate per-node
    /// task outcomes for a deployment.
    pub async fn list_tasks_for_deployment(&self, deployment_id: &str) -> PhoenixResult<Vec<Task>> {
        let deployment_id = deployment_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{SELECT_TASK} WHERE deployment_id = ?1 ORDER BY created_at"))?;
                let mut rows = stmt.query(rusqlite::params![deployment_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(map_err)
    }

    /// Atomically selects up to `max` `pending` tasks for `host_id`, ordered
    /// priority desc then created_at asc, and transitions them to
    /// `assigned` in the same transaction. Never returns the same task to
    /// two callers — concurrent claimers serialize on SQLite's writer lock.
    pub async fn claim_tasks(&self, host_id: &str, max: u32) -> PhoenixResult<Vec<Task>> {
        let host_id = host_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let ids: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM tasks WHERE host_id = ?1 AND status = 'pending'
                         ORDER BY priority DESC, created_at ASC LIMIT ?2",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![host_id, max])?;
                    let mut ids = Vec::new();
                    while let Some(row) = rows.next()? {
                        ids.push(row.get::<_, String>(0)?);
                    }
                    ids
                };

                let now = to_rfc3339(chrono::Utc::now());
                for id in &ids {
                    tx.execute(
                        "UPDATE tasks SET status = 'assigned', assigned_at = ?1 WHERE id = ?2",
                        rusqlite::params![now, id],
                    )?;
                }

                let mut claimed = Vec::with_capacity(ids.len());
                for id in &ids {
                    let mut stmt = tx.prepare(&format!("{SELECT_TASK} WHERE id = ?1"))?;
                    let mut rows = stmt.query(rusqlite::params![id])?;
                    if let Some(row) = rows.next()? {
                        claimed.push(row_to_task(row)?);
                    }
                }
                tx.commit()?;
                Ok(claimed)
            })
            .await
            .map_err(map_err)
    }

    /// Verifies host ownership, advances `status`, records `result`/`error`.
    /// Idempotent on repeated terminal writes: re-reporting `completed` for
    /// an already-`completed` task is accepted as a no-op rather than
    /// rejected, matching the queue's idempotency contract.
    pub async fn update_task_status_with_result(
        &self,
        task_id: &str,
        host_id: &str,
        new_status: TaskStatus,
        result: std::collections::HashMap<String, serde_json::Value>,
        error_message: Option<String>,
    ) -> PhoenixResult<Task> {
        let task_id = task_id.to_string();
        let host_id = host_id.to_string();
        let current = self.get_task(&task_id).await?;

        if current.host_id != host_id {
            return Err(PhoenixError::Forbidden(
                "task is not owned by this host".into(),
            ));
        }
        if current.status == new_status && current.status.is_terminal() {
            return Ok(current);
        }
        if !current.status.can_transition_to(&new_status) {
            return Err(PhoenixError::Conflict(format!(
                "illegal task transition {:?} -> {:?}",
                current.status, new_status
            )));
        }

        let now = to_rfc3339(chrono::Utc::now());
        let status_str = enum_to_sql(&new_status);
        let result_json = json_col(&result);
        let started_clause_now = if new_status == TaskStatus::Running {
            Some(now.clone())
        } else {
            None
        };
        let completed_clause_now = if new_status.is_terminal() {
            Some(now.clone())
        } else {
            None
        };

        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET status = ?1, result = ?2, error_message = ?3,
                        started_at = COALESCE(?4, started_at),
                        completed_at = COALESCE(?5, completed_at)
                     WHERE id = ?6",
                    rusqlite::params![
                        status_str,
                        result_json,
                        error_message,
                        started_clause_now,
                        completed_clause_now,
                        task_id
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)?;

        self.get_task(&current.id).await
    }

    /// Finds `assigned`/`running` tasks whose `assigned_at` is older than
    /// `stale_threshold_secs`: bumps `retry_count` and reverts them to
    /// `pending` if under `max_retries`, otherwise marks them `failed` with
    /// error `"stale"`. Returns the host ids that had at least one task
    /// reverted to `pending`, so callers can wake per-host waiters.
    pub async fn reap_stale_tasks(
        &self,
        stale_threshold_secs: i64,
        max_retries: u32,
    ) -> PhoenixResult<Vec<String>> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let cutoff = to_rfc3339(chrono::Utc::now() - chrono::Duration::seconds(stale_threshold_secs));

                let stale: Vec<(String, String, u32)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, host_id, retry_count FROM tasks
                         WHERE status IN ('assigned', 'running') AND assigned_at < ?1",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![cutoff])?;
                    let mut out = Vec::new();
                    while let Some(row) = rows.next()? {
                        out.push((row.get(0)?, row.get(1)?, row.get(2)?));
                    }
                    out
                };

                let mut woken_hosts = Vec::new();
                for (id, host_id, retry_count) in stale {
                    let next_retry = retry_count + 1;
                    if retry_count < max_retries {
                        tx.execute(
                            "UPDATE tasks SET status = 'pending', retry_count = ?1,
                                assigned_at = NULL, started_at = NULL
                             WHERE id = ?2",
                            rusqlite::params![next_retry, id],
                        )?;
                        woken_hosts.push(host_id);
                    } else {
                        tx.execute(
                            "UPDATE tasks SET status = 'failed', retry_count = ?1,
                                error_message = 'stale', completed_at = ?2
                             WHERE id = ?3",
                            rusqlite::params![next_retry, to_rfc3339(chrono::Utc::now()), id],
                        )?;
                    }
                }
                tx.commit()?;
                woken_hosts.sort();
                woken_hosts.dedup();
                Ok(woken_hosts)
            })
            .await
            .map_err(map_err)
    }

    /// Removes completed/failed tasks older than `retention_days`.
    pub async fn prune_completed_tasks(&self, retention_days: i64) -> PhoenixResult<u64> {
        let cutoff = to_rfc3339(chrono::Utc::now() - chrono::Duration::days(retention_days));
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM tasks WHERE status IN ('completed','failed') AND completed_at < ?1",
                    rusqlite::params![cutoff],
                )?;
                Ok(n as u64)
            })
            .await
            .map_err(map_err)
    }
}

fn insert_task(conn: &rusqlite::Connection, t: &Task) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO tasks
            (id, host_id, experiment_id, deployment_id, task_type, action, priority, status, config,
             created_at, assigned_at, started_at, completed_at, result, error_message, retry_count)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
        rusqlite::params![
            t.id,
            t.host_id,
            t.experiment_id,
            t.deployment_id,
            enum_to_sql(&t.task_type),
            enum_to_sql(&t.action),
            t.priority,
            enum_to_sql(&t.status),
            json_col(&t.config),
            to_rfc3339(t.created_at),
            t.assigned_at.map(to_rfc3339),
            t.started_at.map(to_rfc3339),
            t.completed_at.map(to_rfc3339),
            json_col(&t.result),
            t.error_message,
            t.retry_count,
        ],
    )?;
    Ok(())
}

const SELECT_TASK: &str = "SELECT id, host_id, experiment_id, deployment_id, task_type, action, priority, status,
    config, created_at, assigned_at, started_at, completed_at, result, error_message, retry_count
    FROM tasks";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let task_type_str: String = row.get(4)?;
    let action_str: String = row.get(5)?;
    let status_str: String = row.get(7)?;
    let config_str: String = row.get(8)?;
    let created_at_str: String = row.get(9)?;
    let assigned_at_str: Option<String> = row.get(10)?;
    let started_at_str: Option<String> = row.get(11)?;
    let completed_at_str: Option<String> = row.get(12)?;
    let result_str: String = row.get(13)?;

    Ok(Task {
        id: row.get(0)?,
        host_id: row.get(1)?,
        experiment_id: row.get(2)?,
        deployment_id: row.get(3)?,
        task_type: enum_from_sql::<TaskType>(&task_type_str),
        action: enum_from_sql::<TaskAction>(&action_str),
        priority: row.get(6)?,
        status: enum_from_sql::<TaskStatus>(&status_str),
        config: from_json_col(&config_str),
        created_at: from_rfc3339(&created_at_str),
        assigned_at: assigned_at_str.map(|s| from_rfc3339(&s)),
        started_at: started_at_str.map(|s| from_rfc3339(&s)),
        completed_at: completed_at_str.map(|s| from_rfc3339(&s)),
        result: from_json_col(&result_str),
        error_message: row.get(14)?,
        retry_count: row.get(15)?,
    })
}
