use phx_core::types::{ExperimentEvent, ExperimentPhase};
use phx_core::PhoenixResult;
use rusqlite::Row;

use crate::{enum_from_sql, enum_to_sql, from_json_col, from_rfc3339, json_col, map_err, to_rfc3339, Store};

impl Store {
    pub async fn append_experiment_event(&self, event: &ExperimentEvent) -> PhoenixResult<()> {
        let e = event.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO experiment_events
                        (id, experiment_id, event_type, phase, message, metadata, timestamp)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![
                        e.id,
                        e.experiment_id,
                        e.event_type,
                        enum_to_sql(&e.phase),
                        e.message,
                        json_col(&e.metadata),
                        to_rfc3339(e.timestamp),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }

    pub async fn list_experiment_events(&self, experiment_id: &str) -> PhoenixResult<Vec<ExperimentEvent>> {
        let experiment_id = experiment_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_EVENT} WHERE experiment_id = ?1 ORDER BY timestamp"
                ))?;
                let mut rows = stmt.query(rusqlite::params![experiment_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_event(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(map_err)
    }

    pub async fn prune_old_events(&self, retention_days: i64) -> PhoenixResult<u64> {
        let cutoff = to_rfc3339(chrono::Utc::now() - chrono::Duration::days(retention_days));
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM experiment_events WHERE timestamp < ?1",
                    rusqlite::params![cutoff],
                )?;
                Ok(n as u64)
            })
            .await
            .map_err(map_err)
    }
}

const SELECT_EVENT: &str =
    "SELECT id, experiment_id, event_type, phase, message, metadata, timestamp FROM experiment_events";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<ExperimentEvent> {
    let phase_str: String = row.get(3)?;
    let metadata_str: String = row.get(5)?;
    let timestamp_str: String = row.get(6)?;

    Ok(ExperimentEvent {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        event_type: row.get(2)?,
        phase: enum_from_sql::<ExperimentPhase>(&phase_str),
        message: row.get(4)?,
        metadata: from_json_col(&metadata_str),
        timestamp: from_rfc3339(&timestamp_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_appended_in_order() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .append_experiment_event(&ExperimentEvent::new("exp1", "experiment_started", ExperimentPhase::Deploying, "started"))
            .await
            .unwrap();
        store
            .append_experiment_event(&ExperimentEvent::new("exp1", "experiment_phase_updated", ExperimentPhase::Running, "running"))
            .await
            .unwrap();
        let events = store.list_experiment_events("exp1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "experiment_started");
        assert_eq!(events[1].event_type, "experiment_phase_updated");
    }
}
