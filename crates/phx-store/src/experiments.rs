use phx_core::types::{Experiment, ExperimentConfig, ExperimentPhase, ExperimentStatus};
use phx_core::{PhoenixError, PhoenixResult};
use rusqlite::Row;

use crate::{enum_from_sql, enum_to_sql, from_json_col, from_rfc3339, json_col, map_err, to_rfc3339, Store};

impl Store {
    pub async fn create_experiment(&self, experiment: &Experiment) -> PhoenixResult<()> {
        let e = experiment.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO experiments
                        (id, name, description, phase, config, status, metadata, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        e.id,
                        e.name,
                        e.description,
                        enum_to_sql(&e.phase),
                        json_col(&e.config),
                        json_col(&e.status),
                        json_col(&e.metadata),
                        to_rfc3339(e.created_at),
                        to_rfc3339(e.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }

    pub async fn get_experiment(&self, id: &str) -> PhoenixResult<Experiment> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, phase, config, status, metadata, created_at, updated_at
                     FROM experiments WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_experiment(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(map_err)?
            .ok_or_else(|| PhoenixError::not_found("experiment not found"))
    }

    pub async fn list_experiments(&self, phase: Option<ExperimentPhase>) -> PhoenixResult<Vec<Experiment>> {
        self.conn
            .call(move |conn| {
                let mut out = Vec::new();
                if let Some(phase) = phase {
                    let phase_str = enum_to_sql(&phase);
                    let mut stmt = conn.prepare(
                        "SELECT id, name, description, phase, config, status, metadata, created_at, updated_at
                         FROM experiments WHERE phase = ?1 ORDER BY created_at DESC",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![phase_str])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_experiment(row)?);
                    }
                } else {
                    let mut stmt = conn.prepare(
                        "SELECT id, name, description, phase, config, status, metadata, created_at, updated_at
                         FROM experiments ORDER BY created_at DESC",
                    )?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_experiment(row)?);
                    }
                }
                Ok(out)
            })
            .await
            .map_err(map_err)
    }

    /// Writes the experiment's phase unconditionally. Callers are
    /// responsible for checking `ExperimentPhase::can_transition_to` first;
    /// the Experiment Controller serializes this per experiment so the
    /// check-then-act is safe under its own lock.
    pub async fn set_experiment_phase(&self, id: &str, phase: ExperimentPhase) -> PhoenixResult<()> {
        let id = id.to_string();
        let now = to_rfc3339(chrono::Utc::now());
        let phase_str = enum_to_sql(&phase);
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE experiments SET phase = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![phase_str, now, id],
                )?)
            })
            .await
            .map_err(map_err)?;
        if changed == 0 {
            return Err(PhoenixError::not_found("experiment not found"));
        }
        Ok(())
    }

    pub async fn update_experiment_status(
        &self,
        id: &str,
        status: ExperimentStatus,
    ) -> PhoenixResult<()> {
        let id = id.to_string();
        let now = to_rfc3339(chrono::Utc::now());
        let status_json = json_col(&status);
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE experiments SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![status_json, now, id],
                )?)
            })
            .await
            .map_err(map_err)?;
        if changed == 0 {
            return Err(PhoenixError::not_found("experiment not found"));
        }
        Ok(())
    }

    pub async fn update_experiment_metadata(
        &self,
        id: &str,
        metadata: std::collections::HashMap<String, serde_json::Value>,
    ) -> PhoenixResult<()> {
        let id = id.to_string();
        let now = to_rfc3339(chrono::Utc::now());
        let metadata_json = json_col(&metadata);
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE experiments SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![metadata_json, now, id],
                )?)
            })
            .await
            .map_err(map_err)?;
        if changed == 0 {
            return Err(PhoenixError::not_found("experiment not found"));
        }
        Ok(())
    }
}

fn row_to_experiment(row: &Row<'_>) -> rusqlite::Result<Experiment> {
    let phase_str: String = row.get(3)?;
    let config_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let metadata_str: String = row.get(6)?;
    let created_at_str: String = row.get(7)?;
    let updated_at_str: String = row.get(8)?;

    Ok(Experiment {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        phase: enum_from_sql(&phase_str),
        config: from_json_col::<ExperimentConfig>(&config_str),
        status: from_json_col::<ExperimentStatus>(&status_str),
        metadata: from_json_col(&metadata_str),
        created_at: from_rfc3339(&created_at_str),
        updated_at: from_rfc3339(&updated_at_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use phx_core::types::ExperimentConfig;
    use std::collections::HashMap;

    fn sample_config() -> ExperimentConfig {
        ExperimentConfig {
            target_hosts: vec!["h1".into(), "h2".into()],
            baseline_template: "baseline".into(),
            baseline_variables: HashMap::new(),
            candidate_template: "topk".into(),
            candidate_variables: HashMap::new(),
            load_profile: None,
            duration_secs: 300,
            warmup_duration_secs: 60,
            critical_processes: vec![],
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        let exp = Experiment::new("exp1", sample_config());
        store.create_experiment(&exp).await.unwrap();
        let fetched = store.get_experiment(&exp.id).await.unwrap();
        assert_eq!(fetched.name, "exp1");
        assert_eq!(fetched.phase, ExperimentPhase::Created);
        assert_eq!(fetched.config.target_hosts, vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn get_missing_experiment_is_not_found() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store.get_experiment("missing").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn set_phase_persists_and_rejects_missing_id() {
        let store = Store::open_in_memory().await.unwrap();
        let exp = Experiment::new("exp1", sample_config());
        store.create_experiment(&exp).await.unwrap();
        store
            .set_experiment_phase(&exp.id, ExperimentPhase::Deploying)
            .await
            .unwrap();
        let fetched = store.get_experiment(&exp.id).await.unwrap();
        assert_eq!(fetched.phase, ExperimentPhase::Deploying);

        let err = store
            .set_experiment_phase("missing", ExperimentPhase::Deploying)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn list_filters_by_phase() {
        let store = Store::open_in_memory().await.unwrap();
        let e1 = Experiment::new("exp1", sample_config());
        let mut e2 = Experiment::new("exp2", sample_config());
        e2.phase = ExperimentPhase::Running;
        store.create_experiment(&e1).await.unwrap();
        store.create_experiment(&e2).await.unwrap();

        let all = store.list_experiments(None).await.unwrap();
        assert_eq!(all.len(), 2);
        let running = store
            .list_experiments(Some(ExperimentPhase::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, e2.id);
    }
}
