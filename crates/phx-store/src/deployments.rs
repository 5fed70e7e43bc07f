use phx_core::types::{DeploymentInstanceCounts, DeploymentStatus, DeploymentVersion, PipelineDeployment};
use phx_core::{PhoenixError, PhoenixResult};
use rusqlite::Row;

use crate::{enum_from_sql, enum_to_sql, from_json_col, from_rfc3339, json_col, map_err, to_rfc3339, Store};

impl Store {
    pub async fn create_deployment(&self, deployment: &PipelineDeployment) -> PhoenixResult<()> {
        let d = deployment.clone();
        self.conn
            .call(move |conn| {
                insert_deployment(conn, &d)?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }

    pub async fn get_deployment(&self, id: &str) -> PhoenixResult<PipelineDeployment> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_DEPLOYMENT} WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_deployment(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(map_err)?
            .ok_or_else(|| PhoenixError::not_found("deployment not found"))
    }

    /// Lists non-deleted deployments, optionally filtered by namespace,
    /// template name, and status, with simple offset pagination.
    pub async fn list_deployments(
        &self,
        namespace: Option<String>,
        template_name: Option<String>,
        status: Option<DeploymentStatus>,
        page: u32,
        page_size: u32,
    ) -> PhoenixResult<Vec<PipelineDeployment>> {
        self.conn
            .call(move |conn| {
                let mut sql = format!("{SELECT_DEPLOYMENT} WHERE deleted_at IS NULL");
                let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                if let Some(ns) = &namespace {
                    sql.push_str(" AND namespace = ?");
                    params.push(Box::new(ns.clone()));
                }
                if let Some(t) = &template_name {
                    sql.push_str(" AND template_name = ?");
                    params.push(Box::new(t.clone()));
                }
                if let Some(s) = &status {
                    sql.push_str(" AND status = ?");
                    params.push(Box::new(enum_to_sql(s)));
                }
                sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
                params.push(Box::new(page_size as i64));
                params.push(Box::new((page.saturating_sub(1) * page_size) as i64));

                let mut stmt = conn.prepare(&sql)?;
                let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
                let mut rows = stmt.query(param_refs.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_deployment(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(map_err)
    }

    pub async fn update_deployment_parameters(
        &self,
        id: &str,
        parameters: std::collections::HashMap<String, serde_json::Value>,
    ) -> PhoenixResult<()> {
        let id = id.to_string();
        let now = to_rfc3339(chrono::Utc::now());
        let params_json = json_col(&parameters);
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE pipeline_deployments SET parameters = ?1, updated_at = ?2 WHERE id = ?3 AND deleted_at IS NULL",
                    rusqlite::params![params_json, now, id],
                )?)
            })
            .await
            .map_err(map_err)?;
        if changed == 0 {
            return Err(PhoenixError::not_found("deployment not found"));
        }
        Ok(())
    }

    pub async fn update_deployment_status(
        &self,
        id: &str,
        status: DeploymentStatus,
        phase: &str,
    ) -> PhoenixResult<()> {
        let id = id.to_string();
        let now = to_rfc3339(chrono::Utc::now());
        let status_str = enum_to_sql(&status);
        let phase = phase.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE pipeline_deployments SET status = ?1, phase = ?2, updated_at = ?3 WHERE id = ?4",
                    rusqlite::params![status_str, phase, now, id],
                )?)
            })
            .await
            .map_err(map_err)?;
        if changed == 0 {
            return Err(PhoenixError::not_found("deployment not found"));
        }
        Ok(())
    }

    pub async fn update_deployment_instances(
        &self,
        id: &str,
        instances: DeploymentInstanceCounts,
    ) -> PhoenixResult<()> {
        let id = id.to_string();
        let now = to_rfc3339(chrono::Utc::now());
        let instances_json = json_col(&instances);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE pipeline_deployments SET instances = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![instances_json, now, id],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }

    pub async fn soft_delete_deployment(&self, id: &str) -> PhoenixResult<()> {
        let id = id.to_string();
        let now = to_rfc3339(chrono::Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE pipeline_deployments SET deleted_at = ?1, status = 'deleting', phase = 'terminating', updated_at = ?1
                     WHERE id = ?2 AND deleted_at IS NULL",
                    rusqlite::params![now, id],
                )?)
            })
            .await
            .map_err(map_err)?;
        if changed == 0 {
            return Err(PhoenixError::not_found("deployment not found"));
        }
        Ok(())
    }

    /// Inside one transaction: computes `max(version)+1`, inserts the new
    /// `DeploymentVersion` row, and updates the deployment's
    /// `current_version`/`updated_at`. Returns the new version number.
    pub async fn record_deployment_version(
        &self,
        deployment_id: &str,
        pipeline_config: String,
        parameters_snapshot: std::collections::HashMap<String, serde_json::Value>,
        deployed_by: String,
        status: DeploymentStatus,
        rollback_from_version: Option<i64>,
        notes: Option<String>,
    ) -> PhoenixResult<i64> {
        let deployment_id = deployment_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

                let exists: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM pipeline_deployments WHERE id = ?1",
                    rusqlite::params![deployment_id],
                    |r| r.get(0),
                )?;
                if exists == 0 {
                    return Err(rusqlite::Error::QueryReturnedNoRows);
                }

                let next_version: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM deployment_versions WHERE deployment_id = ?1",
                    rusqlite::params![deployment_id],
                    |r| r.get(0),
                )?;

                let now = to_rfc3339(chrono::Utc::now());
                tx.execute(
                    "INSERT INTO deployment_versions
                        (deployment_id, version, pipeline_config, parameters_snapshot,
                         deployed_by, deployed_at, status, rollback_from_version, notes)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        deployment_id,
                        next_version,
                        pipeline_config,
                        json_col(&parameters_snapshot),
                        deployed_by,
                        now,
                        enum_to_sql(&status),
                        rollback_from_version,
                        notes,
                    ],
                )?;

                tx.execute(
                    "UPDATE pipeline_deployments SET current_version = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![next_version, now, deployment_id],
                )?;

                tx.commit()?;
                Ok(next_version)
            })
            .await
            .map_err(|e| match e {
                tokio_rusqlite::Error::Rusqlite(rusqlite::Error::QueryReturnedNoRows) => {
                    PhoenixError::not_found("deployment not found")
                }
                other => map_err(other),
            })
    }

    /// Reads the `target_version` row (fails if missing), inserts a new
    /// `DeploymentVersion` copying its pipeline/parameters with
    /// `rollback_from_version = target_version`, and updates
    /// `current_version` to the new row's version.
    pub async fn rollback_deployment_version(
        &self,
        deployment_id: &str,
        target_version: i64,
        deployed_by: String,
    ) -> PhoenixResult<i64> {
        let deployment_id = deployment_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

                let (pipeline_config, parameters_snapshot): (String, String) = tx
                    .query_row(
                        "SELECT pipeline_config, parameters_snapshot FROM deployment_versions
                         WHERE deployment_id = ?1 AND version = ?2",
                        rusqlite::params![deployment_id, target_version],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .map_err(|_| rusqlite::Error::QueryReturnedNoRows)?;

                let next_version: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM deployment_versions WHERE deployment_id = ?1",
                    rusqlite::params![deployment_id],
                    |r| r.get(0),
                )?;

                let now = to_rfc3339(chrono::Utc::now());
                tx.execute(
                    "INSERT INTO deployment_versions
                        (deployment_id, version, pipeline_config, parameters_snapshot,
                         deployed_by, deployed_at, status, rollback_from_version, notes)
                     VALUES (?1,?2,?3,?4,?5,?6,'pending',?7,NULL)",
                    rusqlite::params![
                        deployment_id,
                        next_version,
                        pipeline_config,
                        parameters_snapshot,
                        deployed_by,
                        now,
                        target_version,
                    ],
                )?;

                tx.execute(
                    "UPDATE pipeline_deployments SET current_version = ?1, status = 'rolling_back', updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![next_version, now, deployment_id],
                )?;

                tx.commit()?;
                Ok(next_version)
            })
            .await
            .map_err(|e| match e {
                tokio_rusqlite::Error::Rusqlite(rusqlite::Error::QueryReturnedNoRows) => {
                    PhoenixError::not_found("target deployment version not found")
                }
                other => map_err(other),
            })
    }

    pub async fn get_deployment_version(
        &self,
        deployment_id: &str,
        version: i64,
    ) -> PhoenixResult<DeploymentVersion> {
        let deployment_id = deployment_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_VERSION} WHERE deployment_id = ?1 AND version = ?2"))?;
                let mut rows = stmt.query(rusqlite::params![deployment_id, version])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_version(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(map_err)?
            .ok_or_else(|| PhoenixError::not_found("deployment version not found"))
    }

    pub async fn list_deployment_versions(&self, deployment_id: &str) -> PhoenixResult<Vec<DeploymentVersion>> {
        let deployment_id = deployment_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_VERSION} WHERE deployment_id = ?1 ORDER BY version"))?;
                let mut rows = stmt.query(rusqlite::params![deployment_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_version(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(map_err)
    }
}

fn insert_deployment(conn: &rusqlite::Connection, d: &PipelineDeployment) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO pipeline_deployments
            (id, name, namespace, template_name, target_nodes, parameters, resource_requirements,
             status, phase, instances, metrics_snapshot, current_version, created_at, updated_at, deleted_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
        rusqlite::params![
            d.id,
            d.name,
            d.namespace,
            d.template_name,
            json_col(&d.target_nodes),
            json_col(&d.parameters),
            json_col(&d.resource_requirements),
            enum_to_sql(&d.status),
            d.phase,
            json_col(&d.instances),
            json_col(&d.metrics_snapshot),
            d.current_version,
            to_rfc3339(d.created_at),
            to_rfc3339(d.updated_at),
            d.deleted_at.map(to_rfc3339),
        ],
    )?;
    Ok(())
}

const SELECT_DEPLOYMENT: &str = "SELECT id, name, namespace, template_name, target_nodes, parameters,
    resource_requirements, status, phase, instances, metrics_snapshot, current_version,
    created_at, updated_at, deleted_at FROM pipeline_deployments";

fn row_to_deployment(row: &Row<'_>) -> rusqlite::Result<PipelineDeployment> {
    let target_nodes_str: String = row.get(4)?;
    let parameters_str: String = row.get(5)?;
    let resource_requirements_str: String = row.get(6)?;
    let status_str: String = row.get(7)?;
    let instances_str: String = row.get(9)?;
    let metrics_snapshot_str: String = row.get(10)?;
    let created_at_str: String = row.get(12)?;
    let updated_at_str: String = row.get(13)?;
    let deleted_at_str: Option<String> = row.get(14)?;

    Ok(PipelineDeployment {
        id: row.get(0)?,
        name: row.get(1)?,
        namespace: row.get(2)?,
        template_name: row.get(3)?,
        target_nodes: from_json_col(&target_nodes_str),
        parameters: from_json_col(&parameters_str),
        resource_requirements: from_json_col(&resource_requirements_str),
        status: enum_from_sql::<DeploymentStatus>(&status_str),
        phase: row.get(8)?,
        instances: from_json_col(&instances_str),
        metrics_snapshot: from_json_col(&metrics_snapshot_str),
        current_version: row.get(11)?,
        created_at: from_rfc3339(&created_at_str),
        updated_at: from_rfc3339(&updated_at_str),
        deleted_at: deleted_at_str.map(|s| from_rfc3339(&s)),
    })
}

const SELECT_VERSION: &str = "SELECT deployment_id, version, pipeline_config, parameters_snapshot,
    deployed_by, deployed_at, status, rollback_from_version, notes FROM deployment_versions";

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<DeploymentVersion> {
    let parameters_snapshot_str: String = row.get(3)?;
    let deployed_at_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;

    Ok(DeploymentVersion {
        deployment_id: row.get(0)?,
        version: row.get(1)?,
        pipeline_config: row.get(2)?,
        parameters_snapshot: from_json_col(&parameters_snapshot_str),
        deployed_by: row.get(4)?,
        deployed_at: from_rfc3339(&deployed_at_str),
        status: enum_from_sql::<DeploymentStatus>(&status_str),
        rollback_from_version: row.get(7)?,
        notes: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn versions_are_gap_free_and_start_at_one() {
        let store = Store::open_in_memory().await.unwrap();
        let d = PipelineDeployment::new("d1", "default", "baseline");
        store.create_deployment(&d).await.unwrap();

        let v1 = store
            .record_deployment_version(&d.id, "cfg-v1".into(), Default::default(), "op".into(), DeploymentStatus::Ready, None, None)
            .await
            .unwrap();
        let v2 = store
            .record_deployment_version(&d.id, "cfg-v2".into(), Default::default(), "op".into(), DeploymentStatus::Ready, None, None)
            .await
            .unwrap();
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);

        let fetched = store.get_deployment(&d.id).await.unwrap();
        assert_eq!(fetched.current_version, 2);
        let versions = store.list_deployment_versions(&d.id).await.unwrap();
        assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn rollback_creates_new_row_and_preserves_target() {
        let store = Store::open_in_memory().await.unwrap();
        let d = PipelineDeployment::new("d1", "default", "baseline");
        store.create_deployment(&d).await.unwrap();
        store
            .record_deployment_version(&d.id, "cfg-v1".into(), Default::default(), "op".into(), DeploymentStatus::Ready, None, None)
            .await
            .unwrap();
        store
            .record_deployment_version(&d.id, "cfg-v2".into(), Default::default(), "op".into(), DeploymentStatus::Ready, None, None)
            .await
            .unwrap();
        store
            .record_deployment_version(&d.id, "cfg-v3".into(), Default::default(), "op".into(), DeploymentStatus::Ready, None, None)
            .await
            .unwrap();

        let new_version = store
            .rollback_deployment_version(&d.id, 2, "op".into())
            .await
            .unwrap();
        assert_eq!(new_version, 4);

        let rolled = store.get_deployment_version(&d.id, 4).await.unwrap();
        assert_eq!(rolled.rollback_from_version, Some(2));
        assert_eq!(rolled.pipeline_config, "cfg-v2");

        let target = store.get_deployment_version(&d.id, 2).await.unwrap();
        assert_eq!(target.pipeline_config, "cfg-v2");

        let deployment = store.get_deployment(&d.id).await.unwrap();
        assert_eq!(deployment.current_version, 4);
    }

    #[tokio::test]
    async fn rollback_missing_target_version_is_not_found() {
        let store = Store::open_in_memory().await.unwrap();
        let d = PipelineDeployment::new("d1", "default", "baseline");
        store.create_deployment(&d).await.unwrap();
        let err = store
            .rollback_deployment_version(&d.id, 99, "op".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
