use phx_core::types::{Agent, AgentStatus, ResourceUsage};
use phx_core::{PhoenixError, PhoenixResult};
use rusqlite::Row;

use crate::{enum_from_sql, enum_to_sql, from_json_col, from_rfc3339, json_col, map_err, to_rfc3339, Store};

impl Store {
    /// Inserts or fully overwrites the agent row for `host_id`.
    pub async fn upsert_agent(&self, agent: &Agent) -> PhoenixResult<()> {
        let a = agent.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents
                        (host_id, hostname, ip, agent_version, capabilities, active_tasks,
                         resource_usage, last_heartbeat, status, location)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
                     ON CONFLICT(host_id) DO UPDATE SET
                        hostname=excluded.hostname, ip=excluded.ip,
                        agent_version=excluded.agent_version, capabilities=excluded.capabilities,
                        active_tasks=excluded.active_tasks, resource_usage=excluded.resource_usage,
                        last_heartbeat=excluded.last_heartbeat, status=excluded.status,
                        location=excluded.location",
                    rusqlite::params![
                        a.host_id,
                        a.hostname,
                        a.ip,
                        a.agent_version,
                        json_col(&a.capabilities),
                        json_col(&a.active_tasks),
                        json_col(&a.resource_usage),
                        to_rfc3339(a.last_heartbeat),
                        enum_to_sql(&a.status),
                        a.location,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }

    pub async fn get_agent(&self, host_id: &str) -> PhoenixResult<Agent> {
        let host_id = host_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_AGENT} WHERE host_id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![host_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(map_err)?
            .ok_or_else(|| PhoenixError::not_found("agent not found"))
    }

    pub async fn list_agents(&self) -> PhoenixResult<Vec<Agent>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_AGENT} ORDER BY host_id"))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(map_err)
    }

    /// Marks every agent whose `last_heartbeat` is older than
    /// `heartbeat_expiry_secs` as `offline`. Returns the set of host ids
    /// that flipped, so the reaper can fold their tasks into the stale
    /// sweep even before the task-level threshold elapses.
    pub async fn mark_expired_agents_offline(&self, heartbeat_expiry_secs: i64) -> PhoenixResult<Vec<String>> {
        let cutoff = to_rfc3339(chrono::Utc::now() - chrono::Duration::seconds(heartbeat_expiry_secs));
        self.conn
            .call(move |conn| {
                let host_ids: Vec<String> = {
                    let mut stmt = conn.prepare(
                        "SELECT host_id FROM agents WHERE last_heartbeat < ?1 AND status != 'offline'",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![cutoff])?;
                    let mut out = Vec::new();
                    while let Some(row) = rows.next()? {
                        out.push(row.get(0)?);
                    }
                    out
                };
                conn.execute(
                    "UPDATE agents SET status = 'offline' WHERE last_heartbeat < ?1 AND status != 'offline'",
                    rusqlite::params![cutoff],
                )?;
                Ok(host_ids)
            })
            .await
            .map_err(map_err)
    }
}

const SELECT_AGENT: &str = "SELECT host_id, hostname, ip, agent_version, capabilities,
    active_tasks, resource_usage, last_heartbeat, status, location FROM agents";

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let capabilities_str: String = row.get(4)?;
    let active_tasks_str: String = row.get(5)?;
    let resource_usage_str: String = row.get(6)?;
    let last_heartbeat_str: String = row.get(7)?;
    let status_str: String = row.get(8)?;

    Ok(Agent {
        host_id: row.get(0)?,
        hostname: row.get(1)?,
        ip: row.get(2)?,
        agent_version: row.get(3)?,
        capabilities: from_json_col(&capabilities_str),
        active_tasks: from_json_col(&active_tasks_str),
        resource_usage: from_json_col::<ResourceUsage>(&resource_usage_str),
        last_heartbeat: from_rfc3339(&last_heartbeat_str),
        status: enum_from_sql::<AgentStatus>(&status_str),
        location: row.get(9)?,
    })
}
