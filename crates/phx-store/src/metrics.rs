use phx_core::types::{MetricSample, Variant};
use phx_core::PhoenixResult;
use rusqlite::{OptionalExtension, Row};

use crate::{enum_from_sql, enum_to_sql, from_json_col, from_rfc3339, json_col, map_err, to_rfc3339, Store};

impl Store {
    pub async fn write_metric_samples(&self, samples: Vec<MetricSample>) -> PhoenixResult<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for s in &samples {
                    tx.execute(
                        "INSERT INTO metric_cache
                            (experiment_id, timestamp, metric_name, variant, host_id, value, labels)
                         VALUES (?1,?2,?3,?4,?5,?6,?7)",
                        rusqlite::params![
                            s.experiment_id,
                            to_rfc3339(s.timestamp),
                            s.metric_name,
                            enum_to_sql(&s.variant),
                            s.host_id,
                            s.value,
                            json_col(&s.labels),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }

    /// Latest sample for `metric_name`/`variant` at or before `at`, across
    /// all hosts of the experiment — used by the KPI analyser's
    /// range-end snapshot.
    pub async fn latest_metric_value(
        &self,
        experiment_id: &str,
        metric_name: &str,
        variant: Variant,
        at: chrono::DateTime<chrono::Utc>,
    ) -> PhoenixResult<Option<f64>> {
        let experiment_id = experiment_id.to_string();
        let metric_name = metric_name.to_string();
        let variant_str = enum_to_sql(&variant);
        let at_str = to_rfc3339(at);
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT value FROM metric_cache
                     WHERE experiment_id = ?1 AND metric_name = ?2 AND variant = ?3 AND timestamp <= ?4
                     ORDER BY timestamp DESC LIMIT 1",
                    rusqlite::params![experiment_id, metric_name, variant_str, at_str],
                    |r| r.get(0),
                )
                .optional()
            })
            .await
            .map_err(map_err)
    }

    /// Counts distinct `metric_name` values present for `variant` in the
    /// given window — the cardinality signal in the KPI analyser.
    pub async fn distinct_series_count(
        &self,
        experiment_id: &str,
        variant: Variant,
        since: chrono::DateTime<chrono::Utc>,
    ) -> PhoenixResult<u64> {
        let experiment_id = experiment_id.to_string();
        let variant_str = enum_to_sql(&variant);
        let since_str = to_rfc3339(since);
        self.conn
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(DISTINCT metric_name || '|' || host_id || '|' || labels) FROM metric_cache
                     WHERE experiment_id = ?1 AND variant = ?2 AND timestamp >= ?3",
                    rusqlite::params![experiment_id, variant_str, since_str],
                    |r| r.get(0),
                )?;
                Ok(n as u64)
            })
            .await
            .map_err(map_err)
    }

    pub async fn list_recent_samples(
        &self,
        experiment_id: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> PhoenixResult<Vec<MetricSample>> {
        let experiment_id = experiment_id.to_string();
        let since_str = to_rfc3339(since);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT experiment_id, timestamp, metric_name, variant, host_id, value, labels
                     FROM metric_cache WHERE experiment_id = ?1 AND timestamp >= ?2 ORDER BY timestamp",
                )?;
                let mut rows = stmt.query(rusqlite::params![experiment_id, since_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_sample(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(map_err)
    }

    pub async fn prune_metric_cache(&self, retention_days: i64) -> PhoenixResult<u64> {
        let cutoff = to_rfc3339(chrono::Utc::now() - chrono::Duration::days(retention_days));
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM metric_cache WHERE timestamp < ?1",
                    rusqlite::params![cutoff],
                )?;
                Ok(n as u64)
            })
            .await
            .map_err(map_err)
    }
}

fn row_to_sample(row: &Row<'_>) -> rusqlite::Result<MetricSample> {
    let timestamp_str: String = row.get(1)?;
    let variant_str: String = row.get(3)?;
    let labels_str: String = row.get(6)?;

    Ok(MetricSample {
        experiment_id: row.get(0)?,
        timestamp: from_rfc3339(&timestamp_str),
        metric_name: row.get(2)?,
        variant: enum_from_sql::<Variant>(&variant_str),
        host_id: row.get(4)?,
        value: row.get(5)?,
        labels: from_json_col(&labels_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn writes_and_reads_latest_value() {
        let store = Store::open_in_memory().await.unwrap();
        let now = chrono::Utc::now();
        store
            .write_metric_samples(vec![
                MetricSample {
                    experiment_id: "exp1".into(),
                    timestamp: now - chrono::Duration::seconds(30),
                    metric_name: "cpu".into(),
                    variant: Variant::Baseline,
                    host_id: "h1".into(),
                    value: 10.0,
                    labels: HashMap::new(),
                },
                MetricSample {
                    experiment_id: "exp1".into(),
                    timestamp: now,
                    metric_name: "cpu".into(),
                    variant: Variant::Baseline,
                    host_id: "h1".into(),
                    value: 12.0,
                    labels: HashMap::new(),
                },
            ])
            .await
            .unwrap();

        let latest = store
            .latest_metric_value("exp1", "cpu", Variant::Baseline, now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(latest, Some(12.0));
    }

    #[tokio::test]
    async fn distinct_series_count_reflects_cardinality() {
        let store = Store::open_in_memory().await.unwrap();
        let now = chrono::Utc::now();
        store
            .write_metric_samples(vec![
                MetricSample {
                    experiment_id: "exp1".into(),
                    timestamp: now,
                    metric_name: "http_requests".into(),
                    variant: Variant::Baseline,
                    host_id: "h1".into(),
                    value: 1.0,
                    labels: HashMap::new(),
                },
                MetricSample {
                    experiment_id: "exp1".into(),
                    timestamp: now,
                    metric_name: "http_duration".into(),
                    variant: Variant::Baseline,
                    host_id: "h1".into(),
                    value: 1.0,
                    labels: HashMap::new(),
                },
            ])
            .await
            .unwrap();
        let count = store
            .distinct_series_count("exp1", Variant::Baseline, now - chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
