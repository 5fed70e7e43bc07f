//! Persistence for operator-registered pipeline templates. Built-in
//! templates live compiled into `phx-templates` and are never written
//! here; this table only remembers templates registered at runtime so a
//! restarted daemon recovers them.

use phx_core::{PhoenixError, PhoenixResult};
use rusqlite::OptionalExtension;

use crate::{from_rfc3339, map_err, to_rfc3339, Store};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredTemplate {
    pub name: String,
    pub source: String,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

impl Store {
    pub async fn register_template(&self, name: &str, source: &str) -> PhoenixResult<()> {
        let name = name.to_string();
        let source = source.to_string();
        let now = to_rfc3339(chrono::Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pipeline_templates (name, source, registered_at)
                     VALUES (?1,?2,?3)
                     ON CONFLICT(name) DO UPDATE SET source = excluded.source, registered_at = excluded.registered_at",
                    rusqlite::params![name, source, now],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }

    pub async fn get_registered_template(&self, name: &str) -> PhoenixResult<StoredTemplate> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT name, source, registered_at FROM pipeline_templates WHERE name = ?1",
                    rusqlite::params![name],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()
            })
            .await
            .map_err(map_err)?
            .map(|(name, source, registered_at)| StoredTemplate {
                name,
                source,
                registered_at: from_rfc3339(&registered_at),
            })
            .ok_or_else(|| PhoenixError::not_found("template not found"))
    }

    pub async fn list_registered_templates(&self) -> PhoenixResult<Vec<StoredTemplate>> {
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT name, source, registered_at FROM pipeline_templates ORDER BY name")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ));
                }
                Ok(out)
            })
            .await
            .map_err(map_err)?
            .into_iter()
            .map(|(name, source, registered_at)| {
                Ok(StoredTemplate {
                    name,
                    source,
                    registered_at: from_rfc3339(&registered_at),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        store.register_template("custom", "receivers: {}").await.unwrap();
        let t = store.get_registered_template("custom").await.unwrap();
        assert_eq!(t.source, "receivers: {}");
    }

    #[tokio::test]
    async fn re_registering_overwrites_source() {
        let store = Store::open_in_memory().await.unwrap();
        store.register_template("custom", "v1").await.unwrap();
        store.register_template("custom", "v2").await.unwrap();
        let t = store.get_registered_template("custom").await.unwrap();
        assert_eq!(t.source, "v2");
        let all = store.list_registered_templates().await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
