use phx_core::types::{TokenBlacklistEntry, User, UserRole};
use phx_core::{PhoenixError, PhoenixResult};
use rusqlite::{OptionalExtension, Row};

use crate::{enum_from_sql, enum_to_sql, from_rfc3339, map_err, to_rfc3339, Store};

impl Store {
    pub async fn create_user(&self, user: &User) -> PhoenixResult<()> {
        let u = user.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (id, username, password_hash, role, created_at)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![
                        u.id,
                        u.username,
                        u.password_hash,
                        enum_to_sql(&u.role),
                        to_rfc3339(u.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }

    pub async fn get_user_by_username(&self, username: &str) -> PhoenixResult<User> {
        let username = username.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, username, password_hash, role, created_at FROM users WHERE username = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![username])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_user(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(map_err)?
            .ok_or_else(|| PhoenixError::not_found("user not found"))
    }

    pub async fn get_user_by_id(&self, id: &str) -> PhoenixResult<User> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, username, password_hash, role, created_at FROM users WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_user(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(map_err)?
            .ok_or_else(|| PhoenixError::not_found("user not found"))
    }

    pub async fn blacklist_token(&self, entry: &TokenBlacklistEntry) -> PhoenixResult<()> {
        let e = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO token_blacklist (jti, user_id, expires_at, reason)
                     VALUES (?1,?2,?3,?4)
                     ON CONFLICT(jti) DO UPDATE SET reason = excluded.reason",
                    rusqlite::params![e.jti, e.user_id, to_rfc3339(e.expires_at), e.reason],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }

    pub async fn is_token_blacklisted(&self, jti: &str) -> PhoenixResult<bool> {
        let jti = jti.to_string();
        self.conn
            .call(move |conn| {
                let expires_at: Option<String> = conn
                    .query_row(
                        "SELECT expires_at FROM token_blacklist WHERE jti = ?1",
                        rusqlite::params![jti],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(match expires_at {
                    None => false,
                    Some(raw) => from_rfc3339(&raw) > chrono::Utc::now(),
                })
            })
            .await
            .map_err(map_err)
    }

    /// Deletes blacklist rows whose `expires_at` has passed. A token past
    /// its own expiry no longer needs blacklisting — its signature check
    /// would already fail — so this is a pure space reclamation step.
    pub async fn cleanup_expired_tokens(&self) -> PhoenixResult<u64> {
        let now = to_rfc3339(chrono::Utc::now());
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM token_blacklist WHERE expires_at < ?1",
                    rusqlite::params![now],
                )?;
                Ok(n as u64)
            })
            .await
            .map_err(map_err)
    }
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let role_str: String = row.get(3)?;
    let created_at_str: String = row.get(4)?;
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        role: enum_from_sql::<UserRole>(&role_str),
        created_at: from_rfc3339(&created_at_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blacklisted_token_is_reported_until_cleanup() {
        let store = Store::open_in_memory().await.unwrap();
        let entry = TokenBlacklistEntry {
            jti: "jti1".into(),
            user_id: "u1".into(),
            expires_at: chrono::Utc::now() - chrono::Duration::seconds(1),
            reason: "logout".into(),
        };
        store.blacklist_token(&entry).await.unwrap();

        // expires_at already in the past: not blacklisted (expired entries
        // never re-assert blacklisting once past their own expiry).
        assert!(!store.is_token_blacklisted("jti1").await.unwrap());

        let cleaned = store.cleanup_expired_tokens().await.unwrap();
        assert_eq!(cleaned, 1);
        assert!(!store.is_token_blacklisted("jti1").await.unwrap());
    }

    #[tokio::test]
    async fn active_blacklist_entry_is_reported() {
        let store = Store::open_in_memory().await.unwrap();
        let entry = TokenBlacklistEntry {
            jti: "jti2".into(),
            user_id: "u1".into(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            reason: "logout".into(),
        };
        store.blacklist_token(&entry).await.unwrap();
        assert!(store.is_token_blacklisted("jti2").await.unwrap());
    }

    #[tokio::test]
    async fn user_round_trips_by_username_and_id() {
        let store = Store::open_in_memory().await.unwrap();
        let user = User::new("alice", "hash", UserRole::Operator);
        store.create_user(&user).await.unwrap();
        let by_name = store.get_user_by_username("alice").await.unwrap();
        let by_id = store.get_user_by_id(&user.id).await.unwrap();
        assert_eq!(by_name.id, user.id);
        assert_eq!(by_id.username, "alice");
    }
}
