//! # Credential Repository
//!
//! Persists the one live credential so a restarted SDK resumes the session.
//! The table holds at most one row (`id = 1`); saving replaces it.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use finsync_core::{AccessToken, Credential};

use crate::error::{DbError, DbResult};

#[derive(FromRow)]
struct CredentialRow {
    session_id: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
    issued_at: DateTime<Utc>,
}

impl TryFrom<CredentialRow> for Credential {
    type Error = DbError;

    fn try_from(row: CredentialRow) -> Result<Self, Self::Error> {
        let session_id = Uuid::parse_str(&row.session_id)
            .map_err(|e| DbError::corrupt("credentials", format!("session_id: {}", e)))?;

        Ok(Credential {
            session_id,
            access_token: AccessToken::new(row.access_token),
            refresh_token: row.refresh_token,
            expires_at: row.expires_at,
            issued_at: row.issued_at,
        })
    }
}

/// Repository for the persisted credential.
#[derive(Debug, Clone)]
pub struct CredentialRepository {
    pool: SqlitePool,
}

impl CredentialRepository {
    /// Creates a new CredentialRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CredentialRepository { pool }
    }

    /// Replaces the stored credential.
    pub async fn save(&self, credential: &Credential) -> DbResult<()> {
        debug!(session_id = %credential.session_id, "Persisting credential");

        sqlx::query(
            r#"
            INSERT INTO credentials (
                id, session_id, access_token, refresh_token, expires_at, issued_at
            ) VALUES (1, ?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                session_id = excluded.session_id,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                issued_at = excluded.issued_at
            "#,
        )
        .bind(credential.session_id.to_string())
        .bind(credential.access_token.as_str())
        .bind(credential.refresh_token.as_deref())
        .bind(credential.expires_at)
        .bind(credential.issued_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Loads the stored credential, if any.
    pub async fn load(&self) -> DbResult<Option<Credential>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT session_id, access_token, refresh_token, expires_at, issued_at
            FROM credentials
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(Credential::try_from).transpose()
    }

    /// Removes the stored credential. Returns false if there was none.
    pub async fn clear(&self) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE id = 1")
            .execute(&self.pool)
            .await?;

        debug!(removed = result.rows_affected(), "Cleared credential");
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::Duration;
    use finsync_core::TokenGrant;

    fn credential(token: &str) -> Credential {
        Credential::from_grant(
            TokenGrant::new(token)
                .with_refresh_token("refresh-1")
                .with_expires_in(600),
            None,
            Uuid::new_v4(),
            Duration::seconds(3600),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.credentials();

        assert!(repo.load().await.unwrap().is_none());

        let first = credential("access-1");
        repo.save(&first).await.unwrap();
        let second = credential("access-2");
        repo.save(&second).await.unwrap();

        let loaded = repo.load().await.unwrap().unwrap();
        assert_eq!(loaded.session_id, second.session_id);
        assert_eq!(loaded.access_token.as_str(), "access-2");
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(loaded.expires_at.timestamp(), second.expires_at.timestamp());

        assert!(repo.clear().await.unwrap());
        assert!(!repo.clear().await.unwrap());
        assert!(repo.load().await.unwrap().is_none());
    }
}
