use super::util::{is_dup_key, principal_id_from_bytes, session_id_from_bytes};
use crate::domain::{KeyPair, PrincipalId, SessionId};
use crate::infra::{DEFAULT_USED_TOKEN_CAP, SessionRecord, SessionStore, SessionStoreError};
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};

/// MySQL-backed session store. The rotate precondition is a conditional
/// UPDATE, so the check-and-set happens in one statement at write time.
///
/// ```sql
/// CREATE TABLE session_record (
///     id                    BINARY(16)   NOT NULL PRIMARY KEY,
///     owner_id              BINARY(16)   NOT NULL,
///     public_key            BLOB         NOT NULL,
///     private_key           BLOB         NOT NULL,
///     current_refresh_token VARCHAR(768) NOT NULL UNIQUE,
///     created_at            TIMESTAMP(6) NOT NULL,
///     updated_at            TIMESTAMP(6) NOT NULL,
///     KEY idx_session_owner (owner_id)
/// );
///
/// CREATE TABLE session_used_token (
///     session_id BINARY(16)   NOT NULL,
///     token      VARCHAR(768) NOT NULL,
///     rotated_at TIMESTAMP(6) NOT NULL,
///     PRIMARY KEY (session_id, token),
///     KEY idx_used_token (token),
///     FOREIGN KEY (session_id) REFERENCES session_record (id) ON DELETE CASCADE
/// );
/// ```
pub struct MySqlSessionStore {
    pool: MySqlPool,
    used_token_cap: u32,
}

impl MySqlSessionStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self::with_history_cap(pool, DEFAULT_USED_TOKEN_CAP as u32)
    }

    pub fn with_history_cap(pool: MySqlPool, used_token_cap: u32) -> Self {
        MySqlSessionStore {
            pool,
            used_token_cap: used_token_cap.max(1),
        }
    }

    fn row_to_record(row: MySqlRow) -> Result<SessionRecord, SessionStoreError> {
        let id_bytes: Vec<u8> = row.try_get("id").map_err(store_err)?;
        let id = session_id_from_bytes(&id_bytes).map_err(store_err)?;
        let owner_bytes: Vec<u8> = row.try_get("owner_id").map_err(store_err)?;
        let owner_id = principal_id_from_bytes(&owner_bytes).map_err(store_err)?;

        let public_der: Vec<u8> = row.try_get("public_key").map_err(store_err)?;
        let private_der: Vec<u8> = row.try_get("private_key").map_err(store_err)?;
        let current_refresh_token: String =
            row.try_get("current_refresh_token").map_err(store_err)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(store_err)?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(store_err)?;

        Ok(SessionRecord {
            id,
            owner_id,
            key_pair: KeyPair {
                public_der,
                private_der,
            },
            current_refresh_token,
            used_refresh_tokens: Vec::new(),
            created_at,
            updated_at,
        })
    }

    async fn load_used_tokens(&self, session_id: SessionId) -> Result<Vec<String>, SessionStoreError> {
        let rows = sqlx::query(
            r#"
SELECT token
FROM session_used_token
WHERE session_id = ?
ORDER BY rotated_at ASC
"#,
        )
        .bind(session_id.0.as_bytes().as_slice())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("token").map_err(store_err))
            .collect()
    }

    async fn hydrate(
        &self,
        row_opt: Option<MySqlRow>,
    ) -> Result<Option<SessionRecord>, SessionStoreError> {
        let Some(row) = row_opt else {
            return Ok(None);
        };
        let mut record = Self::row_to_record(row)?;
        record.used_refresh_tokens = self.load_used_tokens(record.id).await?;
        Ok(Some(record))
    }
}

#[async_trait::async_trait]
impl SessionStore for MySqlSessionStore {
    async fn create(
        &self,
        owner_id: PrincipalId,
        key_pair: KeyPair,
        refresh_token: &str,
    ) -> Result<SessionRecord, SessionStoreError> {
        let id = SessionId(uuid::Uuid::new_v4());
        let now = Utc::now();

        sqlx::query(
            r#"
INSERT INTO session_record
    (id, owner_id, public_key, private_key, current_refresh_token, created_at, updated_at)
VALUES (?, ?, ?, ?, ?, ?, ?)
"#,
        )
        .bind(id.0.as_bytes().as_slice())
        .bind(owner_id.0.as_bytes().as_slice())
        .bind(key_pair.public_der.as_slice())
        .bind(key_pair.private_der.as_slice())
        .bind(refresh_token)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_dup_key(&e) {
                // UNIQUE(current_refresh_token): a collision would allow
                // cross-session rotation.
                SessionStoreError::Store("refresh token already bound to a live session".into())
            } else {
                store_err(e)
            }
        })?;

        Ok(SessionRecord {
            id,
            owner_id,
            key_pair,
            current_refresh_token: refresh_token.to_string(),
            used_refresh_tokens: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_by_current_token(
        &self,
        token: &str,
    ) -> Result<Option<SessionRecord>, SessionStoreError> {
        let row_opt = sqlx::query(
            r#"
SELECT id, owner_id, public_key, private_key, current_refresh_token, created_at, updated_at
FROM session_record
WHERE current_refresh_token = ?
"#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        self.hydrate(row_opt).await
    }

    async fn find_by_used_token(
        &self,
        token: &str,
    ) -> Result<Option<SessionRecord>, SessionStoreError> {
        let row_opt = sqlx::query(
            r#"
SELECT s.id, s.owner_id, s.public_key, s.private_key, s.current_refresh_token,
       s.created_at, s.updated_at
FROM session_record s
JOIN session_used_token u ON u.session_id = s.id
WHERE u.token = ?
"#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        self.hydrate(row_opt).await
    }

    async fn rotate(
        &self,
        session_id: SessionId,
        expected_current: &str,
        new_token: &str,
    ) -> Result<(), SessionStoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let updated = sqlx::query(
            r#"
UPDATE session_record
SET current_refresh_token = ?, updated_at = ?
WHERE id = ? AND current_refresh_token = ?
"#,
        )
        .bind(new_token)
        .bind(now)
        .bind(session_id.0.as_bytes().as_slice())
        .bind(expected_current)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        if updated.rows_affected() == 0 {
            // Precondition no longer holds: a concurrent rotation won.
            tx.rollback().await.map_err(store_err)?;
            return Err(SessionStoreError::Conflict);
        }

        sqlx::query(
            r#"
INSERT INTO session_used_token (session_id, token, rotated_at)
VALUES (?, ?, ?)
"#,
        )
        .bind(session_id.0.as_bytes().as_slice())
        .bind(expected_current)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        // Bound the history: evict everything older than the freshest cap.
        sqlx::query(
            r#"
DELETE FROM session_used_token
WHERE session_id = ?
  AND token NOT IN (
      SELECT token FROM (
          SELECT token
          FROM session_used_token
          WHERE session_id = ?
          ORDER BY rotated_at DESC
          LIMIT ?
      ) AS freshest
  )
"#,
        )
        .bind(session_id.0.as_bytes().as_slice())
        .bind(session_id.0.as_bytes().as_slice())
        .bind(self.used_token_cap as i64)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn delete_by_owner(&self, owner_id: PrincipalId) -> Result<(), SessionStoreError> {
        // Used tokens go with the records via ON DELETE CASCADE.
        sqlx::query(r#"DELETE FROM session_record WHERE owner_id = ?"#)
            .bind(owner_id.0.as_bytes().as_slice())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn delete_by_id(&self, session_id: SessionId) -> Result<(), SessionStoreError> {
        sqlx::query(r#"DELETE FROM session_record WHERE id = ?"#)
            .bind(session_id.0.as_bytes().as_slice())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

fn store_err<E: std::fmt::Display>(e: E) -> SessionStoreError {
    SessionStoreError::Store(e.to_string())
}
