use super::util::{is_dup_key, principal_id_from_bytes};
use crate::domain::{AuthError, PrincipalId};
use crate::infra::{AccountRecord, AccountRepo};
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};

/// ```sql
/// CREATE TABLE account (
///     id            BINARY(16)   NOT NULL PRIMARY KEY,
///     name          VARCHAR(128) NOT NULL,
///     email         VARCHAR(255) NOT NULL UNIQUE,
///     password_hash VARCHAR(255) NOT NULL,
///     created_at    TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)
/// );
/// ```
pub struct MySqlAccountRepo {
    pool: MySqlPool,
}

impl MySqlAccountRepo {
    pub fn new(pool: MySqlPool) -> Self {
        MySqlAccountRepo { pool }
    }

    fn row_to_record(row: MySqlRow) -> Result<AccountRecord, AuthError> {
        let id_bytes: Vec<u8> = row
            .try_get("id")
            .map_err(|e| AuthError::Store(e.to_string()))?;
        let id = principal_id_from_bytes(&id_bytes)
            .map_err(|e| AuthError::Store(e.to_string()))?;

        let name: String = row
            .try_get("name")
            .map_err(|e| AuthError::Store(e.to_string()))?;
        let email: String = row
            .try_get("email")
            .map_err(|e| AuthError::Store(e.to_string()))?;
        let password_hash: String = row
            .try_get("password_hash")
            .map_err(|e| AuthError::Store(e.to_string()))?;
        let created_at: DateTime<Utc> = row
            .try_get("created_at")
            .map_err(|e| AuthError::Store(e.to_string()))?;

        Ok(AccountRecord {
            id,
            name,
            email,
            password_hash,
            created_at,
        })
    }
}

#[async_trait::async_trait]
impl AccountRepo for MySqlAccountRepo {
    async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>, AuthError> {
        let row_opt: Option<MySqlRow> = sqlx::query(
            r#"
SELECT id, name, email, password_hash, created_at
FROM account
WHERE email = ?
"#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AuthError::Store(e.to_string()))?;

        row_opt.map(Self::row_to_record).transpose()
    }

    async fn email_exists(&self, email: &str) -> Result<bool, AuthError> {
        let row_opt = sqlx::query(r#"SELECT 1 FROM account WHERE email = ?"#)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AuthError::Store(e.to_string()))?;

        Ok(row_opt.is_some())
    }

    async fn create(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<AccountRecord, AuthError> {
        let id = PrincipalId(uuid::Uuid::new_v4());
        let created_at = Utc::now();

        sqlx::query(
            r#"
INSERT INTO account (id, name, email, password_hash, created_at)
VALUES (?, ?, ?, ?, ?)
"#,
        )
        .bind(id.0.as_bytes().as_slice())
        .bind(name)
        .bind(email)
        .bind(password_hash)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_dup_key(&e) {
                AuthError::DuplicateAccount
            } else {
                AuthError::Store(e.to_string())
            }
        })?;

        Ok(AccountRecord {
            id,
            name: name.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at,
        })
    }
}
