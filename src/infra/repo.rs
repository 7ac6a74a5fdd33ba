use crate::domain::{ApiKey, AuthError, PrincipalId};
use chrono::{DateTime, Utc};

// region account repo

#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub id: PrincipalId,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// External account repository. Registration business rules beyond
/// "create exactly once per email" live behind this port.
#[async_trait::async_trait]
pub trait AccountRepo: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>, AuthError>;

    async fn email_exists(&self, email: &str) -> Result<bool, AuthError>;

    async fn create(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<AccountRecord, AuthError>;
}

// endregion


// region api key issuer

/// Opaque to this core: persists a raw key with its permission set.
#[async_trait::async_trait]
pub trait ApiKeyIssuer: Send + Sync {
    async fn issue(&self, raw_key: &str, permissions: &[String]) -> Result<ApiKey, AuthError>;
}

// endregion
