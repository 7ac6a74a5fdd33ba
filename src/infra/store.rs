use crate::domain::{KeyPair, PrincipalId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted per-session credential state: one record per live session.
///
/// Invariants the store upholds:
/// - `current_refresh_token` never appears in `used_refresh_tokens`;
/// - `current_refresh_token` is unique across all live records;
/// - `used_refresh_tokens` is bounded (oldest entries evicted first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub owner_id: PrincipalId,
    pub key_pair: KeyPair,
    pub current_refresh_token: String,
    pub used_refresh_tokens: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    /// The conditional rotate lost a race: the stored current token no longer
    /// equals the expected value at write time.
    #[error("rotation conflict")]
    Conflict,
    #[error("store error: {0}")]
    Store(String),
}

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(
        &self,
        owner_id: PrincipalId,
        key_pair: KeyPair,
        refresh_token: &str,
    ) -> Result<SessionRecord, SessionStoreError>;

    async fn find_by_current_token(
        &self,
        token: &str,
    ) -> Result<Option<SessionRecord>, SessionStoreError>;

    /// Record whose rotated-out history contains `token`.
    async fn find_by_used_token(
        &self,
        token: &str,
    ) -> Result<Option<SessionRecord>, SessionStoreError>;

    /// Single atomic check-and-set: succeeds only if the stored current token
    /// still equals `expected_current` at write time. On success the old
    /// token moves into the bounded history and `new_token` becomes current.
    async fn rotate(
        &self,
        session_id: SessionId,
        expected_current: &str,
        new_token: &str,
    ) -> Result<(), SessionStoreError>;

    /// Removes every record owned by `owner_id`. Missing records are fine.
    async fn delete_by_owner(&self, owner_id: PrincipalId) -> Result<(), SessionStoreError>;

    /// Removes one record. Missing records are fine.
    async fn delete_by_id(&self, session_id: SessionId) -> Result<(), SessionStoreError>;
}
