use crate::domain::{KeyPair, PrincipalId, SessionId};
use crate::infra::{SessionRecord, SessionStore, SessionStoreError};
use chrono::Utc;
use dashmap::DashMap;

pub const DEFAULT_USED_TOKEN_CAP: usize = 32;

/// In-memory session store. The DashMap entry lock makes `rotate` a single
/// check-and-set: a concurrent rotation on the same record blocks until the
/// first writer finishes, then fails the precondition.
pub struct InMemorySessionStore {
    records: DashMap<SessionId, SessionRecord>,
    used_token_cap: usize,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_history_cap(DEFAULT_USED_TOKEN_CAP)
    }

    pub fn with_history_cap(used_token_cap: usize) -> Self {
        InMemorySessionStore {
            records: DashMap::new(),
            used_token_cap: used_token_cap.max(1),
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(
        &self,
        owner_id: PrincipalId,
        key_pair: KeyPair,
        refresh_token: &str,
    ) -> Result<SessionRecord, SessionStoreError> {
        let collision = self
            .records
            .iter()
            .any(|r| r.current_refresh_token == refresh_token);
        if collision {
            // Would allow cross-session rotation; never admit it.
            return Err(SessionStoreError::Store(
                "refresh token already bound to a live session".into(),
            ));
        }

        let now = Utc::now();
        let record = SessionRecord {
            id: SessionId(uuid::Uuid::new_v4()),
            owner_id,
            key_pair,
            current_refresh_token: refresh_token.to_string(),
            used_refresh_tokens: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_by_current_token(
        &self,
        token: &str,
    ) -> Result<Option<SessionRecord>, SessionStoreError> {
        Ok(self
            .records
            .iter()
            .find(|r| r.current_refresh_token == token)
            .map(|r| r.value().clone()))
    }

    async fn find_by_used_token(
        &self,
        token: &str,
    ) -> Result<Option<SessionRecord>, SessionStoreError> {
        Ok(self
            .records
            .iter()
            .find(|r| r.used_refresh_tokens.iter().any(|t| t == token))
            .map(|r| r.value().clone()))
    }

    async fn rotate(
        &self,
        session_id: SessionId,
        expected_current: &str,
        new_token: &str,
    ) -> Result<(), SessionStoreError> {
        let Some(mut record) = self.records.get_mut(&session_id) else {
            return Err(SessionStoreError::Conflict);
        };
        if record.current_refresh_token != expected_current {
            return Err(SessionStoreError::Conflict);
        }

        let rotated_out = std::mem::replace(
            &mut record.current_refresh_token,
            new_token.to_string(),
        );
        record.used_refresh_tokens.push(rotated_out);
        if record.used_refresh_tokens.len() > self.used_token_cap {
            let excess = record.used_refresh_tokens.len() - self.used_token_cap;
            record.used_refresh_tokens.drain(..excess);
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_by_owner(&self, owner_id: PrincipalId) -> Result<(), SessionStoreError> {
        self.records.retain(|_, r| r.owner_id != owner_id);
        Ok(())
    }

    async fn delete_by_id(&self, session_id: SessionId) -> Result<(), SessionStoreError> {
        self.records.remove(&session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key_pair() -> KeyPair {
        KeyPair {
            public_der: vec![1, 2, 3],
            private_der: vec![4, 5, 6],
        }
    }

    #[tokio::test]
    async fn rotate_moves_current_token_into_history() {
        let store = InMemorySessionStore::new();
        let owner = PrincipalId(uuid::Uuid::new_v4());
        let record = store.create(owner, key_pair(), "rt-1").await.unwrap();

        store.rotate(record.id, "rt-1", "rt-2").await.unwrap();

        let found = store.find_by_current_token("rt-2").await.unwrap().unwrap();
        assert_eq!(found.id, record.id);
        assert_eq!(found.used_refresh_tokens, vec!["rt-1".to_string()]);
        assert!(store.find_by_current_token("rt-1").await.unwrap().is_none());
        let by_used = store.find_by_used_token("rt-1").await.unwrap().unwrap();
        assert_eq!(by_used.id, record.id);
    }

    #[tokio::test]
    async fn rotate_with_stale_expectation_is_a_conflict() {
        let store = InMemorySessionStore::new();
        let owner = PrincipalId(uuid::Uuid::new_v4());
        let record = store.create(owner, key_pair(), "rt-1").await.unwrap();
        store.rotate(record.id, "rt-1", "rt-2").await.unwrap();

        let err = store.rotate(record.id, "rt-1", "rt-3").await.unwrap_err();
        assert!(matches!(err, SessionStoreError::Conflict));
        // The losing writer changed nothing.
        let found = store.find_by_current_token("rt-2").await.unwrap().unwrap();
        assert_eq!(found.used_refresh_tokens, vec!["rt-1".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_rotations_have_exactly_one_winner() {
        let store = Arc::new(InMemorySessionStore::new());
        let owner = PrincipalId(uuid::Uuid::new_v4());
        let record = store.create(owner, key_pair(), "rt-1").await.unwrap();

        let a = {
            let store = store.clone();
            let id = record.id;
            tokio::spawn(async move { store.rotate(id, "rt-1", "rt-a").await })
        };
        let b = {
            let store = store.clone();
            let id = record.id;
            tokio::spawn(async move { store.rotate(id, "rt-1", "rt-b").await })
        };

        let outcomes = [a.await.unwrap(), b.await.unwrap()];
        let wins = outcomes.iter().filter(|r| r.is_ok()).count();
        let conflicts = outcomes
            .iter()
            .filter(|r| matches!(r, Err(SessionStoreError::Conflict)))
            .count();
        assert_eq!((wins, conflicts), (1, 1));
    }

    #[tokio::test]
    async fn used_token_history_is_bounded() {
        let store = InMemorySessionStore::with_history_cap(2);
        let owner = PrincipalId(uuid::Uuid::new_v4());
        let record = store.create(owner, key_pair(), "rt-0").await.unwrap();

        for i in 0..4 {
            store
                .rotate(record.id, &format!("rt-{i}"), &format!("rt-{}", i + 1))
                .await
                .unwrap();
        }

        // Only the two freshest rotated-out tokens remain.
        assert!(store.find_by_used_token("rt-0").await.unwrap().is_none());
        assert!(store.find_by_used_token("rt-1").await.unwrap().is_none());
        assert!(store.find_by_used_token("rt-2").await.unwrap().is_some());
        assert!(store.find_by_used_token("rt-3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deletes_are_idempotent() {
        let store = InMemorySessionStore::new();
        let owner = PrincipalId(uuid::Uuid::new_v4());
        let record = store.create(owner, key_pair(), "rt-1").await.unwrap();

        store.delete_by_id(record.id).await.unwrap();
        store.delete_by_id(record.id).await.unwrap();
        store.delete_by_owner(owner).await.unwrap();
        assert!(store.find_by_current_token("rt-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_current_token_is_rejected() {
        let store = InMemorySessionStore::new();
        let owner = PrincipalId(uuid::Uuid::new_v4());
        store.create(owner, key_pair(), "rt-1").await.unwrap();

        let err = store.create(owner, key_pair(), "rt-1").await.unwrap_err();
        assert!(matches!(err, SessionStoreError::Store(_)));
    }
}
