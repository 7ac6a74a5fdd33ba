use crate::domain::{ApiKey, AuthError, PrincipalId};
use crate::infra::{AccountRecord, AccountRepo, ApiKeyIssuer};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// In-memory account repository keyed by email.
#[derive(Default)]
pub struct InMemoryAccountRepo {
    accounts: DashMap<String, AccountRecord>,
}

impl InMemoryAccountRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AccountRepo for InMemoryAccountRepo {
    async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>, AuthError> {
        Ok(self.accounts.get(email).map(|r| r.value().clone()))
    }

    async fn email_exists(&self, email: &str) -> Result<bool, AuthError> {
        Ok(self.accounts.contains_key(email))
    }

    async fn create(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<AccountRecord, AuthError> {
        let record = AccountRecord {
            id: PrincipalId(uuid::Uuid::new_v4()),
            name: name.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        match self.accounts.entry(email.to_string()) {
            Entry::Occupied(_) => Err(AuthError::DuplicateAccount),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }
}

/// In-memory API key issuer; stores nothing beyond the issued key.
#[derive(Default)]
pub struct InMemoryApiKeyIssuer {
    issued: DashMap<String, Vec<String>>,
}

impl InMemoryApiKeyIssuer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ApiKeyIssuer for InMemoryApiKeyIssuer {
    async fn issue(&self, raw_key: &str, permissions: &[String]) -> Result<ApiKey, AuthError> {
        self.issued
            .insert(raw_key.to_string(), permissions.to_vec());
        Ok(ApiKey {
            key: raw_key.to_string(),
            permissions: permissions.to_vec(),
        })
    }
}
