use crate::domain::{
    AuthError, CredentialSigner, PrincipalId, RefreshResult, TokenIssuer, TokenSubject,
};
use crate::infra::{AccountRepo, SessionRecord, SessionStore, SessionStoreError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Refresh-token rotation with reuse detection.
///
/// Every refresh token is valid for exactly one rotation. A second
/// presentation of the same token, whether a stolen copy or a client retry
/// racing a prior success, revokes the owner's sessions instead of silently
/// succeeding.
pub struct RotationProtocol {
    accounts: Arc<dyn AccountRepo>,
    signer: Arc<dyn CredentialSigner>,
    issuer: Arc<TokenIssuer>,
    sessions: Arc<dyn SessionStore>,
}

impl RotationProtocol {
    pub fn new(
        accounts: Arc<dyn AccountRepo>,
        signer: Arc<dyn CredentialSigner>,
        issuer: Arc<TokenIssuer>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        RotationProtocol {
            accounts,
            signer,
            issuer,
            sessions,
        }
    }

    pub async fn rotate(&self, presented: &str) -> Result<RefreshResult, AuthError> {
        // 1. Reuse check: a token found in any record's history was already
        //    rotated out; presenting it again is a replay.
        if let Some(record) = self
            .sessions
            .find_by_used_token(presented)
            .await
            .map_err(store_err)?
        {
            return self.revoke_on_reuse(&record, "used token replayed").await;
        }

        // 2. Validity check.
        let Some(record) = self
            .sessions
            .find_by_current_token(presented)
            .await
            .map_err(store_err)?
        else {
            return Err(AuthError::InvalidToken);
        };

        // 3. Signature and expiry, against the record's public key. A merely
        //    expired or forged token is not reuse; the record stays intact.
        let claims = self
            .signer
            .verify(presented, &record.key_pair.public_der)
            .map_err(|e| {
                debug!(session = %record.id, error = %e, "refresh token failed verification");
                AuthError::InvalidToken
            })?;

        let owner = parse_subject(&claims.sub)?;
        if owner != record.owner_id {
            // Claims and record disagree; never rotate across owners.
            return Err(AuthError::InvalidToken);
        }

        // Re-confirm the principal still exists; clean the orphan up if not.
        let account = self
            .accounts
            .find_by_email(&claims.email)
            .await?
            .filter(|a| a.id == record.owner_id);
        let Some(account) = account else {
            self.sessions
                .delete_by_id(record.id)
                .await
                .map_err(store_err)?;
            return Err(AuthError::InvalidToken);
        };

        // Same stored key pair; only the tokens rotate.
        let tokens = self
            .issuer
            .create_token_pair(account.id, &account.email, &record.key_pair)?;

        match self
            .sessions
            .rotate(record.id, presented, &tokens.refresh_token.0)
            .await
        {
            Ok(()) => {
                debug!(session = %record.id, owner = %record.owner_id, "rotated refresh token");
                Ok(RefreshResult {
                    subject: TokenSubject {
                        id: account.id,
                        email: account.email,
                    },
                    session_id: record.id,
                    tokens,
                })
            }
            // A concurrent rotation consumed the token between our read and
            // the conditional write. Both callers presented the same
            // single-use token; the loser is indistinguishable from a replay.
            Err(SessionStoreError::Conflict) => {
                self.revoke_on_reuse(&record, "rotation conflict").await
            }
            Err(e) => Err(store_err(e)),
        }
    }

    /// One-way destructive transition: delete the owner's sessions, then
    /// surface `ReuseDetected`. If the deletion fails the storage error wins,
    /// so a dangling record is never reported as handled.
    async fn revoke_on_reuse(
        &self,
        record: &SessionRecord,
        cause: &'static str,
    ) -> Result<RefreshResult, AuthError> {
        warn!(
            session = %record.id,
            owner = %record.owner_id,
            cause,
            "refresh token reuse detected, revoking sessions"
        );
        self.sessions
            .delete_by_owner(record.owner_id)
            .await
            .map_err(store_err)?;
        Err(AuthError::ReuseDetected)
    }
}

fn parse_subject(sub: &str) -> Result<PrincipalId, AuthError> {
    uuid::Uuid::parse_str(sub)
        .map(PrincipalId)
        .map_err(|_| AuthError::InvalidToken)
}

fn store_err(e: SessionStoreError) -> AuthError {
    AuthError::Store(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Clock, Ed25519Signer, KeyPair, SessionId, TokenConfig};
    use crate::infra::{InMemoryAccountRepo, InMemorySessionStore};
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SteppingClock(Mutex<DateTime<Utc>>);

    impl SteppingClock {
        fn new() -> Self {
            SteppingClock(Mutex::new(Utc::now()))
        }

        fn advance_secs(&self, secs: i64) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::seconds(secs);
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    struct Harness {
        accounts: Arc<InMemoryAccountRepo>,
        sessions: Arc<InMemorySessionStore>,
        signer: Arc<dyn CredentialSigner>,
        issuer: Arc<TokenIssuer>,
        clock: Arc<SteppingClock>,
        protocol: RotationProtocol,
    }

    fn harness() -> Harness {
        let clock = Arc::new(SteppingClock::new());
        let accounts = Arc::new(InMemoryAccountRepo::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let signer: Arc<dyn CredentialSigner> = Arc::new(Ed25519Signer::new(clock.clone()));
        let issuer = Arc::new(TokenIssuer::new(
            signer.clone(),
            clock.clone(),
            TokenConfig::default(),
        ));
        let protocol = RotationProtocol::new(
            accounts.clone(),
            signer.clone(),
            issuer.clone(),
            sessions.clone(),
        );
        Harness {
            accounts,
            sessions,
            signer,
            issuer,
            clock,
            protocol,
        }
    }

    async fn seed_session(h: &Harness, email: &str) -> (PrincipalId, SessionId, String) {
        let account = h.accounts.create("Acme", email, "hash").await.unwrap();
        let key_pair = h.signer.generate_key_pair().await.unwrap();
        let tokens = h
            .issuer
            .create_token_pair(account.id, email, &key_pair)
            .unwrap();
        let record = h
            .sessions
            .create(account.id, key_pair, &tokens.refresh_token.0)
            .await
            .unwrap();
        (account.id, record.id, tokens.refresh_token.0)
    }

    #[tokio::test]
    async fn valid_token_rotates_once_then_replaying_it_revokes() {
        let h = harness();
        let (owner, _, rt1) = seed_session(&h, "a@x.com").await;

        let first = h.protocol.rotate(&rt1).await.unwrap();
        assert_ne!(first.tokens.refresh_token.0, rt1);
        assert_eq!(first.subject.id, owner);

        let err = h.protocol.rotate(&rt1).await.unwrap_err();
        assert!(matches!(err, AuthError::ReuseDetected), "{err:?}");

        // Revocation took the whole session with it: the winner's token is
        // now unknown, not merely stale.
        let err = h
            .protocol
            .rotate(&first.tokens.refresh_token.0)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken), "{err:?}");
    }

    #[tokio::test]
    async fn unknown_token_is_invalid_without_state_change() {
        let h = harness();
        let (_, _, rt1) = seed_session(&h, "a@x.com").await;

        let err = h.protocol.rotate("garbage-not-a-real-token").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken), "{err:?}");

        // The seeded session still rotates fine.
        h.protocol.rotate(&rt1).await.unwrap();
    }

    #[tokio::test]
    async fn expired_token_is_invalid_and_leaves_the_record_intact() {
        let h = harness();
        let (_, session_id, rt1) = seed_session(&h, "a@x.com").await;

        h.clock.advance_secs(8 * 24 * 3600); // past the refresh TTL

        let err = h.protocol.rotate(&rt1).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken), "{err:?}");
        let record = h
            .sessions
            .find_by_current_token(&rt1)
            .await
            .unwrap()
            .expect("record must survive an expired presentation");
        assert_eq!(record.id, session_id);
    }

    #[tokio::test]
    async fn vanished_principal_invalidates_and_cleans_up_the_record() {
        let h = harness();
        // Session exists but the account repo has no matching principal.
        let ghost = PrincipalId(uuid::Uuid::new_v4());
        let key_pair = h.signer.generate_key_pair().await.unwrap();
        let tokens = h
            .issuer
            .create_token_pair(ghost, "ghost@x.com", &key_pair)
            .unwrap();
        h.sessions
            .create(ghost, key_pair, &tokens.refresh_token.0)
            .await
            .unwrap();

        let err = h.protocol.rotate(&tokens.refresh_token.0).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken), "{err:?}");
        assert!(
            h.sessions
                .find_by_current_token(&tokens.refresh_token.0)
                .await
                .unwrap()
                .is_none(),
            "orphaned record must be cleaned up"
        );
    }

    #[tokio::test]
    async fn concurrent_refreshes_produce_one_winner_and_one_revocation() {
        let h = harness();
        let (_, _, rt1) = seed_session(&h, "a@x.com").await;

        let protocol = Arc::new(h.protocol);
        let a = {
            let protocol = protocol.clone();
            let rt = rt1.clone();
            tokio::spawn(async move { protocol.rotate(&rt).await })
        };
        let b = {
            let protocol = protocol.clone();
            let rt = rt1.clone();
            tokio::spawn(async move { protocol.rotate(&rt).await })
        };

        let outcomes = [a.await.unwrap(), b.await.unwrap()];
        let wins = outcomes.iter().filter(|r| r.is_ok()).count();
        let reuse = outcomes
            .iter()
            .filter(|r| matches!(r, Err(AuthError::ReuseDetected)))
            .count();
        // Exactly one order-independent outcome: one new pair, one revocation.
        assert_eq!((wins, reuse), (1, 1), "{outcomes:?}");
    }

    /// Stub store that loses every conditional rotate, to pin down the
    /// Conflict -> ReuseDetected translation at the protocol boundary.
    struct LosingStore {
        record: SessionRecord,
        revoked: AtomicBool,
    }

    #[async_trait::async_trait]
    impl SessionStore for LosingStore {
        async fn create(
            &self,
            _owner_id: PrincipalId,
            _key_pair: KeyPair,
            _refresh_token: &str,
        ) -> Result<SessionRecord, SessionStoreError> {
            unimplemented!("not used by this test")
        }

        async fn find_by_current_token(
            &self,
            token: &str,
        ) -> Result<Option<SessionRecord>, SessionStoreError> {
            Ok((self.record.current_refresh_token == token).then(|| self.record.clone()))
        }

        async fn find_by_used_token(
            &self,
            _token: &str,
        ) -> Result<Option<SessionRecord>, SessionStoreError> {
            Ok(None)
        }

        async fn rotate(
            &self,
            _session_id: SessionId,
            _expected_current: &str,
            _new_token: &str,
        ) -> Result<(), SessionStoreError> {
            Err(SessionStoreError::Conflict)
        }

        async fn delete_by_owner(&self, owner_id: PrincipalId) -> Result<(), SessionStoreError> {
            assert_eq!(owner_id, self.record.owner_id);
            self.revoked.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_by_id(&self, _session_id: SessionId) -> Result<(), SessionStoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn store_conflict_surfaces_as_reuse_and_revokes() {
        let h = harness();
        let account = h.accounts.create("Acme", "a@x.com", "hash").await.unwrap();
        let key_pair = h.signer.generate_key_pair().await.unwrap();
        let tokens = h
            .issuer
            .create_token_pair(account.id, "a@x.com", &key_pair)
            .unwrap();

        let losing = Arc::new(LosingStore {
            record: SessionRecord {
                id: SessionId(uuid::Uuid::new_v4()),
                owner_id: account.id,
                key_pair,
                current_refresh_token: tokens.refresh_token.0.clone(),
                used_refresh_tokens: Vec::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            revoked: AtomicBool::new(false),
        });
        let protocol = RotationProtocol::new(
            h.accounts.clone(),
            h.signer.clone(),
            h.issuer.clone(),
            losing.clone(),
        );

        let err = protocol.rotate(&tokens.refresh_token.0).await.unwrap_err();
        assert!(matches!(err, AuthError::ReuseDetected), "{err:?}");
        assert!(losing.revoked.load(Ordering::SeqCst));
    }
}
