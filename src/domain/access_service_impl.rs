use crate::domain::{
    AccessService, AuthError, CredentialSigner, PasswordHasher, Principal, RefreshResult,
    RotationProtocol, SessionId, SignInInput, SignInResult, SignUpInput, SignUpResult,
    TokenIssuer,
};
use crate::infra::{AccountRepo, ApiKeyIssuer, SessionStore};
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use argon2::PasswordHasher as _;
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use tracing::debug;

pub struct Argon2PasswordHasher;

#[async_trait::async_trait]
impl PasswordHasher for Argon2PasswordHasher {
    async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let salt = argon2::password_hash::SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .to_string();
        Ok(hash)
    }

    async fn verify_password(
        &self,
        password: &str,
        password_hash: &str,
    ) -> Result<bool, AuthError> {
        let parsed = PasswordHash::new(password_hash)
            .map_err(|e| AuthError::Internal(format!("invalid PHC hash: {}", e)))?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(_) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AuthError::Internal(format!("verify error: {}", e))),
        }
    }
}

/// Permissions attached to the API key issued at sign-up.
pub const DEFAULT_API_PERMISSIONS: &[&str] = &["general"];

const API_KEY_BYTES: usize = 64;

/// Stateless orchestrator for sign-up, sign-in, refresh and logout. All
/// session state lives in the store; the service holds only injected
/// collaborators.
pub struct SessionAccessService {
    accounts: Arc<dyn AccountRepo>,
    hasher: Arc<dyn PasswordHasher>,
    signer: Arc<dyn CredentialSigner>,
    issuer: Arc<TokenIssuer>,
    sessions: Arc<dyn SessionStore>,
    api_keys: Arc<dyn ApiKeyIssuer>,
    rotation: RotationProtocol,
}

impl SessionAccessService {
    pub fn new(
        accounts: Arc<dyn AccountRepo>,
        hasher: Arc<dyn PasswordHasher>,
        signer: Arc<dyn CredentialSigner>,
        issuer: Arc<TokenIssuer>,
        sessions: Arc<dyn SessionStore>,
        api_keys: Arc<dyn ApiKeyIssuer>,
    ) -> Self {
        let rotation = RotationProtocol::new(
            accounts.clone(),
            signer.clone(),
            issuer.clone(),
            sessions.clone(),
        );
        SessionAccessService {
            accounts,
            hasher,
            signer,
            issuer,
            sessions,
            api_keys,
            rotation,
        }
    }

    fn random_api_key() -> Result<String, AuthError> {
        let rng = SystemRandom::new();
        let mut raw = [0u8; API_KEY_BYTES];
        rng.fill(&mut raw)
            .map_err(|_| AuthError::Internal("system rng failure".into()))?;
        Ok(hex::encode(raw))
    }
}

#[async_trait::async_trait]
impl AccessService for SessionAccessService {
    async fn sign_up(&self, input: SignUpInput) -> Result<SignUpResult, AuthError> {
        let SignUpInput {
            name,
            email,
            password,
        } = input;

        if self.accounts.email_exists(&email).await? {
            return Err(AuthError::DuplicateAccount);
        }

        let password_hash = self.hasher.hash_password(&password).await?;
        let account = self.accounts.create(&name, &email, &password_hash).await?;

        let key_pair = self
            .signer
            .generate_key_pair()
            .await
            .map_err(|e| AuthError::KeyError(e.to_string()))?;
        let tokens = self
            .issuer
            .create_token_pair(account.id, &account.email, &key_pair)?;
        let record = self
            .sessions
            .create(account.id, key_pair, &tokens.refresh_token.0)
            .await
            .map_err(|e| AuthError::Store(e.to_string()))?;

        let permissions: Vec<String> =
            DEFAULT_API_PERMISSIONS.iter().map(|p| p.to_string()).collect();
        let api_key = self
            .api_keys
            .issue(&Self::random_api_key()?, &permissions)
            .await?;

        debug!(principal = %account.id, session = %record.id, "registered new principal");
        Ok(SignUpResult {
            principal: Principal {
                id: account.id,
                name: account.name,
                email: account.email,
            },
            session_id: record.id,
            tokens,
            api_key,
        })
    }

    async fn sign_in(&self, input: SignInInput) -> Result<SignInResult, AuthError> {
        let SignInInput { email, password } = input;

        // Unknown email and wrong password are distinguished only here, in
        // logs; the caller sees one generic failure either way.
        let Some(account) = self.accounts.find_by_email(&email).await? else {
            debug!("sign-in for unregistered email");
            return Err(AuthError::InvalidCredentials);
        };
        if !self
            .hasher
            .verify_password(&password, &account.password_hash)
            .await?
        {
            debug!(principal = %account.id, "sign-in with wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        // Fresh key pair per login; concurrent sessions stay independent.
        let key_pair = self
            .signer
            .generate_key_pair()
            .await
            .map_err(|e| AuthError::KeyError(e.to_string()))?;
        let tokens = self
            .issuer
            .create_token_pair(account.id, &account.email, &key_pair)?;
        let record = self
            .sessions
            .create(account.id, key_pair, &tokens.refresh_token.0)
            .await
            .map_err(|e| AuthError::Store(e.to_string()))?;

        Ok(SignInResult {
            principal: Principal {
                id: account.id,
                name: account.name,
                email: account.email,
            },
            session_id: record.id,
            tokens,
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshResult, AuthError> {
        self.rotation.rotate(refresh_token).await
    }

    async fn logout(&self, session_id: SessionId) -> Result<(), AuthError> {
        self.sessions
            .delete_by_id(session_id)
            .await
            .map_err(|e| AuthError::Store(e.to_string()))
    }
}
