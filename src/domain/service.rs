use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// region identifiers

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PrincipalId(pub uuid::Uuid);

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// endregion


// region credentials

/// Asymmetric key material for one session, DER-encoded.
/// The private half never leaves the session store's persisted record.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_der: Vec<u8>,
    pub private_der: Vec<u8>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_der", &hex::encode(&self.public_der))
            .field("private_der", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TokenClaims {
    pub sub: String, // principal id as string
    pub email: String,
    pub jti: String, // unique per issued token
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq, Hash)]
pub struct AccessToken(pub String);

#[derive(Debug, Clone, Serialize, Eq, PartialEq, Hash)]
pub struct RefreshToken(pub String);

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

// endregion


// region errors

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("account already registered")]
    DuplicateAccount,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("token invalid")]
    InvalidToken,
    #[error("token reuse detected, session revoked")]
    ReuseDetected,
    #[error("key error: {0}")]
    KeyError(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signature does not match key")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token malformed")]
    Malformed,
    #[error("key error: {0}")]
    Key(String),
}

// endregion


// region service ports

/// Wall clock, injected so expiry is deterministic under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[async_trait::async_trait]
pub trait PasswordHasher: Send + Sync {
    async fn hash_password(&self, password: &str) -> Result<String, AuthError>;
    async fn verify_password(
        &self,
        password: &str,
        password_hash: &str,
    ) -> Result<bool, AuthError>;
}

/// Generates session key pairs and signs/verifies token claims.
///
/// Discipline: tokens are signed with the private key and verified with the
/// public key, always.
#[async_trait::async_trait]
pub trait CredentialSigner: Send + Sync {
    async fn generate_key_pair(&self) -> Result<KeyPair, SignerError>;
    fn sign(&self, claims: &TokenClaims, private_der: &[u8]) -> Result<String, SignerError>;
    fn verify(&self, token: &str, public_der: &[u8]) -> Result<TokenClaims, SignerError>;
}

// endregion


// region access service

#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub key: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SignUpInput {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug)]
pub struct SignUpResult {
    pub principal: Principal,
    pub session_id: SessionId,
    pub tokens: TokenPair,
    pub api_key: ApiKey,
}

#[derive(Debug, Clone)]
pub struct SignInInput {
    pub email: String,
    pub password: String,
}

#[derive(Debug)]
pub struct SignInResult {
    pub principal: Principal,
    pub session_id: SessionId,
    pub tokens: TokenPair,
}

/// Public claims echoed back on a successful rotation.
#[derive(Debug, Clone, Serialize)]
pub struct TokenSubject {
    pub id: PrincipalId,
    pub email: String,
}

#[derive(Debug)]
pub struct RefreshResult {
    pub subject: TokenSubject,
    pub session_id: SessionId,
    pub tokens: TokenPair,
}

#[async_trait::async_trait]
pub trait AccessService: Send + Sync {
    async fn sign_up(&self, input: SignUpInput) -> Result<SignUpResult, AuthError>;
    async fn sign_in(&self, input: SignInInput) -> Result<SignInResult, AuthError>;
    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshResult, AuthError>;
    /// Idempotent: logging out an already-deleted session succeeds.
    async fn logout(&self, session_id: SessionId) -> Result<(), AuthError>;
}

// endregion
