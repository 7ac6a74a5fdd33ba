use crate::domain::{Clock, CredentialSigner, KeyPair, SignerError, TokenClaims};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair as _};
use std::sync::Arc;

/// Ed25519 signer. Key pairs are generated per session; the private half is a
/// PKCS#8 v2 document, the public half the raw verifying key, both DER.
///
/// Expiry is validated against the injected clock rather than the system
/// clock, so an expired token is a first-class outcome under test.
pub struct Ed25519Signer {
    clock: Arc<dyn Clock>,
}

impl Ed25519Signer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Ed25519Signer { clock }
    }
}

#[async_trait::async_trait]
impl CredentialSigner for Ed25519Signer {
    async fn generate_key_pair(&self) -> Result<KeyPair, SignerError> {
        // Keygen is CPU-bound; keep it off the cooperative executor.
        tokio::task::spawn_blocking(|| {
            let rng = SystemRandom::new();
            let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
                .map_err(|e| SignerError::Key(e.to_string()))?;
            let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
                .map_err(|e| SignerError::Key(e.to_string()))?;
            Ok(KeyPair {
                public_der: pair.public_key().as_ref().to_vec(),
                private_der: pkcs8.as_ref().to_vec(),
            })
        })
        .await
        .map_err(|e| SignerError::Key(e.to_string()))?
    }

    fn sign(&self, claims: &TokenClaims, private_der: &[u8]) -> Result<String, SignerError> {
        let key = EncodingKey::from_ed_der(private_der);
        encode(&Header::new(Algorithm::EdDSA), claims, &key)
            .map_err(|e| SignerError::Key(e.to_string()))
    }

    fn verify(&self, token: &str, public_der: &[u8]) -> Result<TokenClaims, SignerError> {
        let key = DecodingKey::from_ed_der(public_der);
        let mut validation = Validation::new(Algorithm::EdDSA);
        // Expiry is checked below against the injected clock.
        validation.validate_exp = false;

        let data = decode::<TokenClaims>(token, &key, &validation).map_err(|e| match e.kind() {
            ErrorKind::InvalidSignature => SignerError::InvalidSignature,
            ErrorKind::InvalidKeyFormat => SignerError::Key(e.to_string()),
            _ => SignerError::Malformed,
        })?;

        if data.claims.exp <= self.clock.now().timestamp() {
            return Err(SignerError::Expired);
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn claims_at(now: DateTime<Utc>, ttl_secs: i64) -> TokenClaims {
        TokenClaims {
            sub: "6f8d2f3a-0000-0000-0000-000000000001".into(),
            email: "a@x.com".into(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + ttl_secs,
        }
    }

    fn signer_at(ts: i64) -> Ed25519Signer {
        Ed25519Signer::new(Arc::new(FixedClock(Utc.timestamp_opt(ts, 0).unwrap())))
    }

    #[tokio::test]
    async fn sign_then_verify_roundtrips_claims() {
        let signer = signer_at(1_700_000_000);
        let pair = signer.generate_key_pair().await.unwrap();
        let claims = claims_at(Utc.timestamp_opt(1_700_000_000, 0).unwrap(), 3600);

        let token = signer.sign(&claims, &pair.private_der).unwrap();
        let verified = signer.verify(&token, &pair.public_der).unwrap();
        assert_eq!(verified, claims);
    }

    #[tokio::test]
    async fn verify_rejects_foreign_public_key() {
        let signer = signer_at(1_700_000_000);
        let pair = signer.generate_key_pair().await.unwrap();
        let other = signer.generate_key_pair().await.unwrap();
        let claims = claims_at(Utc.timestamp_opt(1_700_000_000, 0).unwrap(), 3600);

        let token = signer.sign(&claims, &pair.private_der).unwrap();
        let err = signer.verify(&token, &other.public_der).unwrap_err();
        assert!(matches!(err, SignerError::InvalidSignature), "{err:?}");
    }

    #[tokio::test]
    async fn verify_reports_expiry_against_injected_clock() {
        let signer = signer_at(1_700_000_000);
        let pair = signer.generate_key_pair().await.unwrap();
        let claims = claims_at(Utc.timestamp_opt(1_700_000_000, 0).unwrap(), 60);
        let token = signer.sign(&claims, &pair.private_der).unwrap();

        // Same token, clock advanced past exp.
        let late = signer_at(1_700_000_000 + 61);
        let err = late.verify(&token, &pair.public_der).unwrap_err();
        assert!(matches!(err, SignerError::Expired), "{err:?}");
    }

    #[tokio::test]
    async fn verify_rejects_garbage_as_malformed() {
        let signer = signer_at(1_700_000_000);
        let pair = signer.generate_key_pair().await.unwrap();
        let err = signer
            .verify("garbage-not-a-real-token", &pair.public_der)
            .unwrap_err();
        assert!(matches!(err, SignerError::Malformed), "{err:?}");
    }
}
