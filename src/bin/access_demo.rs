//! Manual end-to-end walk of the session lifecycle over the in-memory
//! adapters: sign-up, sign-in, one legitimate rotation, a replay of the
//! rotated-out token, and the fallout.

use portcullis::domain::{
    AccessService, Argon2PasswordHasher, Clock, CredentialSigner, Ed25519Signer,
    SessionAccessService, SignInInput, SignUpInput, SystemClock, TokenIssuer,
};
use portcullis::infra::{
    AccountRepo, InMemoryAccountRepo, InMemoryApiKeyIssuer, InMemorySessionStore, SessionStore,
};
use portcullis::infra_mysql::{MySqlAccountRepo, MySqlSessionStore};
use portcullis::infra_redis::RedisSessionStore;
use std::sync::Arc;

use portcullis::logger::*;
use portcullis::settings::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logger = Logger::new_bootstrap();
    let settings = parse_settings(cli.settings.as_deref())?;
    logger.reload_from_config(&LogConfig {
        filter: settings.log.filter.clone(),
    })?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let signer: Arc<dyn CredentialSigner> = Arc::new(Ed25519Signer::new(clock.clone()));
    let issuer = Arc::new(TokenIssuer::new(
        signer.clone(),
        clock.clone(),
        settings.auth.token_config(),
    ));

    let cap = settings.auth.used_token_cap;
    let (accounts, sessions): (Arc<dyn AccountRepo>, Arc<dyn SessionStore>) =
        match settings.store.backend.as_str() {
            "mysql" => {
                let dsn = settings
                    .store
                    .mysql_dsn
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("store.mysql_dsn is required"))?;
                let pool = sqlx::MySqlPool::connect(dsn).await?;
                (
                    Arc::new(MySqlAccountRepo::new(pool.clone())),
                    Arc::new(MySqlSessionStore::with_history_cap(pool, cap as u32)),
                )
            }
            "redis" => {
                let dsn = settings
                    .store
                    .redis_dsn
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("store.redis_dsn is required"))?;
                let client = redis::Client::open(dsn)?;
                let conn = client.get_connection_manager().await?;
                let prefix = settings.store.redis_prefix.as_deref().unwrap_or("portcullis");
                // Sessions outlive the process here but accounts do not.
                warn!("redis backend pairs durable sessions with in-memory accounts; principals reset on restart");
                (
                    Arc::new(InMemoryAccountRepo::new()),
                    Arc::new(RedisSessionStore::with_history_cap(conn, prefix, cap)),
                )
            }
            _ => (
                Arc::new(InMemoryAccountRepo::new()),
                Arc::new(InMemorySessionStore::with_history_cap(cap)),
            ),
        };

    let service = SessionAccessService::new(
        accounts,
        Arc::new(Argon2PasswordHasher),
        signer,
        issuer,
        sessions,
        Arc::new(InMemoryApiKeyIssuer::new()),
    );

    let signed_up = service
        .sign_up(SignUpInput {
            name: "Acme".into(),
            email: "a@x.com".into(),
            password: "secret".into(),
        })
        .await?;
    info!(principal = %signed_up.principal.id, api_key_len = signed_up.api_key.key.len(), "signed up");

    let signed_in = service
        .sign_in(SignInInput {
            email: "a@x.com".into(),
            password: "secret".into(),
        })
        .await?;
    let t1 = signed_in.tokens;
    info!(session = %signed_in.session_id, "signed in");

    let rotated = service.refresh_token(&t1.refresh_token.0).await?;
    info!(session = %rotated.session_id, "rotated refresh token once");

    match service.refresh_token(&t1.refresh_token.0).await {
        Err(e) => warn!(error = %e, "replaying the old token"),
        Ok(_) => unreachable!("replay must never succeed"),
    }

    match service.refresh_token(&rotated.tokens.refresh_token.0).await {
        Err(e) => info!(error = %e, "rotated token after revocation"),
        Ok(_) => unreachable!("session was revoked"),
    }

    service.logout(signed_up.session_id).await?;
    info!("logged out the sign-up session");

    Ok(())
}
