use crate::domain::{KeyPair, PrincipalId, SessionId};
use crate::infra::{DEFAULT_USED_TOKEN_CAP, SessionRecord, SessionStore, SessionStoreError};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;

/// Redis-backed session store.
///
/// Layout under the configured prefix:
/// - `{p}:session:{id}`    hash: owner, keys (JSON `KeyPair`), current, created_at, updated_at
/// - `{p}:used:{id}`       list of rotated-out tokens, newest first, bounded
/// - `{p}:rt:current:{t}`  index: current token -> session id
/// - `{p}:rt:used:{t}`     index: used token -> session id
/// - `{p}:owner:{owner}`   set of the owner's session ids
///
/// `rotate` runs as one Lua script, so the current-token check and the swap
/// are a single atomic step on the server.
pub struct RedisSessionStore {
    conn: ConnectionManager,
    prefix: String,
    used_token_cap: usize,
}

const ROTATE_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], 'current')
if not cur or cur ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'current', ARGV[2], 'updated_at', ARGV[3])
redis.call('DEL', KEYS[3])
redis.call('SET', KEYS[4], ARGV[4])
redis.call('SET', KEYS[5], ARGV[4])
redis.call('LPUSH', KEYS[2], ARGV[1])
local cap = tonumber(ARGV[5])
local evicted = redis.call('LRANGE', KEYS[2], cap, -1)
for _, t in ipairs(evicted) do
  redis.call('DEL', ARGV[6] .. t)
end
redis.call('LTRIM', KEYS[2], 0, cap - 1)
return 1
"#;

impl RedisSessionStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self::with_history_cap(conn, prefix, DEFAULT_USED_TOKEN_CAP)
    }

    pub fn with_history_cap(
        conn: ConnectionManager,
        prefix: impl Into<String>,
        used_token_cap: usize,
    ) -> Self {
        RedisSessionStore {
            conn,
            prefix: prefix.into(),
            used_token_cap: used_token_cap.max(1),
        }
    }

    fn session_key(&self, id: SessionId) -> String {
        format!("{}:session:{}", self.prefix, id)
    }

    fn used_list_key(&self, id: SessionId) -> String {
        format!("{}:used:{}", self.prefix, id)
    }

    fn current_index_key(&self, token: &str) -> String {
        format!("{}:rt:current:{}", self.prefix, token)
    }

    fn used_index_key(&self, token: &str) -> String {
        format!("{}:rt:used:{}", self.prefix, token)
    }

    fn owner_key(&self, owner: PrincipalId) -> String {
        format!("{}:owner:{}", self.prefix, owner)
    }

    async fn load_record(
        &self,
        id: SessionId,
    ) -> Result<Option<SessionRecord>, SessionStoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.session_key(id))
            .await
            .map_err(store_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let used: Vec<String> = conn
            .lrange(self.used_list_key(id), 0, -1)
            .await
            .map_err(store_err)?;

        let owner_id = fields
            .get("owner")
            .ok_or_else(|| SessionStoreError::Store("session hash missing owner".into()))
            .and_then(|s| {
                uuid::Uuid::parse_str(s)
                    .map(PrincipalId)
                    .map_err(store_err)
            })?;
        let key_pair: KeyPair = fields
            .get("keys")
            .ok_or_else(|| SessionStoreError::Store("session hash missing keys".into()))
            .and_then(|raw| serde_json::from_str(raw).map_err(store_err))?;
        let current_refresh_token = fields
            .get("current")
            .cloned()
            .ok_or_else(|| SessionStoreError::Store("session hash missing current".into()))?;
        let created_at = time_field(&fields, "created_at")?;
        let updated_at = time_field(&fields, "updated_at")?;

        Ok(Some(SessionRecord {
            id,
            owner_id,
            key_pair,
            current_refresh_token,
            used_refresh_tokens: used.into_iter().rev().collect(),
            created_at,
            updated_at,
        }))
    }

    async fn find_by_index(
        &self,
        index_key: String,
    ) -> Result<Option<SessionRecord>, SessionStoreError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(index_key).await.map_err(store_err)?;
        let Some(id) = id else {
            return Ok(None);
        };
        let id = uuid::Uuid::parse_str(&id).map(SessionId).map_err(store_err)?;
        self.load_record(id).await
    }

    async fn delete_record(&self, record: &SessionRecord) -> Result<(), SessionStoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.del(self.session_key(record.id))
            .del(self.used_list_key(record.id))
            .del(self.current_index_key(&record.current_refresh_token))
            .srem(self.owner_key(record.owner_id), record.id.to_string());
        for token in &record.used_refresh_tokens {
            pipe.del(self.used_index_key(token));
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(store_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(
        &self,
        owner_id: PrincipalId,
        key_pair: KeyPair,
        refresh_token: &str,
    ) -> Result<SessionRecord, SessionStoreError> {
        let mut conn = self.conn.clone();
        let id = SessionId(uuid::Uuid::new_v4());
        let now = Utc::now();

        // NX claim on the current-token index enforces system-wide token
        // uniqueness before the record itself appears.
        let claimed: bool = conn
            .set_nx(self.current_index_key(refresh_token), id.to_string())
            .await
            .map_err(store_err)?;
        if !claimed {
            return Err(SessionStoreError::Store(
                "refresh token already bound to a live session".into(),
            ));
        }

        let keys_json = serde_json::to_string(&key_pair).map_err(store_err)?;
        let mut pipe = redis::pipe();
        pipe.hset_multiple(
            self.session_key(id),
            &[
                ("owner", owner_id.to_string()),
                ("keys", keys_json),
                ("current", refresh_token.to_string()),
                ("created_at", now.to_rfc3339()),
                ("updated_at", now.to_rfc3339()),
            ],
        )
        .sadd(self.owner_key(owner_id), id.to_string());
        let _: () = pipe.query_async(&mut conn).await.map_err(store_err)?;

        Ok(SessionRecord {
            id,
            owner_id,
            key_pair,
            current_refresh_token: refresh_token.to_string(),
            used_refresh_tokens: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_by_current_token(
        &self,
        token: &str,
    ) -> Result<Option<SessionRecord>, SessionStoreError> {
        self.find_by_index(self.current_index_key(token)).await
    }

    async fn find_by_used_token(
        &self,
        token: &str,
    ) -> Result<Option<SessionRecord>, SessionStoreError> {
        self.find_by_index(self.used_index_key(token)).await
    }

    async fn rotate(
        &self,
        session_id: SessionId,
        expected_current: &str,
        new_token: &str,
    ) -> Result<(), SessionStoreError> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(ROTATE_SCRIPT);
        let rotated: i64 = script
            .key(self.session_key(session_id))
            .key(self.used_list_key(session_id))
            .key(self.current_index_key(expected_current))
            .key(self.current_index_key(new_token))
            .key(self.used_index_key(expected_current))
            .arg(expected_current)
            .arg(new_token)
            .arg(Utc::now().to_rfc3339())
            .arg(session_id.to_string())
            .arg(self.used_token_cap)
            .arg(format!("{}:rt:used:", self.prefix))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        if rotated == 0 {
            return Err(SessionStoreError::Conflict);
        }
        Ok(())
    }

    async fn delete_by_owner(&self, owner_id: PrincipalId) -> Result<(), SessionStoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.owner_key(owner_id))
            .await
            .map_err(store_err)?;
        for id in ids {
            let id = uuid::Uuid::parse_str(&id).map(SessionId).map_err(store_err)?;
            if let Some(record) = self.load_record(id).await? {
                self.delete_record(&record).await?;
            }
        }
        let _: () = conn
            .del(self.owner_key(owner_id))
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn delete_by_id(&self, session_id: SessionId) -> Result<(), SessionStoreError> {
        if let Some(record) = self.load_record(session_id).await? {
            self.delete_record(&record).await?;
        }
        Ok(())
    }
}

fn time_field(
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<DateTime<Utc>, SessionStoreError> {
    let raw = fields
        .get(name)
        .ok_or_else(|| SessionStoreError::Store(format!("session hash missing {name}")))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(store_err)
}

fn store_err<E: std::fmt::Display>(e: E) -> SessionStoreError {
    SessionStoreError::Store(e.to_string())
}
