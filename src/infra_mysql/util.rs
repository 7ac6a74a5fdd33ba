use crate::domain::{PrincipalId, SessionId};
use sqlx::mysql::MySqlDatabaseError;
use uuid::Uuid;

pub fn is_dup_key(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = err {
        if let Some(mysql_err) = db.try_downcast_ref::<MySqlDatabaseError>() {
            return mysql_err.number() == 1062; // ER_DUP_ENTRY
        }
    }

    false
}

#[inline]
pub fn principal_id_from_bytes(bytes: &[u8]) -> Result<PrincipalId, uuid::Error> {
    Uuid::from_slice(bytes).map(PrincipalId)
}

#[inline]
pub fn session_id_from_bytes(bytes: &[u8]) -> Result<SessionId, uuid::Error> {
    Uuid::from_slice(bytes).map(SessionId)
}
