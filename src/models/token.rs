use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Persistent shadow of an issued access token JWT. `token_hash` is the
/// SHA-256 of the compact JWT; revocation flips `is_revoked` and blacklists
/// the `jti`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccessToken {
    pub id: String,
    pub token_hash: String,
    pub jti: String,
    pub user_id: Option<String>,
    pub client_id: String,
    pub scope: String,
    pub auth_code_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub is_revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// 刷新令牌为不透明高熵字符串，仅存 SHA-256。
/// previous_token_id 串成家族链，family_id 供整族一次性吊销。
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    pub id: String,
    pub token_hash: String,
    pub jti: String,
    pub user_id: String,
    pub client_id: String,
    pub scope: String,
    pub auth_code_id: Option<String>,
    pub family_id: String,
    pub previous_token_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub is_revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Append-only denylist entry; rows are prunable once `expires_at` passes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BlacklistEntry {
    pub jti: String,
    pub token_type: String,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
