use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A persisted authorization code. Single-use: `is_used` flips exactly once,
/// inside the consuming transaction.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuthCode {
    pub id: String,
    pub code: String,
    pub user_id: String,
    /// internal client row id, not the public client_id
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
    pub state: Option<String>,
    pub auth_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
}
