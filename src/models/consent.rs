use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A stored user decision authorizing a client for a set of scopes.
/// Keyed uniquely by (user_id, client_id); re-approval widens `scope`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConsentGrant {
    pub id: String,
    pub user_id: String,
    /// internal client row id
    pub client_id: String,
    /// space-delimited
    pub scope: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ConsentGrant {
    /// A grant covers a request iff it is live and its scope set is a
    /// superset of the requested scopes.
    pub fn covers(&self, requested_scopes: &[String], now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        if matches!(self.expires_at, Some(exp) if now >= exp) {
            return false;
        }
        let granted: std::collections::HashSet<&str> = self.scope.split_whitespace().collect();
        requested_scopes.iter().all(|s| granted.contains(s.as_str()))
    }
}
