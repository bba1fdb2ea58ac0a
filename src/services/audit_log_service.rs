use crate::error::ServiceError;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// One protocol request or credential mutation, about to become one
/// `audit_logs` row.
#[derive(Debug, Clone, Default)]
pub struct AuditEntry {
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[async_trait]
pub trait AuditLogService: Send + Sync {
    /// Appends one audit row. Callers on the request path must treat failure
    /// as non-fatal (see middleware::audit).
    async fn record(&self, entry: AuditEntry) -> Result<(), ServiceError>;

    async fn count_for_action(&self, action: &str) -> Result<i64, ServiceError>;
}

pub struct AuditLogServiceImpl {
    db: Arc<SqlitePool>,
}

impl AuditLogServiceImpl {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditLogService for AuditLogServiceImpl {
    async fn record(&self, entry: AuditEntry) -> Result<(), ServiceError> {
        let metadata = entry
            .metadata
            .as_ref()
            .map(|m| m.to_string());

        sqlx::query(
            "INSERT INTO audit_logs (id, timestamp, user_id, client_id, action, resource, \
             ip_address, user_agent, success, error_message, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(Utc::now())
        .bind(&entry.user_id)
        .bind(&entry.client_id)
        .bind(&entry.action)
        .bind(&entry.resource)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.success)
        .bind(&entry.error_message)
        .bind(metadata)
        .execute(&*self.db)
        .await?;

        Ok(())
    }

    async fn count_for_action(&self, action: &str) -> Result<i64, ServiceError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM audit_logs WHERE action = ?")
                .bind(action)
                .fetch_one(&*self.db)
                .await?;
        Ok(count)
    }
}
