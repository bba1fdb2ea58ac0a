use crate::error::ServiceError;
use crate::models::consent::ConsentGrant;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait ConsentService: Send + Sync {
    /// True iff a live ConsentGrant for (user, client) covers every requested
    /// scope. Revoked or expired grants cover nothing.
    async fn has_consent(
        &self,
        user_id: &str,
        client_internal_id: &str,
        requested_scopes: &[String],
    ) -> Result<bool, ServiceError>;

    /// Persists the user's decision. Re-approval widens the stored scope set
    /// rather than replacing it, so previously approved scopes stay covered.
    async fn grant_consent(
        &self,
        user_id: &str,
        client_internal_id: &str,
        scopes: &[String],
    ) -> Result<(), ServiceError>;

    async fn revoke_consent(
        &self,
        user_id: &str,
        client_internal_id: &str,
    ) -> Result<(), ServiceError>;
}

pub struct ConsentServiceImpl {
    db: Arc<SqlitePool>,
}

impl ConsentServiceImpl {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    async fn find_grant(
        &self,
        user_id: &str,
        client_internal_id: &str,
    ) -> Result<Option<ConsentGrant>, ServiceError> {
        let grant = sqlx::query_as::<_, ConsentGrant>(
            "SELECT * FROM consent_grants WHERE user_id = ? AND client_id = ?",
        )
        .bind(user_id)
        .bind(client_internal_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(grant)
    }
}

#[async_trait]
impl ConsentService for ConsentServiceImpl {
    async fn has_consent(
        &self,
        user_id: &str,
        client_internal_id: &str,
        requested_scopes: &[String],
    ) -> Result<bool, ServiceError> {
        match self.find_grant(user_id, client_internal_id).await? {
            Some(grant) => Ok(grant.covers(requested_scopes, Utc::now())),
            None => Ok(false),
        }
    }

    async fn grant_consent(
        &self,
        user_id: &str,
        client_internal_id: &str,
        scopes: &[String],
    ) -> Result<(), ServiceError> {
        let now = Utc::now();

        match self.find_grant(user_id, client_internal_id).await? {
            Some(existing) => {
                // 并集而非覆盖："记住这个决定" 的语义
                let mut merged: BTreeSet<String> = existing
                    .scope
                    .split_whitespace()
                    .map(|s| s.to_string())
                    .collect();
                merged.extend(scopes.iter().cloned());
                let scope = merged.into_iter().collect::<Vec<_>>().join(" ");

                sqlx::query(
                    "UPDATE consent_grants SET scope = ?, granted_at = ?, revoked_at = NULL \
                     WHERE id = ?",
                )
                .bind(scope)
                .bind(now)
                .bind(&existing.id)
                .execute(&*self.db)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO consent_grants (id, user_id, client_id, scope, granted_at) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(user_id)
                .bind(client_internal_id)
                .bind(scopes.join(" "))
                .bind(now)
                .execute(&*self.db)
                .await?;
            }
        }

        Ok(())
    }

    async fn revoke_consent(
        &self,
        user_id: &str,
        client_internal_id: &str,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            "UPDATE consent_grants SET revoked_at = ? WHERE user_id = ? AND client_id = ? \
             AND revoked_at IS NULL",
        )
        .bind(Utc::now())
        .bind(user_id)
        .bind(client_internal_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}
