use crate::config::Config;
use crate::error::{ServiceError, TokenVerifyError};
use crate::models::session::Session;
use crate::services::key_service::KeyService;
use crate::utils::crypto;
use crate::utils::jwt::SessionClaims;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// What a freshly created or refreshed login session hands back to the UI.
#[derive(Debug)]
pub struct SessionTokens {
    pub session_jwt: String,
    /// opaque, accepted only by /auth/refresh
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// The validated identity behind a session JWT.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: String,
    pub session_id: String,
    pub auth_time: DateTime<Utc>,
}

#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create_session(
        &self,
        user_id: &str,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<SessionTokens, ServiceError>;

    /// Full session validation: signature (aud = ui_audience), blacklist,
    /// user still active, and a live backing session row with matching hash.
    async fn validate(&self, session_jwt: &str) -> Result<SessionContext, ServiceError>;

    /// Exchanges the opaque session refresh token for a fresh session JWT.
    /// 会话刷新轮换 refresh token，旧值立即作废。
    async fn refresh(&self, refresh_token: &str) -> Result<SessionTokens, ServiceError>;
}

pub struct SessionServiceImpl {
    db: Arc<SqlitePool>,
    config: Arc<Config>,
    key_service: Arc<KeyService>,
}

impl SessionServiceImpl {
    pub fn new(db: Arc<SqlitePool>, config: Arc<Config>, key_service: Arc<KeyService>) -> Self {
        Self {
            db,
            config,
            key_service,
        }
    }

    async fn issue_for_session(
        &self,
        session_id: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<SessionTokens, ServiceError> {
        let now = Utc::now();
        let claims = SessionClaims {
            iss: self.config.issuer.clone(),
            sub: user_id.to_string(),
            aud: self.config.ui_audience.clone(),
            exp: expires_at.timestamp() as usize,
            iat: now.timestamp() as usize,
            jti: Uuid::new_v4().to_string(),
        };

        let session_jwt = self.key_service.sign(&claims).await?;
        let refresh_token = crypto::generate_token(48);

        sqlx::query(
            "UPDATE sessions SET session_token_hash = ?, refresh_token_hash = ? WHERE id = ?",
        )
        .bind(crypto::hash_token(&session_jwt))
        .bind(crypto::hash_token(&refresh_token))
        .bind(session_id)
        .execute(&*self.db)
        .await?;

        Ok(SessionTokens {
            session_jwt,
            refresh_token,
            expires_at,
        })
    }

    async fn is_blacklisted(&self, jti: &str) -> Result<bool, ServiceError> {
        let entry: Option<(String,)> =
            sqlx::query_as("SELECT jti FROM token_blacklist WHERE jti = ? AND expires_at > ?")
                .bind(jti)
                .bind(Utc::now())
                .fetch_optional(&*self.db)
                .await?;
        Ok(entry.is_some())
    }
}

#[async_trait]
impl SessionService for SessionServiceImpl {
    async fn create_session(
        &self,
        user_id: &str,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<SessionTokens, ServiceError> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.config.session_ttl as i64);
        let session_id = Uuid::new_v4().to_string();

        // hashes are filled in by issue_for_session just below
        sqlx::query(
            "INSERT INTO sessions (id, user_id, session_token_hash, refresh_token_hash, \
             ip_address, user_agent, auth_time, expires_at, is_active, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, TRUE, ?)",
        )
        .bind(&session_id)
        .bind(user_id)
        .bind(format!("pending-{session_id}"))
        .bind(format!("pending-r-{session_id}"))
        .bind(&ip_address)
        .bind(&user_agent)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .execute(&*self.db)
        .await?;

        self.issue_for_session(&session_id, user_id, expires_at).await
    }

    async fn validate(&self, session_jwt: &str) -> Result<SessionContext, ServiceError> {
        let claims: SessionClaims = self
            .key_service
            .verify(session_jwt, Some(&self.config.ui_audience))
            .await?;

        if self.is_blacklisted(&claims.jti).await? {
            return Err(ServiceError::Token(TokenVerifyError::Revoked));
        }

        let user_active: Option<bool> =
            sqlx::query_scalar("SELECT is_active FROM users WHERE id = ?")
                .bind(&claims.sub)
                .fetch_optional(&*self.db)
                .await?;
        if user_active != Some(true) {
            return Err(ServiceError::Unauthorized(
                "User is disabled or missing".to_string(),
            ));
        }

        let session = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE session_token_hash = ?",
        )
        .bind(crypto::hash_token(session_jwt))
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| ServiceError::Unauthorized("Session not found".to_string()))?;

        if !session.is_active || session.expires_at <= Utc::now() {
            return Err(ServiceError::Unauthorized("Session expired".to_string()));
        }

        Ok(SessionContext {
            user_id: session.user_id,
            session_id: session.id,
            auth_time: session.auth_time,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<SessionTokens, ServiceError> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE refresh_token_hash = ?",
        )
        .bind(crypto::hash_token(refresh_token))
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| ServiceError::Unauthorized("Invalid session refresh token".to_string()))?;

        if !session.is_active || session.expires_at <= Utc::now() {
            return Err(ServiceError::Unauthorized("Session expired".to_string()));
        }

        self.issue_for_session(&session.id, &session.user_id, session.expires_at)
            .await
    }
}
