use crate::config::Config;
use crate::error::ServiceError;
use crate::models::auth_code::AuthCode;
use crate::models::client::OAuthClientDetails;
use crate::utils::{crypto, validation};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Everything the authorize endpoint has already validated before minting.
#[derive(Debug)]
pub struct CodeParams<'a> {
    pub client: &'a OAuthClientDetails,
    pub user_id: &'a str,
    pub redirect_uri: &'a str,
    /// effective (narrowed) scope, space-delimited
    pub scope: &'a str,
    pub code_challenge: Option<&'a str>,
    pub code_challenge_method: Option<&'a str>,
    pub nonce: Option<&'a str>,
    pub state: Option<&'a str>,
    pub auth_time: DateTime<Utc>,
}

/// Outcome of the atomic consume step. The token endpoint maps `Replayed`
/// to family-wide cleanup before answering invalid_grant.
#[derive(Debug)]
pub enum CodeConsumption {
    Consumed(AuthCode),
    /// the row existed but `is_used` was already set
    Replayed(AuthCode),
    Expired(AuthCode),
    NotFound,
}

#[async_trait]
pub trait AuthCodeService: Send + Sync {
    async fn create_code(&self, params: CodeParams<'_>) -> Result<String, ServiceError>;

    /// Atomically marks the code used and returns its row. The conditional
    /// UPDATE means exactly one caller ever observes `Consumed` per code.
    async fn consume_code(&self, code: &str) -> Result<CodeConsumption, ServiceError>;
}

pub struct AuthCodeServiceImpl {
    db: Arc<SqlitePool>,
    config: Arc<Config>,
}

impl AuthCodeServiceImpl {
    pub fn new(db: Arc<SqlitePool>, config: Arc<Config>) -> Self {
        Self { db, config }
    }
}

#[async_trait]
impl AuthCodeService for AuthCodeServiceImpl {
    async fn create_code(&self, params: CodeParams<'_>) -> Result<String, ServiceError> {
        // 码值：32 字节 CSPRNG，base64url
        let code = crypto::generate_token(32);
        let now = Utc::now();

        // 客户端级 TTL 覆盖全局默认，硬上限 10 分钟
        let ttl = params
            .client
            .client
            .authorization_code_ttl
            .unwrap_or(self.config.authorization_code_ttl as i64)
            .min(600);
        let expires_at = now + Duration::seconds(ttl);

        sqlx::query(
            "INSERT INTO authorization_codes (id, code, user_id, client_id, redirect_uri, \
             scope, code_challenge, code_challenge_method, nonce, state, auth_time, \
             expires_at, is_used, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, FALSE, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&code)
        .bind(params.user_id)
        .bind(&params.client.client.id)
        .bind(params.redirect_uri)
        .bind(params.scope)
        .bind(params.code_challenge)
        .bind(params.code_challenge_method)
        .bind(params.nonce)
        .bind(params.state)
        .bind(params.auth_time)
        .bind(expires_at)
        .bind(now)
        .execute(&*self.db)
        .await?;

        Ok(code)
    }

    async fn consume_code(&self, code: &str) -> Result<CodeConsumption, ServiceError> {
        validation::validate_auth_code(code)?;

        let mut tx = self.db.begin().await?;

        // 条件更新即单次使用保证：并发的第二个请求 rows_affected = 0
        let flipped = sqlx::query(
            "UPDATE authorization_codes SET is_used = TRUE WHERE code = ? AND is_used = FALSE",
        )
        .bind(code)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let row = sqlx::query_as::<_, AuthCode>(
            "SELECT * FROM authorization_codes WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        let Some(auth_code) = row else {
            tracing::warn!("Authorization code not found");
            return Ok(CodeConsumption::NotFound);
        };

        if flipped == 0 {
            tracing::warn!(
                user_id = %auth_code.user_id,
                client_id = %auth_code.client_id,
                "Authorization code replay attempt"
            );
            return Ok(CodeConsumption::Replayed(auth_code));
        }

        // 精确边界：expires_at - 1ms 可用，expires_at 当刻拒绝
        if Utc::now() >= auth_code.expires_at {
            tracing::info!("Authorization code expired at {:?}", auth_code.expires_at);
            return Ok(CodeConsumption::Expired(auth_code));
        }

        Ok(CodeConsumption::Consumed(auth_code))
    }
}
