use crate::config::Config;
use crate::error::{ServiceError, TokenVerifyError};
use crate::models::client::OAuthClientDetails;
use crate::models::token::RefreshToken;
use crate::models::user::User;
use crate::services::key_service::KeyService;
use crate::services::rbac_service::RbacService;
use crate::services::user_service::UserService;
use crate::utils::crypto;
use crate::utils::jwt::{AccessTokenClaims, IdTokenClaims};
use crate::utils::validation;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use uuid::Uuid;

/// Represents the set of tokens issued by one grant.
#[derive(Debug)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: u64,
    pub scope: String,
}

/// Inputs for minting a token pair, assembled by the grant handlers.
pub struct IssueParams<'a> {
    pub client: &'a OAuthClientDetails,
    pub user: Option<&'a User>,
    /// space-delimited, already narrowed
    pub scope: String,
    pub permissions: Vec<String>,
    pub nonce: Option<String>,
    pub auth_time: Option<DateTime<Utc>>,
    /// set when the pair originates from an authorization code
    pub auth_code_id: Option<String>,
}

/// RFC 7662 introspection result. `active: false` carries no other fields.
#[derive(Debug, serde::Serialize)]
pub struct IntrospectionData {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl IntrospectionData {
    /// 任何验证失败都折叠成这一种响应，绝不泄漏令牌元数据
    pub fn inactive() -> Self {
        Self {
            active: false,
            scope: None,
            client_id: None,
            sub: None,
            username: None,
            exp: None,
            iat: None,
            jti: None,
            token_type: None,
        }
    }
}

#[async_trait]
pub trait TokenService: Send + Sync {
    async fn issue_tokens(&self, params: IssueParams<'_>) -> Result<TokenPair, ServiceError>;

    /// One rotation per token: revoke-then-mint inside a single transaction,
    /// with replay detection revoking the whole family before invalid_grant.
    async fn refresh(
        &self,
        refresh_token: &str,
        client: &OAuthClientDetails,
        requested_scope: Option<&str>,
    ) -> Result<TokenPair, ServiceError>;

    async fn introspect(
        &self,
        token: &str,
        token_type_hint: Option<&str>,
    ) -> Result<IntrospectionData, ServiceError>;

    /// RFC 7009 revocation. Tokens owned by other clients are treated as
    /// unknown; unknown tokens are a silent no-op.
    async fn revoke(
        &self,
        token: &str,
        token_type_hint: Option<&str>,
        client: &OAuthClientDetails,
    ) -> Result<(), ServiceError>;

    /// Bearer verification for userinfo and the authorization middleware:
    /// signature, blacklist, and the persistent row all have to agree.
    async fn verify_bearer(&self, token: &str) -> Result<AccessTokenClaims, ServiceError>;

    /// Defensive cleanup: revokes every token minted under an authorization
    /// code (used when a code exchange fails or a code is replayed).
    async fn revoke_tokens_for_code(&self, auth_code_id: &str) -> Result<(), ServiceError>;

    async fn is_blacklisted(&self, jti: &str) -> Result<bool, ServiceError>;
}

pub struct TokenServiceImpl {
    db: Arc<SqlitePool>,
    config: Arc<Config>,
    key_service: Arc<KeyService>,
    user_service: Arc<dyn UserService>,
    rbac_service: Arc<dyn RbacService>,
}

impl TokenServiceImpl {
    pub fn new(
        db: Arc<SqlitePool>,
        config: Arc<Config>,
        key_service: Arc<KeyService>,
        user_service: Arc<dyn UserService>,
        rbac_service: Arc<dyn RbacService>,
    ) -> Self {
        Self {
            db,
            config,
            key_service,
            user_service,
            rbac_service,
        }
    }

    /// Mints and persists a token pair inside the caller's transaction.
    async fn mint_pair_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        params: &IssueParams<'_>,
        family: Option<(String, String)>, // (family_id, previous_token_id)
    ) -> Result<TokenPair, ServiceError> {
        let now = Utc::now();
        let access_token_ttl = params.client.client.access_token_ttl.max(0) as u64;
        let access_token_exp = now + Duration::seconds(access_token_ttl as i64);
        let access_jti = Uuid::new_v4().to_string();

        let claims = AccessTokenClaims {
            iss: self.config.issuer.clone(),
            sub: params.user.map(|u| u.id.clone()),
            aud: params.client.client.client_id.clone(),
            client_id: params.client.client.client_id.clone(),
            scope: params.scope.clone(),
            permissions: params.permissions.clone(),
            exp: access_token_exp.timestamp() as usize,
            iat: now.timestamp() as usize,
            jti: access_jti.clone(),
        };

        let access_token = self.key_service.sign(&claims).await?;

        sqlx::query(
            "INSERT INTO access_tokens (id, token_hash, jti, user_id, client_id, scope, \
             auth_code_id, expires_at, issued_at, is_revoked) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, FALSE)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(crypto::hash_token(&access_token))
        .bind(&access_jti)
        .bind(params.user.map(|u| u.id.clone()))
        .bind(&params.client.client.id)
        .bind(&params.scope)
        .bind(&params.auth_code_id)
        .bind(access_token_exp)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        let mut issued_refresh_token: Option<String> = None;
        let mut issued_id_token: Option<String> = None;

        if let Some(user) = params.user {
            // 只有带用户主体且客户端声明了 refresh_token grant 才发刷新令牌
            if params.client.supports_grant("refresh_token") {
                let refresh_token = crypto::generate_token(48);
                let refresh_ttl = params.client.client.refresh_token_ttl.max(0);
                let (family_id, previous_token_id) = match family {
                    Some((family_id, previous)) => (family_id, Some(previous)),
                    None => (Uuid::new_v4().to_string(), None),
                };

                sqlx::query(
                    "INSERT INTO refresh_tokens (id, token_hash, jti, user_id, client_id, \
                     scope, auth_code_id, family_id, previous_token_id, expires_at, issued_at, \
                     is_revoked) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, FALSE)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(crypto::hash_token(&refresh_token))
                .bind(Uuid::new_v4().to_string())
                .bind(&user.id)
                .bind(&params.client.client.id)
                .bind(&params.scope)
                .bind(&params.auth_code_id)
                .bind(&family_id)
                .bind(&previous_token_id)
                .bind(now + Duration::seconds(refresh_ttl))
                .bind(now)
                .execute(&mut **tx)
                .await?;

                issued_refresh_token = Some(refresh_token);
            }

            // openid scope 才发 ID token
            if params.scope.split_whitespace().any(|s| s == "openid") {
                let auth_time = params.auth_time.unwrap_or(now);
                let id_claims = IdTokenClaims::for_user(
                    user,
                    &params.client.client.client_id,
                    &self.config.issuer,
                    &params.scope,
                    params.nonce.as_deref(),
                    auth_time.timestamp() as usize,
                    now.timestamp() as usize,
                    access_token_exp.timestamp() as usize,
                );
                issued_id_token = Some(self.key_service.sign(&id_claims).await?);
            }
        }

        Ok(TokenPair {
            access_token,
            refresh_token: issued_refresh_token,
            id_token: issued_id_token,
            expires_in: access_token_ttl,
            scope: params.scope.clone(),
        })
    }

    /// 整族吊销：family_id 一条 UPDATE 覆盖链上所有行
    async fn revoke_family(&self, family_id: &str) -> Result<(), ServiceError> {
        let revoked = sqlx::query(
            "UPDATE refresh_tokens SET is_revoked = TRUE, revoked_at = ? \
             WHERE family_id = ? AND is_revoked = FALSE",
        )
        .bind(Utc::now())
        .bind(family_id)
        .execute(&*self.db)
        .await?
        .rows_affected();

        tracing::warn!(
            family_id = %family_id,
            revoked = revoked,
            "Refresh token family revoked"
        );
        Ok(())
    }

    async fn find_refresh_token(
        &self,
        token: &str,
    ) -> Result<Option<RefreshToken>, ServiceError> {
        let row = sqlx::query_as::<_, RefreshToken>(
            "SELECT * FROM refresh_tokens WHERE token_hash = ?",
        )
        .bind(crypto::hash_token(token))
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    async fn blacklist_jti(
        &self,
        jti: &str,
        token_type: &str,
        user_id: Option<&str>,
        client_id: &str,
        expires_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), ServiceError> {
        // idempotent: double revocation must stay a no-op
        sqlx::query(
            "INSERT OR IGNORE INTO token_blacklist \
             (jti, token_type, user_id, client_id, expires_at, reason, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(jti)
        .bind(token_type)
        .bind(user_id)
        .bind(client_id)
        .bind(expires_at)
        .bind(reason)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn introspect_access_token(&self, token: &str) -> Option<IntrospectionData> {
        let claims = self.verify_bearer(token).await.ok()?;

        Some(IntrospectionData {
            active: true,
            scope: Some(claims.scope),
            client_id: Some(claims.client_id),
            sub: claims.sub.clone(),
            username: claims.sub,
            exp: Some(claims.exp as i64),
            iat: Some(claims.iat as i64),
            jti: Some(claims.jti),
            token_type: Some("access_token".to_string()),
        })
    }

    async fn introspect_refresh_token(&self, token: &str) -> Option<IntrospectionData> {
        let row = self.find_refresh_token(token).await.ok()??;
        if row.is_revoked || row.expires_at <= Utc::now() {
            return None;
        }

        // public client_id 对外，内部行 id 不外泄
        let public_client_id: Option<String> =
            sqlx::query_scalar("SELECT client_id FROM oauth_clients WHERE id = ?")
                .bind(&row.client_id)
                .fetch_optional(&*self.db)
                .await
                .ok()
                .flatten();

        Some(IntrospectionData {
            active: true,
            scope: Some(row.scope),
            client_id: public_client_id,
            sub: Some(row.user_id.clone()),
            username: Some(row.user_id),
            exp: Some(row.expires_at.timestamp()),
            iat: Some(row.issued_at.timestamp()),
            jti: Some(row.jti),
            token_type: Some("refresh_token".to_string()),
        })
    }
}

#[async_trait]
impl TokenService for TokenServiceImpl {
    async fn issue_tokens(&self, params: IssueParams<'_>) -> Result<TokenPair, ServiceError> {
        let mut tx = self.db.begin().await?;
        let pair = self.mint_pair_tx(&mut tx, &params, None).await?;
        tx.commit().await?;
        Ok(pair)
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        client: &OAuthClientDetails,
        requested_scope: Option<&str>,
    ) -> Result<TokenPair, ServiceError> {
        let stored = self
            .find_refresh_token(refresh_token)
            .await?
            .ok_or_else(|| ServiceError::Unauthorized("Invalid refresh token".to_string()))?;

        if stored.is_revoked {
            // 重放：同族全部吊销后再报错
            self.revoke_family(&stored.family_id).await?;
            return Err(ServiceError::Unauthorized(
                "Refresh token replay detected".to_string(),
            ));
        }

        if stored.expires_at <= Utc::now() {
            return Err(ServiceError::Unauthorized(
                "Refresh token has expired".to_string(),
            ));
        }

        if stored.client_id != client.client.id {
            return Err(ServiceError::Unauthorized(
                "Refresh token was issued to a different client".to_string(),
            ));
        }

        let scope = validation::narrow_scope(&stored.scope, requested_scope)?;

        let user = self
            .user_service
            .find_by_id(&stored.user_id)
            .await?
            .filter(|u| u.is_active)
            .ok_or_else(|| {
                ServiceError::Unauthorized("Token subject is disabled or missing".to_string())
            })?;
        let permissions = self.rbac_service.get_user_permissions(&user.id).await?;

        let mut tx = self.db.begin().await?;

        // 并发第二次轮换在这里观察到 0 行，按重放处理
        let rotated = sqlx::query(
            "UPDATE refresh_tokens SET is_revoked = TRUE, revoked_at = ? \
             WHERE id = ? AND is_revoked = FALSE",
        )
        .bind(Utc::now())
        .bind(&stored.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rotated == 0 {
            tx.rollback().await?;
            self.revoke_family(&stored.family_id).await?;
            return Err(ServiceError::Unauthorized(
                "Refresh token replay detected".to_string(),
            ));
        }

        let params = IssueParams {
            client,
            user: Some(&user),
            scope,
            permissions,
            nonce: None,
            auth_time: None,
            auth_code_id: None,
        };
        let pair = self
            .mint_pair_tx(&mut tx, &params, Some((stored.family_id.clone(), stored.id.clone())))
            .await?;

        tx.commit().await?;
        Ok(pair)
    }

    async fn introspect(
        &self,
        token: &str,
        token_type_hint: Option<&str>,
    ) -> Result<IntrospectionData, ServiceError> {
        // hint 只是优化查找顺序，猜错也必须得到正确答案 (RFC 7662 §2.1)
        let result = match token_type_hint {
            Some("refresh_token") => match self.introspect_refresh_token(token).await {
                Some(data) => Some(data),
                None => self.introspect_access_token(token).await,
            },
            _ => match self.introspect_access_token(token).await {
                Some(data) => Some(data),
                None => self.introspect_refresh_token(token).await,
            },
        };

        Ok(result.unwrap_or_else(IntrospectionData::inactive))
    }

    async fn revoke(
        &self,
        token: &str,
        token_type_hint: Option<&str>,
        client: &OAuthClientDetails,
    ) -> Result<(), ServiceError> {
        // refresh token first when hinted, otherwise try both shapes
        if token_type_hint != Some("access_token") {
            if let Some(stored) = self.find_refresh_token(token).await? {
                if stored.client_id != client.client.id {
                    // 非本客户端的令牌按未知处理 (RFC 7009 §2.2)
                    return Ok(());
                }
                self.revoke_family(&stored.family_id).await?;
                self.blacklist_jti(
                    &stored.jti,
                    "refresh_token",
                    Some(&stored.user_id),
                    &client.client.client_id,
                    stored.expires_at,
                    "Client initiated revocation",
                )
                .await?;
                return Ok(());
            }
        }

        // access token: signature may be expired, but the row still tells us
        // who owns it
        let row: Option<crate::models::token::AccessToken> = sqlx::query_as(
            "SELECT * FROM access_tokens WHERE token_hash = ?",
        )
        .bind(crypto::hash_token(token))
        .fetch_optional(&*self.db)
        .await?;

        let Some(row) = row else {
            tracing::debug!("Revocation requested for unknown token (no-op)");
            return Ok(());
        };

        if row.client_id != client.client.id {
            return Ok(());
        }

        sqlx::query(
            "UPDATE access_tokens SET is_revoked = TRUE, revoked_at = ? \
             WHERE id = ? AND is_revoked = FALSE",
        )
        .bind(Utc::now())
        .bind(&row.id)
        .execute(&*self.db)
        .await?;

        self.blacklist_jti(
            &row.jti,
            "access_token",
            row.user_id.as_deref(),
            &client.client.client_id,
            row.expires_at,
            "Client initiated revocation",
        )
        .await?;

        Ok(())
    }

    async fn verify_bearer(&self, token: &str) -> Result<AccessTokenClaims, ServiceError> {
        let claims: AccessTokenClaims = self.key_service.verify(token, None).await?;

        if self.is_blacklisted(&claims.jti).await? {
            return Err(ServiceError::Token(TokenVerifyError::Revoked));
        }

        let revoked: Option<bool> =
            sqlx::query_scalar("SELECT is_revoked FROM access_tokens WHERE jti = ?")
                .bind(&claims.jti)
                .fetch_optional(&*self.db)
                .await?;

        match revoked {
            Some(false) => Ok(claims),
            // 没有落库记录的令牌一律拒绝，防止签名正确但来源不明的 JWT
            Some(true) | None => Err(ServiceError::Token(TokenVerifyError::Revoked)),
        }
    }

    async fn revoke_tokens_for_code(&self, auth_code_id: &str) -> Result<(), ServiceError> {
        let now = Utc::now();

        let access_rows: Vec<crate::models::token::AccessToken> =
            sqlx::query_as("SELECT * FROM access_tokens WHERE auth_code_id = ?")
                .bind(auth_code_id)
                .fetch_all(&*self.db)
                .await?;

        for row in &access_rows {
            self.blacklist_jti(
                &row.jti,
                "access_token",
                row.user_id.as_deref(),
                &row.client_id,
                row.expires_at,
                "Authorization code replay",
            )
            .await?;
        }

        sqlx::query(
            "UPDATE access_tokens SET is_revoked = TRUE, revoked_at = ? \
             WHERE auth_code_id = ? AND is_revoked = FALSE",
        )
        .bind(now)
        .bind(auth_code_id)
        .execute(&*self.db)
        .await?;

        sqlx::query(
            "UPDATE refresh_tokens SET is_revoked = TRUE, revoked_at = ? \
             WHERE auth_code_id = ? AND is_revoked = FALSE",
        )
        .bind(now)
        .bind(auth_code_id)
        .execute(&*self.db)
        .await?;

        Ok(())
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
