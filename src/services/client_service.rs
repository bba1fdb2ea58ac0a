use crate::cache::jwks_cache::JwksCache;
use crate::config::Config;
use crate::error::{OAuthError, ServiceError};
use crate::models::client::{ClientType, OAuthClient, OAuthClientDetails, TokenEndpointAuthMethod};
use crate::utils::crypto;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Credentials presented at the token/introspect/revoke endpoints, already
/// extracted from the Authorization header or form body by the route layer.
#[derive(Debug, Clone)]
pub enum ClientCredentials {
    /// HTTP Basic header
    Basic { client_id: String, secret: String },
    /// client_id + client_secret in the form body
    Post { client_id: String, secret: String },
    /// client_assertion JWT signed by the client's own key
    Assertion {
        assertion_type: String,
        assertion: String,
    },
    /// public client: client_id only
    None { client_id: String },
}

/// Registration-side input; registration itself is admin-mediated (seeding
/// and tests), not exposed over the protocol surface.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateClientRequest {
    pub name: String,
    pub client_type: String,
    pub token_endpoint_auth_method: Option<String>,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub allowed_scopes: Vec<String>,
    pub client_permissions: Option<Vec<String>>,
    pub jwks_uri: Option<String>,
    pub require_pkce: Option<bool>,
    pub require_consent: Option<bool>,
    pub access_token_ttl: Option<i64>,
    pub refresh_token_ttl: Option<i64>,
}

/// Claims carried by a private_key_jwt client assertion (RFC 7523 §3).
#[derive(Debug, Deserialize)]
struct ClientAssertionClaims {
    iss: String,
    sub: String,
    #[allow(dead_code)]
    aud: serde_json::Value,
    #[allow(dead_code)]
    exp: usize,
}

#[async_trait]
pub trait ClientService: Send + Sync {
    async fn find_by_client_id(
        &self,
        client_id: &str,
    ) -> Result<Option<OAuthClientDetails>, ServiceError>;

    /// Authenticates a client against its registered token endpoint auth
    /// method. Every mismatch collapses into `invalid_client` (401).
    async fn authenticate_client(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<OAuthClientDetails, OAuthError>;

    async fn create_client(
        &self,
        request: CreateClientRequest,
    ) -> Result<(OAuthClientDetails, String), ServiceError>;
}

pub struct ClientServiceImpl {
    db: Arc<SqlitePool>,
    config: Arc<Config>,
    jwks_cache: Arc<JwksCache>,
}

impl ClientServiceImpl {
    pub fn new(db: Arc<SqlitePool>, config: Arc<Config>, jwks_cache: Arc<JwksCache>) -> Self {
        Self {
            db,
            config,
            jwks_cache,
        }
    }

    /// 机密客户端的密钥校验。argon2/bcrypt 验证本身即恒定时间。
    fn verify_secret(&self, client: &OAuthClient, provided: &str) -> Result<(), OAuthError> {
        let Some(stored_hash) = client.client_secret_hash.as_deref() else {
            tracing::error!(client_id = %client.client_id, "Confidential client has no secret hash");
            return Err(OAuthError::invalid_client());
        };

        match crypto::verify_password(provided, stored_hash) {
            Ok(true) => Ok(()),
            Ok(false) => Err(OAuthError::invalid_client()),
            Err(e) => {
                tracing::error!(client_id = %client.client_id, "Secret verification error: {e}");
                Err(OAuthError::invalid_client())
            }
        }
    }

    /// RFC 7523: 断言由客户端自己的密钥签名，对照其 jwks_uri 验证。
    /// iss 与 sub 必须等于 client_id，aud 必须指向本服务。
    async fn verify_client_assertion(
        &self,
        client: &OAuthClientDetails,
        assertion: &str,
    ) -> Result<(), OAuthError> {
        let Some(jwks_uri) = client.client.jwks_uri.as_deref() else {
            tracing::warn!(client_id = %client.client.client_id, "private_key_jwt client has no jwks_uri");
            return Err(OAuthError::invalid_client());
        };

        let header = decode_header(assertion).map_err(|_| OAuthError::invalid_client())?;

        let keys = self
            .jwks_cache
            .get(jwks_uri)
            .await
            .map_err(|_| OAuthError::invalid_client())?;

        // kid 命中则精确取键，未带 kid 时容忍单键文档
        let jwk = match header.kid.as_deref() {
            Some(kid) => keys.iter().find(|k| k.kid.as_deref() == Some(kid)),
            None if keys.len() == 1 => keys.first(),
            None => None,
        }
        .ok_or_else(OAuthError::invalid_client)?;

        let (n, e) = match (&jwk.n, &jwk.e) {
            (Some(n), Some(e)) => (n.as_str(), e.as_str()),
            _ => return Err(OAuthError::invalid_client()),
        };
        let decoding_key =
            DecodingKey::from_rsa_components(n, e).map_err(|_| OAuthError::invalid_client())?;

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = true;
        // 断言受众：issuer 或 token 端点 URL 均可
        validation.set_audience(&[
            self.config.issuer.clone(),
            format!("{}/token", self.config.issuer.trim_end_matches('/')),
        ]);

        let claims = decode::<ClientAssertionClaims>(assertion, &decoding_key, &validation)
            .map_err(|e| {
                tracing::debug!(client_id = %client.client.client_id, "Client assertion rejected: {e}");
                OAuthError::invalid_client()
            })?
            .claims;

        if claims.iss != client.client.client_id || claims.sub != client.client.client_id {
            return Err(OAuthError::invalid_client());
        }

        Ok(())
    }
}

#[async_trait]
impl ClientService for ClientServiceImpl {
    async fn find_by_client_id(
        &self,
        client_id: &str,
    ) -> Result<Option<OAuthClientDetails>, ServiceError> {
        let client: Option<OAuthClient> =
            sqlx::query_as("SELECT * FROM oauth_clients WHERE client_id = ?")
                .bind(client_id)
                .fetch_optional(&*self.db)
                .await?;

        if let Some(client) = client {
            // Related table reads run concurrently; the row id is the join key.
            let (redirect_uris, grant_types, response_types, allowed_scopes, client_permissions, ip_whitelist) =
                tokio::join!(
                    async {
                        sqlx::query_scalar("SELECT uri FROM client_redirect_uris WHERE client_id = ?")
                            .bind(&client.id)
                            .fetch_all(&*self.db)
                            .await
                            .unwrap_or_default()
                    },
                    async {
                        sqlx::query_scalar("SELECT grant_type FROM client_grant_types WHERE client_id = ?")
                            .bind(&client.id)
                            .fetch_all(&*self.db)
                            .await
                            .unwrap_or_default()
                    },
                    async {
                        sqlx::query_scalar("SELECT response_type FROM client_response_types WHERE client_id = ?")
                            .bind(&client.id)
                            .fetch_all(&*self.db)
                            .await
                            .unwrap_or_default()
                    },
                    async {
                        sqlx::query_scalar("SELECT scope FROM client_allowed_scopes WHERE client_id = ?")
                            .bind(&client.id)
                            .fetch_all(&*self.db)
                            .await
                            .unwrap_or_default()
                    },
                    async {
                        sqlx::query_scalar("SELECT permission FROM client_permissions WHERE client_id = ?")
                            .bind(&client.id)
                            .fetch_all(&*self.db)
                            .await
                            .unwrap_or_default()
                    },
                    async {
                        sqlx::query_scalar("SELECT ip_address FROM client_ip_whitelist WHERE client_id = ?")
                            .bind(&client.id)
                            .fetch_all(&*self.db)
                            .await
                            .unwrap_or_default()
                    }
                );

            Ok(Some(OAuthClientDetails {
                client,
                redirect_uris,
                grant_types,
                response_types,
                allowed_scopes,
                client_permissions,
                ip_whitelist,
            }))
        } else {
            Ok(None)
        }
    }

    async fn authenticate_client(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<OAuthClientDetails, OAuthError> {
        let client_id = match credentials {
            ClientCredentials::Basic { client_id, .. }
            | ClientCredentials::Post { client_id, .. }
            | ClientCredentials::None { client_id } => client_id.clone(),
            ClientCredentials::Assertion { assertion, .. } => {
                // 未验证前仅用于定位客户端记录
                decode_header(assertion)
                    .ok()
                    .and_then(|_| peek_unverified_issuer(assertion))
                    .ok_or_else(OAuthError::invalid_client)?
            }
        };

        let client = self
            .find_by_client_id(&client_id)
            .await
            .map_err(|e| {
                tracing::error!("Client lookup failed for {client_id}: {e}");
                OAuthError::server_error()
            })?
            .ok_or_else(OAuthError::invalid_client)?;

        if !client.client.is_active {
            return Err(OAuthError::invalid_client());
        }

        let registered = client.client.auth_method();

        match (credentials, registered) {
            (
                ClientCredentials::Basic { secret, .. },
                TokenEndpointAuthMethod::ClientSecretBasic,
            )
            | (ClientCredentials::Post { secret, .. }, TokenEndpointAuthMethod::ClientSecretPost) =>
            {
                if client.client.client_type != ClientType::CONFIDENTIAL {
                    return Err(OAuthError::invalid_client());
                }
                self.verify_secret(&client.client, secret)?;
            }
            (
                ClientCredentials::Assertion {
                    assertion_type,
                    assertion,
                },
                TokenEndpointAuthMethod::PrivateKeyJwt,
            ) => {
                if assertion_type != CLIENT_ASSERTION_TYPE_JWT_BEARER {
                    return Err(OAuthError::invalid_request(
                        "Unsupported client_assertion_type",
                    ));
                }
                self.verify_client_assertion(&client, assertion).await?;
            }
            (ClientCredentials::None { .. }, TokenEndpointAuthMethod::None) => {
                // 机密客户端绝不允许以 public 身份通过
                if client.client.client_type != ClientType::PUBLIC {
                    return Err(OAuthError::invalid_client());
                }
            }
            // presented method does not match the registered method
            _ => return Err(OAuthError::invalid_client()),
        }

        Ok(client)
    }

    async fn create_client(
        &self,
        request: CreateClientRequest,
    ) -> Result<(OAuthClientDetails, String), ServiceError> {
        let client_type = match request.client_type.to_uppercase().as_str() {
            "PUBLIC" => ClientType::PUBLIC,
            "CONFIDENTIAL" => ClientType::CONFIDENTIAL,
            other => {
                return Err(ServiceError::ValidationError(format!(
                    "Invalid client_type: {other}. Must be PUBLIC or CONFIDENTIAL"
                )))
            }
        };

        let auth_method = match &request.token_endpoint_auth_method {
            Some(raw) => TokenEndpointAuthMethod::parse(raw).ok_or_else(|| {
                ServiceError::ValidationError(format!(
                    "Invalid token_endpoint_auth_method: {raw}"
                ))
            })?,
            None => match client_type {
                ClientType::PUBLIC => TokenEndpointAuthMethod::None,
                ClientType::CONFIDENTIAL => TokenEndpointAuthMethod::ClientSecretBasic,
            },
        };

        // 结构不变量
        match client_type {
            ClientType::PUBLIC if auth_method != TokenEndpointAuthMethod::None => {
                return Err(ServiceError::ValidationError(
                    "PUBLIC clients must use token_endpoint_auth_method=none".to_string(),
                ))
            }
            ClientType::CONFIDENTIAL if auth_method == TokenEndpointAuthMethod::None => {
                return Err(ServiceError::ValidationError(
                    "CONFIDENTIAL clients must not use token_endpoint_auth_method=none"
                        .to_string(),
                ))
            }
            _ => {}
        }

        if auth_method == TokenEndpointAuthMethod::PrivateKeyJwt && request.jwks_uri.is_none() {
            return Err(ServiceError::ValidationError(
                "private_key_jwt clients must register a jwks_uri".to_string(),
            ));
        }

        if request.grant_types.iter().any(|g| g == "authorization_code")
            && !request.response_types.iter().any(|r| r == "code")
        {
            return Err(ServiceError::ValidationError(
                "authorization_code grant requires the 'code' response type".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let client_id = Uuid::new_v4().to_string();

        let (client_secret_hash, plain_secret) = if client_type == ClientType::CONFIDENTIAL
            && auth_method != TokenEndpointAuthMethod::PrivateKeyJwt
        {
            let secret = crypto::generate_token(32);
            let hash = crypto::hash_password(&secret)?;
            (Some(hash), secret)
        } else {
            (None, String::new())
        };

        let require_pkce = request
            .require_pkce
            .unwrap_or(client_type == ClientType::PUBLIC)
            // OAuth 2.1：PUBLIC 客户端的 PKCE 不可关闭
            || client_type == ClientType::PUBLIC;

        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO oauth_clients (
                id, client_id, client_secret_hash, name, client_type,
                token_endpoint_auth_method, jwks_uri, require_pkce, require_consent,
                is_active, access_token_ttl, refresh_token_ttl, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&client_id)
        .bind(&client_secret_hash)
        .bind(&request.name)
        .bind(client_type.to_string())
        .bind(auth_method.as_str())
        .bind(&request.jwks_uri)
        .bind(require_pkce)
        .bind(request.require_consent.unwrap_or(false))
        .bind(true)
        .bind(
            request
                .access_token_ttl
                .unwrap_or(self.config.access_token_ttl_default as i64),
        )
        .bind(
            request
                .refresh_token_ttl
                .unwrap_or(self.config.refresh_token_ttl_default as i64),
        )
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for uri in &request.redirect_uris {
            sqlx::query("INSERT INTO client_redirect_uris (client_id, uri) VALUES (?, ?)")
                .bind(&id)
                .bind(uri)
                .execute(&mut *tx)
                .await?;
        }

        for grant in &request.grant_types {
            sqlx::query("INSERT INTO client_grant_types (client_id, grant_type) VALUES (?, ?)")
                .bind(&id)
                .bind(grant)
                .execute(&mut *tx)
                .await?;
        }

        for res_type in &request.response_types {
            sqlx::query(
                "INSERT INTO client_response_types (client_id, response_type) VALUES (?, ?)",
            )
            .bind(&id)
            .bind(res_type)
            .execute(&mut *tx)
            .await?;
        }

        for scope in &request.allowed_scopes {
            sqlx::query("INSERT INTO client_allowed_scopes (client_id, scope) VALUES (?, ?)")
                .bind(&id)
                .bind(scope)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(permissions) = &request.client_permissions {
            for permission in permissions {
                sqlx::query("INSERT INTO client_permissions (client_id, permission) VALUES (?, ?)")
                    .bind(&id)
                    .bind(permission)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;

        let details = self
            .find_by_client_id(&client_id)
            .await?
            .ok_or_else(|| ServiceError::Internal("Client vanished after insert".to_string()))?;

        Ok((details, plain_secret))
    }
}

/// Reads the `iss` claim without signature verification, purely to locate the
/// client row; the assertion is then fully verified against that client's keys.
fn peek_unverified_issuer(assertion: &str) -> Option<String> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;

    let payload = assertion.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    value.get("iss")?.as_str().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_unverified_issuer() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine as _;

        let payload = URL_SAFE_NO_PAD.encode(r#"{"iss":"my-client","sub":"my-client"}"#);
        let fake = format!("eyJhbGciOiJSUzI1NiJ9.{payload}.sig");
        assert_eq!(peek_unverified_issuer(&fake).as_deref(), Some("my-client"));
        assert_eq!(peek_unverified_issuer("garbage"), None);
    }
}
