use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Enum for OAuth client types, mirroring the database schema.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum ClientType {
    PUBLIC,
    CONFIDENTIAL,
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientType::PUBLIC => write!(f, "PUBLIC"),
            ClientType::CONFIDENTIAL => write!(f, "CONFIDENTIAL"),
        }
    }
}

/// Token endpoint client authentication methods (RFC 6749 §2.3, OIDC Core §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
    PrivateKeyJwt,
    None,
}

impl TokenEndpointAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenEndpointAuthMethod::ClientSecretBasic => "client_secret_basic",
            TokenEndpointAuthMethod::ClientSecretPost => "client_secret_post",
            TokenEndpointAuthMethod::PrivateKeyJwt => "private_key_jwt",
            TokenEndpointAuthMethod::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client_secret_basic" => Some(Self::ClientSecretBasic),
            "client_secret_post" => Some(Self::ClientSecretPost),
            "private_key_jwt" => Some(Self::PrivateKeyJwt),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for TokenEndpointAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents the core data of an OAuth2 client from the `oauth_clients` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OAuthClient {
    pub id: String,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret_hash: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub client_type: ClientType,
    pub token_endpoint_auth_method: String,
    pub jwks_uri: Option<String>,
    pub require_pkce: bool,
    pub require_consent: bool,
    pub is_active: bool,
    pub access_token_ttl: i64,
    pub refresh_token_ttl: i64,
    pub authorization_code_ttl: Option<i64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl OAuthClient {
    pub fn auth_method(&self) -> TokenEndpointAuthMethod {
        TokenEndpointAuthMethod::parse(&self.token_endpoint_auth_method)
            // 写入侧由 create_client 校验；脏数据按最严格方法兜底
            .unwrap_or(TokenEndpointAuthMethod::PrivateKeyJwt)
    }
}

/// Represents a fully detailed OAuth2 client, including the normalized
/// list attributes joined from their own tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientDetails {
    #[serde(flatten)]
    pub client: OAuthClient,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub allowed_scopes: Vec<String>,
    pub client_permissions: Vec<String>,
    pub ip_whitelist: Vec<String>,
}

impl OAuthClientDetails {
    pub fn supports_grant(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }

    pub fn supports_response_type(&self, response_type: &str) -> bool {
        self.response_types.iter().any(|r| r == response_type)
    }

    /// PKCE 对 PUBLIC 客户端强制，对显式配置的机密客户端同样强制
    pub fn pkce_required(&self) -> bool {
        self.client.require_pkce || self.client.client_type == ClientType::PUBLIC
    }
}
