use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// A common error type for the entire application.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("OAuth error: {0}")]
    OAuth(#[from] OAuthError),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Errors that can occur within the service layer.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Password hashing error: {0}")]
    PasswordError(String),

    #[error("Token error: {0}")]
    Token(#[from] TokenVerifyError),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Upstream error: {0}")]
    Upstream(String),
}

/// Errors related to authentication and authorization at the request boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Token does not grant the required scope")]
    InsufficientScope,

    #[error("Missing required permissions")]
    InsufficientPermissions,
}

/// JWT 验证失败的细分原因。协议层据此映射到 OAuth 错误码，
/// 调用方可以区分签名、过期、kid、算法等失败模式。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TokenVerifyError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("unknown kid: {0}")]
    UnknownKid(String),

    #[error("algorithm mismatch")]
    AlgorithmMismatch,

    #[error("malformed token")]
    Malformed,

    #[error("token revoked")]
    Revoked,
}

impl From<jsonwebtoken::errors::Error> for TokenVerifyError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenVerifyError::Expired,
            ErrorKind::InvalidSignature => TokenVerifyError::InvalidSignature,
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                TokenVerifyError::AlgorithmMismatch
            }
            _ => TokenVerifyError::Malformed,
        }
    }
}

/// RFC 6749 风格的协议错误。授权端点在 redirect_uri 验证通过后
/// 以重定向形式返回；令牌端点以 JSON 返回。
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {description:?}")]
pub struct OAuthError {
    pub kind: OAuthErrorKind,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthErrorKind {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    InvalidScope,
    UnauthorizedClient,
    UnsupportedGrantType,
    UnsupportedResponseType,
    AccessDenied,
    LoginRequired,
    ConsentRequired,
    InvalidToken,
    InsufficientScope,
    ServerError,
    TemporarilyUnavailable,
}

impl std::fmt::Display for OAuthErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OAuthErrorKind {
    /// Wire-format error code as defined by RFC 6749 / 7662 / OIDC Core.
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthErrorKind::InvalidRequest => "invalid_request",
            OAuthErrorKind::InvalidClient => "invalid_client",
            OAuthErrorKind::InvalidGrant => "invalid_grant",
            OAuthErrorKind::InvalidScope => "invalid_scope",
            OAuthErrorKind::UnauthorizedClient => "unauthorized_client",
            OAuthErrorKind::UnsupportedGrantType => "unsupported_grant_type",
            OAuthErrorKind::UnsupportedResponseType => "unsupported_response_type",
            OAuthErrorKind::AccessDenied => "access_denied",
            OAuthErrorKind::LoginRequired => "login_required",
            OAuthErrorKind::ConsentRequired => "consent_required",
            OAuthErrorKind::InvalidToken => "invalid_token",
            OAuthErrorKind::InsufficientScope => "insufficient_scope",
            OAuthErrorKind::ServerError => "server_error",
            OAuthErrorKind::TemporarilyUnavailable => "temporarily_unavailable",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            OAuthErrorKind::InvalidClient | OAuthErrorKind::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            OAuthErrorKind::InsufficientScope => StatusCode::FORBIDDEN,
            OAuthErrorKind::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            OAuthErrorKind::TemporarilyUnavailable => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl OAuthError {
    pub fn new(kind: OAuthErrorKind) -> Self {
        Self {
            kind,
            description: None,
        }
    }

    pub fn with_description(kind: OAuthErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: Some(description.into()),
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::with_description(OAuthErrorKind::InvalidRequest, description)
    }

    pub fn invalid_client() -> Self {
        Self::new(OAuthErrorKind::InvalidClient)
    }

    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::with_description(OAuthErrorKind::InvalidGrant, description)
    }

    pub fn invalid_scope(description: impl Into<String>) -> Self {
        Self::with_description(OAuthErrorKind::InvalidScope, description)
    }

    pub fn server_error() -> Self {
        Self::new(OAuthErrorKind::ServerError)
    }

    pub fn body(&self) -> serde_json::Value {
        match &self.description {
            Some(desc) => json!({ "error": self.kind.as_str(), "error_description": desc }),
            None => json!({ "error": self.kind.as_str() }),
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        // invalid_client 按 RFC 6749 §5.2 携带 WWW-Authenticate
        if self.kind == OAuthErrorKind::InvalidClient {
            return (
                status,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"oauth\"")],
                Json(self.body()),
            )
                .into_response();
        }
        (status, Json(self.body())).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::OAuth(oauth_error) => return oauth_error.into_response(),
            AppError::Service(service_error) => match service_error {
                // Don't expose database error details to clients
                ServiceError::Database(e) => {
                    tracing::error!("Database error: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "An internal error occurred. Please try again later.".to_string(),
                    )
                }
                ServiceError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
                ServiceError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
                ServiceError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
                ServiceError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
                ServiceError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
                ServiceError::Conflict(msg) => (StatusCode::CONFLICT, msg),
                ServiceError::InvalidScope(msg) => (StatusCode::BAD_REQUEST, msg),
                ServiceError::Token(e) => {
                    tracing::debug!("Token verification failed: {}", e);
                    (
                        StatusCode::UNAUTHORIZED,
                        "Invalid or expired token".to_string(),
                    )
                }
                // Don't expose password hashing details
                ServiceError::PasswordError(e) => {
                    tracing::error!("Password hashing error: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Authentication system error. Please try again later.".to_string(),
                    )
                }
                ServiceError::RateLimitExceeded(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
                ServiceError::Upstream(e) => {
                    tracing::error!("Upstream dependency error: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "An internal error occurred. Please try again later.".to_string(),
                    )
                }
            },
            AppError::Auth(auth_error) => match auth_error {
                AuthError::InvalidCredentials | AuthError::InvalidToken => {
                    (StatusCode::UNAUTHORIZED, auth_error.to_string())
                }
                AuthError::InsufficientScope | AuthError::InsufficientPermissions => {
                    (StatusCode::FORBIDDEN, auth_error.to_string())
                }
            },
            AppError::Url(e) => {
                tracing::error!("URL error: {}", e);
                (
                    StatusCode::BAD_REQUEST,
                    "Malformed URL in request".to_string(),
                )
            }
            // Don't expose internal error details
            AppError::Sqlx(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred. Please try again later.".to_string(),
                )
            }
            AppError::Io(e) => {
                tracing::error!("IO error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred. Please try again later.".to_string(),
                )
            }
            AppError::Anyhow(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred. Please try again later.".to_string(),
                )
            }
        };

        let body = Json(json!({ "error": error_message }));
        (status, body).into_response()
    }
}
