use crate::error::AppError;
use crate::models::jwk::JwksDocument;
use crate::models::rbac::Scope;
use crate::state::AppState;
use axum::{extract::State, response::Json};
use serde_json::{json, Value};
use std::sync::Arc;

/// Handles `GET /.well-known/oauth-authorization-server` (RFC 8414) and
/// `GET /.well-known/openid-configuration`: the same document, derived at
/// request time from configuration. 文档只公布协议引擎真实支持的内容。
pub async fn discovery_document(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, AppError> {
    let issuer = state.config.issuer.trim_end_matches('/').to_string();

    let scopes: Vec<Scope> =
        sqlx::query_as("SELECT * FROM scopes WHERE is_active = TRUE ORDER BY name")
            .fetch_all(&*state.db)
            .await
            .map_err(crate::error::ServiceError::from)?;
    let scopes_supported: Vec<String> = scopes.into_iter().map(|s| s.name).collect();

    Ok(Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
        "introspection_endpoint": format!("{issuer}/introspect"),
        "revocation_endpoint": format!("{issuer}/revoke"),
        "userinfo_endpoint": format!("{issuer}/userinfo"),
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "scopes_supported": scopes_supported,
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token", "client_credentials"],
        "token_endpoint_auth_methods_supported": [
            "client_secret_basic",
            "client_secret_post",
            "private_key_jwt",
            "none"
        ],
        "code_challenge_methods_supported": ["S256"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": [state.key_service.algorithm().as_str()],
        "claims_supported": [
            "iss", "sub", "aud", "exp", "iat", "auth_time", "nonce",
            "name", "given_name", "family_name", "preferred_username",
            "picture", "email", "email_verified"
        ],
    })))
}

/// Handles `GET /.well-known/jwks.json`: the ACTIVE key plus every RETIRED
/// key that may still have live tokens.
pub async fn jwks_document(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JwksDocument>, AppError> {
    let document = state.key_service.jwks_document().await?;
    Ok(Json(document))
}
