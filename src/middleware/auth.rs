use crate::error::{AppError, AuthError};
use crate::services::rbac_service::RbacService;
use crate::services::session_service::SessionService;
use crate::services::token_service::TokenService;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Represents the authenticated context that can be extracted from a request.
///
/// Populated from either an OAuth access token (protocol callers) or a
/// session JWT (UI callers). Bearer 优先于 cookie：两者同时出现时以
/// bearer 为准。
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
    pub permissions: Vec<String>,
    pub jti: Option<String>,
}

impl AuthContext {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Rejects with 403 insufficient_scope unless the context carries `scope`.
pub fn require_scope(ctx: &AuthContext, scope: &str) -> Result<(), AppError> {
    if ctx.has_scope(scope) {
        return Ok(());
    }
    tracing::warn!(scope = scope, "Bearer token missing required scope");
    Err(AuthError::InsufficientScope.into())
}

/// Rejects with 403 insufficient_permissions unless every listed permission
/// is present.
pub fn require_permissions(ctx: &AuthContext, required: &[&str]) -> Result<(), AppError> {
    for permission in required {
        if !ctx.has_permission(permission) {
            tracing::warn!(
                user_id = ?ctx.user_id,
                permission = permission,
                "Permission denied"
            );
            return Err(AuthError::InsufficientPermissions.into());
        }
    }
    Ok(())
}

/// Authentication middleware for bearer-protected routes.
///
/// Accepts an OAuth access token first; a session JWT (the UI's credential)
/// is accepted as a fallback so /auth/check works for both caller kinds.
/// On success an `AuthContext` lands in the request extensions.
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.to_string())
        .ok_or(AuthError::InvalidToken)?;

    let auth_context = match state.token_service.verify_bearer(&token).await {
        Ok(claims) => AuthContext {
            user_id: claims.sub,
            client_id: Some(claims.client_id),
            scopes: claims.scope.split_whitespace().map(String::from).collect(),
            permissions: claims.permissions,
            jti: Some(claims.jti),
        },
        Err(access_err) => match state.session_service.validate(&token).await {
            Ok(session) => {
                // 会话主体的权限在校验时解析，不固化在 JWT 里
                let permissions = state
                    .rbac_service
                    .get_user_permissions(&session.user_id)
                    .await?;
                AuthContext {
                    user_id: Some(session.user_id),
                    client_id: None,
                    scopes: Vec::new(),
                    permissions,
                    jti: None,
                }
            }
            Err(_) => {
                tracing::debug!("Bearer rejected as access token: {access_err}");
                return Err(AuthError::InvalidToken.into());
            }
        },
    };

    request.extensions_mut().insert(auth_context.clone());
    let mut response = next.run(request).await;
    // 复制到响应扩展，供外层审计中间件取用
    response.extensions_mut().insert(auth_context);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(scopes: &[&str], permissions: &[&str]) -> AuthContext {
        AuthContext {
            user_id: Some("u1".to_string()),
            client_id: Some("c1".to_string()),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            permissions: permissions.iter().map(|s| s.to_string()).collect(),
            jti: None,
        }
    }

    #[test]
    fn test_require_scope() {
        let context = ctx(&["openid", "profile"], &[]);
        assert!(require_scope(&context, "openid").is_ok());
        assert!(require_scope(&context, "email").is_err());
    }

    #[test]
    fn test_require_permissions_needs_every_entry() {
        let context = ctx(&[], &["iam:users:read", "iam:users:write"]);
        assert!(require_permissions(&context, &["iam:users:read"]).is_ok());
        assert!(
            require_permissions(&context, &["iam:users:read", "iam:users:write"]).is_ok()
        );
        assert!(
            require_permissions(&context, &["iam:users:read", "iam:roles:read"]).is_err()
        );
    }
}
