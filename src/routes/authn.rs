use crate::error::{AppError, ServiceError};
use crate::middleware::auth::AuthContext;
use crate::services::rbac_service::RbacService;
use crate::services::session_service::SessionService;
use crate::services::user_service::UserService;
use crate::state::AppState;
use axum::{
    extract::{Json as JsonExtractor, State},
    http::HeaderMap,
    response::Json,
    Extension,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// --- Login ---

#[derive(Deserialize, Debug)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize, Debug)]
pub struct LoginResponse {
    success: bool,
    /// session JWT, also set as the session_token cookie
    session_token: String,
    /// opaque; only /auth/refresh accepts it
    refresh_token: String,
    expires_at: i64,
}

/// Handles `POST /auth/login`, the session bootstrap for browser flows.
/// 验证凭证、落一条 session 行、种 cookie，配合 /authorize 使用。
pub async fn login_endpoint(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    JsonExtractor(request): JsonExtractor<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), AppError> {
    // 入参形状检查先于任何数据库访问
    let username = request.username.trim().to_string();
    if username.len() < 3 || username.len() > 50 {
        return Err(ServiceError::ValidationError(
            "Username must be between 3 and 50 characters".to_string(),
        )
        .into());
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || "._@-".contains(c))
    {
        return Err(
            ServiceError::ValidationError("Username contains invalid characters".to_string())
                .into(),
        );
    }
    if request.password.len() < 6 || request.password.len() > 128 {
        return Err(ServiceError::ValidationError(
            "Password must be between 6 and 128 characters".to_string(),
        )
        .into());
    }

    let user = state
        .user_service
        .authenticate(&username, &request.password)
        .await?;

    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string());
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let tokens = state
        .session_service
        .create_session(&user.id, ip_address, user_agent)
        .await?;

    let max_age = (tokens.expires_at - chrono::Utc::now()).num_seconds().max(0);
    let session_cookie = Cookie::build(("session_token", tokens.session_jwt.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(max_age));

    let updated_jar = jar.add(session_cookie);

    tracing::info!(user_id = %user.id, "Login successful");

    Ok((
        updated_jar,
        Json(LoginResponse {
            success: true,
            session_token: tokens.session_jwt,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at.timestamp(),
        }),
    ))
}

// --- Session refresh ---

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionRefreshRequest {
    refresh_token: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionRefreshResponse {
    session_token: String,
    refresh_token: String,
    expires_at: i64,
}

/// Handles `POST /auth/refresh`: refreshes the server session (not an OAuth
/// refresh). The opaque session refresh token rotates on every call.
pub async fn session_refresh_endpoint(
    State(state): State<Arc<AppState>>,
    JsonExtractor(request): JsonExtractor<SessionRefreshRequest>,
) -> Result<Json<SessionRefreshResponse>, AppError> {
    let tokens = state
        .session_service
        .refresh(&request.refresh_token)
        .await?;

    Ok(Json(SessionRefreshResponse {
        session_token: tokens.session_jwt,
        refresh_token: tokens.refresh_token,
        expires_at: tokens.expires_at.timestamp(),
    }))
}

// --- Permission checks ---

#[derive(Deserialize, Debug)]
pub struct CheckRequest {
    permission: String,
    #[allow(dead_code)]
    context: Option<serde_json::Value>,
}

#[derive(Serialize, Debug)]
pub struct CheckResponse {
    allowed: bool,
}

/// Handles `POST /auth/check`: single allow query against the evaluator.
pub async fn check_endpoint(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    JsonExtractor(request): JsonExtractor<CheckRequest>,
) -> Result<Json<CheckResponse>, AppError> {
    let allowed = match &ctx.user_id {
        // 用户主体走新解析，权限图写入后立即生效
        Some(user_id) => {
            state
                .rbac_service
                .has_permission(user_id, &request.permission)
                .await?
        }
        // client_credentials 令牌只看令牌携带的权限
        None => ctx.has_permission(&request.permission),
    };

    Ok(Json(CheckResponse { allowed }))
}

#[derive(Deserialize, Debug)]
pub struct CheckBatchRequest {
    permissions: Vec<String>,
    #[allow(dead_code)]
    context: Option<serde_json::Value>,
}

#[derive(Serialize, Debug)]
pub struct CheckBatchResult {
    permission: String,
    allowed: bool,
}

#[derive(Serialize, Debug)]
pub struct CheckBatchResponse {
    results: Vec<CheckBatchResult>,
}

/// Handles `POST /auth/check-batch`: one resolve, many membership tests.
pub async fn check_batch_endpoint(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    JsonExtractor(request): JsonExtractor<CheckBatchRequest>,
) -> Result<Json<CheckBatchResponse>, AppError> {
    let results = match &ctx.user_id {
        Some(user_id) => {
            let verdicts = state
                .rbac_service
                .has_permissions_batch(user_id, &request.permissions)
                .await?;
            request
                .permissions
                .iter()
                .map(|p| CheckBatchResult {
                    permission: p.clone(),
                    allowed: verdicts.get(p).copied().unwrap_or(false),
                })
                .collect()
        }
        None => request
            .permissions
            .iter()
            .map(|p| CheckBatchResult {
                permission: p.clone(),
                allowed: ctx.has_permission(p),
            })
            .collect(),
    };

    Ok(Json(CheckBatchResponse { results }))
}
