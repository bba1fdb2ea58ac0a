use crate::error::{AppError, OAuthError, OAuthErrorKind, ServiceError};
use crate::middleware::auth::{require_scope, AuthContext};
use crate::models::client::OAuthClientDetails;
use crate::services::auth_code_service::{AuthCodeService, CodeConsumption, CodeParams};
use crate::services::client_service::{
    ClientCredentials, ClientService, CLIENT_ASSERTION_TYPE_JWT_BEARER,
};
use crate::services::consent_service::ConsentService;
use crate::services::rbac_service::RbacService;
use crate::services::session_service::SessionService;
use crate::services::token_service::{IntrospectionData, IssueParams, TokenPair, TokenService};
use crate::services::user_service::UserService;
use crate::state::AppState;
use crate::utils::{pkce, validation};
use axum::{
    extract::{Form, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};
use axum_extra::extract::cookie::CookieJar;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

// --- Authorize Endpoint ---

#[derive(Deserialize, Debug)]
pub struct AuthorizeParams {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
    pub prompt: Option<String>,
    pub max_age: Option<i64>,
}

// --- Token Endpoint ---

#[derive(Deserialize, Debug)]
pub struct TokenRequestForm {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_assertion_type: Option<String>,
    pub client_assertion: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub scope: String,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            token_type: "Bearer".to_string(),
            expires_in: pair.expires_in,
            refresh_token: pair.refresh_token,
            id_token: pair.id_token,
            scope: pair.scope,
        }
    }
}

// --- Introspect / Revoke ---

#[derive(Deserialize, Debug)]
pub struct IntrospectRequestForm {
    pub token: String,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_assertion_type: Option<String>,
    pub client_assertion: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct RevokeRequestForm {
    pub token: String,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_assertion_type: Option<String>,
    pub client_assertion: Option<String>,
}

// --- Endpoint Handlers ---

/// Handles `GET /authorize`, the authorization endpoint state machine.
///
/// 错误分两段：client_id / redirect_uri 验证通过之前返回 400 JSON，
/// 绝不重定向；之后的所有错误都带着原始 state 重定向回客户端。
pub async fn authorize_endpoint(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    // 1. Resolve client. Failure: 400 JSON (cannot redirect yet).
    let client = match resolve_client(&state, params.client_id.as_deref()).await {
        Ok(client) => client,
        Err(response) => return response,
    };

    // 2. Validate redirect_uri. Failure: 400 JSON (must not redirect).
    let redirect_uri = match params.redirect_uri.as_deref() {
        Some(uri) if validation::validate_redirect_uri(uri, &client.redirect_uris).is_ok() => {
            uri.to_string()
        }
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_request",
                    "error_description": "Invalid redirect_uri"
                })),
            )
                .into_response()
        }
    };

    // 3. From here on, all errors redirect back with the original state.
    let state_param = params.state.clone();
    if let Some(s) = state_param.as_deref() {
        if validation::validate_state(s).is_err() {
            return redirect_error(
                &redirect_uri,
                OAuthErrorKind::InvalidRequest,
                "Malformed state parameter",
                None,
            );
        }
    }

    if params.response_type.as_deref() != Some("code") {
        return redirect_error(
            &redirect_uri,
            OAuthErrorKind::UnsupportedResponseType,
            "Only response_type=code is supported",
            state_param.as_deref(),
        );
    }

    // 4. Parse scopes: every requested scope must be configured for the client.
    let requested_scope = params.scope.clone().unwrap_or_default();
    if let Err(e) = validation::validate_scope(&requested_scope, &client.allowed_scopes) {
        return redirect_error(
            &redirect_uri,
            OAuthErrorKind::InvalidScope,
            &e.to_string(),
            state_param.as_deref(),
        );
    }
    let effective_scopes = validation::parse_scopes(&requested_scope);
    let effective_scope = effective_scopes.join(" ");

    // 5. Enforce PKCE.
    if client.pkce_required() {
        let Some(challenge) = params.code_challenge.as_deref() else {
            return redirect_error(
                &redirect_uri,
                OAuthErrorKind::InvalidRequest,
                "code_challenge is required for this client",
                state_param.as_deref(),
            );
        };
        if params.code_challenge_method.as_deref() != Some("S256") {
            return redirect_error(
                &redirect_uri,
                OAuthErrorKind::InvalidRequest,
                "code_challenge_method must be S256",
                state_param.as_deref(),
            );
        }
        if pkce::validate_code_challenge(challenge).is_err() {
            return redirect_error(
                &redirect_uri,
                OAuthErrorKind::InvalidRequest,
                "code_challenge must be 43-128 base64url characters",
                state_param.as_deref(),
            );
        }
    }

    if let Some(nonce) = params.nonce.as_deref() {
        if validation::validate_nonce(nonce).is_err() {
            return redirect_error(
                &redirect_uri,
                OAuthErrorKind::InvalidRequest,
                "Malformed nonce parameter",
                state_param.as_deref(),
            );
        }
    }

    let prompt_none = params.prompt.as_deref() == Some("none");

    // 6. Authenticate user: bearer token is authoritative over the cookie.
    let session = resolve_session(&state, &jar, &headers).await;

    let session = match session {
        Some(session) => session,
        None => {
            // 未认证：prompt=none 直接报错，否则移交外部登录协作方
            if prompt_none {
                return redirect_error(
                    &redirect_uri,
                    OAuthErrorKind::LoginRequired,
                    "User authentication is required",
                    state_param.as_deref(),
                );
            }
            return redirect_to_collaborator(&state, &state.config.login_url, &raw_query);
        }
    };

    // 7. Enforce max_age: stale authentication forces re-auth.
    if let Some(max_age) = params.max_age {
        let age = (Utc::now() - session.auth_time).num_seconds();
        if age > max_age {
            if prompt_none {
                return redirect_error(
                    &redirect_uri,
                    OAuthErrorKind::LoginRequired,
                    "Authentication is older than max_age",
                    state_param.as_deref(),
                );
            }
            return redirect_to_collaborator(&state, &state.config.login_url, &raw_query);
        }
    }

    // 8. Resolve consent against the persisted grant.
    if client.client.require_consent {
        let covered = state
            .consent_service
            .has_consent(&session.user_id, &client.client.id, &effective_scopes)
            .await
            .unwrap_or(false);

        if !covered {
            if prompt_none {
                return redirect_error(
                    &redirect_uri,
                    OAuthErrorKind::ConsentRequired,
                    "User consent is required",
                    state_param.as_deref(),
                );
            }
            return redirect_to_collaborator(&state, &state.config.consent_url, &raw_query);
        }
    }

    // 9. Mint the code.
    let code = match state
        .auth_code_service
        .create_code(CodeParams {
            client: &client,
            user_id: &session.user_id,
            redirect_uri: &redirect_uri,
            scope: &effective_scope,
            code_challenge: params.code_challenge.as_deref(),
            code_challenge_method: params
                .code_challenge
                .is_some()
                .then_some("S256"),
            nonce: params.nonce.as_deref(),
            state: state_param.as_deref(),
            auth_time: session.auth_time,
        })
        .await
    {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("Failed to mint authorization code: {e}");
            return redirect_error(
                &redirect_uri,
                OAuthErrorKind::ServerError,
                "Failed to issue authorization code",
                state_param.as_deref(),
            );
        }
    };

    tracing::info!(
        client_id = %client.client.client_id,
        user_id = %session.user_id,
        "Authorization code issued"
    );

    // 10. Redirect back with code and state.
    let mut url = match url::Url::parse(&redirect_uri) {
        Ok(url) => url,
        Err(_) => return OAuthError::server_error().into_response(),
    };
    url.query_pairs_mut().append_pair("code", &code);
    if let Some(s) = state_param.as_deref() {
        url.query_pairs_mut().append_pair("state", s);
    }

    found(url.as_str())
}

/// 302 Found，OAuth 的重定向语义；axum 的 Redirect::to 是 303
fn found(location: &str) -> Response {
    match axum::http::HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => OAuthError::server_error().into_response(),
    }
}

/// Handles `POST /token` (application/x-www-form-urlencoded).
pub async fn token_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<TokenRequestForm>,
) -> Result<Json<TokenResponse>, OAuthError> {
    let credentials = extract_client_credentials(&headers, &form)?;
    let client = state.client_service.authenticate_client(&credentials).await?;

    match form.grant_type.as_deref() {
        Some("authorization_code") => {
            handle_authorization_code_grant(&state, &client, &form).await
        }
        Some("refresh_token") => handle_refresh_token_grant(&state, &client, &form).await,
        Some("client_credentials") => {
            handle_client_credentials_grant(&state, &client, &form).await
        }
        Some(other) => Err(OAuthError::with_description(
            OAuthErrorKind::UnsupportedGrantType,
            format!("Unsupported grant_type: {other}"),
        )),
        None => Err(OAuthError::invalid_request("Missing grant_type")),
    }
}

/// Handles `POST /introspect` (RFC 7662).
pub async fn introspect_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<IntrospectRequestForm>,
) -> Result<Json<IntrospectionData>, OAuthError> {
    let credentials = extract_client_credentials_parts(
        &headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
        form.client_assertion_type.as_deref(),
        form.client_assertion.as_deref(),
    )?;
    state.client_service.authenticate_client(&credentials).await?;

    // 令牌无效、过期、被吊销、被拉黑：统一 {active:false}，不泄漏任何元数据
    let data = state
        .token_service
        .introspect(&form.token, form.token_type_hint.as_deref())
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Introspection error (answering inactive): {e}");
            IntrospectionData::inactive()
        });

    Ok(Json(data))
}

/// Handles `POST /revoke` (RFC 7009). Always 200, even for unknown tokens.
pub async fn revoke_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<RevokeRequestForm>,
) -> Result<StatusCode, OAuthError> {
    let credentials = extract_client_credentials_parts(
        &headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
        form.client_assertion_type.as_deref(),
        form.client_assertion.as_deref(),
    )?;
    let client = state.client_service.authenticate_client(&credentials).await?;

    match state
        .token_service
        .revoke(&form.token, form.token_type_hint.as_deref(), &client)
        .await
    {
        Ok(()) => {}
        Err(e) => {
            // 按 RFC 7009 吊销失败对客户端不可见
            tracing::debug!("Token revocation error (treating as success): {e}");
        }
    }

    Ok(StatusCode::OK)
}

#[derive(Serialize, Debug)]
pub struct UserInfoResponse {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
}

/// Handles `GET/POST /userinfo`. Claims are released by scope.
pub async fn userinfo_endpoint(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<UserInfoResponse>, AppError> {
    require_scope(&ctx, "openid")?;

    let user_id = ctx.user_id.clone().ok_or_else(|| {
        AppError::Service(ServiceError::Unauthorized(
            "Token does not represent a user".to_string(),
        ))
    })?;

    let user = state
        .user_service
        .find_by_id(&user_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

    let has_profile = ctx.has_scope("profile");
    let has_email = ctx.has_scope("email");

    let name = if has_profile {
        user.display_name
            .clone()
            .or_else(|| match (&user.first_name, &user.last_name) {
                (Some(first), Some(last)) => Some(format!("{first} {last}")),
                (Some(first), None) => Some(first.clone()),
                (None, Some(last)) => Some(last.clone()),
                (None, None) => None,
            })
    } else {
        None
    };

    Ok(Json(UserInfoResponse {
        sub: user.id.clone(),
        preferred_username: has_profile.then(|| user.username.clone()),
        name,
        given_name: has_profile.then(|| user.first_name.clone()).flatten(),
        family_name: has_profile.then(|| user.last_name.clone()).flatten(),
        picture: has_profile.then(|| user.picture.clone()).flatten(),
        updated_at: has_profile.then(|| user.updated_at.timestamp()),
        email: has_email.then(|| user.email.clone()).flatten(),
        email_verified: has_email.then_some(user.email_verified),
    }))
}

// --- Grant Type Handlers ---

async fn handle_authorization_code_grant(
    state: &Arc<AppState>,
    client: &OAuthClientDetails,
    form: &TokenRequestForm,
) -> Result<Json<TokenResponse>, OAuthError> {
    if !client.supports_grant("authorization_code") {
        return Err(OAuthError::with_description(
            OAuthErrorKind::UnauthorizedClient,
            "Client is not allowed to use the authorization_code grant",
        ));
    }

    let code = form
        .code
        .as_deref()
        .ok_or_else(|| OAuthError::invalid_request("Missing authorization code"))?;
    let redirect_uri = form
        .redirect_uri
        .as_deref()
        .ok_or_else(|| OAuthError::invalid_request("Missing redirect_uri"))?;

    // 原子消费：每个 code 至多一个调用方观察到 Consumed
    let auth_code = match state
        .auth_code_service
        .consume_code(code)
        .await
        .map_err(map_service_error)?
    {
        CodeConsumption::Consumed(auth_code) => auth_code,
        CodeConsumption::Replayed(auth_code) => {
            // 重放：该 code 名下已发出的令牌全部吊销
            let _ = state
                .token_service
                .revoke_tokens_for_code(&auth_code.id)
                .await;
            return Err(OAuthError::invalid_grant(
                "Authorization code has already been used",
            ));
        }
        CodeConsumption::Expired(_) => {
            return Err(OAuthError::invalid_grant("Authorization code has expired"))
        }
        CodeConsumption::NotFound => {
            return Err(OAuthError::invalid_grant("Invalid authorization code"))
        }
    };

    // 消费后的每项检查失败都要吊销该 code 名下的令牌（防御性）
    let fail = |description: &str| -> OAuthError { OAuthError::invalid_grant(description) };

    if auth_code.client_id != client.client.id {
        let _ = state
            .token_service
            .revoke_tokens_for_code(&auth_code.id)
            .await;
        return Err(fail(
            "Client mismatch between authorization and token requests",
        ));
    }

    if auth_code.redirect_uri != redirect_uri {
        let _ = state
            .token_service
            .revoke_tokens_for_code(&auth_code.id)
            .await;
        return Err(fail("redirect_uri does not match the authorization request"));
    }

    match (auth_code.code_challenge.as_deref(), form.code_verifier.as_deref()) {
        (Some(challenge), Some(verifier)) => {
            if pkce::verify_pkce(verifier, challenge).is_err() {
                let _ = state
                    .token_service
                    .revoke_tokens_for_code(&auth_code.id)
                    .await;
                return Err(fail("PKCE verification failed"));
            }
        }
        (Some(_), None) => {
            let _ = state
                .token_service
                .revoke_tokens_for_code(&auth_code.id)
                .await;
            return Err(fail("Missing code_verifier"));
        }
        (None, _) if client.pkce_required() => {
            let _ = state
                .token_service
                .revoke_tokens_for_code(&auth_code.id)
                .await;
            return Err(fail("Authorization was made without a PKCE challenge"));
        }
        (None, _) => {}
    }

    let user = state
        .user_service
        .find_by_id(&auth_code.user_id)
        .await
        .map_err(map_service_error)?
        .filter(|u| u.is_active)
        .ok_or_else(|| OAuthError::invalid_grant("Token subject is disabled or missing"))?;

    let permissions = state
        .rbac_service
        .get_user_permissions(&user.id)
        .await
        .map_err(map_service_error)?;

    let pair = state
        .token_service
        .issue_tokens(IssueParams {
            client,
            user: Some(&user),
            scope: auth_code.scope.clone(),
            permissions,
            nonce: auth_code.nonce.clone(),
            auth_time: Some(auth_code.auth_time),
            auth_code_id: Some(auth_code.id.clone()),
        })
        .await
        .map_err(map_service_error)?;

    Ok(Json(pair.into()))
}

async fn handle_refresh_token_grant(
    state: &Arc<AppState>,
    client: &OAuthClientDetails,
    form: &TokenRequestForm,
) -> Result<Json<TokenResponse>, OAuthError> {
    if !client.supports_grant("refresh_token") {
        return Err(OAuthError::with_description(
            OAuthErrorKind::UnauthorizedClient,
            "Client is not allowed to use the refresh_token grant",
        ));
    }

    let refresh_token = form
        .refresh_token
        .as_deref()
        .ok_or_else(|| OAuthError::invalid_request("Missing refresh_token"))?;

    let pair = state
        .token_service
        .refresh(refresh_token, client, form.scope.as_deref())
        .await
        .map_err(|e| match e {
            ServiceError::InvalidScope(msg) => OAuthError::invalid_scope(msg),
            ServiceError::Unauthorized(msg) => OAuthError::invalid_grant(msg),
            other => {
                tracing::error!("Refresh exchange failed: {other}");
                OAuthError::server_error()
            }
        })?;

    Ok(Json(pair.into()))
}

async fn handle_client_credentials_grant(
    state: &Arc<AppState>,
    client: &OAuthClientDetails,
    form: &TokenRequestForm,
) -> Result<Json<TokenResponse>, OAuthError> {
    use crate::models::client::ClientType;

    // 仅限机密客户端；无用户主体，不发 refresh token
    if client.client.client_type != ClientType::CONFIDENTIAL {
        return Err(OAuthError::with_description(
            OAuthErrorKind::UnauthorizedClient,
            "client_credentials is restricted to confidential clients",
        ));
    }
    if !client.supports_grant("client_credentials") {
        return Err(OAuthError::with_description(
            OAuthErrorKind::UnauthorizedClient,
            "Client is not allowed to use the client_credentials grant",
        ));
    }

    let scope = match form.scope.as_deref() {
        Some(scope) if !scope.trim().is_empty() => {
            validation::validate_scope(scope, &client.allowed_scopes)
                .map_err(|e| OAuthError::invalid_scope(e.to_string()))?;
            scope.to_string()
        }
        _ => client.allowed_scopes.join(" "),
    };

    // scope 映射的权限与客户端自有权限取并集
    let mapped = state
        .rbac_service
        .permissions_for_scopes(&validation::parse_scopes(&scope))
        .await
        .map_err(map_service_error)?;
    let permissions: Vec<String> = mapped
        .into_iter()
        .chain(client.client_permissions.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let pair = state
        .token_service
        .issue_tokens(IssueParams {
            client,
            user: None,
            scope,
            permissions,
            nonce: None,
            auth_time: None,
            auth_code_id: None,
        })
        .await
        .map_err(map_service_error)?;

    Ok(Json(pair.into()))
}

// --- Helper Functions ---

/// The authenticated session backing an /authorize call.
pub struct AuthorizeSession {
    pub user_id: String,
    pub auth_time: DateTime<Utc>,
}

async fn resolve_client(
    state: &Arc<AppState>,
    client_id: Option<&str>,
) -> Result<OAuthClientDetails, Response> {
    let bad_client = || {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unauthorized_client" })),
        )
            .into_response()
    };

    let client_id = client_id.ok_or_else(bad_client)?;
    validation::validate_client_id(client_id).map_err(|_| bad_client())?;

    let client = state
        .client_service
        .find_by_client_id(client_id)
        .await
        .map_err(|e| {
            tracing::error!("Client lookup failed: {e}");
            OAuthError::server_error().into_response()
        })?
        .filter(|c| c.client.is_active)
        .ok_or_else(bad_client)?;

    // 客户端必须注册了 code 响应类型
    if !client.supports_response_type("code") {
        return Err(bad_client());
    }

    Ok(client)
}

/// Session resolution for /authorize: the bearer header is authoritative;
/// the session cookie is the fallback.
async fn resolve_session(
    state: &Arc<AppState>,
    jar: &CookieJar,
    headers: &HeaderMap,
) -> Option<AuthorizeSession> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
    {
        return match state.session_service.validate(token).await {
            Ok(session) => Some(AuthorizeSession {
                user_id: session.user_id,
                auth_time: session.auth_time,
            }),
            // bearer 存在但无效：不再退回 cookie
            Err(e) => {
                tracing::debug!("Bearer session rejected at /authorize: {e}");
                None
            }
        };
    }

    let cookie = jar.get("session_token")?;
    match state.session_service.validate(cookie.value()).await {
        Ok(session) => Some(AuthorizeSession {
            user_id: session.user_id,
            auth_time: session.auth_time,
        }),
        Err(e) => {
            tracing::debug!("Session cookie rejected at /authorize: {e}");
            None
        }
    }
}

/// Builds the error redirect back to a validated redirect_uri.
fn redirect_error(
    redirect_uri: &str,
    kind: OAuthErrorKind,
    description: &str,
    state: Option<&str>,
) -> Response {
    let Ok(mut url) = url::Url::parse(redirect_uri) else {
        return OAuthError::server_error().into_response();
    };

    url.query_pairs_mut()
        .append_pair("error", kind.as_str())
        .append_pair("error_description", description);
    if let Some(s) = state {
        url.query_pairs_mut().append_pair("state", s);
    }

    found(url.as_str())
}

/// 302 to the external login/consent collaborator, preserving every original
/// /authorize parameter so the flow can resume afterwards.
fn redirect_to_collaborator(
    state: &Arc<AppState>,
    collaborator_url: &str,
    raw_query: &Option<String>,
) -> Response {
    let issuer = state.config.issuer.trim_end_matches('/');
    let authorize_url = match raw_query {
        Some(query) => format!("{issuer}/authorize?{query}"),
        None => format!("{issuer}/authorize"),
    };

    let Ok(mut url) = url::Url::parse(collaborator_url) else {
        return OAuthError::server_error().into_response();
    };
    url.query_pairs_mut().append_pair("redirect", &authorize_url);

    found(url.as_str())
}

/// Extracts client credentials from the Authorization header / form body.
/// Presenting two different methods at once is an invalid_request.
fn extract_client_credentials(
    headers: &HeaderMap,
    form: &TokenRequestForm,
) -> Result<ClientCredentials, OAuthError> {
    extract_client_credentials_parts(
        headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
        form.client_assertion_type.as_deref(),
        form.client_assertion.as_deref(),
    )
}

fn extract_client_credentials_parts(
    headers: &HeaderMap,
    client_id: Option<&str>,
    client_secret: Option<&str>,
    client_assertion_type: Option<&str>,
    client_assertion: Option<&str>,
) -> Result<ClientCredentials, OAuthError> {
    let basic = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Basic "))
        .and_then(|b64| STANDARD.decode(b64).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|pair| {
            pair.split_once(':')
                .map(|(id, secret)| (id.to_string(), secret.to_string()))
        });

    let methods_presented = [
        basic.is_some(),
        client_secret.is_some(),
        client_assertion.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count();
    if methods_presented > 1 {
        return Err(OAuthError::invalid_request(
            "Multiple client authentication methods presented",
        ));
    }

    if let Some((id, secret)) = basic {
        if id.is_empty() {
            return Err(OAuthError::invalid_client());
        }
        return Ok(ClientCredentials::Basic {
            client_id: id,
            secret,
        });
    }

    if let Some(assertion) = client_assertion {
        return Ok(ClientCredentials::Assertion {
            assertion_type: client_assertion_type
                .unwrap_or(CLIENT_ASSERTION_TYPE_JWT_BEARER)
                .to_string(),
            assertion: assertion.to_string(),
        });
    }

    let client_id = client_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| OAuthError::invalid_request("Missing client_id"))?;

    match client_secret {
        Some(secret) => Ok(ClientCredentials::Post {
            client_id: client_id.to_string(),
            secret: secret.to_string(),
        }),
        None => Ok(ClientCredentials::None {
            client_id: client_id.to_string(),
        }),
    }
}

fn map_service_error(e: ServiceError) -> OAuthError {
    match e {
        ServiceError::InvalidScope(msg) => OAuthError::invalid_scope(msg),
        ServiceError::Unauthorized(msg) => OAuthError::invalid_grant(msg),
        ServiceError::ValidationError(msg) => OAuthError::invalid_request(msg),
        other => {
            tracing::error!("Token endpoint internal error: {other}");
            OAuthError::server_error()
        }
    }
}
