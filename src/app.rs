use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{config::Config, middleware, routes, state::AppState};

/// Assembles the protocol router with all middleware layers applied.
pub async fn create_app(pool: Arc<sqlx::SqlitePool>, config: Arc<Config>) -> Router {
    let app_state = Arc::new(
        AppState::new(pool, config)
            .await
            .expect("Failed to create AppState"),
    );

    // bearer 保护的子路由：userinfo 与权限查询
    let protected = Router::new()
        .route(
            "/userinfo",
            get(routes::oauth::userinfo_endpoint).post(routes::oauth::userinfo_endpoint),
        )
        .route("/auth/check", post(routes::authn::check_endpoint))
        .route("/auth/check-batch", post(routes::authn::check_batch_endpoint))
        .route_layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            middleware::auth::require_bearer,
        ));

    let api_router = Router::new()
        // 健康检查 (公开)
        .route("/health", get(|| async { "OK" }))
        // OAuth 协议端点
        .route("/authorize", get(routes::oauth::authorize_endpoint))
        .route("/token", post(routes::oauth::token_endpoint))
        .route("/introspect", post(routes::oauth::introspect_endpoint))
        .route("/revoke", post(routes::oauth::revoke_endpoint))
        // 发现文档与 JWKS
        .route(
            "/.well-known/oauth-authorization-server",
            get(routes::discovery::discovery_document),
        )
        .route(
            "/.well-known/openid-configuration",
            get(routes::discovery::discovery_document),
        )
        .route(
            "/.well-known/jwks.json",
            get(routes::discovery::jwks_document),
        )
        // 会话端点
        .route("/auth/login", post(routes::authn::login_endpoint))
        .route("/auth/refresh", post(routes::authn::session_refresh_endpoint))
        .merge(protected);

    // 中间件按反向顺序执行：最后添加的 layer 最先处理请求。
    // 处理顺序：审计 -> 追踪 -> CORS -> 限流 -> 路由
    api_router
        .with_state(app_state.clone())
        .layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            middleware::rate_limit::rate_limit_middleware,
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    axum::http::header::AUTHORIZATION,
                    axum::http::header::CONTENT_TYPE,
                    axum::http::header::ACCEPT,
                ]),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn_with_state(
            app_state,
            middleware::audit::audit_middleware,
        ))
}
