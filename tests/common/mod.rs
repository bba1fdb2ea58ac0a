//! Shared fixtures for the integration test suites.
#![allow(dead_code)]

use auth_center::config::Config;
use auth_center::services::client_service::{ClientService, CreateClientRequest};
use auth_center::services::session_service::SessionService;
use auth_center::state::AppState;
use auth_center::utils::crypto;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct TestEnv {
    pub pool: Arc<SqlitePool>,
    pub config: Arc<Config>,
    pub state: Arc<AppState>,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(Config::for_tests()).await
    }

    pub async fn with_config(config: Config) -> Self {
        // 单连接：内存库在多连接下各自为政
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");

        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&pool)
            .await
            .expect("Failed to run initial schema migration");

        let pool = Arc::new(pool);
        let config = Arc::new(config);
        let state = Arc::new(
            AppState::new(pool.clone(), config.clone())
                .await
                .expect("Failed to build AppState"),
        );

        Self {
            pool,
            config,
            state,
        }
    }

    pub async fn router(&self) -> Router {
        auth_center::create_app(self.pool.clone(), self.config.clone()).await
    }

    pub async fn create_user(&self, username: &str) -> String {
        let user_id = uuid::Uuid::new_v4().to_string();
        let password_hash = crypto::hash_password("password123").expect("hash");
        let now = chrono::Utc::now();

        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, is_active, email_verified, \
             created_at, updated_at) VALUES (?, ?, ?, ?, TRUE, TRUE, ?, ?)",
        )
        .bind(&user_id)
        .bind(username)
        .bind(format!("{username}@example.com"))
        .bind(&password_hash)
        .bind(now)
        .bind(now)
        .execute(&*self.pool)
        .await
        .expect("Failed to create test user");

        user_id
    }

    /// Registers a PUBLIC client (PKCE enforced, auth method `none`).
    pub async fn create_public_client(
        &self,
        redirect_uri: &str,
        scopes: &[&str],
    ) -> auth_center::models::client::OAuthClientDetails {
        let (details, _) = self
            .state
            .client_service
            .create_client(CreateClientRequest {
                name: "Test Public Client".to_string(),
                client_type: "PUBLIC".to_string(),
                token_endpoint_auth_method: None,
                redirect_uris: vec![redirect_uri.to_string()],
                grant_types: vec![
                    "authorization_code".to_string(),
                    "refresh_token".to_string(),
                ],
                response_types: vec!["code".to_string()],
                allowed_scopes: scopes.iter().map(|s| s.to_string()).collect(),
                client_permissions: None,
                jwks_uri: None,
                require_pkce: Some(true),
                require_consent: Some(false),
                access_token_ttl: None,
                refresh_token_ttl: None,
            })
            .await
            .expect("Failed to create public client");
        details
    }

    /// Registers a CONFIDENTIAL client, returning its plaintext secret.
    pub async fn create_confidential_client(
        &self,
        redirect_uri: &str,
        scopes: &[&str],
        auth_method: &str,
        grant_types: &[&str],
    ) -> (auth_center::models::client::OAuthClientDetails, String) {
        self.state
            .client_service
            .create_client(CreateClientRequest {
                name: "Test Confidential Client".to_string(),
                client_type: "CONFIDENTIAL".to_string(),
                token_endpoint_auth_method: Some(auth_method.to_string()),
                redirect_uris: vec![redirect_uri.to_string()],
                grant_types: grant_types.iter().map(|s| s.to_string()).collect(),
                response_types: vec!["code".to_string()],
                allowed_scopes: scopes.iter().map(|s| s.to_string()).collect(),
                client_permissions: None,
                jwks_uri: None,
                require_pkce: Some(false),
                require_consent: Some(false),
                access_token_ttl: None,
                refresh_token_ttl: None,
            })
            .await
            .expect("Failed to create confidential client")
    }

    /// Logs a session row for the user and returns the session JWT.
    pub async fn create_session(&self, user_id: &str) -> String {
        self.state
            .session_service
            .create_session(user_id, None, None)
            .await
            .expect("Failed to create session")
            .session_jwt
    }

    pub async fn seed_scope(&self, name: &str) {
        sqlx::query(
            "INSERT OR IGNORE INTO scopes (id, name, is_oidc_scope, is_active, created_at) \
             VALUES (?, ?, FALSE, TRUE, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(name)
        .bind(chrono::Utc::now())
        .execute(&*self.pool)
        .await
        .expect("Failed to seed scope");
    }
}

/// RFC 7636 Appendix B sample pair.
pub const RFC_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
pub const RFC_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

/// Builds an application/x-www-form-urlencoded body from pairs.
pub fn form_body(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}
