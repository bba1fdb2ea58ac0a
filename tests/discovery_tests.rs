//! 发现文档与 JWKS：文档是配置的纯函数；轮换后旧密钥在保留窗口内
//! 仍被公布，旧令牌仍可验证。

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use auth_center::services::token_service::TokenService;
use auth_center::services::user_service::UserService;
use common::TestEnv;
use http_body_util::BodyExt;
use tower::util::ServiceExt;

async fn get_json(app: &axum::Router, uri: &str) -> serde_json::Value {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_discovery_document_shape() {
    let env = TestEnv::new().await;
    let app = env.router().await;

    let doc = get_json(&app, "/.well-known/openid-configuration").await;
    let issuer = env.config.issuer.trim_end_matches('/');

    assert_eq!(doc["issuer"], issuer);
    assert_eq!(doc["authorization_endpoint"], format!("{issuer}/authorize"));
    assert_eq!(doc["token_endpoint"], format!("{issuer}/token"));
    assert_eq!(doc["jwks_uri"], format!("{issuer}/.well-known/jwks.json"));
    assert_eq!(doc["response_types_supported"], serde_json::json!(["code"]));
    assert_eq!(
        doc["code_challenge_methods_supported"],
        serde_json::json!(["S256"])
    );
    assert_eq!(
        doc["grant_types_supported"],
        serde_json::json!(["authorization_code", "refresh_token", "client_credentials"])
    );
    assert_eq!(
        doc["id_token_signing_alg_values_supported"],
        serde_json::json!(["RS256"])
    );
    // 对称算法绝不出现
    assert!(!doc["id_token_signing_alg_values_supported"]
        .as_array()
        .unwrap()
        .iter()
        .any(|v| v.as_str().unwrap().starts_with("HS")));
}

#[tokio::test]
async fn test_discovery_is_pure_function_of_configuration() {
    let env = TestEnv::new().await;
    let app = env.router().await;

    let first = get_json(&app, "/.well-known/oauth-authorization-server").await;
    let second = get_json(&app, "/.well-known/oauth-authorization-server").await;
    assert_eq!(first, second);

    // 两个 well-known 路径给出同一份文档
    let oidc = get_json(&app, "/.well-known/openid-configuration").await;
    assert_eq!(first, oidc);
}

#[tokio::test]
async fn test_jwks_contains_active_key() {
    let env = TestEnv::new().await;
    let app = env.router().await;

    let jwks = get_json(&app, "/.well-known/jwks.json").await;
    let keys = jwks["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kty"], "RSA");
    assert_eq!(keys[0]["use"], "sig");
    assert_eq!(keys[0]["alg"], "RS256");
    assert!(keys[0]["n"].is_string());
    assert!(keys[0]["e"].is_string());
}

#[tokio::test]
async fn test_rotation_keeps_retired_key_published_and_old_tokens_valid() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("alice").await;
    let (client, _) = env
        .create_confidential_client(
            "https://app.example/cb",
            &["openid"],
            "client_secret_basic",
            &["authorization_code", "refresh_token"],
        )
        .await;

    // 轮换前签发
    let user = env
        .state
        .user_service
        .find_by_id(&user_id)
        .await
        .unwrap()
        .unwrap();
    let pair = env
        .state
        .token_service
        .issue_tokens(auth_center::services::token_service::IssueParams {
            client: &client,
            user: Some(&user),
            scope: "openid".to_string(),
            permissions: vec![],
            nonce: None,
            auth_time: None,
            auth_code_id: None,
        })
        .await
        .unwrap();
    let old_kid = jsonwebtoken::decode_header(&pair.access_token)
        .unwrap()
        .kid
        .unwrap();

    let new_kid = env.state.key_service.rotate().await.unwrap();
    assert_ne!(old_kid, new_kid);

    // 至多一个 ACTIVE
    let active: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM jwks WHERE status = 'ACTIVE'")
            .fetch_one(&*env.pool)
            .await
            .unwrap();
    assert_eq!(active, 1);

    // 旧 kid 仍在公开的 JWKS 里
    let app = env.router().await;
    let jwks = get_json(&app, "/.well-known/jwks.json").await;
    let kids: Vec<&str> = jwks["keys"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|k| k["kid"].as_str())
        .collect();
    assert!(kids.contains(&old_kid.as_str()));
    assert!(kids.contains(&new_kid.as_str()));

    // 轮换前的令牌仍然验证通过
    assert!(env
        .state
        .token_service
        .verify_bearer(&pair.access_token)
        .await
        .is_ok());

    // 新签发使用新 kid
    let pair2 = env
        .state
        .token_service
        .issue_tokens(auth_center::services::token_service::IssueParams {
            client: &client,
            user: Some(&user),
            scope: "openid".to_string(),
            permissions: vec![],
            nonce: None,
            auth_time: None,
            auth_code_id: None,
        })
        .await
        .unwrap();
    let kid2 = jsonwebtoken::decode_header(&pair2.access_token)
        .unwrap()
        .kid
        .unwrap();
    assert_eq!(kid2, new_kid);
}
