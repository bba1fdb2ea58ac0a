//! 客户端认证矩阵：注册方法与出示方法必须一致，
//! 任何不匹配都折叠成 401 invalid_client。

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{form_body, TestEnv};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

fn basic_auth(client_id: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{client_id}:{secret}")))
}

async fn post_token(app: &axum::Router, auth: Option<String>, body: String) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    let response = app
        .clone()
        .oneshot(builder.body(Body::from(body)).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_client_secret_basic_with_client_credentials_grant() {
    let env = TestEnv::new().await;
    let (client, secret) = env
        .create_confidential_client(
            "https://app.example/cb",
            &["openid"],
            "client_secret_basic",
            &["client_credentials"],
        )
        .await;
    let app = env.router().await;

    let (status, json) = post_token(
        &app,
        Some(basic_auth(&client.client.client_id, &secret)),
        form_body(&[("grant_type", "client_credentials")]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["token_type"], "Bearer");
    assert_eq!(json["scope"], "openid");
    // 无用户主体：不发 refresh token 也不发 id_token
    assert!(json.get("refresh_token").is_none());
    assert!(json.get("id_token").is_none());
}

#[tokio::test]
async fn test_wrong_secret_is_invalid_client() {
    let env = TestEnv::new().await;
    let (client, _secret) = env
        .create_confidential_client(
            "https://app.example/cb",
            &["openid"],
            "client_secret_basic",
            &["client_credentials"],
        )
        .await;
    let app = env.router().await;

    let (status, json) = post_token(
        &app,
        Some(basic_auth(&client.client.client_id, "not-the-secret")),
        form_body(&[("grant_type", "client_credentials")]),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "invalid_client");
}

#[tokio::test]
async fn test_method_mismatch_is_invalid_client() {
    let env = TestEnv::new().await;
    // 注册为 basic，用 post 方式出示
    let (client, secret) = env
        .create_confidential_client(
            "https://app.example/cb",
            &["openid"],
            "client_secret_basic",
            &["client_credentials"],
        )
        .await;
    let app = env.router().await;

    let (status, json) = post_token(
        &app,
        None,
        form_body(&[
            ("grant_type", "client_credentials"),
            ("client_id", &client.client.client_id),
            ("client_secret", &secret),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "invalid_client");
}

#[tokio::test]
async fn test_client_secret_post_happy_path() {
    let env = TestEnv::new().await;
    let (client, secret) = env
        .create_confidential_client(
            "https://app.example/cb",
            &["openid"],
            "client_secret_post",
            &["client_credentials"],
        )
        .await;
    let app = env.router().await;

    let (status, json) = post_token(
        &app,
        None,
        form_body(&[
            ("grant_type", "client_credentials"),
            ("client_id", &client.client.client_id),
            ("client_secret", &secret),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["token_type"], "Bearer");
}

#[tokio::test]
async fn test_public_client_must_not_use_client_credentials() {
    let env = TestEnv::new().await;
    let client = env
        .create_public_client("https://app.example/cb", &["openid"])
        .await;
    let app = env.router().await;

    let (status, json) = post_token(
        &app,
        None,
        form_body(&[
            ("grant_type", "client_credentials"),
            ("client_id", &client.client.client_id),
        ]),
    )
    .await;

    // client_credentials 仅限机密客户端
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "unauthorized_client");
}

#[tokio::test]
async fn test_confidential_client_without_credentials_is_rejected() {
    let env = TestEnv::new().await;
    let (client, _secret) = env
        .create_confidential_client(
            "https://app.example/cb",
            &["openid"],
            "client_secret_basic",
            &["client_credentials"],
        )
        .await;
    let app = env.router().await;

    // 机密客户端装作 public（只报 client_id）必须被拒
    let (status, json) = post_token(
        &app,
        None,
        form_body(&[
            ("grant_type", "client_credentials"),
            ("client_id", &client.client.client_id),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "invalid_client");
}

#[tokio::test]
async fn test_multiple_auth_methods_presented_is_invalid_request() {
    let env = TestEnv::new().await;
    let (client, secret) = env
        .create_confidential_client(
            "https://app.example/cb",
            &["openid"],
            "client_secret_basic",
            &["client_credentials"],
        )
        .await;
    let app = env.router().await;

    let (status, json) = post_token(
        &app,
        Some(basic_auth(&client.client.client_id, &secret)),
        form_body(&[
            ("grant_type", "client_credentials"),
            ("client_id", &client.client.client_id),
            ("client_secret", &secret),
        ]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_request");
}

#[tokio::test]
async fn test_unknown_grant_type_is_rejected() {
    let env = TestEnv::new().await;
    let (client, secret) = env
        .create_confidential_client(
            "https://app.example/cb",
            &["openid"],
            "client_secret_basic",
            &["client_credentials"],
        )
        .await;
    let app = env.router().await;

    let (status, json) = post_token(
        &app,
        Some(basic_auth(&client.client.client_id, &secret)),
        form_body(&[("grant_type", "password")]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn test_invalid_client_carries_www_authenticate() {
    let env = TestEnv::new().await;
    let app = env.router().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header(header::AUTHORIZATION, basic_auth("ghost-client", "secret"))
                .body(Body::from(form_body(&[(
                    "grant_type",
                    "client_credentials",
                )])))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(header::WWW_AUTHENTICATE).is_some());
}
