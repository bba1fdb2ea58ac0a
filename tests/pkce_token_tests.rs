//! PKCE 行为测试：错误 verifier 烧掉授权码、verifier 缺失、
//! code_challenge 长度边界 (42 拒绝 / 43 接受)。

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{form_body, TestEnv, RFC_CHALLENGE, RFC_VERIFIER};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

async fn authorize_and_get_code(
    env: &TestEnv,
    app: &axum::Router,
    client_id: &str,
    session: &str,
    challenge: &str,
) -> String {
    let _ = env;
    let uri = format!(
        "/authorize?client_id={client_id}&redirect_uri=https%3A%2F%2Fapp.example%2Fcb\
         &response_type=code&scope=openid&code_challenge={challenge}&code_challenge_method=S256",
    );
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(&uri)
                .header(header::COOKIE, format!("session_token={session}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);

    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    let url = url::Url::parse(location).unwrap();
    url.query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.to_string())
        .expect("authorization code in redirect")
}

#[tokio::test]
async fn test_wrong_verifier_fails_and_burns_the_code() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("alice").await;
    let client = env
        .create_public_client("https://app.example/cb", &["openid"])
        .await;
    let session = env.create_session(&user_id).await;
    let app = env.router().await;

    let code =
        authorize_and_get_code(&env, &app, &client.client.client_id, &session, RFC_CHALLENGE)
            .await;

    // 错误的 verifier（形状合法，值不对）
    let body = form_body(&[
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", "https://app.example/cb"),
        ("client_id", &client.client.client_id),
        ("code_verifier", "wrong-wrong-wrong-wrong-wrong-wrong-wrong-wr"),
    ]);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["error"], "invalid_grant");

    // code 行已烧毁
    let is_used: bool =
        sqlx::query_scalar("SELECT is_used FROM authorization_codes WHERE code = ?")
            .bind(&code)
            .fetch_one(&*env.pool)
            .await
            .unwrap();
    assert!(is_used);

    // 重试（即使换成正确的 verifier）也换不到令牌
    let body = form_body(&[
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", "https://app.example/cb"),
        ("client_id", &client.client.client_id),
        ("code_verifier", RFC_VERIFIER),
    ]);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_verifier_is_invalid_grant() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("bob").await;
    let client = env
        .create_public_client("https://app.example/cb", &["openid"])
        .await;
    let session = env.create_session(&user_id).await;
    let app = env.router().await;

    let code =
        authorize_and_get_code(&env, &app, &client.client.client_id, &session, RFC_CHALLENGE)
            .await;

    let body = form_body(&[
        ("grant_type", "authorization_code"),
        ("code", &code),
        ("redirect_uri", "https://app.example/cb"),
        ("client_id", &client.client.client_id),
    ]);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["error"], "invalid_grant");
}

#[tokio::test]
async fn test_challenge_length_boundary_at_authorize() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("carol").await;
    let client = env
        .create_public_client("https://app.example/cb", &["openid"])
        .await;
    let session = env.create_session(&user_id).await;
    let app = env.router().await;

    // 42 字符：拒绝（重定向回客户端并带 invalid_request）
    let short = "a".repeat(42);
    let uri = format!(
        "/authorize?client_id={}&redirect_uri=https%3A%2F%2Fapp.example%2Fcb&response_type=code\
         &scope=openid&code_challenge={short}&code_challenge_method=S256",
        client.client.client_id
    );
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(&uri)
                .header(header::COOKIE, format!("session_token={session}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(location.contains("error=invalid_request"));

    // 43 字符：接受
    let ok = "a".repeat(43);
    let uri = format!(
        "/authorize?client_id={}&redirect_uri=https%3A%2F%2Fapp.example%2Fcb&response_type=code\
         &scope=openid&code_challenge={ok}&code_challenge_method=S256",
        client.client.client_id
    );
    let response = app
        .oneshot(
            Request::builder()
                .uri(&uri)
                .header(header::COOKIE, format!("session_token={session}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(location.contains("code="));
    assert!(!location.contains("error="));
}

#[tokio::test]
async fn test_public_client_without_challenge_is_rejected() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("dave").await;
    let client = env
        .create_public_client("https://app.example/cb", &["openid"])
        .await;
    let session = env.create_session(&user_id).await;
    let app = env.router().await;

    let uri = format!(
        "/authorize?client_id={}&redirect_uri=https%3A%2F%2Fapp.example%2Fcb&response_type=code\
         &scope=openid",
        client.client.client_id
    );
    let response = app
        .oneshot(
            Request::builder()
                .uri(&uri)
                .header(header::COOKIE, format!("session_token={session}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(location.contains("error=invalid_request"));
    assert!(location.contains("code_challenge"));
}
