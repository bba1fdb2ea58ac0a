//! RFC 7009 / RFC 7662 行为：吊销后内省必须 inactive，
//! 黑名单收录 jti，重复吊销幂等，未知令牌静默成功。

mod common;

use auth_center::services::token_service::{IssueParams, TokenService};
use auth_center::services::user_service::UserService;
use common::TestEnv;

async fn issue_pair(
    env: &TestEnv,
    client: &auth_center::models::client::OAuthClientDetails,
    user_id: &str,
) -> auth_center::services::token_service::TokenPair {
    let user = env
        .state
        .user_service
        .find_by_id(user_id)
        .await
        .unwrap()
        .unwrap();
    env.state
        .token_service
        .issue_tokens(IssueParams {
            client,
            user: Some(&user),
            scope: "openid".to_string(),
            permissions: vec![],
            nonce: None,
            auth_time: None,
            auth_code_id: None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_revoked_access_token_introspects_inactive_and_is_blacklisted() {
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

    let pair = issue_pair(&env, &client, &user_id).await;

    // 吊销前 active
    let before = env
        .state
        .token_service
        .introspect(&pair.access_token, Some("access_token"))
        .await
        .unwrap();
    assert!(before.active);
    let jti = before.jti.clone().unwrap();

    env.state
        .token_service
        .revoke(&pair.access_token, Some("access_token"), &client)
        .await
        .unwrap();

    // 吊销后 inactive，且不泄漏其他字段
    let after = env
        .state
        .token_service
        .introspect(&pair.access_token, Some("access_token"))
        .await
        .unwrap();
    assert!(!after.active);
    assert!(after.sub.is_none());
    assert!(after.scope.is_none());

    // jti 进入黑名单，expires_at 对齐令牌自身的过期时间
    let entry: auth_center::models::token::BlacklistEntry =
        sqlx::query_as("SELECT * FROM token_blacklist WHERE jti = ?")
            .bind(&jti)
            .fetch_one(&*env.pool)
            .await
            .unwrap();
    assert_eq!(entry.token_type, "access_token");
    assert_eq!(entry.expires_at.timestamp(), before.exp.unwrap());

    // verify_bearer 同样拒绝
    assert!(env
        .state
        .token_service
        .verify_bearer(&pair.access_token)
        .await
        .is_err());
}

#[tokio::test]
async fn test_double_revoke_is_a_noop() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("bob").await;
    let (client, _) = env
        .create_confidential_client(
            "https://app.example/cb",
            &["openid"],
            "client_secret_basic",
            &["authorization_code", "refresh_token"],
        )
        .await;

    let pair = issue_pair(&env, &client, &user_id).await;

    env.state
        .token_service
        .revoke(&pair.access_token, Some("access_token"), &client)
        .await
        .unwrap();
    // 第二次也成功，黑名单不长胖
    env.state
        .token_service
        .revoke(&pair.access_token, Some("access_token"), &client)
        .await
        .unwrap();

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM token_blacklist")
        .fetch_one(&*env.pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn test_revoking_refresh_token_revokes_family() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("carol").await;
    let (client, _) = env
        .create_confidential_client(
            "https://app.example/cb",
            &["openid"],
            "client_secret_basic",
            &["authorization_code", "refresh_token"],
        )
        .await;

    let pair = issue_pair(&env, &client, &user_id).await;
    let r1 = pair.refresh_token.unwrap();
    let rotated = env
        .state
        .token_service
        .refresh(&r1, &client, None)
        .await
        .unwrap();
    let r2 = rotated.refresh_token.unwrap();

    env.state
        .token_service
        .revoke(&r2, Some("refresh_token"), &client)
        .await
        .unwrap();

    let live: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM refresh_tokens WHERE is_revoked = FALSE")
            .fetch_one(&*env.pool)
            .await
            .unwrap();
    assert_eq!(live, 0);

    // 整族吊销后再内省 r2 → inactive
    let data = env
        .state
        .token_service
        .introspect(&r2, Some("refresh_token"))
        .await
        .unwrap();
    assert!(!data.active);
}

#[tokio::test]
async fn test_revoking_foreign_token_is_silent_noop() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("dave").await;
    let (client_a, _) = env
        .create_confidential_client(
            "https://a.example/cb",
            &["openid"],
            "client_secret_basic",
            &["authorization_code", "refresh_token"],
        )
        .await;
    let (client_b, _) = env
        .create_confidential_client(
            "https://b.example/cb",
            &["openid"],
            "client_secret_basic",
            &["authorization_code", "refresh_token"],
        )
        .await;

    let pair = issue_pair(&env, &client_a, &user_id).await;

    // 他人客户端吊销：静默成功但令牌仍有效
    env.state
        .token_service
        .revoke(&pair.access_token, Some("access_token"), &client_b)
        .await
        .unwrap();

    let data = env
        .state
        .token_service
        .introspect(&pair.access_token, None)
        .await
        .unwrap();
    assert!(data.active);
}

#[tokio::test]
async fn test_unknown_token_revocation_succeeds() {
    let env = TestEnv::new().await;
    let (client, _) = env
        .create_confidential_client(
            "https://app.example/cb",
            &["openid"],
            "client_secret_basic",
            &["authorization_code"],
        )
        .await;

    env.state
        .token_service
        .revoke("no-such-token", None, &client)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_introspection_hint_mismatch_still_finds_token() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("erin").await;
    let (client, _) = env
        .create_confidential_client(
            "https://app.example/cb",
            &["openid"],
            "client_secret_basic",
            &["authorization_code", "refresh_token"],
        )
        .await;

    let pair = issue_pair(&env, &client, &user_id).await;
    let refresh = pair.refresh_token.unwrap();

    // 提示错了也要给出正确答案 (RFC 7662 §2.1)
    let data = env
        .state
        .token_service
        .introspect(&refresh, Some("access_token"))
        .await
        .unwrap();
    assert!(data.active);
    assert_eq!(data.token_type.as_deref(), Some("refresh_token"));
    assert_eq!(data.client_id.as_deref(), Some(client.client.client_id.as_str()));
}
