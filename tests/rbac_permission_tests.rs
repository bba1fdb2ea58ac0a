//! 权限评估器：active-only 并集语义、批量查询、scope→permission 映射、
//! 权限图写入后的缓存失效。

mod common;

use auth_center::services::rbac_service::RbacService;
use common::TestEnv;

async fn create_permission(env: &TestEnv, name: &str, active: bool) -> String {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now();
    sqlx::query(
        "INSERT INTO permissions (id, name, display_name, resource, action, is_active, \
         created_at, updated_at) VALUES (?, ?, ?, '', '', ?, ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(name)
    .bind(active)
    .bind(now)
    .bind(now)
    .execute(&*env.pool)
    .await
    .unwrap();
    id
}

async fn create_role(env: &TestEnv, name: &str, active: bool) -> String {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now();
    sqlx::query(
        "INSERT INTO roles (id, name, display_name, is_active, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(name)
    .bind(active)
    .bind(now)
    .bind(now)
    .execute(&*env.pool)
    .await
    .unwrap();
    id
}

async fn link_role_permission(env: &TestEnv, role_id: &str, perm_id: &str) {
    sqlx::query("INSERT INTO role_permissions (role_id, permission_id) VALUES (?, ?)")
        .bind(role_id)
        .bind(perm_id)
        .execute(&*env.pool)
        .await
        .unwrap();
}

async fn link_user_role(env: &TestEnv, user_id: &str, role_id: &str) {
    sqlx::query("INSERT INTO user_roles (user_id, role_id) VALUES (?, ?)")
        .bind(user_id)
        .bind(role_id)
        .execute(&*env.pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_union_across_multiple_roles() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("alice").await;

    let p_read = create_permission(&env, "iam:users:read", true).await;
    let p_write = create_permission(&env, "iam:users:write", true).await;
    let p_audit = create_permission(&env, "iam:audit:read", true).await;

    let viewer = create_role(&env, "viewer", true).await;
    let editor = create_role(&env, "editor", true).await;
    link_role_permission(&env, &viewer, &p_read).await;
    link_role_permission(&env, &viewer, &p_audit).await;
    link_role_permission(&env, &editor, &p_read).await;
    link_role_permission(&env, &editor, &p_write).await;

    link_user_role(&env, &user_id, &viewer).await;
    link_user_role(&env, &user_id, &editor).await;

    let mut permissions = env
        .state
        .rbac_service
        .get_user_permissions(&user_id)
        .await
        .unwrap();
    permissions.sort();

    // 去重的并集
    assert_eq!(
        permissions,
        vec![
            "iam:audit:read".to_string(),
            "iam:users:read".to_string(),
            "iam:users:write".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_inactive_role_contributes_nothing() {
    use auth_center::models::rbac::{Permission, Role};

    let env = TestEnv::new().await;
    let user_id = env.create_user("bob").await;

    let p1 = create_permission(&env, "iam:users:read", true).await;
    let p2 = create_permission(&env, "iam:users:write", true).await;

    let active_role = create_role(&env, "active_role", true).await;
    let retired_role = create_role(&env, "retired_role", false).await;
    link_role_permission(&env, &active_role, &p1).await;
    link_role_permission(&env, &retired_role, &p2).await;

    link_user_role(&env, &user_id, &active_role).await;
    link_user_role(&env, &user_id, &retired_role).await;

    // 夹具自检：软禁用而非删除
    let retired: Role = sqlx::query_as("SELECT * FROM roles WHERE id = ?")
        .bind(&retired_role)
        .fetch_one(&*env.pool)
        .await
        .unwrap();
    assert!(!retired.is_active);
    let orphaned: Permission = sqlx::query_as("SELECT * FROM permissions WHERE id = ?")
        .bind(&p2)
        .fetch_one(&*env.pool)
        .await
        .unwrap();
    assert!(orphaned.is_active);

    let permissions = env
        .state
        .rbac_service
        .get_user_permissions(&user_id)
        .await
        .unwrap();

    assert_eq!(permissions, vec!["iam:users:read".to_string()]);
}

#[tokio::test]
async fn test_permission_in_active_and_retired_role_still_counts() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("carol").await;

    let p1 = create_permission(&env, "iam:users:read", true).await;
    let active_role = create_role(&env, "live", true).await;
    let retired_role = create_role(&env, "dead", false).await;
    link_role_permission(&env, &active_role, &p1).await;
    link_role_permission(&env, &retired_role, &p1).await;
    link_user_role(&env, &user_id, &active_role).await;
    link_user_role(&env, &user_id, &retired_role).await;

    // "any active grant suffices"
    assert!(env
        .state
        .rbac_service
        .has_permission(&user_id, "iam:users:read")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_inactive_permission_is_excluded() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("dave").await;

    let p_dead = create_permission(&env, "iam:legacy:read", false).await;
    let role = create_role(&env, "role", true).await;
    link_role_permission(&env, &role, &p_dead).await;
    link_user_role(&env, &user_id, &role).await;

    let permissions = env
        .state
        .rbac_service
        .get_user_permissions(&user_id)
        .await
        .unwrap();
    assert!(permissions.is_empty());
}

#[tokio::test]
async fn test_batch_is_single_resolve_with_membership_tests() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("erin").await;

    let p1 = create_permission(&env, "iam:users:read", true).await;
    let role = create_role(&env, "role", true).await;
    link_role_permission(&env, &role, &p1).await;
    link_user_role(&env, &user_id, &role).await;

    let verdicts = env
        .state
        .rbac_service
        .has_permissions_batch(
            &user_id,
            &[
                "iam:users:read".to_string(),
                "iam:users:write".to_string(),
            ],
        )
        .await
        .unwrap();

    assert_eq!(verdicts.get("iam:users:read"), Some(&true));
    assert_eq!(verdicts.get("iam:users:write"), Some(&false));
}

#[tokio::test]
async fn test_resolve_is_idempotent() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("frank").await;

    let p1 = create_permission(&env, "iam:users:read", true).await;
    let role = create_role(&env, "role", true).await;
    link_role_permission(&env, &role, &p1).await;
    link_user_role(&env, &user_id, &role).await;

    let first = env
        .state
        .rbac_service
        .get_user_permissions(&user_id)
        .await
        .unwrap();
    let second = env
        .state
        .rbac_service
        .get_user_permissions(&user_id)
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_cache_invalidation_after_graph_write() {
    let env = TestEnv::new().await;
    let user_id = env.create_user("grace").await;

    let p1 = create_permission(&env, "iam:users:read", true).await;
    let role = create_role(&env, "role", true).await;
    link_role_permission(&env, &role, &p1).await;
    link_user_role(&env, &user_id, &role).await;

    // prime the cache
    assert!(!env
        .state
        .rbac_service
        .get_user_permissions(&user_id)
        .await
        .unwrap()
        .is_empty());

    // graph write: new permission granted to the role
    let p2 = create_permission(&env, "iam:users:write", true).await;
    link_role_permission(&env, &role, &p2).await;
    env.state.rbac_service.invalidate_user(&user_id).await.unwrap();

    let permissions = env
        .state
        .rbac_service
        .get_user_permissions(&user_id)
        .await
        .unwrap();
    assert!(permissions.contains(&"iam:users:write".to_string()));
}

#[tokio::test]
async fn test_permissions_for_scopes_union_of_active_mappings() {
    let env = TestEnv::new().await;

    let p_profile = create_permission(&env, "iam:profile:read", true).await;
    let p_email = create_permission(&env, "iam:email:read", true).await;
    let p_dead = create_permission(&env, "iam:dead:read", false).await;

    env.seed_scope("profile").await;
    env.seed_scope("email").await;

    let profile_id: String =
        sqlx::query_scalar("SELECT id FROM scopes WHERE name = 'profile'")
            .fetch_one(&*env.pool)
            .await
            .unwrap();
    let email_id: String = sqlx::query_scalar("SELECT id FROM scopes WHERE name = 'email'")
        .fetch_one(&*env.pool)
        .await
        .unwrap();

    for (scope_id, perm_id) in [
        (&profile_id, &p_profile),
        (&profile_id, &p_dead),
        (&email_id, &p_email),
    ] {
        sqlx::query("INSERT INTO scope_permissions (scope_id, permission_id) VALUES (?, ?)")
            .bind(scope_id)
            .bind(perm_id)
            .execute(&*env.pool)
            .await
            .unwrap();
    }

    let mut mapped = env
        .state
        .rbac_service
        .permissions_for_scopes(&["profile".to_string(), "email".to_string()])
        .await
        .unwrap();
    mapped.sort();

    // 失活的权限不随 scope 带出
    assert_eq!(
        mapped,
        vec!["iam:email:read".to_string(), "iam:profile:read".to_string()]
    );

    assert!(env
        .state
        .rbac_service
        .permissions_for_scopes(&[])
        .await
        .unwrap()
        .is_empty());
}
