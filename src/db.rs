// Database initialization and seeding
use crate::error::ServiceError;
use crate::utils::crypto;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePool, Sqlite};
use std::path::Path;

/// Initialize database: create it if missing, run migrations, seed data.
pub async fn initialize_database(
    database_url: &str,
    skip_init: bool,
) -> Result<SqlitePool, ServiceError> {
    if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
        tracing::info!("Creating database: {}", database_url);
        Sqlite::create_database(database_url)
            .await
            .map_err(|e| ServiceError::Internal(format!("Failed to create database: {e}")))?;
    }

    let pool = SqlitePool::connect(database_url)
        .await
        .map_err(|e| ServiceError::Internal(format!("Failed to connect to database: {e}")))?;

    if skip_init {
        tracing::info!("SKIP_DB_INIT is set, skipping migrations and seeding.");
    } else {
        tracing::info!("Running migrations and seeding data...");
        run_migrations(&pool, "migrations").await?;
        seed_initial_data(&pool).await?;
    }

    tracing::info!("Database initialization completed successfully");
    Ok(pool)
}

/// Run migrations from SQL files, sorted by file name.
pub async fn run_migrations(pool: &SqlitePool, migrations_dir: &str) -> Result<(), ServiceError> {
    tracing::info!("Running database migrations from: {}", migrations_dir);

    let migration_path = Path::new(migrations_dir);
    if !migration_path.exists() {
        tracing::warn!("Migrations directory not found: {}", migrations_dir);
        return Ok(());
    }

    let mut entries = std::fs::read_dir(migration_path)
        .map_err(|e| ServiceError::Internal(format!("Failed to read migrations directory: {e}")))?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "sql")
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        if let Some(filename) = path.file_name() {
            let sql = std::fs::read_to_string(&path).map_err(|e| {
                ServiceError::Internal(format!("Failed to read migration file {filename:?}: {e}"))
            })?;

            tracing::info!("Executing migration: {:?}", filename);

            sqlx::raw_sql(&sql).execute(pool).await.map_err(|e| {
                ServiceError::Internal(format!("Failed to execute migration {filename:?}: {e}"))
            })?;
        }
    }

    tracing::info!("All migrations completed");
    Ok(())
}

/// Seed initial data. Idempotent: every step checks before inserting.
/// 管理面不在本服务内，初始客户端/角色由种子数据承担静态注册。
pub async fn seed_initial_data(pool: &SqlitePool) -> Result<(), ServiceError> {
    tracing::info!("Seeding initial data");

    seed_admin_user(pool).await?;
    seed_default_roles(pool).await?;
    seed_default_permissions(pool).await?;
    seed_role_permissions(pool).await?;
    seed_default_scopes(pool).await?;
    seed_scope_permissions(pool).await?;
    seed_oauth_clients(pool).await?;

    tracing::info!("Initial data seeding completed");
    Ok(())
}

async fn seed_admin_user(pool: &SqlitePool) -> Result<(), ServiceError> {
    let existing =
        sqlx::query_scalar::<_, String>("SELECT id FROM users WHERE username = 'admin' LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| ServiceError::Internal(format!("Failed to check admin user: {e}")))?;

    if existing.is_some() {
        tracing::debug!("Admin user already exists");
        return Ok(());
    }

    let password_hash = crypto::hash_password("admin123")?;
    let user_id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now();

    sqlx::query(
        "INSERT INTO users (id, username, email, password_hash, display_name, is_active, \
         email_verified, must_change_password, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, TRUE, FALSE, TRUE, ?, ?)",
    )
    .bind(&user_id)
    .bind("admin")
    .bind("admin@auth-center.local")
    .bind(&password_hash)
    .bind("Administrator")
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|e| ServiceError::Internal(format!("Failed to create admin user: {e}")))?;

    tracing::info!("Admin user created successfully");
    Ok(())
}

async fn seed_default_roles(pool: &SqlitePool) -> Result<(), ServiceError> {
    let default_roles = vec![
        ("admin", "Administrator", "System administrator with full access"),
        ("user", "User", "Regular user with basic access"),
        ("viewer", "Viewer", "Read-only access"),
    ];

    let now = chrono::Utc::now();
    for (name, display_name, description) in default_roles {
        let existing =
            sqlx::query_scalar::<_, String>("SELECT id FROM roles WHERE name = ? LIMIT 1")
                .bind(name)
                .fetch_optional(pool)
                .await
                .map_err(|e| ServiceError::Internal(format!("Failed to check role: {e}")))?;

        if existing.is_some() {
            tracing::debug!("Role '{}' already exists", name);
            continue;
        }

        sqlx::query(
            "INSERT INTO roles (id, name, display_name, description, is_system_role, is_active, \
             created_at, updated_at) VALUES (?, ?, ?, ?, TRUE, TRUE, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(name)
        .bind(display_name)
        .bind(description)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(|e| ServiceError::Internal(format!("Failed to create role '{name}': {e}")))?;

        tracing::info!("Role '{}' created successfully", name);
    }

    Ok(())
}

async fn seed_default_permissions(pool: &SqlitePool) -> Result<(), ServiceError> {
    // 权限命名：domain:resource:action，全小写
    let default_permissions = vec![
        ("iam:users:read", "Read Users", "users", "read"),
        ("iam:users:write", "Manage Users", "users", "write"),
        ("iam:roles:read", "Read Roles", "roles", "read"),
        ("iam:roles:write", "Manage Roles", "roles", "write"),
        ("iam:clients:read", "Read Clients", "clients", "read"),
        ("iam:clients:write", "Manage Clients", "clients", "write"),
        ("iam:audit:read", "Read Audit Logs", "audit", "read"),
        ("iam:profile:read", "Read Own Profile", "profile", "read"),
        ("iam:email:read", "Read Own Email", "email", "read"),
    ];

    let now = chrono::Utc::now();
    for (name, display_name, resource, action) in default_permissions {
        let existing =
            sqlx::query_scalar::<_, String>("SELECT id FROM permissions WHERE name = ? LIMIT 1")
                .bind(name)
                .fetch_optional(pool)
                .await
                .map_err(|e| ServiceError::Internal(format!("Failed to check permission: {e}")))?;

        if existing.is_some() {
            continue;
        }

        sqlx::query(
            "INSERT INTO permissions (id, name, display_name, resource, action, is_system_perm, \
             is_active, created_at, updated_at) VALUES (?, ?, ?, ?, ?, TRUE, TRUE, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(name)
        .bind(display_name)
        .bind(resource)
        .bind(action)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(|e| {
            ServiceError::Internal(format!("Failed to create permission '{name}': {e}"))
        })?;
    }

    tracing::info!("Default permissions seeded successfully");
    Ok(())
}

async fn seed_role_permissions(pool: &SqlitePool) -> Result<(), ServiceError> {
    let admin_role_id =
        sqlx::query_scalar::<_, String>("SELECT id FROM roles WHERE name = 'admin' LIMIT 1")
            .fetch_one(pool)
            .await
            .map_err(|e| ServiceError::Internal(format!("Failed to get admin role: {e}")))?;

    let existing_count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM role_permissions WHERE role_id = ?")
            .bind(&admin_role_id)
            .fetch_one(pool)
            .await
            .map_err(|e| ServiceError::Internal(format!("Failed to check role permissions: {e}")))?;

    if existing_count == 0 {
        let permissions =
            sqlx::query_scalar::<_, String>("SELECT id FROM permissions WHERE is_system_perm = TRUE")
                .fetch_all(pool)
                .await
                .map_err(|e| ServiceError::Internal(format!("Failed to get permissions: {e}")))?;

        for perm_id in permissions {
            sqlx::query("INSERT INTO role_permissions (role_id, permission_id) VALUES (?, ?)")
                .bind(&admin_role_id)
                .bind(&perm_id)
                .execute(pool)
                .await
                .map_err(|e| {
                    ServiceError::Internal(format!("Failed to assign permission to admin role: {e}"))
                })?;
        }
    }

    let admin_user_id =
        sqlx::query_scalar::<_, String>("SELECT id FROM users WHERE username = 'admin' LIMIT 1")
            .fetch_one(pool)
            .await
            .map_err(|e| ServiceError::Internal(format!("Failed to get admin user: {e}")))?;

    let existing_assignment = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM user_roles WHERE user_id = ? AND role_id = ?",
    )
    .bind(&admin_user_id)
    .bind(&admin_role_id)
    .fetch_one(pool)
    .await
    .map_err(|e| ServiceError::Internal(format!("Failed to check user role assignment: {e}")))?;

    if existing_assignment == 0 {
        sqlx::query("INSERT INTO user_roles (user_id, role_id) VALUES (?, ?)")
            .bind(&admin_user_id)
            .bind(&admin_role_id)
            .execute(pool)
            .await
            .map_err(|e| {
                ServiceError::Internal(format!("Failed to assign admin role to admin user: {e}"))
            })?;
    }

    tracing::info!("Admin role permissions assigned successfully");
    Ok(())
}

async fn seed_default_scopes(pool: &SqlitePool) -> Result<(), ServiceError> {
    let scopes = vec![
        ("openid", "OpenID Connect authentication", true),
        ("profile", "Access to basic profile information", true),
        ("email", "Access to email address and verification status", true),
        ("offline_access", "Access while the user is offline", false),
    ];

    let now = chrono::Utc::now();
    for (name, description, is_oidc) in scopes {
        let existing =
            sqlx::query_scalar::<_, String>("SELECT id FROM scopes WHERE name = ? LIMIT 1")
                .bind(name)
                .fetch_optional(pool)
                .await
                .map_err(|e| ServiceError::Internal(format!("Failed to check scope: {e}")))?;

        if existing.is_some() {
            continue;
        }

        sqlx::query(
            "INSERT INTO scopes (id, name, description, is_oidc_scope, is_active, created_at) \
             VALUES (?, ?, ?, ?, TRUE, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(name)
        .bind(description)
        .bind(is_oidc)
        .bind(now)
        .execute(pool)
        .await
        .map_err(|e| ServiceError::Internal(format!("Failed to create scope '{name}': {e}")))?;
    }

    tracing::info!("Default scopes seeded successfully");
    Ok(())
}

/// 接受 scope 即授予映射权限：profile/email 映射到对应的读权限
async fn seed_scope_permissions(pool: &SqlitePool) -> Result<(), ServiceError> {
    let mappings = vec![
        ("profile", "iam:profile:read"),
        ("email", "iam:email:read"),
    ];

    for (scope_name, permission_name) in mappings {
        let scope_id =
            sqlx::query_scalar::<_, String>("SELECT id FROM scopes WHERE name = ? LIMIT 1")
                .bind(scope_name)
                .fetch_one(pool)
                .await
                .map_err(|e| ServiceError::Internal(format!("Failed to get scope: {e}")))?;
        let permission_id =
            sqlx::query_scalar::<_, String>("SELECT id FROM permissions WHERE name = ? LIMIT 1")
                .bind(permission_name)
                .fetch_one(pool)
                .await
                .map_err(|e| ServiceError::Internal(format!("Failed to get permission: {e}")))?;

        sqlx::query(
            "INSERT OR IGNORE INTO scope_permissions (scope_id, permission_id) VALUES (?, ?)",
        )
        .bind(&scope_id)
        .bind(&permission_id)
        .execute(pool)
        .await
        .map_err(|e| ServiceError::Internal(format!("Failed to map scope permission: {e}")))?;
    }

    Ok(())
}

async fn seed_oauth_clients(pool: &SqlitePool) -> Result<(), ServiceError> {
    let clients = vec![
        (
            "admin-portal-client",
            "Admin Portal",
            "Authorization server UI",
            "http://localhost:3002/auth/callback",
            "CONFIDENTIAL",
            "client_secret_basic",
        ),
        (
            "demo-public-client",
            "Demo Public Client",
            "Sample public SPA client",
            "http://localhost:3000/callback",
            "PUBLIC",
            "none",
        ),
    ];

    let now = chrono::Utc::now();
    for (client_id, name, description, redirect_uri, client_type, auth_method) in clients {
        let existing = sqlx::query_scalar::<_, String>(
            "SELECT id FROM oauth_clients WHERE client_id = ? LIMIT 1",
        )
        .bind(client_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| ServiceError::Internal(format!("Failed to check OAuth client: {e}")))?;

        if existing.is_some() {
            tracing::debug!("OAuth client '{}' already exists", client_id);
            continue;
        }

        let internal_id = uuid::Uuid::new_v4().to_string();
        let secret_hash = if client_type == "CONFIDENTIAL" {
            let secret = crypto::generate_token(32);
            tracing::info!("OAuth client '{}' created with secret: {}", client_id, secret);
            Some(crypto::hash_password(&secret)?)
        } else {
            None
        };

        sqlx::query(
            "INSERT INTO oauth_clients (id, client_id, client_secret_hash, name, description, \
             client_type, token_endpoint_auth_method, require_pkce, require_consent, is_active, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, TRUE, TRUE, TRUE, ?, ?)",
        )
        .bind(&internal_id)
        .bind(client_id)
        .bind(&secret_hash)
        .bind(name)
        .bind(description)
        .bind(client_type)
        .bind(auth_method)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(|e| ServiceError::Internal(format!("Failed to create OAuth client: {e}")))?;

        sqlx::query("INSERT INTO client_redirect_uris (client_id, uri) VALUES (?, ?)")
            .bind(&internal_id)
            .bind(redirect_uri)
            .execute(pool)
            .await
            .map_err(|e| ServiceError::Internal(format!("Failed to add redirect URI: {e}")))?;

        for grant_type in ["authorization_code", "refresh_token"] {
            sqlx::query("INSERT INTO client_grant_types (client_id, grant_type) VALUES (?, ?)")
                .bind(&internal_id)
                .bind(grant_type)
                .execute(pool)
                .await
                .map_err(|e| ServiceError::Internal(format!("Failed to add grant type: {e}")))?;
        }

        sqlx::query("INSERT INTO client_response_types (client_id, response_type) VALUES (?, ?)")
            .bind(&internal_id)
            .bind("code")
            .execute(pool)
            .await
            .map_err(|e| ServiceError::Internal(format!("Failed to add response type: {e}")))?;

        for scope in ["openid", "profile", "email"] {
            sqlx::query("INSERT INTO client_allowed_scopes (client_id, scope) VALUES (?, ?)")
                .bind(&internal_id)
                .bind(scope)
                .execute(pool)
                .await
                .map_err(|e| ServiceError::Internal(format!("Failed to add allowed scope: {e}")))?;
        }
    }

    Ok(())
}

/// GC sweep: prunes rows that only matter until their expiry passes.
pub async fn prune_expired(pool: &SqlitePool) -> Result<(), ServiceError> {
    let now = chrono::Utc::now();

    sqlx::query("DELETE FROM token_blacklist WHERE expires_at <= ?")
        .bind(now)
        .execute(pool)
        .await?;

    sqlx::query("DELETE FROM authorization_codes WHERE expires_at <= ?")
        .bind(now)
        .execute(pool)
        .await?;

    Ok(())
}
