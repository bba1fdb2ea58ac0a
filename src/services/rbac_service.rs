use crate::cache::permission_cache::PermissionCache;
use crate::error::ServiceError;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;

/// 有效权限集缓存 TTL（秒）。角色/权限图写入时整体失效。
const PERMISSION_CACHE_TTL: i64 = 300;

#[async_trait]
pub trait RbacService: Send + Sync {
    /// Resolves a user's effective permission set: the union of names reached
    /// via active UserRole -> active Role -> active RolePermission -> active
    /// Permission. Purely additive; there is no denial-overrides layer.
    async fn get_user_permissions(&self, user_id: &str) -> Result<Vec<String>, ServiceError>;

    async fn has_permission(
        &self,
        user_id: &str,
        permission_name: &str,
    ) -> Result<bool, ServiceError>;

    /// Single resolve followed by membership tests.
    async fn has_permissions_batch(
        &self,
        user_id: &str,
        permission_names: &[String],
    ) -> Result<HashMap<String, bool>, ServiceError>;

    /// Union of permissions mapped to each active scope name.
    async fn permissions_for_scopes(
        &self,
        scopes: &[String],
    ) -> Result<Vec<String>, ServiceError>;

    /// Drops the cached effective set for one user.
    async fn invalidate_user(&self, user_id: &str) -> Result<(), ServiceError>;

    /// Drops every cached set. Role/permission graph writes must call this.
    async fn invalidate_all(&self) -> Result<(), ServiceError>;
}

pub struct RbacServiceImpl {
    db: Arc<SqlitePool>,
    cache: Arc<dyn PermissionCache>,
}

impl RbacServiceImpl {
    pub fn new(db: Arc<SqlitePool>, cache: Arc<dyn PermissionCache>) -> Self {
        Self { db, cache }
    }
}

#[derive(sqlx::FromRow)]
struct PermissionName {
    name: String,
}

#[async_trait]
impl RbacService for RbacServiceImpl {
    async fn get_user_permissions(&self, user_id: &str) -> Result<Vec<String>, ServiceError> {
        if let Some(cached) = self.cache.get(user_id).await {
            return Ok(cached);
        }

        // 失活的角色、权限或关联行不贡献任何权限
        let permissions = sqlx::query_as::<_, PermissionName>(
            "SELECT DISTINCT p.name FROM permissions p
             JOIN role_permissions rp ON p.id = rp.permission_id
             JOIN roles r ON rp.role_id = r.id
             JOIN user_roles ur ON r.id = ur.role_id
             WHERE ur.user_id = ? AND p.is_active = TRUE AND r.is_active = TRUE",
        )
        .bind(user_id)
        .fetch_all(&*self.db)
        .await?;

        let names: Vec<String> = permissions.into_iter().map(|p| p.name).collect();

        if let Err(e) = self
            .cache
            .set(user_id, names.clone(), PERMISSION_CACHE_TTL)
            .await
        {
            tracing::warn!("Failed to cache permissions for {user_id}: {e}");
        }

        Ok(names)
    }

    async fn has_permission(
        &self,
        user_id: &str,
        permission_name: &str,
    ) -> Result<bool, ServiceError> {
        let permissions = self.get_user_permissions(user_id).await?;
        Ok(permissions.iter().any(|p| p == permission_name))
    }

    async fn has_permissions_batch(
        &self,
        user_id: &str,
        permission_names: &[String],
    ) -> Result<HashMap<String, bool>, ServiceError> {
        let effective: std::collections::HashSet<String> =
            self.get_user_permissions(user_id).await?.into_iter().collect();

        Ok(permission_names
            .iter()
            .map(|name| (name.clone(), effective.contains(name)))
            .collect())
    }

    async fn permissions_for_scopes(
        &self,
        scopes: &[String],
    ) -> Result<Vec<String>, ServiceError> {
        if scopes.is_empty() {
            return Ok(Vec::new());
        }

        // sqlx sqlite 不支持数组绑定，逐个占位符拼接
        let placeholders = vec!["?"; scopes.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT p.name FROM permissions p
             JOIN scope_permissions sp ON p.id = sp.permission_id
             JOIN scopes s ON sp.scope_id = s.id
             WHERE s.name IN ({placeholders}) AND s.is_active = TRUE AND p.is_active = TRUE"
        );

        let mut query = sqlx::query_as::<_, PermissionName>(&sql);
        for scope in scopes {
            query = query.bind(scope);
        }

        let permissions = query.fetch_all(&*self.db).await?;
        Ok(permissions.into_iter().map(|p| p.name).collect())
    }

    async fn invalidate_user(&self, user_id: &str) -> Result<(), ServiceError> {
        self.cache
            .invalidate(user_id)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }

    async fn invalidate_all(&self) -> Result<(), ServiceError> {
        self.cache
            .clear()
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }
}
