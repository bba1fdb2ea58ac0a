use crate::config::Config;
use crate::error::ServiceError;
use crate::models::user::User;
use crate::utils::crypto;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

#[async_trait]
pub trait UserService: Send + Sync {
    async fn find_by_id(&self, user_id: &str) -> Result<Option<User>, ServiceError>;

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, ServiceError>;

    /// Verifies credentials with the account-lockout policy applied.
    async fn authenticate(&self, username: &str, password: &str) -> Result<User, ServiceError>;
}

pub struct UserServiceImpl {
    db: Arc<SqlitePool>,
    config: Arc<Config>,
}

impl UserServiceImpl {
    pub fn new(db: Arc<SqlitePool>, config: Arc<Config>) -> Self {
        Self { db, config }
    }

    /// 失败计数达到阈值时写入 locked_until
    async fn record_failed_attempt(&self, user: &User) -> Result<(), ServiceError> {
        let attempts = user.failed_login_attempts + 1;
        let locked_until = if attempts >= self.config.max_login_attempts as i64 {
            Some(Utc::now() + Duration::seconds(self.config.account_lock_duration as i64))
        } else {
            None
        };

        sqlx::query(
            "UPDATE users SET failed_login_attempts = ?, locked_until = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(attempts)
        .bind(locked_until)
        .bind(Utc::now())
        .bind(&user.id)
        .execute(&*self.db)
        .await?;

        if locked_until.is_some() {
            tracing::warn!(
                user_id = %user.id,
                attempts = attempts,
                "Account locked after repeated failed logins"
            );
        }

        Ok(())
    }

    async fn record_successful_login(
        &self,
        user: &User,
        new_hash: Option<String>,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        match new_hash {
            Some(hash) => {
                sqlx::query(
                    "UPDATE users SET failed_login_attempts = 0, locked_until = NULL, \
                     last_login_at = ?, password_hash = ?, updated_at = ? WHERE id = ?",
                )
                .bind(now)
                .bind(hash)
                .bind(now)
                .bind(&user.id)
                .execute(&*self.db)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE users SET failed_login_attempts = 0, locked_until = NULL, \
                     last_login_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(now)
                .bind(now)
                .bind(&user.id)
                .execute(&*self.db)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UserService for UserServiceImpl {
    async fn find_by_id(&self, user_id: &str) -> Result<Option<User>, ServiceError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, ServiceError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&*self.db)
            .await?;
        Ok(user)
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<User, ServiceError> {
        let user = self
            .find_by_username(username)
            .await?
            .ok_or_else(|| ServiceError::Unauthorized("Invalid username or password".to_string()))?;

        if !user.is_active {
            return Err(ServiceError::Unauthorized(
                "Account is disabled".to_string(),
            ));
        }

        let now = Utc::now();
        if user.is_locked(now) {
            return Err(ServiceError::Unauthorized(
                "Account is temporarily locked".to_string(),
            ));
        }

        if !crypto::verify_password(password, &user.password_hash)? {
            self.record_failed_attempt(&user).await?;
            return Err(ServiceError::Unauthorized(
                "Invalid username or password".to_string(),
            ));
        }

        // 登录成功时把低于现行策略的哈希升级到 Argon2id
        let new_hash = if crypto::needs_rehash(&user.password_hash) {
            Some(crypto::hash_password(password)?)
        } else {
            None
        };

        self.record_successful_login(&user, new_hash).await?;

        self.find_by_id(&user.id)
            .await?
            .ok_or_else(|| ServiceError::Internal("User vanished after login".to_string()))
    }
}
