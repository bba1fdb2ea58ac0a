use crate::cache::jwks_cache::JwksCache;
use crate::cache::permission_cache::{InMemoryPermissionCache, PermissionCache};
use crate::config::Config;
use crate::error::AppError;
use crate::middleware::rate_limit::EndpointRateLimiters;
use crate::services::{
    audit_log_service::{AuditLogService, AuditLogServiceImpl},
    auth_code_service::{AuthCodeService, AuthCodeServiceImpl},
    client_service::{ClientService, ClientServiceImpl},
    consent_service::{ConsentService, ConsentServiceImpl},
    key_service::KeyService,
    rbac_service::{RbacService, RbacServiceImpl},
    session_service::{SessionService, SessionServiceImpl},
    token_service::{TokenService, TokenServiceImpl},
    user_service::{UserService, UserServiceImpl},
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// The application state, containing all shared services and resources.
/// 请求处理器之间不共享可变内存状态；共享状态全部落在凭据存储里。
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub config: Arc<Config>,
    pub key_service: Arc<KeyService>,
    pub user_service: Arc<dyn UserService>,
    pub client_service: Arc<dyn ClientService>,
    pub token_service: Arc<dyn TokenService>,
    pub auth_code_service: Arc<dyn AuthCodeService>,
    pub rbac_service: Arc<dyn RbacService>,
    pub consent_service: Arc<dyn ConsentService>,
    pub session_service: Arc<dyn SessionService>,
    pub audit_log_service: Arc<dyn AuditLogService>,
    pub permission_cache: Arc<dyn PermissionCache>,
    pub jwks_cache: Arc<JwksCache>,
    pub rate_limiters: EndpointRateLimiters,
}

impl AppState {
    /// Creates the application state from a connection pool and configuration.
    /// Bootstraps the signing key if the JWK table is empty.
    pub async fn new(pool: Arc<SqlitePool>, config: Arc<Config>) -> Result<Self, AppError> {
        let permission_cache: Arc<dyn PermissionCache> =
            Arc::new(InMemoryPermissionCache::with_capacity(1000));
        let jwks_cache = Arc::new(JwksCache::new(config.jwks_cache_ttl));
        let rate_limiters = EndpointRateLimiters::new(&config.rate_limits);

        let key_service = Arc::new(KeyService::new(pool.clone(), config.clone()));
        key_service.ensure_signing_key().await?;

        let user_service: Arc<dyn UserService> =
            Arc::new(UserServiceImpl::new(pool.clone(), config.clone()));
        let client_service: Arc<dyn ClientService> = Arc::new(ClientServiceImpl::new(
            pool.clone(),
            config.clone(),
            jwks_cache.clone(),
        ));
        let rbac_service: Arc<dyn RbacService> = Arc::new(RbacServiceImpl::new(
            pool.clone(),
            permission_cache.clone(),
        ));
        let token_service: Arc<dyn TokenService> = Arc::new(TokenServiceImpl::new(
            pool.clone(),
            config.clone(),
            key_service.clone(),
            user_service.clone(),
            rbac_service.clone(),
        ));
        let auth_code_service: Arc<dyn AuthCodeService> =
            Arc::new(AuthCodeServiceImpl::new(pool.clone(), config.clone()));
        let consent_service: Arc<dyn ConsentService> =
            Arc::new(ConsentServiceImpl::new(pool.clone()));
        let session_service: Arc<dyn SessionService> = Arc::new(SessionServiceImpl::new(
            pool.clone(),
            config.clone(),
            key_service.clone(),
        ));
        let audit_log_service: Arc<dyn AuditLogService> =
            Arc::new(AuditLogServiceImpl::new(pool.clone()));

        Ok(Self {
            db: pool,
            config,
            key_service,
            user_service,
            client_service,
            token_service,
            auth_code_service,
            rbac_service,
            consent_service,
            session_service,
            audit_log_service,
            permission_cache,
            jwks_cache,
            rate_limiters,
        })
    }
}
