use serde::Deserialize;
use std::collections::HashMap;

/// JWT 签名算法配置。
/// 协议令牌一律使用非对称签名；对称 HMAC 已不再支持，
/// 发现文档只公布这里声明的算法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum JwtAlgorithm {
    #[default]
    RS256,
    ES256,
    PS256,
}

impl JwtAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            JwtAlgorithm::RS256 => "RS256",
            JwtAlgorithm::ES256 => "ES256",
            JwtAlgorithm::PS256 => "PS256",
        }
    }

    pub fn to_jsonwebtoken(&self) -> jsonwebtoken::Algorithm {
        match self {
            JwtAlgorithm::RS256 => jsonwebtoken::Algorithm::RS256,
            JwtAlgorithm::ES256 => jsonwebtoken::Algorithm::ES256,
            JwtAlgorithm::PS256 => jsonwebtoken::Algorithm::PS256,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "RS256" => Some(JwtAlgorithm::RS256),
            "ES256" => Some(JwtAlgorithm::ES256),
            "PS256" => Some(JwtAlgorithm::PS256),
            _ => None,
        }
    }
}

/// Per-endpoint token bucket parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitSettings {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl RateLimitSettings {
    /// Parses the `capacity:refill_per_sec` wire format, e.g. `"20:0.5"`.
    fn parse(s: &str) -> Option<Self> {
        let (cap, refill) = s.split_once(':')?;
        Some(Self {
            capacity: cap.trim().parse().ok()?,
            refill_per_sec: refill.trim().parse().ok()?,
        })
    }
}

/// 应用配置快照。显式传入各组件，不读进程级全局变量。
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// `iss` claim 的取值；必须与发现文档一致
    pub issuer: String,
    /// 会话 JWT 的 `aud`
    pub ui_audience: String,
    pub jwt_algorithm: JwtAlgorithm,
    /// 秒。客户端配置优先于该默认值
    pub access_token_ttl_default: u64,
    pub refresh_token_ttl_default: u64,
    /// 秒，上限 600
    pub authorization_code_ttl: u64,
    pub session_ttl: u64,
    /// 外部 JWKS 文档缓存秒数 (private_key_jwt 客户端断言验证)
    pub jwks_cache_ttl: u64,
    pub max_login_attempts: u32,
    /// 秒
    pub account_lock_duration: u64,
    /// keyed by endpoint name, e.g. "token", "authorize"
    pub rate_limits: HashMap<String, RateLimitSettings>,
    /// 外部登录协作方：未认证的 /authorize 302 到这里
    pub login_url: String,
    /// 外部同意页协作方
    pub consent_url: String,
    pub skip_db_init: bool,
}

impl Config {
    /// Loads configuration from the environment, with `.env` support.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let issuer =
            std::env::var("ISSUER").unwrap_or_else(|_| "http://127.0.0.1:3001".to_string());

        let ui_audience =
            std::env::var("UI_AUDIENCE").unwrap_or_else(|_| "auth-center-ui".to_string());

        let jwt_algorithm = std::env::var("JWT_ALGORITHM")
            .ok()
            .and_then(|s| JwtAlgorithm::parse(&s))
            .unwrap_or_default();

        let authorization_code_ttl = env_u64("AUTHORIZATION_CODE_TTL", 600);
        if authorization_code_ttl > 600 {
            return Err(anyhow::anyhow!(
                "AUTHORIZATION_CODE_TTL must be <= 600 seconds, got {authorization_code_ttl}"
            ));
        }

        let mut rate_limits = HashMap::new();
        for endpoint in [
            "authorize",
            "token",
            "introspect",
            "revoke",
            "userinfo",
            "login",
            "check",
        ] {
            let key = format!("RATE_LIMIT_{}", endpoint.to_uppercase());
            if let Ok(raw) = std::env::var(&key) {
                match RateLimitSettings::parse(&raw) {
                    Some(settings) => {
                        rate_limits.insert(endpoint.to_string(), settings);
                    }
                    None => {
                        return Err(anyhow::anyhow!(
                            "{key} must use the capacity:refill_per_sec format, got '{raw}'"
                        ))
                    }
                }
            }
        }

        Ok(Self {
            database_url,
            issuer,
            ui_audience,
            jwt_algorithm,
            access_token_ttl_default: env_u64("ACCESS_TOKEN_TTL_DEFAULT", 3600),
            refresh_token_ttl_default: env_u64("REFRESH_TOKEN_TTL_DEFAULT", 30 * 24 * 3600),
            authorization_code_ttl,
            session_ttl: env_u64("SESSION_TTL", 8 * 3600),
            jwks_cache_ttl: env_u64("JWKS_CACHE_TTL", 600),
            max_login_attempts: env_u64("MAX_LOGIN_ATTEMPTS", 5) as u32,
            account_lock_duration: env_u64("ACCOUNT_LOCK_DURATION", 15 * 60),
            rate_limits,
            login_url: std::env::var("LOGIN_URL")
                .unwrap_or_else(|_| "http://localhost:3002/login".to_string()),
            consent_url: std::env::var("CONSENT_URL")
                .unwrap_or_else(|_| "http://localhost:3002/oauth/consent".to_string()),
            skip_db_init: matches!(
                std::env::var("SKIP_DB_INIT").as_deref(),
                Ok("true") | Ok("1")
            ),
        })
    }

    /// 测试与内嵌场景使用的默认配置
    pub fn for_tests() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            issuer: "http://auth-center.test".to_string(),
            ui_audience: "auth-center-ui".to_string(),
            jwt_algorithm: JwtAlgorithm::RS256,
            access_token_ttl_default: 3600,
            refresh_token_ttl_default: 30 * 24 * 3600,
            authorization_code_ttl: 600,
            session_ttl: 8 * 3600,
            jwks_cache_ttl: 600,
            max_login_attempts: 5,
            account_lock_duration: 15 * 60,
            rate_limits: HashMap::new(),
            login_url: "http://localhost:3002/login".to_string(),
            consent_url: "http://localhost:3002/oauth/consent".to_string(),
            skip_db_init: false,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_settings_parse() {
        let settings = RateLimitSettings::parse("20:0.5").unwrap();
        assert_eq!(settings.capacity, 20);
        assert!((settings.refill_per_sec - 0.5).abs() < f64::EPSILON);

        assert!(RateLimitSettings::parse("garbage").is_none());
        assert!(RateLimitSettings::parse("20").is_none());
    }

    #[test]
    fn test_jwt_algorithm_parse() {
        assert_eq!(JwtAlgorithm::parse("rs256"), Some(JwtAlgorithm::RS256));
        assert_eq!(JwtAlgorithm::parse("PS256"), Some(JwtAlgorithm::PS256));
        // 对称算法不被接受
        assert_eq!(JwtAlgorithm::parse("HS256"), None);
    }
}
