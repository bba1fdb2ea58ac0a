//! 请求边界限流
//!
//! 按 (调用方, 端点) 计费的令牌桶。已认证端点以 client_id 为键，
//! 匿名端点以来源 IP 为键。桶参数来自配置 `rate_limit.<endpoint>`，
//! 未配置的端点不限流。拒绝时返回 429 + Retry-After；外层审计中间件
//! 为该请求落一条 success=false 的审计行。

use crate::config::RateLimitSettings;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use std::{
    collections::HashMap,
    sync::Arc,
    time::Instant,
};
use tokio::sync::RwLock;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A keyed token-bucket limiter.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Bucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            capacity: settings.capacity as f64,
            refill_per_sec: settings.refill_per_sec,
        }
    }

    /// Takes one token for `key`; on exhaustion returns the suggested
    /// Retry-After in whole seconds.
    pub async fn try_acquire(&self, key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - bucket.tokens) / self.refill_per_sec.max(f64::MIN_POSITIVE);
            Err(wait.ceil() as u64)
        }
    }

    /// 后台清理：长时间未动的键直接回收
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;
        buckets.retain(|_, bucket| {
            now.duration_since(bucket.last_refill).as_secs_f64() * self.refill_per_sec
                < self.capacity * 2.0
        });
    }
}

/// Per-endpoint limiter registry built from configuration.
pub struct EndpointRateLimiters {
    limiters: HashMap<String, RateLimiter>,
}

impl EndpointRateLimiters {
    pub fn new(settings: &HashMap<String, RateLimitSettings>) -> Self {
        let limiters = settings
            .iter()
            .map(|(endpoint, cfg)| (endpoint.clone(), RateLimiter::new(*cfg)))
            .collect();
        Self { limiters }
    }

    pub fn for_endpoint(&self, endpoint: &str) -> Option<&RateLimiter> {
        self.limiters.get(endpoint)
    }
}

/// Maps a request path to its configured endpoint name.
fn endpoint_name(path: &str) -> Option<&'static str> {
    match path {
        "/authorize" => Some("authorize"),
        "/token" => Some("token"),
        "/introspect" => Some("introspect"),
        "/revoke" => Some("revoke"),
        "/userinfo" => Some("userinfo"),
        "/auth/login" => Some("login"),
        "/auth/check" | "/auth/check-batch" | "/auth/refresh" => Some("check"),
        _ => None,
    }
}

/// 已认证端点的键：HTTP Basic 里的 client_id；否则退回来源 IP
fn limiter_key(request: &Request) -> String {
    if let Some(client_id) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Basic "))
        .and_then(|b64| STANDARD.decode(b64).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|pair| pair.split(':').next().map(|s| s.to_string()))
        .filter(|id| !id.is_empty())
    {
        return format!("client:{client_id}");
    }

    let ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| "127.0.0.1".to_string());

    format!("ip:{ip}")
}

pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(endpoint) = endpoint_name(&path) else {
        return next.run(request).await;
    };
    let Some(limiter) = state.rate_limiters.for_endpoint(endpoint) else {
        return next.run(request).await;
    };

    let key = limiter_key(&request);

    match limiter.try_acquire(&format!("{key}|{endpoint}")).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::warn!(endpoint = endpoint, key = %key, path = %path, "Rate limit exceeded");

            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "temporarily_unavailable",
                    "error_description": "Rate limit exceeded. Please retry later."
                })),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(capacity: u32, refill: f64) -> RateLimitSettings {
        RateLimitSettings {
            capacity,
            refill_per_sec: refill,
        }
    }

    #[tokio::test]
    async fn test_bucket_exhaustion() {
        let limiter = RateLimiter::new(settings(3, 0.001));

        for _ in 0..3 {
            assert!(limiter.try_acquire("k").await.is_ok());
        }
        let retry_after = limiter.try_acquire("k").await.unwrap_err();
        assert!(retry_after >= 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(settings(1, 0.001));

        assert!(limiter.try_acquire("a").await.is_ok());
        assert!(limiter.try_acquire("b").await.is_ok());
        assert!(limiter.try_acquire("a").await.is_err());
    }

    #[tokio::test]
    async fn test_refill() {
        let limiter = RateLimiter::new(settings(1, 20.0));

        assert!(limiter.try_acquire("k").await.is_ok());
        assert!(limiter.try_acquire("k").await.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(limiter.try_acquire("k").await.is_ok());
    }

    #[test]
    fn test_endpoint_name_mapping() {
        assert_eq!(endpoint_name("/token"), Some("token"));
        assert_eq!(endpoint_name("/auth/check"), Some("check"));
        assert_eq!(endpoint_name("/health"), None);
    }
}
