//! 外部 JWKS 文档缓存
//!
//! private_key_jwt 客户端认证需要抓取客户端的 jwks_uri。缓存为进程级，
//! 按 URI 设 TTL；同一 URI 的并发未命中由 per-URI 锁收敛成一次抓取
//! (single-flight)，防止上游被打穿。

use crate::error::ServiceError;
use crate::models::jwk::{JwksDocument, PublicJwk};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Clone)]
struct CachedJwks {
    keys: Vec<PublicJwk>,
    fetched_at: DateTime<Utc>,
}

pub struct JwksCache {
    http: reqwest::Client,
    ttl_seconds: i64,
    entries: RwLock<HashMap<String, CachedJwks>>,
    /// one lock per URI; acquiring it serializes the fetch
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JwksCache {
    pub fn new(ttl_seconds: u64) -> Self {
        let http = reqwest::Client::builder()
            // 出站抓取受 3 秒截止时间约束
            .timeout(std::time::Duration::from_secs(3))
            .build()
            .unwrap_or_default();

        Self {
            http,
            ttl_seconds: ttl_seconds as i64,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the keys published at `jwks_uri`, served from cache within TTL.
    pub async fn get(&self, jwks_uri: &str) -> Result<Vec<PublicJwk>, ServiceError> {
        if let Some(keys) = self.fresh(jwks_uri).await {
            return Ok(keys);
        }

        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(jwks_uri.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let _guard = gate.lock().await;

        // another task may have refreshed while we waited on the gate
        if let Some(keys) = self.fresh(jwks_uri).await {
            return Ok(keys);
        }

        let document: JwksDocument = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("JWKS fetch failed for {jwks_uri}: {e}")))?
            .error_for_status()
            .map_err(|e| ServiceError::Upstream(format!("JWKS fetch failed for {jwks_uri}: {e}")))?
            .json()
            .await
            .map_err(|e| {
                ServiceError::Upstream(format!("Malformed JWKS document at {jwks_uri}: {e}"))
            })?;

        let mut entries = self.entries.write().await;
        entries.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys: document.keys.clone(),
                fetched_at: Utc::now(),
            },
        );

        Ok(document.keys)
    }

    /// 失效指定 URI（客户端换钥后由管理面触发）
    pub async fn invalidate(&self, jwks_uri: &str) {
        self.entries.write().await.remove(jwks_uri);
    }

    async fn fresh(&self, jwks_uri: &str) -> Option<Vec<PublicJwk>> {
        let entries = self.entries.read().await;
        let cached = entries.get(jwks_uri)?;
        if Utc::now() - cached.fetched_at < Duration::seconds(self.ttl_seconds) {
            Some(cached.keys.clone())
        } else {
            None
        }
    }

    /// Test hook: seed the cache without hitting the network.
    pub async fn insert_for_tests(&self, jwks_uri: &str, keys: Vec<PublicJwk>) {
        self.entries.write().await.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys,
                fetched_at: Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(kid: &str) -> PublicJwk {
        PublicJwk {
            kty: "RSA".to_string(),
            use_: Some("sig".to_string()),
            kid: Some(kid.to_string()),
            alg: Some("RS256".to_string()),
            n: Some("AQAB".to_string()),
            e: Some("AQAB".to_string()),
        }
    }

    #[tokio::test]
    async fn test_seeded_cache_hit() {
        let cache = JwksCache::new(600);
        cache
            .insert_for_tests("https://client.example/jwks.json", vec![test_key("k1")])
            .await;

        let keys = cache.get("https://client.example/jwks.json").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].kid.as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let cache = JwksCache::new(600);
        cache
            .insert_for_tests("https://client.example/jwks.json", vec![test_key("k1")])
            .await;
        cache.invalidate("https://client.example/jwks.json").await;

        // no entry and no reachable upstream -> Upstream error
        let err = cache
            .get("https://client.example/jwks.json")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(_)));
    }
}
