//! 签名密钥管理 (JWK 表)
//!
//! 不变量：任一时刻至多一个 ACTIVE 签名密钥。轮换把 ACTIVE 标记为
//! RETIRED 并插入新 ACTIVE，已退役密钥在其签发的令牌全部过期前继续
//! 留在公开的 JWKS 里，保证在途令牌可验证。

use crate::config::{Config, JwtAlgorithm};
use crate::error::{ServiceError, TokenVerifyError};
use crate::models::jwk::{JwkRow, JwksDocument, PublicJwk, JWK_STATUS_ACTIVE, JWK_STATUS_RETIRED};
use crate::utils::jwt;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

struct ActiveKey {
    kid: String,
    encoding_key: Arc<EncodingKey>,
}

pub struct KeyService {
    db: Arc<SqlitePool>,
    config: Arc<Config>,
    /// process-wide signing key cache, refreshed on rotation
    active: RwLock<Option<ActiveKey>>,
    /// kid -> decoding key, covers ACTIVE and RETIRED keys
    decoding: RwLock<HashMap<String, Arc<DecodingKey>>>,
    /// 轮换串行化
    rotation_lock: Mutex<()>,
}

impl KeyService {
    pub fn new(db: Arc<SqlitePool>, config: Arc<Config>) -> Self {
        Self {
            db,
            config,
            active: RwLock::new(None),
            decoding: RwLock::new(HashMap::new()),
            rotation_lock: Mutex::new(()),
        }
    }

    /// Bootstrap: generate and persist an initial ACTIVE key if none exists.
    pub async fn ensure_signing_key(&self) -> Result<(), ServiceError> {
        let _guard = self.rotation_lock.lock().await;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT kid FROM jwks WHERE status = ? LIMIT 1")
                .bind(JWK_STATUS_ACTIVE)
                .fetch_optional(&*self.db)
                .await?;

        if existing.is_some() {
            return Ok(());
        }

        let row = self.generate_key_row()?;
        sqlx::query(
            "INSERT INTO jwks (kid, alg, public_jwk, private_pem, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.kid)
        .bind(&row.alg)
        .bind(&row.public_jwk)
        .bind(&row.private_pem)
        .bind(JWK_STATUS_ACTIVE)
        .bind(row.created_at)
        .execute(&*self.db)
        .await?;

        tracing::info!(kid = %row.kid, alg = %row.alg, "Bootstrap signing key created");
        Ok(())
    }

    /// Rotates the signing key: retires the ACTIVE key and inserts a fresh
    /// one, in a single transaction serialized by the rotation lock.
    pub async fn rotate(&self) -> Result<String, ServiceError> {
        let _guard = self.rotation_lock.lock().await;

        let row = self.generate_key_row()?;
        let now = Utc::now();

        let mut tx = self.db.begin().await?;

        sqlx::query("UPDATE jwks SET status = ?, rotated_at = ? WHERE status = ?")
            .bind(JWK_STATUS_RETIRED)
            .bind(now)
            .bind(JWK_STATUS_ACTIVE)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO jwks (kid, alg, public_jwk, private_pem, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.kid)
        .bind(&row.alg)
        .bind(&row.public_jwk)
        .bind(&row.private_pem)
        .bind(JWK_STATUS_ACTIVE)
        .bind(row.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        // 缓存随轮换信号刷新
        self.active.write().await.take();
        self.decoding.write().await.clear();

        tracing::info!(kid = %row.kid, "Signing key rotated");
        Ok(row.kid)
    }

    /// Signs claims with the current ACTIVE key, embedding its `kid`.
    pub async fn sign<T: Serialize + Sync>(&self, claims: &T) -> Result<String, ServiceError> {
        let (kid, encoding_key) = self.active_signing_key().await?;
        jwt::encode_with_kid(claims, &encoding_key, self.config.jwt_algorithm, &kid)
            .map_err(ServiceError::Token)
    }

    /// Verifies a token via `kid`-directed key lookup plus standard claim
    /// checks. `expected_audience` is enforced only when known (session JWTs).
    pub async fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        expected_audience: Option<&str>,
    ) -> Result<T, TokenVerifyError> {
        let kid = jwt::peek_kid(token)?.ok_or(TokenVerifyError::Malformed)?;
        let decoding_key = self
            .decoding_key(&kid)
            .await
            .map_err(|_| TokenVerifyError::UnknownKid(kid.clone()))?
            .ok_or_else(|| TokenVerifyError::UnknownKid(kid.clone()))?;

        jwt::decode_claims(
            token,
            &decoding_key,
            self.config.jwt_algorithm,
            &self.config.issuer,
            expected_audience,
        )
    }

    /// Assembles the published JWKS: the ACTIVE key plus every RETIRED key
    /// still inside its retention window.
    pub async fn jwks_document(&self) -> Result<JwksDocument, ServiceError> {
        let retention = self.retired_key_retention().await?;
        let cutoff = Utc::now() - retention;

        let rows: Vec<JwkRow> = sqlx::query_as(
            "SELECT kid, alg, public_jwk, private_pem, status, created_at, rotated_at \
             FROM jwks WHERE status = ? OR (status = ? AND rotated_at > ?) \
             ORDER BY created_at DESC",
        )
        .bind(JWK_STATUS_ACTIVE)
        .bind(JWK_STATUS_RETIRED)
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;

        let keys = rows
            .iter()
            .filter_map(|row| serde_json::from_str::<PublicJwk>(&row.public_jwk).ok())
            .collect();

        Ok(JwksDocument { keys })
    }

    /// Currently advertised signing algorithm, for the discovery document.
    pub fn algorithm(&self) -> JwtAlgorithm {
        self.config.jwt_algorithm
    }

    async fn active_signing_key(&self) -> Result<(String, Arc<EncodingKey>), ServiceError> {
        if let Some(active) = self.active.read().await.as_ref() {
            return Ok((active.kid.clone(), active.encoding_key.clone()));
        }

        let row: JwkRow = sqlx::query_as(
            "SELECT kid, alg, public_jwk, private_pem, status, created_at, rotated_at \
             FROM jwks WHERE status = ? LIMIT 1",
        )
        .bind(JWK_STATUS_ACTIVE)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| ServiceError::Internal("No ACTIVE signing key configured".to_string()))?;

        let encoding_key = Arc::new(
            EncodingKey::from_rsa_pem(row.private_pem.as_bytes())
                .map_err(|e| ServiceError::Internal(format!("Bad signing key PEM: {e}")))?,
        );

        let mut cache = self.active.write().await;
        *cache = Some(ActiveKey {
            kid: row.kid.clone(),
            encoding_key: encoding_key.clone(),
        });

        Ok((row.kid, encoding_key))
    }

    async fn decoding_key(&self, kid: &str) -> Result<Option<Arc<DecodingKey>>, ServiceError> {
        if let Some(key) = self.decoding.read().await.get(kid) {
            return Ok(Some(key.clone()));
        }

        let row: Option<JwkRow> = sqlx::query_as(
            "SELECT kid, alg, public_jwk, private_pem, status, created_at, rotated_at \
             FROM jwks WHERE kid = ?",
        )
        .bind(kid)
        .fetch_optional(&*self.db)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let public: PublicJwk = serde_json::from_str(&row.public_jwk)
            .map_err(|e| ServiceError::Internal(format!("Corrupt public JWK for {kid}: {e}")))?;
        let (n, e) = match (&public.n, &public.e) {
            (Some(n), Some(e)) => (n.as_str(), e.as_str()),
            _ => {
                return Err(ServiceError::Internal(format!(
                    "Public JWK for {kid} is missing RSA components"
                )))
            }
        };

        let decoding_key = Arc::new(
            DecodingKey::from_rsa_components(n, e)
                .map_err(|e| ServiceError::Internal(format!("Bad RSA components: {e}")))?,
        );

        self.decoding
            .write()
            .await
            .insert(kid.to_string(), decoding_key.clone());

        Ok(Some(decoding_key))
    }

    /// RETIRED 保留窗口 = 已配置客户端的最大 access token TTL
    async fn retired_key_retention(&self) -> Result<Duration, ServiceError> {
        let max_client_ttl: Option<i64> =
            sqlx::query_scalar("SELECT MAX(access_token_ttl) FROM oauth_clients")
                .fetch_one(&*self.db)
                .await
                .unwrap_or(None);

        let seconds = max_client_ttl
            .unwrap_or(0)
            .max(self.config.access_token_ttl_default as i64);
        Ok(Duration::seconds(seconds))
    }

    fn generate_key_row(&self) -> Result<JwkRow, ServiceError> {
        match self.config.jwt_algorithm {
            JwtAlgorithm::RS256 | JwtAlgorithm::PS256 => {}
            JwtAlgorithm::ES256 => {
                // EC 密钥不在进程内生成；见 DESIGN.md
                return Err(ServiceError::Internal(
                    "ES256 signing keys must be provisioned externally".to_string(),
                ));
            }
        }

        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
            .map_err(|e| ServiceError::Internal(format!("RSA key generation failed: {e}")))?;
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ServiceError::Internal(format!("PEM encoding failed: {e}")))?
            .to_string();

        let kid = Uuid::new_v4().to_string();
        let public = PublicJwk {
            kty: "RSA".to_string(),
            use_: Some("sig".to_string()),
            kid: Some(kid.clone()),
            alg: Some(self.config.jwt_algorithm.as_str().to_string()),
            n: Some(URL_SAFE_NO_PAD.encode(private_key.n().to_bytes_be())),
            e: Some(URL_SAFE_NO_PAD.encode(private_key.e().to_bytes_be())),
        };
        let public_jwk = serde_json::to_string(&public)
            .map_err(|e| ServiceError::Internal(format!("JWK serialization failed: {e}")))?;

        Ok(JwkRow {
            kid,
            alg: self.config.jwt_algorithm.as_str().to_string(),
            public_jwk,
            private_pem,
            status: JWK_STATUS_ACTIVE.to_string(),
            created_at: Utc::now(),
            rotated_at: None,
        })
    }
}
