use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A signing key row. At most one row is ACTIVE at any instant; RETIRED keys
/// stay in the published JWKS until every token they signed has expired.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JwkRow {
    pub kid: String,
    pub alg: String,
    /// serialized public JWK (kty/use/kid/alg/n/e)
    pub public_jwk: String,
    #[serde(skip_serializing)]
    pub private_pem: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

pub const JWK_STATUS_ACTIVE: &str = "ACTIVE";
pub const JWK_STATUS_RETIRED: &str = "RETIRED";

/// Public JWK wire format, as published at /.well-known/jwks.json and as
/// parsed from client `jwks_uri` documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicJwk {
    pub kty: String,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// RSA modulus, base64url
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent, base64url
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<PublicJwk>,
}
