use crate::config::JwtAlgorithm;
use crate::error::TokenVerifyError;
use crate::models::user::User;
use jsonwebtoken::{decode, decode_header, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Claims carried by protocol access tokens.
///
/// `aud` is the client the token was issued to; resource servers doing local
/// validation check `iss`/`exp`/signature and consult `/introspect` for
/// revocation state.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct AccessTokenClaims {
    pub iss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub aud: String,
    pub client_id: String,
    /// space-delimited
    pub scope: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    pub exp: usize,
    pub iat: usize,
    pub jti: String,
}

/// The claims present in the ID Token (OpenID Connect Core §2).
/// profile/email 相关字段按授权的 scope 裁剪。
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: usize,
    pub iat: usize,
    pub auth_time: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
}

/// Claims for the authorization server's own login-session JWT.
/// 与 OAuth 令牌互相独立：`aud` 固定为 ui_audience。
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct SessionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: usize,
    pub iat: usize,
    pub jti: String,
}

impl IdTokenClaims {
    /// Builds ID token claims from a user row, releasing optional claims only
    /// for the scopes the grant actually carries.
    #[allow(clippy::too_many_arguments)]
    pub fn for_user(
        user: &User,
        client_id: &str,
        issuer: &str,
        scope: &str,
        nonce: Option<&str>,
        auth_time: usize,
        iat: usize,
        exp: usize,
    ) -> Self {
        let scopes: Vec<&str> = scope.split_whitespace().collect();
        let has_profile = scopes.contains(&"profile");
        let has_email = scopes.contains(&"email");

        let name = if has_profile {
            user.display_name
                .clone()
                .or_else(|| match (&user.first_name, &user.last_name) {
                    (Some(first), Some(last)) => Some(format!("{first} {last}")),
                    (Some(first), None) => Some(first.clone()),
                    (None, Some(last)) => Some(last.clone()),
                    (None, None) => None,
                })
        } else {
            None
        };

        Self {
            iss: issuer.to_string(),
            sub: user.id.clone(),
            aud: client_id.to_string(),
            exp,
            iat,
            auth_time,
            nonce: nonce.map(|n| n.to_string()),
            name,
            given_name: has_profile.then(|| user.first_name.clone()).flatten(),
            family_name: has_profile.then(|| user.last_name.clone()).flatten(),
            preferred_username: has_profile.then(|| user.username.clone()),
            picture: has_profile.then(|| user.picture.clone()).flatten(),
            email: has_email.then(|| user.email.clone()).flatten(),
            email_verified: has_email.then_some(user.email_verified),
        }
    }
}

/// Signs claims with the given key, embedding the `kid` in the JWT header.
pub fn encode_with_kid<T: Serialize>(
    claims: &T,
    encoding_key: &EncodingKey,
    algorithm: JwtAlgorithm,
    kid: &str,
) -> Result<String, TokenVerifyError> {
    let mut header = Header::new(algorithm.to_jsonwebtoken());
    header.kid = Some(kid.to_string());
    encode(&header, claims, encoding_key).map_err(|e| {
        tracing::error!("JWT encoding with {} failed: {:?}", algorithm.as_str(), e);
        TokenVerifyError::Malformed
    })
}

/// Reads the `kid` from a token header without verifying the signature.
pub fn peek_kid(token: &str) -> Result<Option<String>, TokenVerifyError> {
    let header = decode_header(token).map_err(|_| TokenVerifyError::Malformed)?;
    Ok(header.kid)
}

/// Verifies a token against a resolved decoding key.
///
/// `exp`/`nbf`/`iat` checks always run; `aud` is only enforced when the
/// caller knows the expected audience (session JWTs), since access token
/// audiences vary per client.
pub fn decode_claims<T: DeserializeOwned>(
    token: &str,
    decoding_key: &DecodingKey,
    algorithm: JwtAlgorithm,
    expected_issuer: &str,
    expected_audience: Option<&str>,
) -> Result<T, TokenVerifyError> {
    let mut validation = Validation::new(algorithm.to_jsonwebtoken());
    validation.validate_exp = true;
    validation.set_issuer(&[expected_issuer]);
    match expected_audience {
        Some(aud) => validation.set_audience(&[aud]),
        None => validation.validate_aud = false,
    }

    decode::<T>(token, decoding_key, &validation)
        .map(|data| data.claims)
        .map_err(TokenVerifyError::from)
}
