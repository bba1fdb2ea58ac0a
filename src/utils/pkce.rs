use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PkceError {
    #[error("PKCE verification failed: code challenge does not match verifier")]
    VerificationFailed,

    #[error("code_verifier must be between 43 and 128 characters")]
    InvalidVerifierLength,

    #[error("code_verifier contains invalid characters")]
    InvalidVerifierCharset,

    #[error("code_challenge must be between 43 and 128 base64url characters")]
    InvalidChallenge,
}

/// RFC 7636 unreserved charset: [A-Z] / [a-z] / [0-9] / "-" / "." / "_" / "~"
fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' || c == '~'
}

/// Validates code_verifier format according to RFC 7636 §4.1.
pub fn validate_code_verifier(verifier: &str) -> Result<(), PkceError> {
    if verifier.len() < 43 || verifier.len() > 128 {
        return Err(PkceError::InvalidVerifierLength);
    }
    if !verifier.chars().all(is_unreserved) {
        return Err(PkceError::InvalidVerifierCharset);
    }
    Ok(())
}

/// Validates the stored form of a code_challenge (base64url, 43-128 chars).
/// 43 是 SHA-256 摘要 base64url 编码的精确长度，42 字符一律拒绝。
pub fn validate_code_challenge(challenge: &str) -> Result<(), PkceError> {
    if challenge.len() < 43 || challenge.len() > 128 {
        return Err(PkceError::InvalidChallenge);
    }
    if !challenge
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PkceError::InvalidChallenge);
    }
    Ok(())
}

/// Verifies a PKCE S256 code challenge against a code verifier.
///
/// `BASE64URL_NOPAD(SHA256(verifier)) == challenge`, compared in constant
/// time so the token endpoint leaks nothing about partial matches.
pub fn verify_pkce(code_verifier: &str, code_challenge: &str) -> Result<(), PkceError> {
    validate_code_verifier(code_verifier)?;

    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    let hash = hasher.finalize();

    let encoded_challenge = URL_SAFE_NO_PAD.encode(hash);

    let matches: bool = encoded_challenge
        .as_bytes()
        .ct_eq(code_challenge.as_bytes())
        .into();
    if !matches {
        return Err(PkceError::VerificationFailed);
    }

    Ok(())
}

/// Generates a random PKCE code verifier (43-128 characters).
pub fn generate_code_verifier() -> String {
    let mut rng = thread_rng();
    let length = rng.gen_range(43..=128);
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Generates the S256 code challenge for a verifier. Mainly useful for tests.
pub fn generate_code_challenge(code_verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    let hash = hasher.finalize();
    URL_SAFE_NO_PAD.encode(hash)
}
