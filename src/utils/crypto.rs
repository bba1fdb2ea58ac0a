use crate::error::ServiceError;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Hashes a password using Argon2id.
pub fn hash_password(password: &str) -> Result<String, ServiceError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ServiceError::PasswordError(e.to_string()))?;

    Ok(password_hash.to_string())
}

/// Verifies a password against either a bcrypt or Argon2 hash.
/// Automatically detects the hash format and uses the appropriate algorithm.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, ServiceError> {
    if hash.starts_with("$2a$") || hash.starts_with("$2b$") || hash.starts_with("$2y$") {
        // bcrypt hash (legacy imports)
        bcrypt::verify(password, hash)
            .map_err(|e| ServiceError::PasswordError(format!("bcrypt verification error: {e}")))
    } else if hash.starts_with("$argon2") {
        let parsed_hash =
            PasswordHash::new(hash).map_err(|e| ServiceError::PasswordError(e.to_string()))?;

        let argon2 = Argon2::default();

        Ok(argon2
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    } else {
        Err(ServiceError::PasswordError(
            "Unknown hash format. Expected bcrypt ($2a$/$2b$/$2y$) or Argon2 ($argon2)".to_string(),
        ))
    }
}

/// 存量 bcrypt 哈希在登录成功后迁移到 Argon2id
pub fn needs_rehash(hash: &str) -> bool {
    !hash.starts_with("$argon2")
}

/// Emits a CSPRNG base64url string covering `byte_len` bytes of entropy.
/// Authorization codes, refresh tokens and session tokens all come from here.
pub fn generate_token(byte_len: usize) -> String {
    let mut bytes = vec![0u8; byte_len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex digest used for at-rest storage of opaque tokens and JWTs.
/// 数据库中从不存明文令牌。
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// Constant-time equality for secret material.
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hashing_and_verification() {
        let password = "mySecurePassword123";

        let hash = hash_password(password).unwrap();
        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("wrongPassword", &hash).unwrap());
    }

    #[test]
    fn test_invalid_hash_verification() {
        assert!(verify_password("pw", "this_is_not_a_valid_hash").is_err());
    }

    #[test]
    fn test_needs_rehash_detects_bcrypt() {
        assert!(needs_rehash(
            "$2b$10$PKrWTcyzYWIf2c38GCQ3b.QvuMjGGXcyAp.juw0Fz1EoZ80HQ.4.C"
        ));
        let argon = hash_password("pw").unwrap();
        assert!(!needs_rehash(&argon));
    }

    #[test]
    fn test_generate_token_is_base64url() {
        let token = generate_token(32);
        // 32 bytes -> 43 chars of unpadded base64url
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_hash_token_stable() {
        let h1 = hash_token("abc");
        let h2 = hash_token("abc");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, hash_token("abd"));
    }

    #[test]
    fn test_timing_safe_eq() {
        assert!(timing_safe_eq(b"secret", b"secret"));
        assert!(!timing_safe_eq(b"secret", b"secreT"));
        assert!(!timing_safe_eq(b"secret", b"longer_secret"));
    }
}
