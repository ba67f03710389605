//! Secret hashing with scrypt.
//!
//! Stored values carry the `sc:` marker so the scheme can be rotated later
//! without guessing at what produced an old hash.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use scrypt::Params;
use thiserror::Error;

const SCRYPT_PREFIX: &str = "sc:";

// log2(N)=15, r=8, p=1, 32-byte key.
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SCRYPT_DK_LEN: usize = 32;

/// Secret hashing errors
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("failed to derive key: {0}")]
    Derivation(String),
}

/// Hash a secret with the configured salt.
///
/// Identical `(secret, salt)` pairs always produce identical output, which is
/// what lets verification be a plain string comparison against the store.
pub fn hash_secret(secret: &str, salt: &[u8]) -> Result<String, SecretError> {
    let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SCRYPT_DK_LEN)
        .map_err(|e| SecretError::Derivation(e.to_string()))?;

    let mut dk = [0u8; SCRYPT_DK_LEN];
    scrypt::scrypt(secret.as_bytes(), salt, &params, &mut dk)
        .map_err(|e| SecretError::Derivation(e.to_string()))?;

    Ok(format!("{}{}", SCRYPT_PREFIX, BASE64.encode(dk)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = hash_secret("secret123", b"salt").unwrap();
        let b = hash_secret("secret123", b"salt").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hash_carries_marker() {
        let h = hash_secret("secret123", b"salt").unwrap();
        assert!(h.starts_with("sc:"));
    }

    #[test]
    fn different_secrets_differ() {
        let a = hash_secret("secret123", b"salt").unwrap();
        let b = hash_secret("secret124", b"salt").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn different_salts_differ() {
        let a = hash_secret("secret123", b"salt-a").unwrap();
        let b = hash_secret("secret123", b"salt-b").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_salt_is_allowed() {
        // Deployments without a configured salt still hash; they just lose
        // the per-deployment separation.
        let h = hash_secret("secret123", b"").unwrap();
        assert!(h.starts_with("sc:"));
    }
}
