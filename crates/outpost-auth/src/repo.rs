//! Auth repository: token verification and registration over a key-value
//! store.
//!
//! The repository stores `"<prefix>API_KEY::<baseID>" -> "sc:<hash>"` and
//! treats both "no such key" and "hash mismatch" as the same answer: bad
//! credentials. Errors are reserved for store faults and malformed input.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::secret::{hash_secret, SecretError};
use crate::store::{KeyValueStore, StoreError};
use crate::token::{split_key_id, Token, TokenError};

const API_KEY_PREFIX: &str = "API_KEY::";

/// Repository errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token ID already exists")]
    DuplicateTokenId,

    #[error("token not found")]
    TokenNotFound,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("store fault: {0}")]
    Store(#[from] StoreError),
}

/// The auth surface the core consumes.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Verify credentials. `Ok(None)` means bad credentials; the caller must
    /// not learn whether the key existed.
    async fn verify(&self, key_id_with_kind: &str, secret: &str)
        -> Result<Option<Token>, AuthError>;

    async fn save_token(&self, token: &Token) -> Result<(), AuthError>;

    async fn delete_token(&self, id: &str) -> Result<(), AuthError>;

    /// Existence probe on the base key ID; lets edges tell "unknown key"
    /// apart from "known key with no live tunnel".
    async fn is_key_exists(&self, id: &str) -> Result<bool, AuthError>;

    async fn check_health(&self) -> Result<(), AuthError>;
}

/// Repository configuration.
#[derive(Debug, Clone, Default)]
pub struct RepoConfig {
    /// Prefix applied to every store key, separating deployments sharing one
    /// store.
    pub key_prefix: String,
    /// Salt fed to the secret hash.
    pub salt: String,
}

/// Auth repository over any [`KeyValueStore`].
pub struct AuthRepo<S> {
    store: S,
    key_prefix: String,
    salt: Vec<u8>,
}

impl<S: KeyValueStore> AuthRepo<S> {
    pub fn new(store: S, cfg: RepoConfig) -> Self {
        Self {
            store,
            key_prefix: cfg.key_prefix,
            salt: cfg.salt.into_bytes(),
        }
    }

    fn store_key(&self, base_id: &str) -> String {
        format!("{}{}{}", self.key_prefix, API_KEY_PREFIX, base_id)
    }
}

#[async_trait]
impl<S: KeyValueStore> AuthStore for AuthRepo<S> {
    async fn verify(
        &self,
        key_id_with_kind: &str,
        secret: &str,
    ) -> Result<Option<Token>, AuthError> {
        // Suffix-less IDs are rejected before any store round trip. The
        // client decode path is lenient about them; this path is not.
        let (base_id, kind) = split_key_id(key_id_with_kind)?;

        let secret_hash = hash_secret(secret, &self.salt)?;

        match self.store.get(&self.store_key(&base_id)).await? {
            Some(stored) if stored == secret_hash => {
                Ok(Some(Token::new(base_id, String::new(), kind)))
            }
            Some(_) => {
                debug!(key_id = %base_id, "secret mismatch");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn save_token(&self, token: &Token) -> Result<(), AuthError> {
        let secret_hash = hash_secret(&token.secret, &self.salt)?;

        let inserted = self
            .store
            .set_nx(&self.store_key(&token.id), &secret_hash, token.ttl)
            .await?;

        if !inserted {
            return Err(AuthError::DuplicateTokenId);
        }

        Ok(())
    }

    async fn delete_token(&self, id: &str) -> Result<(), AuthError> {
        if !self.store.del(&self.store_key(id)).await? {
            return Err(AuthError::TokenNotFound);
        }

        Ok(())
    }

    async fn is_key_exists(&self, id: &str) -> Result<bool, AuthError> {
        Ok(self.store.exists(&self.store_key(id)).await?)
    }

    async fn check_health(&self) -> Result<(), AuthError> {
        Ok(self.store.ping().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::token::TokenKind;

    fn repo() -> AuthRepo<MemoryStore> {
        AuthRepo::new(
            MemoryStore::new(),
            RepoConfig {
                key_prefix: "test::".to_string(),
                salt: "pepper".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn verify_round_trip_web() {
        let repo = repo();
        let token = Token::new("key123", "secret123", TokenKind::Web);
        repo.save_token(&token).await.unwrap();

        let got = repo.verify("key123-w", "secret123").await.unwrap().unwrap();
        assert_eq!(got.id, "key123");
        assert_eq!(got.kind, TokenKind::Web);
        // The stored secret never comes back.
        assert!(got.secret.is_empty());
    }

    #[tokio::test]
    async fn verify_respects_wire_kind() {
        let repo = repo();
        repo.save_token(&Token::new("key456", "secret456", TokenKind::Tcp))
            .await
            .unwrap();

        // The kind comes from the presented ID, not from the stored value.
        let got = repo.verify("key456-t", "secret456").await.unwrap().unwrap();
        assert_eq!(got.kind, TokenKind::Tcp);
    }

    #[tokio::test]
    async fn verify_bad_secret_is_none() {
        let repo = repo();
        repo.save_token(&Token::new("key123", "secret123", TokenKind::Web))
            .await
            .unwrap();

        assert!(repo.verify("key123-w", "wrong").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn verify_unknown_key_is_none() {
        let repo = repo();
        assert!(repo.verify("ghost-w", "secret").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn verify_rejects_missing_suffix() {
        let repo = repo();
        let err = repo.verify("key123", "secret123").await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Token(TokenError::InvalidTypeSuffix)
        ));
    }

    #[tokio::test]
    async fn verify_rejects_unknown_suffix() {
        let repo = repo();
        let err = repo.verify("key123-x", "secret123").await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Token(TokenError::InvalidTypeSuffix)
        ));
    }

    #[tokio::test]
    async fn save_twice_is_duplicate() {
        let repo = repo();
        let token = Token::new("dup", "s", TokenKind::Web);

        repo.save_token(&token).await.unwrap();
        assert!(matches!(
            repo.save_token(&token).await.unwrap_err(),
            AuthError::DuplicateTokenId
        ));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let repo = repo();
        assert!(matches!(
            repo.delete_token("nope").await.unwrap_err(),
            AuthError::TokenNotFound
        ));
    }

    #[tokio::test]
    async fn exists_uses_base_id() {
        let repo = repo();
        repo.save_token(&Token::new("present", "s", TokenKind::Web))
            .await
            .unwrap();

        assert!(repo.is_key_exists("present").await.unwrap());
        assert!(!repo.is_key_exists("absent").await.unwrap());
    }
}
