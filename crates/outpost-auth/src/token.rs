//! Tunnel token codec.
//!
//! Wire form is `base64(<id>-<kind>:<secret>)` where `<kind>` is `w` (web)
//! or `t` (tcp). The base ID (without suffix) is what the store and the edge
//! routers key on.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;

/// Length of generated key IDs and secrets.
const GENERATED_ID_LEN: usize = 8;
const GENERATED_SECRET_LEN: usize = 32;

/// Token errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    MalformedToken,

    #[error("token ID has no valid type suffix")]
    InvalidTypeSuffix,
}

/// What kind of traffic a token admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Web,
    Tcp,
}

impl TokenKind {
    /// One-letter suffix used on the wire and in token IDs.
    pub fn suffix(&self) -> char {
        match self {
            TokenKind::Web => 'w',
            TokenKind::Tcp => 't',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Web => "web",
            TokenKind::Tcp => "tcp",
        }
    }

    fn from_suffix(c: &str) -> Result<Self, TokenError> {
        match c {
            "w" => Ok(TokenKind::Web),
            "t" => Ok(TokenKind::Tcp),
            _ => Err(TokenError::InvalidTypeSuffix),
        }
    }
}

/// A tunnel credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Base key ID, without the kind suffix.
    pub id: String,
    pub secret: String,
    pub kind: TokenKind,
    /// Store TTL applied at save time.
    pub ttl: Duration,
}

impl Token {
    pub fn new(id: impl Into<String>, secret: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            kind,
            ttl: Duration::ZERO,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Mint a new token with a random secret. An empty `id` gets a random
    /// alphanumeric one.
    pub fn generate(id: &str, kind: TokenKind, ttl: Duration) -> Self {
        let id = if id.is_empty() {
            random_string(GENERATED_ID_LEN).to_lowercase()
        } else {
            id.to_string()
        };

        Self {
            id,
            secret: random_string(GENERATED_SECRET_LEN),
            kind,
            ttl,
        }
    }

    /// Key ID with the kind suffix attached, e.g. `mykey-w`.
    pub fn id_with_kind(&self) -> String {
        format!("{}-{}", self.id, self.kind.suffix())
    }

    /// Encode to the wire form handed to end users.
    pub fn encode(&self) -> String {
        BASE64.encode(format!("{}:{}", self.id_with_kind(), self.secret))
    }

    /// Decode a wire-form token.
    ///
    /// IDs without a kind suffix are accepted as `web` for compatibility with
    /// tokens issued before kinds existed. Only this client-facing decode is
    /// lenient; the server-side verify path rejects suffix-less IDs.
    pub fn decode(encoded: &str) -> Result<Self, TokenError> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|_| TokenError::MalformedToken)?;
        let raw = String::from_utf8(raw).map_err(|_| TokenError::MalformedToken)?;

        let (id_part, secret) = raw.split_once(':').ok_or(TokenError::MalformedToken)?;
        if id_part.is_empty() || secret.is_empty() {
            return Err(TokenError::MalformedToken);
        }

        let (id, kind) = match split_key_id(id_part) {
            Ok(split) => split,
            Err(TokenError::InvalidTypeSuffix) => (id_part.to_string(), TokenKind::Web),
            Err(e) => return Err(e),
        };

        Ok(Self::new(id, secret, kind))
    }
}

/// Split a suffixed key ID (`mykey-w`) into its base ID and kind.
///
/// This is the strict inverse of [`Token::id_with_kind`], used by the server
/// before any store lookup.
pub fn split_key_id(id_with_kind: &str) -> Result<(String, TokenKind), TokenError> {
    let (id, suffix) = id_with_kind
        .rsplit_once('-')
        .ok_or(TokenError::InvalidTypeSuffix)?;

    if id.is_empty() {
        return Err(TokenError::InvalidTypeSuffix);
    }

    Ok((id.to_string(), TokenKind::from_suffix(suffix)?))
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_web() {
        let token = Token::new("demo", "s3cret", TokenKind::Web);
        let decoded = Token::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn round_trip_tcp() {
        let token = Token::new("db", "hunter2", TokenKind::Tcp);
        let decoded = Token::decode(&token.encode()).unwrap();
        assert_eq!(decoded.kind, TokenKind::Tcp);
        assert_eq!(decoded.id, "db");
        assert_eq!(decoded.secret, "hunter2");
    }

    #[test]
    fn decode_legacy_token_assumes_web() {
        // base64("test:test") - no kind suffix
        let decoded = Token::decode("dGVzdDp0ZXN0").unwrap();
        assert_eq!(decoded.id, "test");
        assert_eq!(decoded.secret, "test");
        assert_eq!(decoded.kind, TokenKind::Web);
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert_eq!(
            Token::decode("not-base64!!!"),
            Err(TokenError::MalformedToken)
        );
    }

    #[test]
    fn decode_rejects_missing_separator() {
        let encoded = BASE64.encode("no-separator-here");
        assert_eq!(Token::decode(&encoded), Err(TokenError::MalformedToken));
    }

    #[test]
    fn decode_rejects_empty_secret() {
        let encoded = BASE64.encode("key-w:");
        assert_eq!(Token::decode(&encoded), Err(TokenError::MalformedToken));
    }

    #[test]
    fn split_key_id_variants() {
        assert_eq!(
            split_key_id("mykey-w").unwrap(),
            ("mykey".to_string(), TokenKind::Web)
        );
        assert_eq!(
            split_key_id("my-key-t").unwrap(),
            ("my-key".to_string(), TokenKind::Tcp)
        );
        assert_eq!(split_key_id("mykey"), Err(TokenError::InvalidTypeSuffix));
        assert_eq!(split_key_id("mykey-x"), Err(TokenError::InvalidTypeSuffix));
        assert_eq!(split_key_id("-w"), Err(TokenError::InvalidTypeSuffix));
    }

    #[test]
    fn generate_fills_in_random_parts() {
        let token = Token::generate("", TokenKind::Web, Duration::from_secs(3600));
        assert_eq!(token.id.len(), 8);
        assert_eq!(token.secret.len(), 32);

        let named = Token::generate("demo", TokenKind::Tcp, Duration::ZERO);
        assert_eq!(named.id, "demo");
        assert_ne!(named.secret, token.secret);
    }

    #[test]
    fn id_with_kind_suffixes() {
        assert_eq!(Token::new("a", "s", TokenKind::Web).id_with_kind(), "a-w");
        assert_eq!(Token::new("a", "s", TokenKind::Tcp).id_with_kind(), "a-t");
    }
}
