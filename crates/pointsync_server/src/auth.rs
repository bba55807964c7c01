//! Authentication support for the points server.
//!
//! This module stands in for the identity provider: it issues and checks
//! HMAC-SHA256 bearer tokens, and resolves a valid token to the
//! `EntityKey` of the account it was issued for. Tokens include a
//! timestamp for expiration checking.
//!
//! ## Token Format
//!
//! Tokens are composed of:
//! - 2 bytes: key length `n` (big-endian)
//! - `n` bytes: entity key (UTF-8)
//! - 8 bytes: issue time (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature over everything before it

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use pointsync_protocol::{EntityKey, Timestamp};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_LEN: usize = 32;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60), // 24 hours
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Token issuer and validator.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Issues a token for `key`, stamped with the current time.
    pub fn create_token(&self, key: &EntityKey) -> ServerResult<Vec<u8>> {
        self.create_token_at(key, Timestamp::now())
    }

    /// Issues a token for `key` as if at `issued_at`.
    pub fn create_token_at(&self, key: &EntityKey, issued_at: Timestamp) -> ServerResult<Vec<u8>> {
        if key.is_empty() {
            return Err(ServerError::InvalidRequest("empty entity key".into()));
        }
        let key_bytes = key.as_str().as_bytes();
        let key_len = u16::try_from(key_bytes.len())
            .map_err(|_| ServerError::InvalidRequest("entity key too long".into()))?;

        let mut token = Vec::with_capacity(2 + key_bytes.len() + 8 + SIGNATURE_LEN);
        token.extend_from_slice(&key_len.to_be_bytes());
        token.extend_from_slice(key_bytes);
        token.extend_from_slice(&issued_at.as_millis().to_be_bytes());

        let signature = self.mac(&token)?.finalize().into_bytes();
        token.extend_from_slice(&signature);
        Ok(token)
    }

    /// Validates a token and returns the key it was issued for.
    pub fn validate_token(&self, token: &[u8]) -> ServerResult<EntityKey> {
        if token.len() < 2 + 1 + 8 + SIGNATURE_LEN {
            return Err(ServerError::NotAuthorized("Invalid token length".into()));
        }

        let key_len = u16::from_be_bytes([token[0], token[1]]) as usize;
        if token.len() != 2 + key_len + 8 + SIGNATURE_LEN {
            return Err(ServerError::NotAuthorized("Invalid token length".into()));
        }
        let (signed, signature) = token.split_at(token.len() - SIGNATURE_LEN);

        // Verify signature (constant time)
        self.mac(signed)?
            .verify_slice(signature)
            .map_err(|_| ServerError::NotAuthorized("Invalid signature".into()))?;

        let key = std::str::from_utf8(&signed[2..2 + key_len])
            .map_err(|_| ServerError::NotAuthorized("Malformed entity key".into()))?;

        let mut issued = [0u8; 8];
        issued.copy_from_slice(&signed[2 + key_len..]);
        let issued_at = u64::from_be_bytes(issued);

        // Check expiration
        let now = Timestamp::now().as_millis();
        let expiry_millis = self.config.token_expiry.as_millis() as u64;
        if now > issued_at.saturating_add(expiry_millis) {
            return Err(ServerError::NotAuthorized("Token expired".into()));
        }

        Ok(EntityKey::from(key))
    }

    /// Checks that `token` is valid and was issued for `key`.
    pub fn authorize(&self, token: &[u8], key: &EntityKey) -> ServerResult<()> {
        let owner = self.validate_token(token)?;
        if owner != *key {
            return Err(ServerError::NotAuthorized(format!(
                "token for {owner} cannot read {key}"
            )));
        }
        Ok(())
    }

    fn mac(&self, data: &[u8]) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("HMAC key rejected: {e}")))?;
        mac.update(data);
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec()))
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let key = EntityKey::from("user-42");

        let token = validator.create_token(&key).unwrap();
        assert_eq!(token.len(), 2 + 7 + 8 + 32);
        assert_eq!(validator.validate_token(&token).unwrap(), key);
        assert!(validator.authorize(&token, &key).is_ok());
    }

    #[test]
    fn reject_wrong_account() {
        let validator = validator();
        let token = validator.create_token(&EntityKey::from("user-1")).unwrap();

        let result = validator.authorize(&token, &EntityKey::from("user-2"));
        assert!(matches!(result, Err(ServerError::NotAuthorized(_))));
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let mut token = validator.create_token(&EntityKey::from("user-1")).unwrap();
        let last = token.len() - 1;
        token[last] ^= 0xFF; // Flip a bit in the signature

        assert!(validator.validate_token(&token).is_err());
    }

    #[test]
    fn reject_rewritten_key() {
        let validator = validator();
        let mut token = validator.create_token(&EntityKey::from("user-1")).unwrap();
        token[2 + 5] = b'2';

        assert!(validator.validate_token(&token).is_err());
    }

    #[test]
    fn reject_other_secret() {
        let token = validator().create_token(&EntityKey::from("user-1")).unwrap();
        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()));

        assert!(other.validate_token(&token).is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator = TokenValidator::new(
            AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec())
                .with_expiry(Duration::from_secs(60)),
        );
        let issued = Timestamp::from_millis(Timestamp::now().as_millis() - 120_000);
        let token = validator
            .create_token_at(&EntityKey::from("user-1"), issued)
            .unwrap();

        let result = validator.validate_token(&token);
        assert!(matches!(result, Err(ServerError::NotAuthorized(m)) if m.contains("expired")));
    }

    #[test]
    fn reject_garbage() {
        let validator = validator();
        assert!(validator.validate_token(b"").is_err());
        assert!(validator.validate_token(&[0u8; 60]).is_err());
        assert!(validator.create_token(&EntityKey::from("")).is_err());
    }
}
