//! Token command implementation.

use pointsync_protocol::EntityKey;
use pointsync_server::{AuthConfig, ServerError, TokenValidator};
use std::time::Duration;
use thiserror::Error;

/// Errors from the token commands.
#[derive(Error, Debug)]
pub enum TokenError {
    /// The token is not valid hex.
    #[error("token is not hex: {0}")]
    Encoding(#[from] hex::FromHexError),

    /// The token was refused, or could not be issued.
    #[error(transparent)]
    Auth(#[from] ServerError),
}

/// Issues a hex-encoded token for `key`.
pub fn issue(secret: &str, key: &str) -> Result<String, TokenError> {
    let validator = TokenValidator::new(AuthConfig::new(secret.as_bytes().to_vec()));
    let token = validator.create_token(&EntityKey::from(key))?;
    Ok(hex::encode(token))
}

/// Verifies a hex-encoded token and returns the account it grants.
pub fn verify(secret: &str, token: &str, expiry: Duration) -> Result<EntityKey, TokenError> {
    let validator =
        TokenValidator::new(AuthConfig::new(secret.as_bytes().to_vec()).with_expiry(expiry));
    let bytes = hex::decode(token.trim())?;
    Ok(validator.validate_token(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    #[test]
    fn issued_token_verifies() {
        let token = issue("s3cret", "alice").unwrap();
        assert_eq!(verify("s3cret", &token, DAY).unwrap(), EntityKey::from("alice"));
    }

    #[test]
    fn wrong_secret_is_refused() {
        let token = issue("s3cret", "alice").unwrap();
        assert!(matches!(
            verify("other", &token, DAY),
            Err(TokenError::Auth(ServerError::NotAuthorized(_)))
        ));
    }

    #[test]
    fn non_hex_is_refused() {
        assert!(matches!(
            verify("s3cret", "not-hex", DAY),
            Err(TokenError::Encoding(_))
        ));
    }
}
