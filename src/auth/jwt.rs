//! JWT Token Handler
//! Mission: Generate and validate signed identity tokens

use crate::auth::models::TokenClaims;
use crate::config::TokenConfig;
use anyhow::Context;
use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
    #[error("token is not valid yet")]
    NotYetValid,
    #[error("token is malformed: {0}")]
    Malformed(String),
    #[error("failed to sign token")]
    Signing(#[source] anyhow::Error),
}

/// Issues and validates HS256 tokens bound to one issuer and audience.
pub struct TokenAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    config: TokenConfig,
}

impl TokenAuthenticator {
    pub fn new(config: TokenConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        validation.set_required_spec_claims(&["sub", "iat", "nbf", "exp", "iss", "aud"]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = config.leeway.as_secs();

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            config,
        }
    }

    /// Claims for `user_id`, valid from now for the configured lifetime.
    pub fn claims_for(&self, user_id: i64) -> TokenClaims {
        let now = Utc::now().timestamp();
        TokenClaims {
            sub: user_id.to_string(),
            iat: now,
            nbf: now,
            exp: now + self.config.ttl.as_secs() as i64,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
        }
    }

    pub fn issue_for(&self, user_id: i64) -> Result<String, TokenError> {
        self.generate_token(&self.claims_for(user_id))
    }

    pub fn generate_token(&self, claims: &TokenClaims) -> Result<String, TokenError> {
        debug!(sub = %claims.sub, exp = claims.exp, "Generating token");

        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .context("Failed to generate JWT")
            .map_err(TokenError::Signing)
    }

    pub fn validate_token(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
            return Err(TokenError::Malformed(
                "expected three dot-separated segments".to_string(),
            ));
        }

        let decoded = decode::<RawClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| classify(e.into_kind()))?;
        let claims = decoded.claims.into_claims()?;

        if claims.user_id().is_none() {
            return Err(TokenError::Malformed("subject is not a user id".to_string()));
        }

        debug!(sub = %claims.sub, "Validated token");
        Ok(claims)
    }
}

/// Claims as they arrive on the wire.
///
/// Every field is optional so that a verified token missing a claim reaches the
/// required-claims check instead of failing deserialization.
#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: Option<String>,
    iat: Option<i64>,
    nbf: Option<i64>,
    exp: Option<i64>,
    iss: Option<String>,
    aud: Option<String>,
}

impl RawClaims {
    fn into_claims(self) -> Result<TokenClaims, TokenError> {
        Ok(TokenClaims {
            sub: required(self.sub, "sub")?,
            iat: required(self.iat, "iat")?,
            nbf: required(self.nbf, "nbf")?,
            exp: required(self.exp, "exp")?,
            iss: required(self.iss, "iss")?,
            aud: required(self.aud, "aud")?,
        })
    }
}

fn required<T>(value: Option<T>, claim: &str) -> Result<T, TokenError> {
    value.ok_or_else(|| TokenError::Malformed(format!("missing required claim '{claim}'")))
}

/// Map library errors onto the gate taxonomy.
///
/// Once a token has the right shape, anything that keeps it from being authenticated
/// (bad signature, undecodable segment, wrong issuer or audience) is a signature failure.
fn classify(kind: ErrorKind) -> TokenError {
    match kind {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::ImmatureSignature => TokenError::NotYetValid,
        ErrorKind::MissingRequiredClaim(claim) => {
            TokenError::Malformed(format!("missing required claim '{claim}'"))
        }
        ErrorKind::InvalidToken => TokenError::Malformed("invalid token structure".to_string()),
        _ => TokenError::InvalidSignature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(secret: &str) -> TokenConfig {
        TokenConfig {
            secret: secret.to_string(),
            ttl: Duration::from_secs(3600),
            issuer: "gatehouse".to_string(),
            audience: "gatehouse".to_string(),
            leeway: Duration::ZERO,
        }
    }

    fn handler() -> TokenAuthenticator {
        TokenAuthenticator::new(test_config("test-secret-key-12345"))
    }

    /// Replace the character at `index` with a different base64url character.
    fn flip_char(token: &str, index: usize) -> String {
        let mut bytes = token.as_bytes().to_vec();
        bytes[index] = if bytes[index] == b'A' { b'B' } else { b'A' };
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_jwt_generation_and_validation() {
        let handler = handler();
        let claims = handler.claims_for(42);

        let token = handler.generate_token(&claims).unwrap();
        assert!(!token.is_empty());

        let validated = handler.validate_token(&token).unwrap();
        assert_eq!(validated.sub, "42");
        assert_eq!(validated.iss, "gatehouse");
        assert_eq!(validated.aud, "gatehouse");
        assert_eq!(validated, claims);
    }

    #[test]
    fn test_expired_token_rejected() {
        let handler = handler();
        let mut claims = handler.claims_for(7);
        claims.iat -= 7200;
        claims.nbf -= 7200;
        claims.exp = Utc::now().timestamp() - 3600;

        let token = handler.generate_token(&claims).unwrap();
        assert!(matches!(
            handler.validate_token(&token),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn test_not_yet_valid_token_rejected() {
        let handler = handler();
        let mut claims = handler.claims_for(7);
        claims.nbf = Utc::now().timestamp() + 600;

        let token = handler.generate_token(&claims).unwrap();
        assert!(matches!(
            handler.validate_token(&token),
            Err(TokenError::NotYetValid)
        ));
    }

    #[test]
    fn test_every_flipped_byte_is_a_signature_failure() {
        let handler = handler();
        let token = handler.issue_for(42).unwrap();

        for (index, byte) in token.bytes().enumerate() {
            let tampered = flip_char(&token, index);
            assert_ne!(tampered, token);

            // Overwriting a separator changes the token's shape, not its content.
            if byte == b'.' {
                assert!(
                    matches!(handler.validate_token(&tampered), Err(TokenError::Malformed(_))),
                    "separator flip at {index} should be malformed"
                );
                continue;
            }

            assert!(
                matches!(
                    handler.validate_token(&tampered),
                    Err(TokenError::InvalidSignature)
                ),
                "flip at {index} was not rejected as a signature failure"
            );
        }
    }

    #[test]
    fn test_signed_token_missing_claim_is_malformed() {
        let handler = handler();
        let now = Utc::now().timestamp();
        let without_nbf = serde_json::json!({
            "sub": "42",
            "iat": now,
            "exp": now + 3600,
            "iss": "gatehouse",
            "aud": "gatehouse",
        });

        let token = encode(
            &Header::new(Algorithm::HS256),
            &without_nbf,
            &EncodingKey::from_secret(b"test-secret-key-12345"),
        )
        .unwrap();

        match handler.validate_token(&token) {
            Err(TokenError::Malformed(reason)) => assert!(reason.contains("nbf"), "{reason}"),
            other => panic!("expected malformed token, got {other:?}"),
        }
    }

    #[test]
    fn test_different_secrets_reject() {
        let handler1 = TokenAuthenticator::new(test_config("secret1"));
        let handler2 = TokenAuthenticator::new(test_config("secret2"));

        let token = handler1.issue_for(1).unwrap();
        assert!(matches!(
            handler2.validate_token(&token),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn test_foreign_audience_rejected() {
        let handler = handler();
        let mut claims = handler.claims_for(1);
        claims.aud = "someone-else".to_string();

        let token = handler.generate_token(&claims).unwrap();
        assert!(matches!(
            handler.validate_token(&token),
            Err(TokenError::InvalidSignature)
        ));

        let mut claims = handler.claims_for(1);
        claims.iss = "someone-else".to_string();
        let token = handler.generate_token(&claims).unwrap();
        assert!(matches!(
            handler.validate_token(&token),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn test_malformed_token_rejected() {
        let handler = handler();

        for token in ["", "abc", "a.b", "a..c", "a.b.c.d"] {
            assert!(
                matches!(handler.validate_token(token), Err(TokenError::Malformed(_))),
                "{token:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_non_numeric_subject_rejected() {
        let handler = handler();
        let mut claims = handler.claims_for(1);
        claims.sub = "alice".to_string();

        let token = handler.generate_token(&claims).unwrap();
        assert!(matches!(
            handler.validate_token(&token),
            Err(TokenError::Malformed(_))
        ));
    }
}
