//! JWT (JSON Web Token) handling
//!
//! Agents and nodes present a bearer token before their WebSocket upgrade; the
//! admin API accepts tokens of kind [`TokenKind::Admin`].

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Who a token was issued to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Agent,
    Node,
    Admin,
}

/// JWT claims for control-plane authentication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetClaims {
    /// Subject (agent id, node id or admin name)
    pub sub: String,
    pub kind: TokenKind,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
}

impl FleetClaims {
    pub fn new(subject: String, kind: TokenKind, issuer: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: subject,
            kind,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }

    /// Check the token may be used by `subject` acting as `kind`
    pub fn authorize(&self, kind: TokenKind, subject: &str) -> Result<(), JwtError> {
        if self.kind != kind {
            return Err(JwtError::WrongKind {
                expected: kind,
                actual: self.kind,
            });
        }
        if self.sub != subject {
            return Err(JwtError::SubjectMismatch(subject.to_string()));
        }
        Ok(())
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token issued for {actual:?}, expected {expected:?}")]
    WrongKind {
        expected: TokenKind,
        actual: TokenKind,
    },

    #[error("Token subject does not match {0}")]
    SubjectMismatch(String),
}

/// JWT validator
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a new JWT validator using HMAC-SHA256 (symmetric secret)
    ///
    /// Validates the signature and expiration. Issuer validation is only enabled
    /// when [`JwtValidator::with_issuer`] is called.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<FleetClaims, JwtError> {
        let token_data = decode::<FleetClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::TokenExpired,
                jsonwebtoken::errors::ErrorKind::InvalidToken
                | jsonwebtoken::errors::ErrorKind::InvalidSignature => JwtError::InvalidToken,
                _ => JwtError::EncodingError(e),
            })?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Encode JWT using HMAC-SHA256 (symmetric secret)
    pub fn encode(secret: &[u8], claims: &FleetClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test_secret_key_1234567890";

    #[test]
    fn test_jwt_encode_decode() {
        let claims = FleetClaims::new(
            "fa_001".to_string(),
            TokenKind::Agent,
            "fleet".to_string(),
            Duration::hours(1),
        );

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let validator = JwtValidator::new(TEST_SECRET).with_issuer("fleet".to_string());
        let decoded = validator.validate(&token).unwrap();

        assert_eq!(decoded, claims);
        assert!(decoded.authorize(TokenKind::Agent, "fa_001").is_ok());
    }

    #[test]
    fn test_expired_token() {
        let claims = FleetClaims::new(
            "fa_002".to_string(),
            TokenKind::Agent,
            "fleet".to_string(),
            Duration::seconds(-120),
        );

        assert!(claims.is_expired());

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();
        let result = JwtValidator::new(TEST_SECRET).validate(&token);

        assert!(matches!(result, Err(JwtError::TokenExpired)));
    }

    #[test]
    fn test_wrong_secret() {
        let claims = FleetClaims::new(
            "fa_003".to_string(),
            TokenKind::Agent,
            "fleet".to_string(),
            Duration::hours(1),
        );
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let result = JwtValidator::new(b"another-secret").validate(&token);
        assert!(matches!(result, Err(JwtError::InvalidToken)));
    }

    #[test]
    fn test_wrong_issuer() {
        let claims = FleetClaims::new(
            "fa_004".to_string(),
            TokenKind::Agent,
            "someone-else".to_string(),
            Duration::hours(1),
        );
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let validator = JwtValidator::new(TEST_SECRET).with_issuer("fleet".to_string());
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_authorize_kind_and_subject() {
        let claims = FleetClaims::new(
            "node-7".to_string(),
            TokenKind::Node,
            "fleet".to_string(),
            Duration::hours(1),
        );

        assert!(claims.authorize(TokenKind::Node, "node-7").is_ok());
        assert!(matches!(
            claims.authorize(TokenKind::Agent, "node-7"),
            Err(JwtError::WrongKind { .. })
        ));
        assert!(matches!(
            claims.authorize(TokenKind::Node, "node-8"),
            Err(JwtError::SubjectMismatch(_))
        ));
    }
}
