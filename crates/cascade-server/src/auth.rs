//! Bearer token validation for the signaling upgrade.
//!
//! Tokens are signed JWTs carrying at least a `sid` claim plus standard
//! lifetime claims. The only coupling to the rest of the system is that
//! the token's `sid` must match the session id in the request path.

use crate::config::AuthConfig;
use crate::error::AuthError;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sid: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub nbf: Option<i64>,
}

fn decoding_key(config: &AuthConfig) -> Result<(DecodingKey, Algorithm), AuthError> {
    match config.key_type.as_str() {
        "" | "HMAC" | "hmac" => Ok((
            DecodingKey::from_secret(config.key.as_bytes()),
            Algorithm::HS256,
        )),
        other => Err(AuthError::UnsupportedKeyType(other.to_owned())),
    }
}

/// Validates the token's signature and lifetime, then requires its `sid`
/// claim to equal the session id from the request path.
pub fn validate_token(
    config: &AuthConfig,
    token: &str,
    session_id: &str,
) -> Result<SessionClaims, AuthError> {
    if token.is_empty() {
        return Err(AuthError::NoToken);
    }
    let (key, alg) = decoding_key(config)?;
    let validation = Validation::new(alg);
    let data = decode::<SessionClaims>(token, &key, &validation)?;

    if data.claims.sid.is_empty() {
        return Err(AuthError::MissingSid);
    }
    if data.claims.sid != session_id {
        return Err(AuthError::SidMismatch);
    }
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn config() -> AuthConfig {
        AuthConfig {
            enabled: true,
            key: "test-signing-key".to_owned(),
            key_type: String::new(),
        }
    }

    fn token_for(sid: &str, key: &str, exp_offset: i64) -> String {
        let claims = SessionClaims {
            sid: sid.to_owned(),
            exp: chrono::Utc::now().timestamp() + exp_offset,
            iat: Some(chrono::Utc::now().timestamp()),
            nbf: None,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(key.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_matching_sid() {
        let token = token_for("room-1", "test-signing-key", 600);
        let claims = validate_token(&config(), &token, "room-1").unwrap();
        assert_eq!(claims.sid, "room-1");
    }

    #[test]
    fn rejects_sid_mismatch() {
        let token = token_for("room-1", "test-signing-key", 600);
        assert!(matches!(
            validate_token(&config(), &token, "room-2"),
            Err(AuthError::SidMismatch)
        ));
    }

    #[test]
    fn rejects_bad_signature() {
        let token = token_for("room-1", "other-key", 600);
        assert!(matches!(
            validate_token(&config(), &token, "room-1"),
            Err(AuthError::Jwt(_))
        ));
    }

    #[test]
    fn rejects_expired_token() {
        let token = token_for("room-1", "test-signing-key", -600);
        assert!(matches!(
            validate_token(&config(), &token, "room-1"),
            Err(AuthError::Jwt(_))
        ));
    }

    #[test]
    fn rejects_unknown_key_type() {
        let mut cfg = config();
        cfg.key_type = "RSA".to_owned();
        let token = token_for("room-1", "test-signing-key", 600);
        assert!(matches!(
            validate_token(&cfg, &token, "room-1"),
            Err(AuthError::UnsupportedKeyType(_))
        ));
    }
}
