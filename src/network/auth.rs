//! Join Authentication
//!
//! Binds a socket to a user id. The token in `joinMatch` is a JWT issued by
//! the account service; this server only validates it. The `sub` claim is
//! the user id and must appear on the match roster.

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::state::UserId;

/// JWT validation settings.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected `iss`; any issuer when unset.
    pub issuer: Option<String>,
    /// Expected `aud`; audience unchecked when unset.
    pub audience: Option<String>,
    /// RS256 public key (PEM). Takes precedence over the secret.
    pub public_key_pem: Option<String>,
    /// HS256 shared secret.
    pub secret: Option<String>,
    /// Skip expiry checks (tests only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Read `AUTH_ISSUER`, `AUTH_AUDIENCE`, `AUTH_PUBLIC_KEY_PEM`,
    /// `AUTH_SECRET` and `AUTH_SKIP_EXPIRY`.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// A key or secret is present.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims read from the join token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User id.
    pub sub: String,
    /// Expiry (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at (Unix seconds).
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience (string or list).
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No key or secret and insecure joins are off.
    #[error("authentication not configured")]
    NotConfigured,
    /// Malformed token.
    #[error("invalid token format")]
    InvalidFormat,
    /// Signature check failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token expired.
    #[error("token expired")]
    Expired,
    /// Wrong issuer.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Wrong audience.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim missing or empty.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Anything else from the JWT library.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Validate a JWT and return its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let algorithm = if config.public_key_pem.is_some() {
        Algorithm::RS256
    } else {
        Algorithm::HS256
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = std::collections::HashSet::new();
    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }
    if let Some(ref audience) = config.audience {
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }
    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let token_data: TokenData<TokenClaims> = if let Some(ref pem) = config.public_key_pem {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else if let Some(ref secret) = config.secret {
        let key = DecodingKey::from_secret(secret.as_bytes());
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else {
        return Err(AuthError::NotConfigured);
    };

    let claims = token_data.claims;
    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    // exp = 0 means the issuer set no expiry
    if !config.skip_expiry && claims.exp > 0 && Utc::now().timestamp() as u64 > claims.exp {
        return Err(AuthError::Expired);
    }

    Ok(claims)
}

/// Resolve the user id behind a join token.
///
/// With no key configured and `allow_insecure` set, the token itself is the
/// user id (local development only).
pub fn authenticate(token: &str, config: &AuthConfig, allow_insecure: bool) -> Result<UserId, AuthError> {
    if config.is_configured() {
        return validate_token(token, config).map(|claims| claims.sub);
    }
    if !allow_insecure {
        return Err(AuthError::NotConfigured);
    }
    let user_id = token.trim();
    if user_id.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    Ok(user_id.to_string())
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
