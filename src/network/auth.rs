//! JWT Authentication
//!
//! Issues and validates HS256 credentials. A credential names a username and
//! carries an expiry; the server records the expiry in the token registry
//! but never stores the token itself.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default credential lifetime in hours.
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

/// Credential settings.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// HS256 signing secret. Issuance and validation fail without it.
    pub secret: Option<String>,
    /// Issuer claim stamped on, and then required of, every credential.
    pub issuer: Option<String>,
    /// Lifetime of issued credentials.
    pub token_ttl: ChronoDuration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            issuer: None,
            token_ttl: ChronoDuration::hours(DEFAULT_TOKEN_TTL_HOURS),
        }
    }
}

impl AuthConfig {
    /// Read `ACCESS_TOKEN_SECRET`, `ACCESS_TOKEN_EXPIRY_HOUR` and
    /// `ACCESS_TOKEN_ISSUER`. Missing or unusable values fall back to defaults.
    pub fn from_env() -> Self {
        let ttl_hours = std::env::var("ACCESS_TOKEN_EXPIRY_HOUR")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|h| *h > 0)
            .unwrap_or(DEFAULT_TOKEN_TTL_HOURS);

        Self {
            secret: std::env::var("ACCESS_TOKEN_SECRET").ok().filter(|s| !s.is_empty()),
            issuer: std::env::var("ACCESS_TOKEN_ISSUER").ok().filter(|s| !s.is_empty()),
            token_ttl: ChronoDuration::hours(ttl_hours),
        }
    }

    /// Whether a signing secret is present.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["sub", "exp"]);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }
        validation
    }
}

/// Claims carried by a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Username.
    pub sub: String,
    /// Expiry (Unix seconds).
    pub exp: i64,
    /// Issue time (Unix seconds).
    #[serde(default)]
    pub iat: i64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl TokenClaims {
    /// Expiry as a timestamp.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }
}

/// A freshly issued credential.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Who it was issued to.
    pub username: String,
    /// Signed token string.
    pub token: String,
    /// When it stops being valid.
    pub expires_at: DateTime<Utc>,
}

/// Credential errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No signing secret configured.
    #[error("credential signing is not configured")]
    NotConfigured,
    /// Not a JWT.
    #[error("malformed credential")]
    InvalidFormat,
    /// Signed with a different secret.
    #[error("credential signature mismatch")]
    InvalidSignature,
    /// Past its expiry.
    #[error("credential expired")]
    Expired,
    /// Issued by someone else.
    #[error("credential issuer mismatch")]
    InvalidIssuer,
    /// A required claim is absent or empty.
    #[error("credential is missing claim: {0}")]
    MissingClaim(String),
    /// Signing failed.
    #[error("failed to sign credential: {0}")]
    EncodeError(String),
    /// Any other decoding failure.
    #[error("failed to decode credential: {0}")]
    DecodeError(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
            ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
            ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
            _ => AuthError::DecodeError(err.to_string()),
        }
    }
}

/// Sign a credential for `username`, valid for `config.token_ttl`.
pub fn issue_token(username: &str, config: &AuthConfig) -> Result<IssuedToken, AuthError> {
    let secret = config.secret.as_ref().ok_or(AuthError::NotConfigured)?;
    if username.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }

    let issued_at = Utc::now();
    let expires_at = issued_at + config.token_ttl;
    let claims = TokenClaims {
        sub: username.to_string(),
        exp: expires_at.timestamp(),
        iat: issued_at.timestamp(),
        iss: config.issuer.clone(),
    };

    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::EncodeError(e.to_string()))?;

    Ok(IssuedToken {
        username: claims.sub,
        token,
        expires_at,
    })
}

/// Check signature, expiry and issuer, then return the claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let secret = config.secret.as_ref().ok_or(AuthError::NotConfigured)?;

    let claims = decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &config.validation(),
    )?
    .claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    Ok(claims)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    const SECRET: &str = "katana-auth-test-secret";

    fn config() -> AuthConfig {
        AuthConfig {
            secret: Some(SECRET.into()),
            ..Default::default()
        }
    }

    fn sign(claims: &TokenClaims) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn claims_for(sub: &str, exp: i64) -> TokenClaims {
        TokenClaims {
            sub: sub.into(),
            exp,
            iat: 0,
            iss: None,
        }
    }

    #[test]
    fn test_issue_then_validate() {
        let config = config();
        let issued = issue_token("alice", &config).unwrap();
        assert_eq!(issued.username, "alice");

        let claims = validate_token(&issued.token, &config).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.expires_at(), Some(issued.expires_at.with_nanosecond(0).unwrap()));
    }

    #[test]
    fn test_issued_expiry_uses_ttl() {
        let config = AuthConfig {
            token_ttl: ChronoDuration::hours(2),
            ..config()
        };
        let before = Utc::now();
        let issued = issue_token("alice", &config).unwrap();

        let lifetime = issued.expires_at - before;
        assert!(lifetime >= ChronoDuration::hours(2) - ChronoDuration::seconds(1));
        assert!(lifetime <= ChronoDuration::hours(2) + ChronoDuration::seconds(1));
    }

    #[test]
    fn test_expired_credential() {
        let token = sign(&claims_for("alice", Utc::now().timestamp() - 1));
        assert!(matches!(validate_token(&token, &config()), Err(AuthError::Expired)));
    }

    #[test]
    fn test_foreign_secret() {
        let issued = issue_token("alice", &config()).unwrap();
        let other = AuthConfig {
            secret: Some("some-other-secret".into()),
            ..Default::default()
        };

        assert!(matches!(validate_token(&issued.token, &other), Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_garbage_credential() {
        let result = validate_token("not-a-token", &config());
        assert!(matches!(result, Err(AuthError::InvalidFormat) | Err(AuthError::DecodeError(_))));
    }

    #[test]
    fn test_empty_subject() {
        let token = sign(&claims_for("", Utc::now().timestamp() + 3600));
        assert!(matches!(validate_token(&token, &config()), Err(AuthError::MissingClaim(_))));
        assert!(matches!(issue_token("", &config()), Err(AuthError::MissingClaim(_))));
    }

    #[test]
    fn test_issuer_must_match() {
        let issuing = AuthConfig {
            issuer: Some("katana".into()),
            ..config()
        };
        let issued = issue_token("alice", &issuing).unwrap();
        assert!(validate_token(&issued.token, &issuing).is_ok());

        let expecting_other = AuthConfig {
            issuer: Some("elsewhere".into()),
            ..config()
        };
        let result = validate_token(&issued.token, &expecting_other);
        assert!(matches!(result, Err(AuthError::InvalidIssuer)));
    }

    #[test]
    fn test_without_secret() {
        let config = AuthConfig::default();
        assert!(!config.is_configured());
        assert!(matches!(issue_token("alice", &config), Err(AuthError::NotConfigured)));
        assert!(matches!(validate_token("a.b.c", &config), Err(AuthError::NotConfigured)));
    }
}
