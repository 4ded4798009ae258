//! Centralized configuration for the authentication engine.
//!
//! Configuration is loaded from environment variables and validated up
//! front; embedders can also construct it directly for tests.

use crate::error::AuthError;
use std::env;
use std::time::Duration;

/// JWT signing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwtAlgorithm {
    /// RSA with SHA-256
    RS256,
    /// RSA with SHA-384
    RS384,
    /// RSA with SHA-512
    RS512,
}

impl JwtAlgorithm {
    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self, AuthError> {
        match s.to_uppercase().as_str() {
            "RS256" => Ok(Self::RS256),
            "RS384" => Ok(Self::RS384),
            "RS512" => Ok(Self::RS512),
            _ => Err(AuthError::internal(format!("Invalid JWT algorithm: {s}"))),
        }
    }

    /// Get algorithm name for JWT headers and key rows.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::RS512 => "RS512",
        }
    }

    /// The corresponding `jsonwebtoken` algorithm.
    #[must_use]
    pub const fn jwt_algorithm(&self) -> jsonwebtoken::Algorithm {
        match self {
            Self::RS256 => jsonwebtoken::Algorithm::RS256,
            Self::RS384 => jsonwebtoken::Algorithm::RS384,
            Self::RS512 => jsonwebtoken::Algorithm::RS512,
        }
    }
}

/// Session issuance mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Random opaque tokens; the session row is the only proof.
    Opaque,
    /// JWT access tokens paired with rotating refresh tokens.
    Jwt,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // JWT settings
    /// JWT issuer claim
    pub jwt_issuer: String,
    /// JWT signing algorithm
    pub jwt_algorithm: JwtAlgorithm,
    /// RSA modulus size in bits for generated keys
    pub key_bits: usize,
    /// Access token TTL
    pub access_token_ttl: Duration,
    /// Refresh token TTL
    pub refresh_token_ttl: Duration,

    // Key rotation
    /// Lifetime of a signing key before scheduled rotation
    pub key_rotation_interval: Duration,
    /// Window after rotation during which the old key still verifies
    pub key_grace_period: Duration,

    // Sessions
    /// Token issuance mode
    pub session_mode: SessionMode,
    /// Store device and metadata rows alongside sessions
    pub enhanced_sessions: bool,
    /// Default session TTL when the caller supplies none
    pub session_ttl: Duration,
    /// Rotate refresh tokens on every use
    pub rotation_enabled: bool,

    // Maintenance
    /// How often the built-in cleanup tasks fire
    pub maintenance_interval: Duration,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but invalid.
    pub fn from_env() -> Result<Self, AuthError> {
        dotenvy::dotenv().ok();

        let jwt_issuer = env::var("AUTH_JWT_ISSUER").unwrap_or_else(|_| "auth-engine".to_string());
        let jwt_algorithm = JwtAlgorithm::parse(
            &env::var("AUTH_JWT_ALGORITHM").unwrap_or_else(|_| "RS256".to_string()),
        )?;
        let key_bits = parse_env("AUTH_KEY_BITS", 2048)?;
        let access_token_ttl = Duration::from_secs(parse_env("AUTH_ACCESS_TOKEN_TTL", 900)?);
        let refresh_token_ttl = Duration::from_secs(parse_env("AUTH_REFRESH_TOKEN_TTL", 604_800)?);

        let key_rotation_interval =
            Duration::from_secs(parse_env("AUTH_KEY_ROTATION_DAYS", 90u64)? * 86_400);
        let key_grace_period =
            Duration::from_secs(parse_env("AUTH_KEY_GRACE_DAYS", 7u64)? * 86_400);

        let session_mode = match env::var("AUTH_SESSION_MODE")
            .unwrap_or_else(|_| "jwt".to_string())
            .to_lowercase()
            .as_str()
        {
            "opaque" => SessionMode::Opaque,
            _ => SessionMode::Jwt,
        };
        let enhanced_sessions = parse_env("AUTH_ENHANCED_SESSIONS", true)?;
        let session_ttl = Duration::from_secs(parse_env("AUTH_SESSION_TTL", 86_400)?);
        let rotation_enabled = parse_env("AUTH_REFRESH_ROTATION", true)?;
        let maintenance_interval =
            Duration::from_secs(parse_env("AUTH_MAINTENANCE_INTERVAL", 3600)?);

        Ok(Self {
            jwt_issuer,
            jwt_algorithm,
            key_bits,
            access_token_ttl,
            refresh_token_ttl,
            key_rotation_interval,
            key_grace_period,
            session_mode,
            enhanced_sessions,
            session_ttl,
            rotation_enabled,
            maintenance_interval,
        })
    }

    /// Configuration suitable for tests: short TTLs, small keys.
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            jwt_issuer: "auth-engine-test".to_string(),
            jwt_algorithm: JwtAlgorithm::RS256,
            key_bits: 2048,
            access_token_ttl: Duration::from_secs(900),
            refresh_token_ttl: Duration::from_secs(3600),
            key_rotation_interval: Duration::from_secs(86_400),
            key_grace_period: Duration::from_secs(3600),
            session_mode: SessionMode::Jwt,
            enhanced_sessions: true,
            session_ttl: Duration::from_secs(3600),
            rotation_enabled: true,
            maintenance_interval: Duration::from_secs(3600),
        }
    }
}

/// Parse environment variable with default value.
fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, AuthError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val
            .parse()
            .map_err(|e| AuthError::internal(format!("Invalid {name}: {e}"))),
        Err(_) => Ok(default),
    }
}
