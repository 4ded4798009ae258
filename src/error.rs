//! Centralized error handling for the authentication engine.
//!
//! Every failure surfaced by the engine is one of the kinds below. Transport
//! adapters map `status_tag()` to protocol-specific codes; the `sanitized()`
//! view is the only form that may be serialized back to callers.

use serde::Serialize;
use thiserror::Error;

/// Engine error types.
///
/// Kinds mirror the behavior callers need to distinguish: fatal lookup
/// failures, schema violations, authentication and authorization failures,
/// conflicts, and upstream provider errors.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Plugin, step, or resource missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Step input failed schema validation
    #[error("Input validation failed: {0}")]
    InputValidation(String),

    /// Step output failed schema validation
    #[error("Output validation failed: {0}")]
    OutputValidation(String),

    /// Session or token check failed
    #[error("Unauthenticated")]
    Unauthenticated,

    /// Authenticated but lacking a required role or permission
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Duplicate resource or credential re-use
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Too many attempts
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Code or token expired
    #[error("Expired: {0}")]
    Expired(String),

    /// An external provider call failed
    #[error("External service error from {provider}: {detail}")]
    ExternalService {
        /// Provider name
        provider: String,
        /// Upstream status or message when available
        detail: String,
    },

    /// Everything else
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Sanitized error view safe to serialize back to callers.
///
/// Never carries stack detail, key material, or hashes.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SanitizedError {
    /// Stable machine-readable kind
    pub kind: &'static str,
    /// Short status tag consumed by transport adapters
    pub status: &'static str,
    /// Human-readable message with internals stripped
    pub message: String,
}

impl AuthError {
    /// Create a not-found error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an input-validation error naming the offending field.
    #[must_use]
    pub fn input_validation(msg: impl Into<String>) -> Self {
        Self::InputValidation(msg.into())
    }

    /// Create an output-validation error naming the offending field.
    #[must_use]
    pub fn output_validation(msg: impl Into<String>) -> Self {
        Self::OutputValidation(msg.into())
    }

    /// Create an unauthorized error.
    #[must_use]
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an expired error.
    #[must_use]
    pub fn expired(msg: impl Into<String>) -> Self {
        Self::Expired(msg.into())
    }

    /// Create an external-service error.
    #[must_use]
    pub fn external(provider: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ExternalService {
            provider: provider.into(),
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable.
    ///
    /// Retryable errors are transient failures that may succeed on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalService { .. } | Self::RateLimited)
    }

    /// Stable machine-readable kind name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InputValidation(_) => "input_validation",
            Self::OutputValidation(_) => "output_validation",
            Self::Unauthenticated => "unauthenticated",
            Self::Unauthorized(_) => "unauthorized",
            Self::Conflict(_) => "conflict",
            Self::RateLimited => "rate_limited",
            Self::Expired(_) => "expired",
            Self::ExternalService { .. } => "external_service",
            Self::Internal(_) => "internal",
        }
    }

    /// Short status tag for transport adapters.
    #[must_use]
    pub const fn status_tag(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "nf",
            Self::InputValidation(_) | Self::OutputValidation(_) => "ip",
            Self::Unauthenticated => "unf",
            Self::Unauthorized(_) => "fb",
            Self::Conflict(_) => "eq",
            Self::RateLimited => "rl",
            Self::Expired(_) => "ev",
            Self::ExternalService { .. } => "es",
            Self::Internal(_) => "ic",
        }
    }

    /// Sanitized view for exposure to callers.
    ///
    /// Internal and external-service details are collapsed to fixed
    /// messages so that upstream errors cannot leak key material.
    #[must_use]
    pub fn sanitized(&self) -> SanitizedError {
        let message = match self {
            Self::NotFound(what) => format!("{what} not found"),
            Self::InputValidation(msg) | Self::OutputValidation(msg) => msg.clone(),
            Self::Unauthenticated => "Authentication required".to_string(),
            Self::Unauthorized(_) => "Insufficient permissions".to_string(),
            Self::Conflict(msg) => msg.clone(),
            Self::RateLimited => "Too many attempts".to_string(),
            Self::Expired(what) => format!("{what} expired"),
            Self::ExternalService { provider, .. } => {
                format!("Upstream service {provider} unavailable")
            }
            Self::Internal(_) => "Internal error".to_string(),
        };
        SanitizedError {
            kind: self.kind(),
            status: self.status_tag(),
            message,
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("Serialization error: {err}"))
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired("Token".to_string()),
            _ => Self::Unauthenticated,
        }
    }
}

/// Convenience result alias used throughout the engine.
pub type AuthResult<T> = Result<T, AuthError>;
