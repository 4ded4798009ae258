//! Session token wire form.

use serde::{Deserialize, Serialize};

/// A session handle as issued to and presented by clients.
///
/// Serializes transparently: `None` as JSON null, an opaque token as a
/// bare string, a pair as `{"accessToken", "refreshToken"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Token {
    /// No token; the result of a failed verification.
    None,
    /// Unstructured random session handle.
    Opaque(String),
    /// JWT access token with its refresh companion.
    Pair {
        /// JWT access token
        #[serde(rename = "accessToken")]
        access: String,
        /// Refresh token, absent when the client only presents the JWT
        #[serde(rename = "refreshToken", skip_serializing_if = "Option::is_none")]
        refresh: Option<String>,
    },
}

impl Token {
    /// The access-token string used as the session-row key.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Opaque(token) => Some(token),
            Self::Pair { access, .. } => Some(access),
        }
    }

    /// The refresh token, when one is present.
    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        match self {
            Self::Pair {
                refresh: Some(refresh),
                ..
            } => Some(refresh),
            _ => None,
        }
    }

    /// Whether this is a usable token.
    #[must_use]
    pub fn is_some(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::None
    }
}

impl From<&str> for Token {
    fn from(token: &str) -> Self {
        Self::Opaque(token.to_string())
    }
}
