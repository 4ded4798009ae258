//! Session service.
//!
//! Issues, verifies, refreshes, and destroys sessions. Opaque and JWT
//! modes share a single session-row lifecycle keyed by the access token,
//! so logout and listing work the same way in both.

pub mod service;
pub mod token;

pub use service::{SessionOptions, SessionService, SessionView, VerifiedSession};
pub use token::Token;

/// Table holding one row per active access token.
pub const SESSIONS_TABLE: &str = "session";
/// Table holding per-session device info.
pub const SESSION_DEVICES_TABLE: &str = "session_device";
/// Table holding per-session metadata entries.
pub const SESSION_METADATA_TABLE: &str = "session_metadata";
