//! JWKS and JWT service.
//!
//! Owns the asymmetric signing keys, signs and verifies JWTs, publishes
//! the public key set, and manages refresh tokens and the token
//! blacklist. Keys rotate on a schedule with a grace period during which
//! the previous key still verifies outstanding tokens.

pub mod clients;
pub mod jwk;
pub mod keys;
pub mod refresh;
pub mod service;

pub use clients::ClientRegistry;
pub use jwk::{Jwk, Jwks};
pub use keys::JwksKeyRow;
pub use refresh::{RefreshTokenRow, TokenPair};
pub use service::JwksService;

/// Table holding signing keys.
pub const KEYS_TABLE: &str = "jwks_key";
/// Table holding the rotation audit trail.
pub const ROTATIONS_TABLE: &str = "jwks_key_rotation";
/// Table holding revoked JWTs.
pub const BLACKLIST_TABLE: &str = "jwt_blacklist";
/// Table holding hashed refresh tokens.
pub const REFRESH_TOKENS_TABLE: &str = "refresh_token";
/// Table holding relying-party clients.
pub const CLIENTS_TABLE: &str = "reauth_client";
