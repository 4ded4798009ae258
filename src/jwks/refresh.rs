//! Refresh token issuance, validation, rotation, and revocation.
//!
//! Raw tokens are random and never persisted; rows hold only the
//! SHA-256 hash, and lookup happens by hash. Rotation is single-use:
//! validating and revoking happen in the same call, so a replayed
//! refresh token is rejected.

use crate::error::{AuthError, AuthResult};
use crate::jwks::service::JwksService;
use crate::jwks::REFRESH_TOKENS_TABLE;
use crate::orm::{from_row, row, to_row, Orm, Predicate};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

/// Why a refresh token was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    /// Session logout
    Logout,
    /// Superseded by rotation
    Rotation,
    /// Security response
    Security,
    /// Administrative expiry
    Expired,
}

impl RevocationReason {
    /// Stable name stored in refresh-token rows.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::Rotation => "rotation",
            Self::Security => "security",
            Self::Expired => "expired",
        }
    }
}

/// A refresh-token row from the `refresh_token` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRow {
    /// Row id
    pub id: String,
    /// Public token identifier
    pub token_id: String,
    /// Subject type the token authenticates
    pub subject_type: String,
    /// Subject id the token authenticates
    pub subject_id: String,
    /// SHA-256 of the raw token, base64url
    pub token_hash: String,
    /// Expiry instant
    pub expires_at: DateTime<Utc>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Last successful use
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Whether the token has been revoked
    pub is_revoked: bool,
    /// Revocation instant
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Revocation reason
    #[serde(default)]
    pub revocation_reason: Option<String>,
    /// Device fingerprint captured at issuance
    #[serde(default)]
    pub device_fingerprint: Option<String>,
    /// IP address captured at issuance
    #[serde(default)]
    pub ip_address: Option<String>,
    /// User agent captured at issuance
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// An access/refresh token pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPair {
    /// JWT access token
    pub access_token: String,
    /// Raw refresh token
    pub refresh_token: String,
    /// Access token expiry
    pub expires_at: DateTime<Utc>,
}

/// SHA-256 of a raw refresh token, base64url.
#[must_use]
pub(crate) fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate raw refresh-token material: 32 random bytes, base64url.
#[must_use]
fn generate_token_material() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

impl JwksService {
    /// Issue a refresh token for a subject.
    ///
    /// Returns the raw token; only its hash is stored.
    pub async fn generate_refresh_token(
        &self,
        subject_type: &str,
        subject_id: &str,
        device_info: Option<&Value>,
    ) -> AuthResult<String> {
        let token = generate_token_material();
        let now = Utc::now();
        let expires_at = now
            + ChronoDuration::from_std(self.config.refresh_token_ttl)
                .unwrap_or_else(|_| ChronoDuration::days(7));

        let pick = |field: &str| -> Option<String> {
            device_info
                .and_then(|d| d.get(field))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let record = RefreshTokenRow {
            id: Uuid::new_v4().to_string(),
            token_id: Uuid::new_v4().to_string(),
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            token_hash: hash_refresh_token(&token),
            expires_at,
            created_at: now,
            last_used_at: None,
            is_revoked: false,
            revoked_at: None,
            revocation_reason: None,
            device_fingerprint: pick("fingerprint"),
            ip_address: pick("ip_address"),
            user_agent: pick("user_agent"),
        };
        self.orm
            .create(REFRESH_TOKENS_TABLE, to_row(&record)?)
            .await?;

        Ok(token)
    }

    /// Validate a raw refresh token against its stored row.
    ///
    /// # Errors
    ///
    /// [`AuthError::Unauthenticated`] for unknown or revoked tokens,
    /// [`AuthError::Expired`] past `expires_at`.
    pub async fn validate_refresh_token(&self, token: &str) -> AuthResult<RefreshTokenRow> {
        let hash = hash_refresh_token(token);
        let Some(found) = self
            .orm
            .find_first(REFRESH_TOKENS_TABLE, &Predicate::eq("token_hash", hash))
            .await?
        else {
            return Err(AuthError::Unauthenticated);
        };
        let record: RefreshTokenRow = from_row(found)?;

        if record.is_revoked {
            warn!(
                token_id = %record.token_id,
                subject_id = %record.subject_id,
                "Revoked refresh token presented"
            );
            return Err(AuthError::Unauthenticated);
        }
        if record.expires_at <= Utc::now() {
            return Err(AuthError::expired("Refresh token"));
        }
        Ok(record)
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// When rotation is enabled the presented refresh token is revoked
    /// and a replacement issued, so each refresh token works once.
    pub async fn refresh_access_token(&self, token: &str) -> AuthResult<TokenPair> {
        let record = self.validate_refresh_token(token).await?;
        let now = Utc::now();

        self.orm
            .update_many(
                REFRESH_TOKENS_TABLE,
                &Predicate::eq("token_id", record.token_id.clone()),
                row(vec![("last_used_at", json!(now))]),
            )
            .await?;

        let mut payload = Map::new();
        payload.insert("sub".to_string(), json!(record.subject_id));
        payload.insert("subject_type".to_string(), json!(record.subject_type));
        let signed = self.sign_jwt(&payload, None, None).await?;

        let refresh_token = if self.config.rotation_enabled {
            self.revoke_refresh_token(token, RevocationReason::Rotation)
                .await?;
            let device = json!({
                "fingerprint": record.device_fingerprint,
                "ip_address": record.ip_address,
                "user_agent": record.user_agent,
            });
            let next = self
                .generate_refresh_token(&record.subject_type, &record.subject_id, Some(&device))
                .await?;
            info!(
                subject_id = %record.subject_id,
                old_token_id = %record.token_id,
                "Rotated refresh token"
            );
            next
        } else {
            token.to_string()
        };

        Ok(TokenPair {
            access_token: signed.token,
            refresh_token,
            expires_at: signed.expires_at,
        })
    }

    /// Revoke a refresh token by raw value. Idempotent.
    pub async fn revoke_refresh_token(
        &self,
        token: &str,
        reason: RevocationReason,
    ) -> AuthResult<()> {
        let hash = hash_refresh_token(token);
        self.orm
            .update_many(
                REFRESH_TOKENS_TABLE,
                &Predicate::eq("token_hash", hash).and(Predicate::eq("is_revoked", false)),
                row(vec![
                    ("is_revoked", json!(true)),
                    ("revoked_at", json!(Utc::now())),
                    ("revocation_reason", json!(reason.as_str())),
                ]),
            )
            .await?;
        Ok(())
    }

    /// Revoke every live refresh token for a subject; returns the count.
    pub async fn revoke_all_refresh_tokens(
        &self,
        subject_type: &str,
        subject_id: &str,
        reason: RevocationReason,
    ) -> AuthResult<u64> {
        let count = self
            .orm
            .update_many(
                REFRESH_TOKENS_TABLE,
                &Predicate::eq("subject_type", subject_type)
                    .and(Predicate::eq("subject_id", subject_id))
                    .and(Predicate::eq("is_revoked", false)),
                row(vec![
                    ("is_revoked", json!(true)),
                    ("revoked_at", json!(Utc::now())),
                    ("revocation_reason", json!(reason.as_str())),
                ]),
            )
            .await?;
        if count > 0 {
            info!(subject_id, count, "Revoked all refresh tokens for subject");
        }
        Ok(count)
    }

    /// Remove refresh-token rows past their expiry.
    pub async fn cleanup_expired_refresh_tokens(&self) -> AuthResult<u64> {
        let removed = self
            .orm
            .delete_many(
                REFRESH_TOKENS_TABLE,
                &Predicate::lte("expires_at", json!(Utc::now())),
            )
            .await?;
        if removed > 0 {
            info!(removed, "Removed expired refresh tokens");
        }
        Ok(removed)
    }
}
