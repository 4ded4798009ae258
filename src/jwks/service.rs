//! Signing key lifecycle, JWT issuance and verification, blacklist.

use crate::config::{EngineConfig, JwtAlgorithm};
use crate::error::{AuthError, AuthResult};
use crate::jwks::jwk::Jwks;
use crate::jwks::keys::{decoding_key, generate_key_material, JwksKeyRow};
use crate::jwks::{BLACKLIST_TABLE, KEYS_TABLE, ROTATIONS_TABLE};
use crate::orm::{from_row, row, to_row, Direction, FindOptions, Orm, Predicate};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, decode_header, encode, EncodingKey, Header, Validation};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// How long cached keys and the published JWKS stay fresh.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Why a rotation happened; recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    /// Interval-driven rotation
    Scheduled,
    /// Operator-requested rotation
    Manual,
    /// Key compromise response
    Compromise,
}

impl RotationReason {
    /// Stable name stored in rotation rows.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::Compromise => "compromise",
        }
    }
}

/// Why a JWT was blacklisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistReason {
    /// Session logout
    Logout,
    /// Explicit revocation
    Revocation,
    /// Security response
    Security,
}

impl BlacklistReason {
    /// Stable name stored in blacklist rows.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::Revocation => "revocation",
            Self::Security => "security",
        }
    }
}

/// A signed access token together with its expiry instant.
#[derive(Debug, Clone)]
pub struct SignedJwt {
    /// Compact JWS
    pub token: String,
    /// The token's `exp` claim as an instant
    pub expires_at: DateTime<Utc>,
}

struct CachedActiveKey {
    key: JwksKeyRow,
    cached_at: DateTime<Utc>,
}

/// JWKS/JWT service.
///
/// Owns signing keys, signs and verifies JWTs, publishes the public key
/// set, and manages the blacklist and refresh tokens.
pub struct JwksService {
    pub(crate) orm: Arc<dyn Orm>,
    pub(crate) config: EngineConfig,
    active_key_cache: RwLock<Option<CachedActiveKey>>,
    jwks_cache: RwLock<Option<(DateTime<Utc>, Jwks)>>,
    kid_cache: RwLock<HashMap<String, JwksKeyRow>>,
}

impl JwksService {
    /// Create the service over the given store.
    #[must_use]
    pub fn new(orm: Arc<dyn Orm>, config: EngineConfig) -> Self {
        Self {
            orm,
            config,
            active_key_cache: RwLock::new(None),
            jwks_cache: RwLock::new(None),
            kid_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Generate and persist a new active signing key.
    ///
    /// The key signs until `now + rotation_interval`, then rotates.
    pub async fn generate_key_pair(
        &self,
        algorithm: Option<JwtAlgorithm>,
    ) -> AuthResult<JwksKeyRow> {
        let algorithm = algorithm.unwrap_or(self.config.jwt_algorithm);
        let material = generate_key_material(algorithm, self.config.key_bits).await?;
        let now = Utc::now();
        let expires_at = now
            + ChronoDuration::from_std(self.config.key_rotation_interval)
                .unwrap_or_else(|_| ChronoDuration::days(90));

        let key = JwksKeyRow {
            id: uuid::Uuid::new_v4().to_string(),
            key_id: material.key_id,
            algorithm: algorithm.as_str().to_string(),
            public_key: material.public_jwk,
            private_key: material.private_key,
            is_active: true,
            created_at: now,
            expires_at: Some(expires_at),
            last_used_at: None,
            usage_count: 0,
        };

        self.orm.create(KEYS_TABLE, to_row(&key)?).await?;
        self.invalidate_caches().await;

        info!(kid = %key.key_id, algorithm = %key.algorithm, "Generated signing key");
        Ok(key)
    }

    /// The key currently used for signing.
    ///
    /// Served from cache for five minutes; when no active unexpired key
    /// exists, a scheduled rotation creates one.
    pub async fn get_active_key(&self) -> AuthResult<JwksKeyRow> {
        {
            let cache = self.active_key_cache.read().await;
            if let Some(ref cached) = *cache {
                let age = (Utc::now() - cached.cached_at).to_std().unwrap_or_default();
                if age < CACHE_TTL {
                    return Ok(cached.key.clone());
                }
            }
        }

        let key = match self.load_primary_key().await? {
            Some(key) => key,
            None => self.rotate_keys(RotationReason::Scheduled).await?,
        };

        let mut cache = self.active_key_cache.write().await;
        *cache = Some(CachedActiveKey {
            key: key.clone(),
            cached_at: Utc::now(),
        });
        Ok(key)
    }

    /// Every active key, grace keys included.
    pub async fn get_all_active_keys(&self) -> AuthResult<Vec<JwksKeyRow>> {
        let rows = self
            .orm
            .find_many(
                KEYS_TABLE,
                &Predicate::eq("is_active", true),
                FindOptions::order_by("created_at", Direction::Desc),
            )
            .await?;
        rows.into_iter().map(from_row).collect()
    }

    /// Rotate signing keys.
    ///
    /// Generates a new primary key, records the rotation, and demotes the
    /// previous primary to the grace window (it keeps verifying until
    /// `now + grace_period` but no longer signs).
    pub async fn rotate_keys(&self, reason: RotationReason) -> AuthResult<JwksKeyRow> {
        let old_key = self.load_primary_key().await?;
        let new_key = self.generate_key_pair(None).await?;

        self.orm
            .create(
                ROTATIONS_TABLE,
                row(vec![
                    (
                        "old_key_id",
                        old_key
                            .as_ref()
                            .map_or(Value::Null, |k| json!(k.key_id)),
                    ),
                    ("new_key_id", json!(new_key.key_id)),
                    ("rotation_reason", json!(reason.as_str())),
                    ("rotated_at", json!(Utc::now())),
                ]),
            )
            .await?;

        if let Some(ref old) = old_key {
            let grace_end = Utc::now()
                + ChronoDuration::from_std(self.config.key_grace_period)
                    .unwrap_or_else(|_| ChronoDuration::days(7));
            self.orm
                .update_many(
                    KEYS_TABLE,
                    &Predicate::eq("key_id", old.key_id.clone()),
                    row(vec![("expires_at", json!(grace_end))]),
                )
                .await?;
        }

        self.invalidate_caches().await;

        info!(
            old_kid = old_key.as_ref().map(|k| k.key_id.as_str()).unwrap_or("none"),
            new_kid = %new_key.key_id,
            reason = reason.as_str(),
            "Rotated signing keys"
        );
        Ok(new_key)
    }

    /// Sign a JWT with the active key (or an explicit key by id).
    ///
    /// The payload keeps its fields; `iss`, `iat`, and `exp` are set by
    /// the service. Updates the key's usage bookkeeping.
    pub async fn sign_jwt(
        &self,
        payload: &Map<String, Value>,
        key_id: Option<&str>,
        ttl: Option<Duration>,
    ) -> AuthResult<SignedJwt> {
        let key = match key_id {
            Some(kid) => self
                .load_key_by_kid(kid)
                .await?
                .ok_or_else(|| AuthError::not_found(format!("Signing key {kid}")))?,
            None => self.get_active_key().await?,
        };

        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.config.access_token_ttl);
        let expires_at = now
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(900));

        let mut claims = payload.clone();
        claims.insert("iss".to_string(), json!(self.config.jwt_issuer));
        claims.insert("iat".to_string(), json!(now.timestamp()));
        claims.insert("exp".to_string(), json!(expires_at.timestamp()));

        let algorithm = JwtAlgorithm::parse(&key.algorithm)?;
        let mut header = Header::new(algorithm.jwt_algorithm());
        header.kid = Some(key.key_id.clone());

        let encoding_key = EncodingKey::from_rsa_pem(key.private_pem()?.as_bytes())
            .map_err(|e| AuthError::internal(format!("Private key rejected: {e}")))?;
        let token = encode(&header, &Value::Object(claims), &encoding_key)?;

        // Usage bookkeeping; reads the row directly so cached copies
        // cannot undercount. Best effort, no atomicity assumed.
        if let Ok(Some(found)) = self
            .orm
            .find_first(KEYS_TABLE, &Predicate::eq("key_id", key.key_id.clone()))
            .await
        {
            let usage_count = found
                .get("usage_count")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let _ = self
                .orm
                .update_many(
                    KEYS_TABLE,
                    &Predicate::eq("key_id", key.key_id.clone()),
                    row(vec![
                        ("usage_count", json!(usage_count + 1)),
                        ("last_used_at", json!(now)),
                    ]),
                )
                .await;
        }

        Ok(SignedJwt { token, expires_at })
    }

    /// Verify a JWT and return its payload.
    ///
    /// Fails closed on blacklist hits, missing or unknown `kid`, signature
    /// mismatch, wrong issuer, and expiry.
    pub async fn verify_jwt(&self, token: &str) -> AuthResult<Value> {
        if self.is_token_blacklisted(token).await? {
            return Err(AuthError::Unauthenticated);
        }

        let header = decode_header(token).map_err(|_| AuthError::Unauthenticated)?;
        let kid = header.kid.ok_or(AuthError::Unauthenticated)?;

        let key = self
            .load_key_by_kid(&kid)
            .await?
            .ok_or(AuthError::Unauthenticated)?;

        let algorithm = JwtAlgorithm::parse(&key.algorithm)?;
        let mut validation = Validation::new(algorithm.jwt_algorithm());
        validation.set_issuer(&[&self.config.jwt_issuer]);
        validation.validate_exp = true;
        validation.validate_aud = false;

        let data = decode::<Value>(token, &decoding_key(&key.public_key)?, &validation)?;
        Ok(data.claims)
    }

    /// The published public key set, grace keys included.
    pub async fn get_public_jwks(&self) -> AuthResult<Jwks> {
        {
            let cache = self.jwks_cache.read().await;
            if let Some((cached_at, ref jwks)) = *cache {
                let age = (Utc::now() - cached_at).to_std().unwrap_or_default();
                if age < CACHE_TTL {
                    return Ok(jwks.clone());
                }
            }
        }

        let mut jwks = Jwks::new();
        for key in self.get_all_active_keys().await? {
            jwks.add_key(key.to_jwk()?);
        }

        let mut cache = self.jwks_cache.write().await;
        *cache = Some((Utc::now(), jwks.clone()));
        Ok(jwks)
    }

    /// Blacklist a token. Idempotent by token string.
    pub async fn blacklist_token(&self, token: &str, reason: BlacklistReason) -> AuthResult<()> {
        self.orm
            .upsert(
                BLACKLIST_TABLE,
                &Predicate::eq("token", token),
                row(vec![
                    ("token", json!(token)),
                    ("reason", json!(reason.as_str())),
                    ("blacklisted_at", json!(Utc::now())),
                ]),
                row(vec![("reason", json!(reason.as_str()))]),
            )
            .await?;
        Ok(())
    }

    /// Whether a token has been blacklisted.
    pub async fn is_token_blacklisted(&self, token: &str) -> AuthResult<bool> {
        Ok(self
            .orm
            .find_first(BLACKLIST_TABLE, &Predicate::eq("token", token))
            .await?
            .is_some())
    }

    /// Remove keys whose grace window has ended.
    ///
    /// Demotes active keys past `expires_at`, then deletes demoted rows.
    pub async fn cleanup_expired_keys(&self) -> AuthResult<u64> {
        let now = json!(Utc::now());

        self.orm
            .update_many(
                KEYS_TABLE,
                &Predicate::eq("is_active", true).and(Predicate::lte("expires_at", now.clone())),
                row(vec![("is_active", json!(false))]),
            )
            .await?;

        let removed = self
            .orm
            .delete_many(
                KEYS_TABLE,
                &Predicate::eq("is_active", false).and(Predicate::lte("expires_at", now)),
            )
            .await?;

        if removed > 0 {
            self.invalidate_caches().await;
            info!(removed, "Removed expired signing keys");
        }
        Ok(removed)
    }

    /// Remove blacklist entries older than 24 hours.
    pub async fn cleanup_blacklisted_tokens(&self) -> AuthResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::hours(24);
        let removed = self
            .orm
            .delete_many(
                BLACKLIST_TABLE,
                &Predicate::lt("blacklisted_at", json!(cutoff)),
            )
            .await?;
        if removed > 0 {
            info!(removed, "Removed stale blacklist entries");
        }
        Ok(removed)
    }

    /// Current primary: newest active, unexpired key.
    async fn load_primary_key(&self) -> AuthResult<Option<JwksKeyRow>> {
        let filter = Predicate::eq("is_active", true).and(
            Predicate::is_null("expires_at")
                .or(Predicate::gt("expires_at", json!(Utc::now()))),
        );
        let rows = self
            .orm
            .find_many(
                KEYS_TABLE,
                &filter,
                FindOptions::order_by("created_at", Direction::Desc).with_limit(1),
            )
            .await?;
        rows.into_iter().next().map(from_row).transpose()
    }

    /// Load a key by `kid`, whatever its lifecycle state.
    ///
    /// Grace and demoted keys must keep verifying outstanding tokens, so
    /// no active filter applies here.
    pub(crate) async fn load_key_by_kid(&self, kid: &str) -> AuthResult<Option<JwksKeyRow>> {
        {
            let cache = self.kid_cache.read().await;
            if let Some(key) = cache.get(kid) {
                return Ok(Some(key.clone()));
            }
        }

        let Some(found) = self
            .orm
            .find_first(KEYS_TABLE, &Predicate::eq("key_id", kid))
            .await?
        else {
            warn!(kid = %kid, "Unknown key id requested");
            return Ok(None);
        };
        let key: JwksKeyRow = from_row(found)?;

        let mut cache = self.kid_cache.write().await;
        cache.insert(kid.to_string(), key.clone());
        Ok(Some(key))
    }

    pub(crate) async fn invalidate_caches(&self) {
        *self.active_key_cache.write().await = None;
        *self.jwks_cache.write().await = None;
        self.kid_cache.write().await.clear();
    }
}

/// Scheduler runner for [`JwksService::cleanup_expired_keys`].
pub struct KeyCleanupRunner(pub Arc<JwksService>);

/// Scheduler runner for [`JwksService::cleanup_blacklisted_tokens`].
pub struct BlacklistCleanupRunner(pub Arc<JwksService>);

/// Scheduler runner for [`JwksService::cleanup_expired_refresh_tokens`].
pub struct RefreshTokenCleanupRunner(pub Arc<JwksService>);

macro_rules! cleanup_runner {
    ($runner:ident, $method:ident) => {
        #[async_trait::async_trait]
        impl crate::scheduler::CleanupRunner for $runner {
            async fn run(
                &self,
                _orm: &dyn crate::orm::Orm,
                _plugin_config: &Value,
            ) -> AuthResult<crate::scheduler::CleanupOutcome> {
                match self.0.$method().await {
                    Ok(cleaned) => Ok(crate::scheduler::CleanupOutcome::cleaned(cleaned)),
                    Err(err) => Ok(crate::scheduler::CleanupOutcome {
                        cleaned: 0,
                        errors: vec![err.to_string()],
                    }),
                }
            }
        }
    };
}

cleanup_runner!(KeyCleanupRunner, cleanup_expired_keys);
cleanup_runner!(BlacklistCleanupRunner, cleanup_blacklisted_tokens);
cleanup_runner!(RefreshTokenCleanupRunner, cleanup_expired_refresh_tokens);
