//! Session issuance, verification, refresh, and teardown.

use crate::config::{EngineConfig, SessionMode};
use crate::error::{AuthError, AuthResult};
use crate::jwks::refresh::RevocationReason;
use crate::jwks::service::BlacklistReason;
use crate::jwks::JwksService;
use crate::orm::{from_row, row, Orm, Predicate};
use crate::session::token::Token;
use crate::session::{SESSIONS_TABLE, SESSION_DEVICES_TABLE, SESSION_METADATA_TABLE};
use crate::subject::SubjectResolvers;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Minimum accepted session TTL.
const MIN_TTL: Duration = Duration::from_secs(30);

/// Sessions expiring within this window are rotated pre-emptively.
const REFRESH_WINDOW_SECS: i64 = 60;

/// A session row from the `session` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    /// Row id
    pub id: String,
    /// Subject type of the principal
    pub subject_type: String,
    /// Subject id of the principal
    pub subject_id: String,
    /// The access token; unique per row
    pub token: String,
    /// Expiry instant, absent for non-expiring sessions
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

/// Options for [`SessionService::create_session_with_metadata`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Session TTL; must be at least 30 seconds when given
    pub ttl: Option<Duration>,
    /// Device info stored with the session and embedded in JWT payloads
    pub device_info: Option<Value>,
    /// Metadata entries stored one row each
    pub metadata: Map<String, Value>,
}

/// The result of a verification. Failed verifications carry
/// `subject: None` and `token: Token::None`.
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    /// The sanitized subject, when resolvable
    pub subject: Option<Value>,
    /// The (possibly rotated) token the caller should keep using
    pub token: Token,
    /// `"jwt"` or `"opaque"`, absent on failure
    pub token_type: Option<&'static str>,
    /// Verified JWT claims, JWT mode only
    pub payload: Option<Value>,
}

impl VerifiedSession {
    fn invalid() -> Self {
        Self {
            subject: None,
            token: Token::None,
            token_type: None,
            payload: None,
        }
    }

    /// Whether verification succeeded.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.token.is_some()
    }
}

/// An active session with its enhanced-mode attachments.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    /// The session row
    pub session: SessionRow,
    /// Device info, when a device row exists
    pub device_info: Option<Value>,
    /// Metadata entries keyed by name
    pub metadata: Map<String, Value>,
}

/// Loads optional per-subject data into JWT payloads.
#[async_trait]
pub trait UserDataLoader: Send + Sync {
    /// Load data for the subject, or `None` to omit the claim.
    async fn load(&self, subject_id: &str, orm: &dyn Orm) -> AuthResult<Option<Value>>;
}

/// Compares stored device info against the presenting device.
pub type DeviceValidator = Arc<dyn Fn(&Value, Option<&Value>) -> bool + Send + Sync>;

/// Produces opaque session tokens.
pub type OpaqueTokenFactory = Arc<dyn Fn() -> String + Send + Sync>;

fn default_token_factory() -> OpaqueTokenFactory {
    Arc::new(|| {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        URL_SAFE_NO_PAD.encode(bytes)
    })
}

enum Resolution {
    NoResolver,
    Found(Value),
    Gone,
}

/// Session service.
pub struct SessionService {
    orm: Arc<dyn Orm>,
    config: EngineConfig,
    jwks: Option<Arc<JwksService>>,
    resolvers: Arc<SubjectResolvers>,
    token_factory: OpaqueTokenFactory,
    device_validator: Option<DeviceValidator>,
    user_data_loader: Option<Arc<dyn UserDataLoader>>,
}

impl SessionService {
    /// Create the service. JWT mode requires a JWKS service.
    #[must_use]
    pub fn new(
        orm: Arc<dyn Orm>,
        config: EngineConfig,
        jwks: Option<Arc<JwksService>>,
        resolvers: Arc<SubjectResolvers>,
    ) -> Self {
        Self {
            orm,
            config,
            jwks,
            resolvers,
            token_factory: default_token_factory(),
            device_validator: None,
            user_data_loader: None,
        }
    }

    /// Replace the opaque token factory.
    #[must_use]
    pub fn with_token_factory(mut self, factory: OpaqueTokenFactory) -> Self {
        self.token_factory = factory;
        self
    }

    /// Install a device validator.
    #[must_use]
    pub fn with_device_validator(mut self, validator: DeviceValidator) -> Self {
        self.device_validator = Some(validator);
        self
    }

    /// Install a user-data loader for JWT payload enrichment.
    #[must_use]
    pub fn with_user_data_loader(mut self, loader: Arc<dyn UserDataLoader>) -> Self {
        self.user_data_loader = Some(loader);
        self
    }

    fn jwt_service(&self) -> Option<&Arc<JwksService>> {
        match self.config.session_mode {
            SessionMode::Jwt => self.jwks.as_ref(),
            SessionMode::Opaque => None,
        }
    }

    /// Create a session with the default options.
    pub async fn create_session(
        &self,
        subject_type: &str,
        subject_id: &str,
        ttl: Option<Duration>,
    ) -> AuthResult<Token> {
        self.create_session_with_metadata(
            subject_type,
            subject_id,
            SessionOptions {
                ttl,
                ..SessionOptions::default()
            },
        )
        .await
    }

    /// Create a session, optionally with device info and metadata rows.
    pub async fn create_session_with_metadata(
        &self,
        subject_type: &str,
        subject_id: &str,
        options: SessionOptions,
    ) -> AuthResult<Token> {
        if let Some(ttl) = options.ttl {
            if ttl < MIN_TTL {
                return Err(AuthError::input_validation(
                    "ttl must be at least 30 seconds",
                ));
            }
        }

        let now = Utc::now();
        let (token, token_string, expires_at) = match self.jwt_service() {
            Some(jwks) => {
                let mut payload = Map::new();
                payload.insert("sub".to_string(), json!(subject_id));
                payload.insert("subject_type".to_string(), json!(subject_type));
                if let Some(loader) = &self.user_data_loader {
                    if let Some(data) = loader.load(subject_id, self.orm.as_ref()).await? {
                        payload.insert("userData".to_string(), data);
                    }
                }
                if let Some(device) = &options.device_info {
                    payload.insert("deviceInfo".to_string(), device.clone());
                }

                let signed = jwks.sign_jwt(&payload, None, options.ttl).await?;
                let refresh = jwks
                    .generate_refresh_token(subject_type, subject_id, options.device_info.as_ref())
                    .await?;

                let expires_at = signed.expires_at;
                let access = signed.token;
                (
                    Token::Pair {
                        access: access.clone(),
                        refresh: Some(refresh),
                    },
                    access,
                    expires_at,
                )
            }
            None => {
                let token = (self.token_factory)();
                let ttl = options.ttl.unwrap_or(self.config.session_ttl);
                let expires_at = now
                    + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(1));
                (Token::Opaque(token.clone()), token, expires_at)
            }
        };

        let session = self
            .orm
            .create(
                SESSIONS_TABLE,
                row(vec![
                    ("subject_type", json!(subject_type)),
                    ("subject_id", json!(subject_id)),
                    ("token", json!(token_string)),
                    ("expires_at", json!(expires_at)),
                    ("created_at", json!(now)),
                ]),
            )
            .await?;
        let session_id = session
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if self.config.enhanced_sessions {
            self.attach_session_rows(&session_id, &options, now).await?;
        }

        debug!(subject_type, subject_id, "Created session");
        Ok(token)
    }

    async fn attach_session_rows(
        &self,
        session_id: &str,
        options: &SessionOptions,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        if let Some(device) = &options.device_info {
            self.orm
                .create(
                    SESSION_DEVICES_TABLE,
                    row(vec![
                        ("session_id", json!(session_id)),
                        ("device_info", json!(device.to_string())),
                        ("created_at", json!(now)),
                        ("updated_at", json!(now)),
                    ]),
                )
                .await?;
        }
        for (key, value) in &options.metadata {
            self.orm
                .create(
                    SESSION_METADATA_TABLE,
                    row(vec![
                        ("session_id", json!(session_id)),
                        ("key", json!(key)),
                        ("value", json!(value)),
                    ]),
                )
                .await?;
        }
        Ok(())
    }

    /// Verify a session token.
    ///
    /// Never fails: every failure path returns an invalid result. Expired
    /// sessions with a refresh token are rotated in place; the caller
    /// receives the replacement pair.
    pub async fn verify_session(
        &self,
        token: &Token,
        current_device: Option<&Value>,
    ) -> VerifiedSession {
        match self.verify_session_inner(token, current_device).await {
            Ok(verified) => verified,
            Err(err) => {
                warn!(error = %err, "Session verification failed closed");
                VerifiedSession::invalid()
            }
        }
    }

    async fn verify_session_inner(
        &self,
        token: &Token,
        current_device: Option<&Value>,
    ) -> AuthResult<VerifiedSession> {
        let Some(access) = token.access_token() else {
            return Ok(VerifiedSession::invalid());
        };

        let Some(found) = self
            .orm
            .find_first(SESSIONS_TABLE, &Predicate::eq("token", access))
            .await?
        else {
            return Ok(VerifiedSession::invalid());
        };
        let session: SessionRow = from_row(found)?;

        let now = Utc::now();
        let session_expired = session.expires_at.is_some_and(|exp| exp <= now);
        let needs_refresh = session
            .expires_at
            .is_some_and(|exp| exp <= now + ChronoDuration::seconds(REFRESH_WINDOW_SECS));

        let mut token_type: &'static str = "opaque";
        let mut payload: Option<Value> = None;
        if let Some(jwks) = self.jwt_service() {
            // A failed JWT check falls back to opaque-style verification;
            // the row's existence is the proof.
            if let Ok(claims) = jwks.verify_jwt(access).await {
                token_type = "jwt";
                payload = Some(claims);
            }
        }

        if let Some(validator) = &self.device_validator {
            let stored = match payload.as_ref().and_then(|p| p.get("deviceInfo")) {
                Some(device) => Some(device.clone()),
                None => self.load_device_info(&session.id).await?,
            };
            // No stored device info means nothing to validate against.
            if let Some(stored) = stored {
                if !validator(&stored, current_device) {
                    info!(session_id = %session.id, "Device validation rejected session");
                    return Ok(VerifiedSession::invalid());
                }
            }
        }

        if session_expired || needs_refresh {
            if let (Some(refresh), Some(jwks)) = (token.refresh_token(), self.jwt_service()) {
                return self.rotate_session(&session, refresh, jwks).await;
            }
            if session_expired {
                self.delete_session_row(&session).await?;
                return Ok(VerifiedSession::invalid());
            }
        }

        let verified_token = token.clone();
        match self.resolve_subject(&session.subject_type, &session.subject_id).await? {
            Resolution::Found(subject) => Ok(VerifiedSession {
                subject: Some(subject),
                token: verified_token,
                token_type: Some(token_type),
                payload,
            }),
            Resolution::NoResolver => Ok(VerifiedSession {
                subject: None,
                token: verified_token,
                token_type: Some(token_type),
                payload,
            }),
            Resolution::Gone => Ok(VerifiedSession::invalid()),
        }
    }

    /// Replace an expiring session with a fresh token pair.
    ///
    /// The old row is deleted before the new one is inserted, keeping the
    /// token-uniqueness invariant; device and metadata rows move over.
    async fn rotate_session(
        &self,
        session: &SessionRow,
        refresh: &str,
        jwks: &Arc<JwksService>,
    ) -> AuthResult<VerifiedSession> {
        let pair = match jwks.refresh_access_token(refresh).await {
            Ok(pair) => pair,
            Err(err) => {
                // A losing concurrent refresh or a replayed token: the
                // session is unrecoverable, fail closed.
                debug!(session_id = %session.id, error = %err, "Session refresh failed");
                self.delete_session_row(session).await?;
                jwks.revoke_refresh_token(refresh, RevocationReason::Security)
                    .await?;
                return Ok(VerifiedSession::invalid());
            }
        };

        self.orm
            .delete_many(SESSIONS_TABLE, &Predicate::eq("id", session.id.clone()))
            .await?;
        let new_row = self
            .orm
            .create(
                SESSIONS_TABLE,
                row(vec![
                    ("subject_type", json!(session.subject_type)),
                    ("subject_id", json!(session.subject_id)),
                    ("token", json!(pair.access_token)),
                    ("expires_at", json!(pair.expires_at)),
                    ("created_at", json!(Utc::now())),
                ]),
            )
            .await?;

        if let Some(new_id) = new_row.get("id").and_then(Value::as_str) {
            let transfer = row(vec![("session_id", json!(new_id))]);
            self.orm
                .update_many(
                    SESSION_DEVICES_TABLE,
                    &Predicate::eq("session_id", session.id.clone()),
                    transfer.clone(),
                )
                .await?;
            self.orm
                .update_many(
                    SESSION_METADATA_TABLE,
                    &Predicate::eq("session_id", session.id.clone()),
                    transfer,
                )
                .await?;
        }

        info!(session_id = %session.id, subject_id = %session.subject_id, "Rotated session");

        let payload = jwks.verify_jwt(&pair.access_token).await.ok();
        let token = Token::Pair {
            access: pair.access_token,
            refresh: Some(pair.refresh_token),
        };
        match self.resolve_subject(&session.subject_type, &session.subject_id).await? {
            Resolution::Found(subject) => Ok(VerifiedSession {
                subject: Some(subject),
                token,
                token_type: Some("jwt"),
                payload,
            }),
            Resolution::NoResolver => Ok(VerifiedSession {
                subject: None,
                token,
                token_type: Some("jwt"),
                payload,
            }),
            Resolution::Gone => Ok(VerifiedSession::invalid()),
        }
    }

    /// Destroy a session. Idempotent.
    pub async fn destroy_session(&self, token: &Token) -> AuthResult<()> {
        let Some(access) = token.access_token() else {
            return Ok(());
        };

        if let (Some(refresh), Some(jwks)) = (token.refresh_token(), self.jwt_service()) {
            jwks.blacklist_token(refresh, BlacklistReason::Logout).await?;
            jwks.revoke_refresh_token(refresh, RevocationReason::Logout)
                .await?;
        }

        if let Some(found) = self
            .orm
            .find_first(SESSIONS_TABLE, &Predicate::eq("token", access))
            .await?
        {
            let session: SessionRow = from_row(found)?;
            self.delete_session_row(&session).await?;
            info!(session_id = %session.id, "Destroyed session");
        }
        Ok(())
    }

    /// Destroy every session for a subject; returns the session count.
    pub async fn destroy_all_sessions(
        &self,
        subject_type: &str,
        subject_id: &str,
    ) -> AuthResult<u64> {
        let rows = self
            .orm
            .find_many(
                SESSIONS_TABLE,
                &Predicate::eq("subject_type", subject_type)
                    .and(Predicate::eq("subject_id", subject_id)),
                crate::orm::FindOptions::default(),
            )
            .await?;

        let mut count = 0;
        for found in rows {
            let session: SessionRow = from_row(found)?;
            self.delete_session_row(&session).await?;
            count += 1;
        }

        if let Some(jwks) = self.jwt_service() {
            jwks.revoke_all_refresh_tokens(subject_type, subject_id, RevocationReason::Logout)
                .await?;
        }

        info!(subject_type, subject_id, count, "Destroyed all sessions for subject");
        Ok(count)
    }

    /// Active sessions for a subject, with device and metadata when
    /// enhanced mode is on.
    pub async fn list_sessions_for_subject(
        &self,
        subject_type: &str,
        subject_id: &str,
    ) -> AuthResult<Vec<SessionView>> {
        let active = Predicate::eq("subject_type", subject_type)
            .and(Predicate::eq("subject_id", subject_id))
            .and(
                Predicate::is_null("expires_at")
                    .or(Predicate::gt("expires_at", json!(Utc::now()))),
            );
        let rows = self
            .orm
            .find_many(SESSIONS_TABLE, &active, crate::orm::FindOptions::default())
            .await?;

        let mut views = Vec::with_capacity(rows.len());
        for found in rows {
            let session: SessionRow = from_row(found)?;
            let (device_info, metadata) = if self.config.enhanced_sessions {
                (
                    self.load_device_info(&session.id).await?,
                    self.load_metadata(&session.id).await?,
                )
            } else {
                (None, Map::new())
            };
            views.push(SessionView {
                session,
                device_info,
                metadata,
            });
        }
        Ok(views)
    }

    /// Delete a session row and its attachments. All deletes are
    /// idempotent; attachments go first.
    async fn delete_session_row(&self, session: &SessionRow) -> AuthResult<()> {
        let by_session = Predicate::eq("session_id", session.id.clone());
        self.orm
            .delete_many(SESSION_DEVICES_TABLE, &by_session)
            .await?;
        self.orm
            .delete_many(SESSION_METADATA_TABLE, &by_session)
            .await?;
        self.orm
            .delete_many(SESSIONS_TABLE, &Predicate::eq("id", session.id.clone()))
            .await?;
        Ok(())
    }

    async fn load_device_info(&self, session_id: &str) -> AuthResult<Option<Value>> {
        let Some(device_row) = self
            .orm
            .find_first(
                SESSION_DEVICES_TABLE,
                &Predicate::eq("session_id", session_id),
            )
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(parse_json_column(device_row.get("device_info"))))
    }

    async fn load_metadata(&self, session_id: &str) -> AuthResult<Map<String, Value>> {
        let rows = self
            .orm
            .find_many(
                SESSION_METADATA_TABLE,
                &Predicate::eq("session_id", session_id),
                crate::orm::FindOptions::default(),
            )
            .await?;
        let mut metadata = Map::new();
        for entry in rows {
            if let Some(key) = entry.get("key").and_then(Value::as_str) {
                metadata.insert(
                    key.to_string(),
                    entry.get("value").cloned().unwrap_or(Value::Null),
                );
            }
        }
        Ok(metadata)
    }

    async fn resolve_subject(
        &self,
        subject_type: &str,
        subject_id: &str,
    ) -> AuthResult<Resolution> {
        let Some(resolver) = self.resolvers.get(subject_type) else {
            warn!(subject_type, "No session resolver registered for verified token");
            return Ok(Resolution::NoResolver);
        };
        match resolver.get_by_id(subject_id, self.orm.as_ref()).await? {
            Some(subject) => Ok(Resolution::Found(resolver.sanitize(subject))),
            None => Ok(Resolution::Gone),
        }
    }
}

/// Parse a JSON column that may be a string, already-parsed JSON, or
/// malformed; malformed content falls back to an empty object.
fn parse_json_column(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| json!({})),
        Some(Value::Null) | None => json!({}),
        Some(other) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orm::MemoryOrm;
    use crate::subject::TableSubjectResolver;

    async fn seeded_orm() -> Arc<MemoryOrm> {
        let orm = Arc::new(MemoryOrm::new());
        orm.create(
            "subject",
            row(vec![
                ("id", json!("u1")),
                ("email", json!("alice@example.com")),
                ("password_hash", json!("$argon2$...")),
                ("created_at", json!(Utc::now())),
            ]),
        )
        .await
        .unwrap();
        orm
    }

    fn resolvers() -> Arc<SubjectResolvers> {
        let mut registry = SubjectResolvers::new();
        registry
            .register(
                "user",
                Arc::new(TableSubjectResolver::new(
                    "subject",
                    vec!["password_hash".to_string()],
                )),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn jwt_service(orm: Arc<MemoryOrm>, config: &EngineConfig) -> SessionService {
        let jwks = Arc::new(JwksService::new(orm.clone(), config.clone()));
        SessionService::new(orm, config.clone(), Some(jwks), resolvers())
    }

    fn opaque_service(orm: Arc<MemoryOrm>) -> SessionService {
        let config = EngineConfig {
            session_mode: SessionMode::Opaque,
            ..EngineConfig::for_tests()
        };
        SessionService::new(orm, config, None, resolvers())
    }

    #[tokio::test]
    async fn test_ttl_below_minimum_rejected() {
        let service = opaque_service(seeded_orm().await);
        let err = service
            .create_session("user", "u1", Some(Duration::from_secs(29)))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InputValidation(_)));
    }

    #[tokio::test]
    async fn test_opaque_roundtrip() {
        let service = opaque_service(seeded_orm().await);
        let token = service.create_session("user", "u1", None).await.unwrap();
        assert!(matches!(token, Token::Opaque(_)));

        let verified = service.verify_session(&token, None).await;
        assert!(verified.is_valid());
        assert_eq!(verified.token_type, Some("opaque"));
        let subject = verified.subject.unwrap();
        assert_eq!(subject["id"], "u1");
        assert!(subject.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn test_jwt_roundtrip_and_exp_sync() {
        let orm = seeded_orm().await;
        let config = EngineConfig::for_tests();
        let service = jwt_service(orm.clone(), &config);

        let token = service.create_session("user", "u1", None).await.unwrap();
        let Token::Pair { ref access, refresh: Some(_) } = token else {
            panic!("expected a token pair");
        };

        // The session row's expiry equals the JWT exp claim.
        let session: SessionRow = from_row(
            orm.dump(SESSIONS_TABLE).await.into_iter().next().unwrap(),
        )
        .unwrap();
        let jwks = JwksService::new(orm.clone(), config);
        let claims = jwks.verify_jwt(access).await.unwrap();
        assert_eq!(
            session.expires_at.unwrap().timestamp(),
            claims["exp"].as_i64().unwrap()
        );

        let verified = service.verify_session(&token, None).await;
        assert!(verified.is_valid());
        assert_eq!(verified.token_type, Some("jwt"));
        assert_eq!(verified.payload.unwrap()["sub"], "u1");
    }

    #[tokio::test]
    async fn test_unknown_token_is_invalid() {
        let service = opaque_service(seeded_orm().await);
        let verified = service
            .verify_session(&Token::Opaque("unknown".to_string()), None)
            .await;
        assert!(!verified.is_valid());
        assert!(verified.subject.is_none());
    }

    #[tokio::test]
    async fn test_short_ttl_session_rotates_on_verify() {
        let orm = seeded_orm().await;
        let service = jwt_service(orm.clone(), &EngineConfig::for_tests());

        // Within the pre-emptive refresh window from the start.
        let token = service
            .create_session("user", "u1", Some(Duration::from_secs(31)))
            .await
            .unwrap();
        let old_access = token.access_token().unwrap().to_string();

        let verified = service.verify_session(&token, None).await;
        assert!(verified.is_valid());
        assert_ne!(verified.token.access_token().unwrap(), old_access);
        assert_eq!(verified.subject.as_ref().unwrap()["id"], "u1");

        // The old session row is gone; the new one is present.
        let sessions = orm.dump(SESSIONS_TABLE).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(
            sessions[0].get("token").and_then(Value::as_str),
            verified.token.access_token()
        );
    }

    #[tokio::test]
    async fn test_expired_session_without_refresh_is_deleted() {
        let orm = seeded_orm().await;
        let service = opaque_service(orm.clone());

        orm.create(
            SESSIONS_TABLE,
            row(vec![
                ("subject_type", json!("user")),
                ("subject_id", json!("u1")),
                ("token", json!("stale")),
                ("expires_at", json!(Utc::now() - ChronoDuration::minutes(5))),
                ("created_at", json!(Utc::now() - ChronoDuration::hours(1))),
            ]),
        )
        .await
        .unwrap();

        let verified = service
            .verify_session(&Token::Opaque("stale".to_string()), None)
            .await;
        assert!(!verified.is_valid());
        assert!(orm.dump(SESSIONS_TABLE).await.is_empty());
    }

    #[tokio::test]
    async fn test_device_mismatch_rejected_row_untouched() {
        let orm = seeded_orm().await;
        let service = jwt_service(orm.clone(), &EngineConfig::for_tests())
            .with_device_validator(Arc::new(|stored, current| {
                current.is_some_and(|c| stored.get("fingerprint") == c.get("fingerprint"))
            }));

        let token = service
            .create_session_with_metadata(
                "user",
                "u1",
                SessionOptions {
                    device_info: Some(json!({"fingerprint": "A"})),
                    ..SessionOptions::default()
                },
            )
            .await
            .unwrap();

        let mismatch = service
            .verify_session(&token, Some(&json!({"fingerprint": "B"})))
            .await;
        assert!(!mismatch.is_valid());
        assert_eq!(orm.dump(SESSIONS_TABLE).await.len(), 1);

        let matched = service
            .verify_session(&token, Some(&json!({"fingerprint": "A"})))
            .await;
        assert!(matched.is_valid());
    }

    #[tokio::test]
    async fn test_device_validation_skipped_without_stored_info() {
        let orm = seeded_orm().await;
        let service = jwt_service(orm.clone(), &EngineConfig::for_tests())
            .with_device_validator(Arc::new(|_, _| false));

        let token = service.create_session("user", "u1", None).await.unwrap();
        let verified = service
            .verify_session(&token, Some(&json!({"fingerprint": "B"})))
            .await;
        assert!(verified.is_valid());
    }

    #[tokio::test]
    async fn test_enhanced_rows_created_and_destroyed() {
        let orm = seeded_orm().await;
        let service = jwt_service(orm.clone(), &EngineConfig::for_tests());

        let token = service
            .create_session_with_metadata(
                "user",
                "u1",
                SessionOptions {
                    device_info: Some(json!({"fingerprint": "A"})),
                    metadata: {
                        let mut m = Map::new();
                        m.insert("ip".to_string(), json!("10.0.0.1"));
                        m.insert("login_method".to_string(), json!("password"));
                        m
                    },
                    ..SessionOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(orm.dump(SESSION_DEVICES_TABLE).await.len(), 1);
        assert_eq!(orm.dump(SESSION_METADATA_TABLE).await.len(), 2);

        let views = service.list_sessions_for_subject("user", "u1").await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].device_info.as_ref().unwrap()["fingerprint"], "A");
        assert_eq!(views[0].metadata["ip"], "10.0.0.1");

        service.destroy_session(&token).await.unwrap();
        assert!(orm.dump(SESSIONS_TABLE).await.is_empty());
        assert!(orm.dump(SESSION_DEVICES_TABLE).await.is_empty());
        assert!(orm.dump(SESSION_METADATA_TABLE).await.is_empty());

        // Destroying again is a no-op.
        service.destroy_session(&token).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_all_sessions() {
        let orm = seeded_orm().await;
        let service = jwt_service(orm.clone(), &EngineConfig::for_tests());

        service.create_session("user", "u1", None).await.unwrap();
        service.create_session("user", "u1", None).await.unwrap();
        let keep = service.create_session("user", "u2", None).await.unwrap();

        let count = service.destroy_all_sessions("user", "u1").await.unwrap();
        assert_eq!(count, 2);

        let remaining = orm.dump(SESSIONS_TABLE).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            remaining[0].get("token").and_then(Value::as_str),
            keep.access_token()
        );

        // u1's refresh tokens are all revoked.
        for record in orm.dump(crate::jwks::REFRESH_TOKENS_TABLE).await {
            if record.get("subject_id") == Some(&json!("u1")) {
                assert_eq!(record.get("is_revoked"), Some(&json!(true)));
            }
        }
    }

    #[tokio::test]
    async fn test_missing_resolver_returns_token_without_subject() {
        let orm = seeded_orm().await;
        let config = EngineConfig::for_tests();
        let jwks = Arc::new(JwksService::new(orm.clone(), config.clone()));
        let service = SessionService::new(
            orm,
            config,
            Some(jwks),
            Arc::new(SubjectResolvers::new()),
        );

        let token = service.create_session("user", "u1", None).await.unwrap();
        let verified = service.verify_session(&token, None).await;

        assert!(verified.is_valid());
        assert!(verified.subject.is_none());
    }

    #[tokio::test]
    async fn test_malformed_device_json_tolerated() {
        let orm = seeded_orm().await;
        let service = opaque_service(orm.clone());

        let token = service.create_session("user", "u1", None).await.unwrap();
        let session = orm.dump(SESSIONS_TABLE).await.into_iter().next().unwrap();
        orm.create(
            SESSION_DEVICES_TABLE,
            row(vec![
                ("session_id", session.get("id").cloned().unwrap_or(json!(""))),
                ("device_info", json!("{not json")),
                ("created_at", json!(Utc::now())),
                ("updated_at", json!(Utc::now())),
            ]),
        )
        .await
        .unwrap();

        let views = service.list_sessions_for_subject("user", "u1").await.unwrap();
        assert_eq!(views[0].device_info, Some(json!({})));

        let _ = token;
    }
}
