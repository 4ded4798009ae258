//! Shared test fixtures: a representative email-password plugin.

use async_trait::async_trait;
use auth_engine::config::EngineConfig;
use auth_engine::engine::{AuthPlugin, Engine, Registrar, Step, StepContext, StepHandler};
use auth_engine::error::AuthResult;
use auth_engine::orm::{row, MemoryOrm, Orm, Predicate};
use auth_engine::schema::{FieldKind, StepSchema};
use auth_engine::subject::TableSubjectResolver;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Table holding principals.
pub const SUBJECTS_TABLE: &str = "subject";

/// Test-grade password hashing.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

struct RegisterHandler;

#[async_trait]
impl StepHandler for RegisterHandler {
    async fn run(&self, input: Value, ctx: StepContext) -> AuthResult<Value> {
        let email = input["email"].as_str().unwrap_or_default();
        let password = input["password"].as_str().unwrap_or_default();
        let orm = ctx.engine.orm();

        if orm
            .find_first(SUBJECTS_TABLE, &Predicate::eq("email", email))
            .await?
            .is_some()
        {
            return Ok(json!({
                "success": false,
                "message": "Email already registered",
                "status": "eq",
            }));
        }

        let subject = orm
            .create(
                SUBJECTS_TABLE,
                row(vec![
                    ("email", json!(email)),
                    ("password_hash", json!(hash_password(password))),
                    ("created_at", json!(Utc::now())),
                ]),
            )
            .await?;

        Ok(json!({
            "success": true,
            "message": "Registered",
            "status": "su",
            "subject": {
                "id": subject.get("id").cloned().unwrap_or(Value::Null),
                "email": email,
            },
        }))
    }
}

struct LoginHandler;

#[async_trait]
impl StepHandler for LoginHandler {
    async fn run(&self, input: Value, ctx: StepContext) -> AuthResult<Value> {
        let email = input["email"].as_str().unwrap_or_default();
        let password = input["password"].as_str().unwrap_or_default();
        let orm = ctx.engine.orm();

        let Some(subject) = orm
            .find_first(SUBJECTS_TABLE, &Predicate::eq("email", email))
            .await?
        else {
            return Ok(json!({
                "success": false,
                "message": "Invalid credentials",
                "status": "unf",
            }));
        };

        let stored_hash = subject
            .get("password_hash")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if stored_hash != hash_password(password) {
            return Ok(json!({
                "success": false,
                "message": "Invalid credentials",
                "status": "unf",
            }));
        }

        let subject_id = subject
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let device_info = input.get("deviceInfo").filter(|d| !d.is_null()).cloned();
        let token = ctx
            .engine
            .create_session_for("user", &subject_id, None, device_info)
            .await?;

        Ok(json!({
            "success": true,
            "message": "Logged in",
            "status": "su",
            "token": token,
        }))
    }
}

struct LogoutHandler;

#[async_trait]
impl StepHandler for LogoutHandler {
    async fn run(&self, input: Value, ctx: StepContext) -> AuthResult<Value> {
        let token = input
            .get("token")
            .cloned()
            .and_then(|t| serde_json::from_value(t).ok())
            .unwrap_or(auth_engine::session::Token::None);
        ctx.engine.sessions().destroy_session(&token).await?;
        Ok(json!({
            "success": true,
            "message": "Logged out",
            "status": "su",
        }))
    }
}

/// A minimal email-password plugin exercising the engine surface.
pub struct EmailPasswordPlugin;

#[async_trait]
impl AuthPlugin for EmailPasswordPlugin {
    fn name(&self) -> &str {
        "email-password"
    }

    fn steps(&self) -> Vec<Arc<Step>> {
        vec![
            Arc::new(
                Step::new("register", Arc::new(RegisterHandler))
                    .with_validation(
                        StepSchema::new()
                            .required("email", FieldKind::Email)
                            .required("password", FieldKind::String),
                    )
                    .with_output(
                        StepSchema::new()
                            .required("success", FieldKind::Boolean)
                            .required("status", FieldKind::String),
                    )
                    .with_protocol(json!({
                        "http": { "method": "POST", "codes": { "su": 201, "eq": 409, "ip": 400 } }
                    })),
            ),
            Arc::new(
                Step::new("login", Arc::new(LoginHandler))
                    .with_validation(
                        StepSchema::new()
                            .required("email", FieldKind::Email)
                            .required("password", FieldKind::String)
                            .optional("deviceInfo", FieldKind::Object),
                    )
                    .with_output(
                        StepSchema::new()
                            .required("success", FieldKind::Boolean)
                            .required("status", FieldKind::String),
                    )
                    .with_protocol(json!({
                        "http": { "method": "POST", "codes": { "su": 200, "unf": 401, "ip": 400 } }
                    })),
            ),
            Arc::new(
                Step::new("logout", Arc::new(LogoutHandler))
                    .requires_auth(true)
                    .with_protocol(json!({
                        "http": { "method": "POST", "codes": { "su": 200 }, "auth": true }
                    })),
            ),
        ]
    }

    async fn initialize(&self, registrar: &mut Registrar<'_>) -> AuthResult<()> {
        registrar.register_session_resolver(
            "user",
            Arc::new(TableSubjectResolver::new(
                SUBJECTS_TABLE,
                vec!["password_hash".to_string()],
            )),
        )
    }

    async fn get_profile(&self, subject_id: &str, orm: &dyn Orm) -> AuthResult<Option<Value>> {
        let Some(subject) = orm
            .find_first(SUBJECTS_TABLE, &Predicate::eq("id", subject_id))
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(json!({
            "email": subject.get("email").cloned().unwrap_or(Value::Null),
            "registeredAt": subject.get("created_at").cloned().unwrap_or(Value::Null),
        })))
    }
}

/// A JWT-mode engine with the email-password plugin over a fresh store.
pub async fn build_engine() -> (Arc<Engine>, Arc<MemoryOrm>) {
    build_engine_with_config(EngineConfig::for_tests()).await
}

/// Same, with a caller-supplied configuration.
pub async fn build_engine_with_config(
    config: EngineConfig,
) -> (Arc<Engine>, Arc<MemoryOrm>) {
    let orm = Arc::new(MemoryOrm::new());
    let engine = Engine::builder(orm.clone(), config)
        .register_plugin(Arc::new(EmailPasswordPlugin))
        .build()
        .await
        .expect("engine build");
    (engine, orm)
}

/// Register alice and log her in, returning the issued token JSON.
pub async fn register_and_login(engine: &Arc<Engine>) -> Value {
    let registered = engine
        .execute_step(
            "email-password",
            "register",
            json!({"email": "alice@example.com", "password": "Secret123!"}),
        )
        .await
        .expect("register");
    assert_eq!(registered["success"], true);

    let logged_in = engine
        .execute_step(
            "email-password",
            "login",
            json!({"email": "alice@example.com", "password": "Secret123!"}),
        )
        .await
        .expect("login");
    assert_eq!(logged_in["success"], true);
    logged_in
}
