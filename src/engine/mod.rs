//! Engine composition root.
//!
//! Wires the ORM port, JWKS service, session service, plugin registry,
//! hook pipeline, and cleanup scheduler behind one handle. The engine is
//! immutable once built; all registration happens on the builder or
//! inside plugin `initialize`.

mod dispatch;
pub mod hooks;
pub mod plugin;
pub mod registrar;

pub use hooks::{AuthHook, Hook, HookContext, RequireSessionHook};
pub use plugin::{AuthPlugin, Step, StepContext, StepHandler};
pub use registrar::Registrar;

use crate::config::{EngineConfig, SessionMode};
use crate::error::{AuthError, AuthResult};
use crate::jwks::service::{
    BlacklistCleanupRunner, KeyCleanupRunner, RefreshTokenCleanupRunner,
};
use crate::jwks::JwksService;
use crate::orm::Orm;
use crate::scheduler::{CleanupScheduler, CleanupTask};
use crate::session::service::{DeviceValidator, OpaqueTokenFactory, UserDataLoader};
use crate::session::{SessionOptions, SessionService, Token};
use crate::subject::SubjectResolvers;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The result of [`Engine::check_session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCheck {
    /// Whether the session verified
    #[serde(default)]
    pub valid: bool,
    /// The sanitized subject, when resolvable
    #[serde(default)]
    pub subject: Option<Value>,
    /// The token the caller should keep using; rotated pairs land here
    #[serde(default)]
    pub token: Token,
    /// `"jwt"` or `"opaque"`
    #[serde(rename = "type", default)]
    pub token_type: Option<String>,
    /// Verified JWT claims, JWT mode only
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    orm: Arc<dyn Orm>,
    plugins: Vec<Arc<dyn AuthPlugin>>,
    plugin_configs: HashMap<String, Value>,
    auth_hooks: Vec<AuthHook>,
    session_hooks: Vec<Arc<dyn Hook>>,
    resolvers: SubjectResolvers,
    cleanup_tasks: Vec<CleanupTask>,
    device_validator: Option<DeviceValidator>,
    user_data_loader: Option<Arc<dyn UserDataLoader>>,
    token_factory: Option<OpaqueTokenFactory>,
}

impl EngineBuilder {
    /// Start building an engine over the given store.
    #[must_use]
    pub fn new(orm: Arc<dyn Orm>, config: EngineConfig) -> Self {
        Self {
            config,
            orm,
            plugins: Vec::new(),
            plugin_configs: HashMap::new(),
            auth_hooks: Vec::new(),
            session_hooks: Vec::new(),
            resolvers: SubjectResolvers::new(),
            cleanup_tasks: Vec::new(),
            device_validator: None,
            user_data_loader: None,
            token_factory: None,
        }
    }

    /// Register a plugin.
    #[must_use]
    pub fn register_plugin(mut self, plugin: Arc<dyn AuthPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Set a plugin's configuration value.
    #[must_use]
    pub fn set_plugin_config(mut self, plugin_name: impl Into<String>, config: Value) -> Self {
        self.plugin_configs.insert(plugin_name.into(), config);
        self
    }

    /// Register an engine-level step hook.
    #[must_use]
    pub fn register_auth_hook(mut self, hook: AuthHook) -> Self {
        self.auth_hooks.push(hook);
        self
    }

    /// Register a session hook.
    #[must_use]
    pub fn register_session_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.session_hooks.push(hook);
        self
    }

    /// Register a cleanup task.
    #[must_use]
    pub fn register_cleanup_task(mut self, task: CleanupTask) -> Self {
        self.cleanup_tasks.push(task);
        self
    }

    /// Install a device validator on the session service.
    #[must_use]
    pub fn with_device_validator(mut self, validator: DeviceValidator) -> Self {
        self.device_validator = Some(validator);
        self
    }

    /// Install a user-data loader on the session service.
    #[must_use]
    pub fn with_user_data_loader(mut self, loader: Arc<dyn UserDataLoader>) -> Self {
        self.user_data_loader = Some(loader);
        self
    }

    /// Replace the opaque token factory.
    #[must_use]
    pub fn with_token_factory(mut self, factory: OpaqueTokenFactory) -> Self {
        self.token_factory = Some(factory);
        self
    }

    /// Initialize every plugin and assemble the engine.
    ///
    /// Plugin `initialize` runs exactly once, here. Plugin names must be
    /// unique.
    pub async fn build(mut self) -> AuthResult<Arc<Engine>> {
        let mut plugin_map = HashMap::new();
        for (index, plugin) in self.plugins.iter().enumerate() {
            if plugin_map
                .insert(plugin.name().to_string(), index)
                .is_some()
            {
                return Err(AuthError::conflict(format!(
                    "Plugin '{}' registered twice",
                    plugin.name()
                )));
            }
        }

        let jwks = match self.config.session_mode {
            SessionMode::Jwt => Some(Arc::new(JwksService::new(
                self.orm.clone(),
                self.config.clone(),
            ))),
            SessionMode::Opaque => None,
        };

        if let Some(ref jwks) = jwks {
            let interval = self.config.maintenance_interval;
            self.cleanup_tasks.extend([
                CleanupTask::new(
                    "jwks-expired-keys",
                    "jwks",
                    interval,
                    Arc::new(KeyCleanupRunner(jwks.clone())),
                ),
                CleanupTask::new(
                    "jwt-blacklist",
                    "jwks",
                    interval,
                    Arc::new(BlacklistCleanupRunner(jwks.clone())),
                ),
                CleanupTask::new(
                    "refresh-tokens",
                    "jwks",
                    interval,
                    Arc::new(RefreshTokenCleanupRunner(jwks.clone())),
                ),
            ]);
        }

        for plugin in &self.plugins {
            let mut registrar = Registrar {
                orm: &self.orm,
                resolvers: &mut self.resolvers,
                auth_hooks: &mut self.auth_hooks,
                session_hooks: &mut self.session_hooks,
                cleanup_tasks: &mut self.cleanup_tasks,
                plugin_config: self
                    .plugin_configs
                    .get(plugin.name())
                    .cloned()
                    .unwrap_or(Value::Null),
            };
            plugin.initialize(&mut registrar).await?;
            info!(plugin = plugin.name(), "Initialized plugin");
        }

        let resolvers = Arc::new(self.resolvers);
        let mut sessions = SessionService::new(
            self.orm.clone(),
            self.config.clone(),
            jwks.clone(),
            resolvers,
        );
        if let Some(validator) = self.device_validator {
            sessions = sessions.with_device_validator(validator);
        }
        if let Some(loader) = self.user_data_loader {
            sessions = sessions.with_user_data_loader(loader);
        }
        if let Some(factory) = self.token_factory {
            sessions = sessions.with_token_factory(factory);
        }

        let scheduler = CleanupScheduler::new(
            self.orm.clone(),
            self.cleanup_tasks,
            self.plugin_configs.clone(),
        );

        Ok(Arc::new(Engine {
            config: self.config,
            orm: self.orm,
            jwks,
            sessions,
            plugins: self.plugins,
            plugin_map,
            plugin_configs: self.plugin_configs,
            auth_hooks: self.auth_hooks,
            session_hooks: self.session_hooks,
            scheduler,
        }))
    }
}

/// The authentication engine.
pub struct Engine {
    config: EngineConfig,
    orm: Arc<dyn Orm>,
    jwks: Option<Arc<JwksService>>,
    sessions: SessionService,
    plugins: Vec<Arc<dyn AuthPlugin>>,
    plugin_map: HashMap<String, usize>,
    plugin_configs: HashMap<String, Value>,
    pub(crate) auth_hooks: Vec<AuthHook>,
    session_hooks: Vec<Arc<dyn Hook>>,
    scheduler: CleanupScheduler,
}

impl Engine {
    /// Start building an engine.
    #[must_use]
    pub fn builder(orm: Arc<dyn Orm>, config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(orm, config)
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The storage port.
    #[must_use]
    pub fn orm(&self) -> &Arc<dyn Orm> {
        &self.orm
    }

    /// The JWKS service, JWT mode only.
    #[must_use]
    pub fn jwks(&self) -> Option<&Arc<JwksService>> {
        self.jwks.as_ref()
    }

    /// The session service.
    #[must_use]
    pub fn sessions(&self) -> &SessionService {
        &self.sessions
    }

    /// The cleanup scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &CleanupScheduler {
        &self.scheduler
    }

    /// All registered plugins, in registration order.
    #[must_use]
    pub fn get_all_plugins(&self) -> &[Arc<dyn AuthPlugin>] {
        &self.plugins
    }

    /// Look up a plugin by name.
    #[must_use]
    pub fn get_plugin(&self, name: &str) -> Option<&Arc<dyn AuthPlugin>> {
        self.plugin_map.get(name).map(|&index| &self.plugins[index])
    }

    /// A plugin's configuration value.
    #[must_use]
    pub fn get_plugin_config(&self, name: &str) -> Value {
        self.plugin_configs.get(name).cloned().unwrap_or(Value::Null)
    }

    /// The declared input fields of a step.
    pub fn get_step_inputs(&self, plugin_name: &str, step_name: &str) -> AuthResult<Vec<String>> {
        let step = self.find_step(plugin_name, step_name)?;
        Ok(step.inputs().into_iter().map(str::to_string).collect())
    }

    pub(crate) fn find_step(
        &self,
        plugin_name: &str,
        step_name: &str,
    ) -> AuthResult<Arc<Step>> {
        let plugin = self
            .get_plugin(plugin_name)
            .ok_or_else(|| AuthError::not_found(format!("Plugin '{plugin_name}'")))?;
        plugin
            .steps()
            .into_iter()
            .find(|step| step.name == step_name)
            .ok_or_else(|| {
                AuthError::not_found(format!("Step '{plugin_name}.{step_name}'"))
            })
    }

    /// Issue a session for a subject, running the session hooks.
    pub async fn create_session_for(
        self: &Arc<Self>,
        subject_type: &str,
        subject_id: &str,
        ttl: Option<Duration>,
        device_info: Option<Value>,
    ) -> AuthResult<Token> {
        let ctx = HookContext {
            engine: self.clone(),
            plugin_name: None,
            step_name: None,
        };

        let result: AuthResult<Token> = async {
            let mut input = json!({
                "subjectType": subject_type,
                "subjectId": subject_id,
                "deviceInfo": device_info,
            });
            for hook in &self.session_hooks {
                input = hook.before(input, &ctx).await?;
            }

            let subject_type = input
                .get("subjectType")
                .and_then(Value::as_str)
                .unwrap_or(subject_type)
                .to_string();
            let subject_id = input
                .get("subjectId")
                .and_then(Value::as_str)
                .unwrap_or(subject_id)
                .to_string();
            let device_info = input
                .get("deviceInfo")
                .filter(|d| !d.is_null())
                .cloned();

            let token = self
                .sessions
                .create_session_with_metadata(
                    &subject_type,
                    &subject_id,
                    SessionOptions {
                        ttl,
                        device_info,
                        ..SessionOptions::default()
                    },
                )
                .await?;

            let mut output = serde_json::to_value(&token)?;
            for hook in &self.session_hooks {
                output = hook.after(output, &ctx).await?;
            }
            Ok(serde_json::from_value(output).unwrap_or(token))
        }
        .await;

        match result {
            Ok(token) => Ok(token),
            Err(err) => {
                for hook in &self.session_hooks {
                    if let Some(replacement) = hook.on_error(&err, &ctx).await? {
                        if let Ok(token) = serde_json::from_value(replacement) {
                            return Ok(token);
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Verify a session token, running the session hooks.
    ///
    /// Verification failures come back as `valid: false`; only hook
    /// errors propagate.
    pub async fn check_session(
        self: &Arc<Self>,
        token: &Token,
        device_info: Option<&Value>,
    ) -> AuthResult<SessionCheck> {
        let ctx = HookContext {
            engine: self.clone(),
            plugin_name: None,
            step_name: None,
        };

        let result: AuthResult<SessionCheck> = async {
            let mut input = json!({
                "token": token,
                "deviceInfo": device_info,
            });
            for hook in &self.session_hooks {
                input = hook.before(input, &ctx).await?;
            }

            let token = input
                .get("token")
                .cloned()
                .and_then(|t| serde_json::from_value(t).ok())
                .unwrap_or_else(|| token.clone());
            let device_info = input.get("deviceInfo").filter(|d| !d.is_null()).cloned();

            let verified = self
                .sessions
                .verify_session(&token, device_info.as_ref())
                .await;
            let check = SessionCheck {
                valid: verified.is_valid(),
                subject: verified.subject,
                token: verified.token,
                token_type: verified.token_type.map(str::to_string),
                payload: verified.payload,
            };

            let mut output = serde_json::to_value(&check)?;
            for hook in &self.session_hooks {
                output = hook.after(output, &ctx).await?;
            }
            Ok(serde_json::from_value(output).unwrap_or(check))
        }
        .await;

        match result {
            Ok(check) => Ok(check),
            Err(err) => {
                for hook in &self.session_hooks {
                    if let Some(replacement) = hook.on_error(&err, &ctx).await? {
                        if let Ok(check) = serde_json::from_value(replacement) {
                            return Ok(check);
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// JSON description of every plugin and step for adapters.
    ///
    /// Conversion failures yield an empty plugin list rather than an
    /// error; callers must not treat introspection as a correctness
    /// signal.
    #[must_use]
    pub fn get_introspection_data(&self) -> Value {
        match self.build_introspection() {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "Introspection failed; returning empty plugin list");
                json!({ "plugins": [], "generatedAt": Utc::now() })
            }
        }
    }

    fn build_introspection(&self) -> AuthResult<Value> {
        let mut plugins = Vec::new();
        for plugin in &self.plugins {
            let mut steps = Vec::new();
            for step in plugin.steps() {
                steps.push(json!({
                    "name": step.name,
                    "inputs": step.inputs(),
                    "inputSchema": step
                        .validation_schema
                        .as_ref()
                        .map(crate::schema::StepSchema::to_json_schema),
                    "outputSchema": step
                        .output_schema
                        .as_ref()
                        .map(crate::schema::StepSchema::to_json_schema),
                    "protocol": step.protocol,
                    "requiresAuth": step.requires_auth,
                }));
            }
            plugins.push(json!({
                "name": plugin.name(),
                "steps": steps,
            }));
        }
        Ok(json!({ "plugins": plugins, "generatedAt": Utc::now() }))
    }

    /// Aggregate every plugin's profile data for a subject.
    ///
    /// A failing plugin contributes an error entry instead of poisoning
    /// the whole profile.
    pub async fn get_unified_profile(&self, subject_id: &str) -> Value {
        let mut plugins = Map::new();
        for plugin in &self.plugins {
            match plugin.get_profile(subject_id, self.orm.as_ref()).await {
                Ok(Some(data)) => {
                    plugins.insert(plugin.name().to_string(), data);
                }
                Ok(None) => {}
                Err(err) => {
                    plugins.insert(
                        plugin.name().to_string(),
                        json!({ "error": err.sanitized().message }),
                    );
                }
            }
        }
        json!({
            "subjectId": subject_id,
            "plugins": plugins,
            "generatedAt": Utc::now(),
        })
    }
}
