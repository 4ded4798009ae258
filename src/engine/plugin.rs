//! Plugin and step contracts.

use crate::engine::hooks::Hook;
use crate::engine::registrar::Registrar;
use crate::engine::Engine;
use crate::error::AuthResult;
use crate::orm::Orm;
use crate::schema::StepSchema;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Context handed to a running step.
pub struct StepContext {
    /// The engine, for session and storage access
    pub engine: Arc<Engine>,
    /// The plugin's configuration value
    pub config: Value,
}

/// The work a step performs.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute the step.
    async fn run(&self, input: Value, ctx: StepContext) -> AuthResult<Value>;
}

/// A named operation exposed by a plugin.
///
/// Steps are values addressed by name; the dispatcher validates input
/// and output against the schemas and runs the hook pipeline around
/// `handler`.
#[derive(Clone)]
pub struct Step {
    /// Step name, unique within its plugin
    pub name: String,
    /// Input schema, validated before dispatch
    pub validation_schema: Option<StepSchema>,
    /// Output schema, validated after the pipeline
    pub output_schema: Option<StepSchema>,
    /// Protocol metadata for transport adapters; opaque to the engine
    pub protocol: Option<Value>,
    /// Whether adapters must authenticate callers first
    pub requires_auth: bool,
    /// Step-scoped hook
    pub hook: Option<Arc<dyn Hook>>,
    /// The step body
    pub handler: Arc<dyn StepHandler>,
}

impl Step {
    /// A step with no schemas, no protocol metadata, and no hook.
    #[must_use]
    pub fn new(name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            name: name.into(),
            validation_schema: None,
            output_schema: None,
            protocol: None,
            requires_auth: false,
            hook: None,
            handler,
        }
    }

    /// Set the input schema.
    #[must_use]
    pub fn with_validation(mut self, schema: StepSchema) -> Self {
        self.validation_schema = Some(schema);
        self
    }

    /// Set the output schema.
    #[must_use]
    pub fn with_output(mut self, schema: StepSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Attach protocol metadata.
    #[must_use]
    pub fn with_protocol(mut self, protocol: Value) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Mark the step as requiring an authenticated caller.
    #[must_use]
    pub fn requires_auth(mut self, requires: bool) -> Self {
        self.requires_auth = requires;
        self
    }

    /// Attach a step-scoped hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// The input field names, from the validation schema.
    #[must_use]
    pub fn inputs(&self) -> Vec<&str> {
        self.validation_schema
            .as_ref()
            .map(StepSchema::field_names)
            .unwrap_or_default()
    }
}

/// A named unit bundling steps, configuration, and lifecycle callbacks.
#[async_trait]
pub trait AuthPlugin: Send + Sync {
    /// The plugin's unique name.
    fn name(&self) -> &str;

    /// The steps this plugin exposes.
    fn steps(&self) -> Vec<Arc<Step>>;

    /// The plugin-root hook, run around every step of this plugin.
    fn root_hook(&self) -> Option<Arc<dyn Hook>> {
        None
    }

    /// One-time initialization; runs exactly once, during engine build.
    ///
    /// Plugins register resolvers, hooks, and cleanup tasks here.
    async fn initialize(&self, _registrar: &mut Registrar<'_>) -> AuthResult<()> {
        Ok(())
    }

    /// Per-subject profile data for the unified profile.
    async fn get_profile(&self, _subject_id: &str, _orm: &dyn Orm) -> AuthResult<Option<Value>> {
        Ok(None)
    }
}
