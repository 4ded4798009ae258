//! Step dispatch.
//!
//! Validates input, runs the hook pipeline around the step body, and
//! validates output. Hook order is deterministic: engine before, plugin
//! before, step before, run, step after, plugin after, engine after.
//! Failures walk the `on_error` chain in reverse scope order.

use crate::engine::hooks::HookContext;
use crate::engine::plugin::StepContext;
use crate::engine::Engine;
use crate::error::{AuthError, AuthResult};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

impl Engine {
    /// Execute a plugin step.
    pub async fn execute_step(
        self: &Arc<Self>,
        plugin_name: &str,
        step_name: &str,
        input: Value,
    ) -> AuthResult<Value> {
        let plugin = self
            .get_plugin(plugin_name)
            .cloned()
            .ok_or_else(|| AuthError::not_found(format!("Plugin '{plugin_name}'")))?;
        let step = self.find_step(plugin_name, step_name)?;

        if let Some(schema) = &step.validation_schema {
            schema.validate(&input)?;
        }

        let ctx = HookContext {
            engine: self.clone(),
            plugin_name: Some(plugin_name.to_string()),
            step_name: Some(step_name.to_string()),
        };
        let root_hook = plugin.root_hook();

        debug!(plugin = plugin_name, step = step_name, "Dispatching step");

        let result: AuthResult<Value> = async {
            let mut data = input;
            for auth_hook in &self.auth_hooks {
                if auth_hook.matches(plugin_name, step_name) {
                    data = auth_hook.hook.before(data, &ctx).await?;
                }
            }
            if let Some(root) = &root_hook {
                data = root.before(data, &ctx).await?;
            }
            if let Some(step_hook) = &step.hook {
                data = step_hook.before(data, &ctx).await?;
            }

            let step_ctx = StepContext {
                engine: self.clone(),
                config: self.get_plugin_config(plugin_name),
            };
            let mut output = step.handler.run(data, step_ctx).await?;

            if let Some(step_hook) = &step.hook {
                output = step_hook.after(output, &ctx).await?;
            }
            if let Some(root) = &root_hook {
                output = root.after(output, &ctx).await?;
            }
            for auth_hook in &self.auth_hooks {
                if auth_hook.matches(plugin_name, step_name) {
                    output = auth_hook.hook.after(output, &ctx).await?;
                }
            }
            Ok(output)
        }
        .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if let Some(step_hook) = &step.hook {
                    if let Some(replacement) = step_hook.on_error(&err, &ctx).await? {
                        return Ok(replacement);
                    }
                }
                if let Some(root) = &root_hook {
                    if let Some(replacement) = root.on_error(&err, &ctx).await? {
                        return Ok(replacement);
                    }
                }
                for auth_hook in &self.auth_hooks {
                    if auth_hook.matches(plugin_name, step_name) {
                        if let Some(replacement) =
                            auth_hook.hook.on_error(&err, &ctx).await?
                        {
                            return Ok(replacement);
                        }
                    }
                }
                return Err(err);
            }
        };

        if let Some(schema) = &step.output_schema {
            schema.validate(&output).map_err(|err| match err {
                AuthError::InputValidation(message) => AuthError::OutputValidation(message),
                other => other,
            })?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, SessionMode};
    use crate::engine::hooks::{AuthHook, Hook};
    use crate::engine::plugin::{AuthPlugin, Step, StepHandler};
    use crate::orm::MemoryOrm;
    use crate::schema::{FieldKind, StepSchema};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn log_entry(log: &Log, entry: &str) {
        log.lock().unwrap().push(entry.to_string());
    }

    struct Recorder {
        log: Log,
        scope: &'static str,
        suppress_with: Option<Value>,
    }

    impl Recorder {
        fn new(log: Log, scope: &'static str) -> Arc<Self> {
            Arc::new(Self {
                log,
                scope,
                suppress_with: None,
            })
        }
    }

    #[async_trait]
    impl Hook for Recorder {
        async fn before(&self, input: Value, _ctx: &HookContext) -> AuthResult<Value> {
            log_entry(&self.log, &format!("{}.before", self.scope));
            Ok(input)
        }

        async fn after(&self, output: Value, _ctx: &HookContext) -> AuthResult<Value> {
            log_entry(&self.log, &format!("{}.after", self.scope));
            Ok(output)
        }

        async fn on_error(
            &self,
            _error: &AuthError,
            _ctx: &HookContext,
        ) -> AuthResult<Option<Value>> {
            log_entry(&self.log, &format!("{}.on_error", self.scope));
            Ok(self.suppress_with.clone())
        }
    }

    struct RecordingHandler {
        log: Log,
        fail: bool,
    }

    #[async_trait]
    impl StepHandler for RecordingHandler {
        async fn run(&self, input: Value, _ctx: StepContext) -> AuthResult<Value> {
            log_entry(&self.log, "run");
            if self.fail {
                return Err(AuthError::internal("step blew up"));
            }
            Ok(json!({ "echo": input }))
        }
    }

    struct TestPlugin {
        log: Log,
        fail: bool,
    }

    impl AuthPlugin for TestPlugin {
        fn name(&self) -> &str {
            "test"
        }

        fn steps(&self) -> Vec<Arc<Step>> {
            vec![Arc::new(
                Step::new(
                    "echo",
                    Arc::new(RecordingHandler {
                        log: self.log.clone(),
                        fail: self.fail,
                    }),
                )
                .with_hook(Recorder::new(self.log.clone(), "step")),
            )]
        }

        fn root_hook(&self) -> Option<Arc<dyn Hook>> {
            Some(Recorder::new(self.log.clone(), "plugin"))
        }
    }

    async fn engine_with(log: Log, fail: bool) -> Arc<Engine> {
        let config = EngineConfig {
            session_mode: SessionMode::Opaque,
            ..EngineConfig::for_tests()
        };
        Engine::builder(Arc::new(MemoryOrm::new()), config)
            .register_plugin(Arc::new(TestPlugin {
                log: log.clone(),
                fail,
            }))
            .register_auth_hook(AuthHook::universal(Recorder::new(log, "engine")))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_hook_order_on_success() {
        let log: Log = Arc::default();
        let engine = engine_with(log.clone(), false).await;

        let output = engine
            .execute_step("test", "echo", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(output["echo"]["x"], 1);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "engine.before",
                "plugin.before",
                "step.before",
                "run",
                "step.after",
                "plugin.after",
                "engine.after",
            ]
        );
    }

    #[tokio::test]
    async fn test_on_error_reverses_scope_and_reraises() {
        let log: Log = Arc::default();
        let engine = engine_with(log.clone(), true).await;

        let err = engine
            .execute_step("test", "echo", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Internal(_)));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "engine.before",
                "plugin.before",
                "step.before",
                "run",
                "step.on_error",
                "plugin.on_error",
                "engine.on_error",
            ]
        );
    }

    #[tokio::test]
    async fn test_on_error_can_suppress() {
        let log: Log = Arc::default();
        let config = EngineConfig {
            session_mode: SessionMode::Opaque,
            ..EngineConfig::for_tests()
        };
        let engine = Engine::builder(Arc::new(MemoryOrm::new()), config)
            .register_plugin(Arc::new(TestPlugin {
                log: log.clone(),
                fail: true,
            }))
            .register_auth_hook(AuthHook::universal(Arc::new(Recorder {
                log: log.clone(),
                scope: "engine",
                suppress_with: Some(json!({"recovered": true})),
            })))
            .build()
            .await
            .unwrap();

        let output = engine.execute_step("test", "echo", json!({})).await.unwrap();
        assert_eq!(output, json!({"recovered": true}));
    }

    #[tokio::test]
    async fn test_unknown_plugin_and_step() {
        let log: Log = Arc::default();
        let engine = engine_with(log.clone(), false).await;

        assert!(matches!(
            engine.execute_step("missing", "echo", json!({})).await,
            Err(AuthError::NotFound(_))
        ));
        assert!(matches!(
            engine.execute_step("test", "missing", json!({})).await,
            Err(AuthError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_input_validation_precedes_hooks() {
        struct ValidatedPlugin;

        struct EchoHandler;
        #[async_trait]
        impl StepHandler for EchoHandler {
            async fn run(&self, input: Value, _ctx: StepContext) -> AuthResult<Value> {
                Ok(input)
            }
        }

        impl AuthPlugin for ValidatedPlugin {
            fn name(&self) -> &str {
                "validated"
            }

            fn steps(&self) -> Vec<Arc<Step>> {
                vec![Arc::new(
                    Step::new("login", Arc::new(EchoHandler)).with_validation(
                        StepSchema::new().required("email", FieldKind::Email),
                    ),
                )]
            }
        }

        let log: Log = Arc::default();
        let config = EngineConfig {
            session_mode: SessionMode::Opaque,
            ..EngineConfig::for_tests()
        };
        let engine = Engine::builder(Arc::new(MemoryOrm::new()), config)
            .register_plugin(Arc::new(ValidatedPlugin))
            .register_auth_hook(AuthHook::universal(Recorder::new(log.clone(), "engine")))
            .build()
            .await
            .unwrap();

        let err = engine
            .execute_step("validated", "login", json!({"email": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InputValidation(_)));

        // Validation failed before any hook ran.
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_output_validation() {
        struct BadOutputPlugin;

        struct BadHandler;
        #[async_trait]
        impl StepHandler for BadHandler {
            async fn run(&self, _input: Value, _ctx: StepContext) -> AuthResult<Value> {
                Ok(json!({"success": "yes"}))
            }
        }

        impl AuthPlugin for BadOutputPlugin {
            fn name(&self) -> &str {
                "bad-output"
            }

            fn steps(&self) -> Vec<Arc<Step>> {
                vec![Arc::new(
                    Step::new("run", Arc::new(BadHandler)).with_output(
                        StepSchema::new().required("success", FieldKind::Boolean),
                    ),
                )]
            }
        }

        let config = EngineConfig {
            session_mode: SessionMode::Opaque,
            ..EngineConfig::for_tests()
        };
        let engine = Engine::builder(Arc::new(MemoryOrm::new()), config)
            .register_plugin(Arc::new(BadOutputPlugin))
            .build()
            .await
            .unwrap();

        let err = engine
            .execute_step("bad-output", "run", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::OutputValidation(_)));
    }

    #[tokio::test]
    async fn test_scoped_hook_skipped_for_other_plugin() {
        let log: Log = Arc::default();
        let config = EngineConfig {
            session_mode: SessionMode::Opaque,
            ..EngineConfig::for_tests()
        };
        let engine = Engine::builder(Arc::new(MemoryOrm::new()), config)
            .register_plugin(Arc::new(TestPlugin {
                log: log.clone(),
                fail: false,
            }))
            .register_auth_hook(AuthHook::scoped(
                Some("other-plugin".to_string()),
                None,
                Recorder::new(log.clone(), "scoped"),
            ))
            .build()
            .await
            .unwrap();

        engine.execute_step("test", "echo", json!({})).await.unwrap();

        let entries = log.lock().unwrap();
        assert!(!entries.iter().any(|e| e.starts_with("scoped")));
    }
}
