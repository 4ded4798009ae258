//! Hook pipeline.
//!
//! Hooks weave user code into step execution at `before`, `after`, and
//! `on_error` points. Engine-level hooks carry a filter; plugin-root and
//! step hooks are scoped by where they are attached.

use crate::engine::Engine;
use crate::error::{AuthError, AuthResult};
use crate::session::Token;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Context handed to every hook invocation.
pub struct HookContext {
    /// The engine, for service access
    pub engine: Arc<Engine>,
    /// The plugin being dispatched, absent for session hooks
    pub plugin_name: Option<String>,
    /// The step being dispatched, absent for session hooks
    pub step_name: Option<String>,
}

/// A before/after/on_error hook.
///
/// `before` may replace the input, `after` may replace the output, and
/// `on_error` may convert an error into a non-error output by returning
/// `Some`.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Runs before the step; returns the (possibly replaced) input.
    async fn before(&self, input: Value, _ctx: &HookContext) -> AuthResult<Value> {
        Ok(input)
    }

    /// Runs after the step; returns the (possibly replaced) output.
    async fn after(&self, output: Value, _ctx: &HookContext) -> AuthResult<Value> {
        Ok(output)
    }

    /// Runs when the pipeline fails; `Some` suppresses the error.
    async fn on_error(
        &self,
        _error: &AuthError,
        _ctx: &HookContext,
    ) -> AuthResult<Option<Value>> {
        Ok(None)
    }
}

/// An engine-level hook with its filter.
#[derive(Clone)]
pub struct AuthHook {
    /// Matches every plugin and step regardless of the other filters
    pub universal: bool,
    /// Restrict to one plugin
    pub plugin_name: Option<String>,
    /// Restrict to these steps
    pub steps: Option<Vec<String>>,
    /// The hook implementation
    pub hook: Arc<dyn Hook>,
}

impl AuthHook {
    /// A hook that matches everything.
    #[must_use]
    pub fn universal(hook: Arc<dyn Hook>) -> Self {
        Self {
            universal: true,
            plugin_name: None,
            steps: None,
            hook,
        }
    }

    /// A hook scoped to a plugin and optionally to named steps.
    #[must_use]
    pub fn scoped(
        plugin_name: Option<String>,
        steps: Option<Vec<String>>,
        hook: Arc<dyn Hook>,
    ) -> Self {
        Self {
            universal: false,
            plugin_name,
            steps,
            hook,
        }
    }

    /// Whether the hook applies to a dispatch.
    #[must_use]
    pub fn matches(&self, plugin_name: &str, step_name: &str) -> bool {
        if self.universal {
            return true;
        }
        let plugin_ok = self
            .plugin_name
            .as_deref()
            .map_or(true, |p| p == plugin_name);
        let step_ok = self
            .steps
            .as_ref()
            .map_or(true, |steps| steps.iter().any(|s| s == step_name));
        plugin_ok && step_ok
    }
}

/// Hook that rejects dispatches whose input lacks a valid session.
///
/// Plugins scope it to their protected steps. The step input must carry
/// the session token under `token`; on success the verified subject is
/// attached under `session.subject`.
pub struct RequireSessionHook;

#[async_trait]
impl Hook for RequireSessionHook {
    async fn before(&self, mut input: Value, ctx: &HookContext) -> AuthResult<Value> {
        let token = input
            .get("token")
            .cloned()
            .and_then(|t| serde_json::from_value::<Token>(t).ok())
            .unwrap_or(Token::None);

        let verified = ctx.engine.sessions().verify_session(&token, None).await;
        if !verified.is_valid() {
            return Err(AuthError::Unauthenticated);
        }

        if let Value::Object(map) = &mut input {
            map.insert(
                "session".to_string(),
                json!({
                    "subject": verified.subject,
                    "token": verified.token,
                }),
            );
        }
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl Hook for Noop {}

    fn hook() -> Arc<dyn Hook> {
        Arc::new(Noop)
    }

    #[test]
    fn test_universal_matches_everything() {
        let h = AuthHook::universal(hook());
        assert!(h.matches("email-password", "login"));
        assert!(h.matches("oauth", "callback"));
    }

    #[test]
    fn test_plugin_scope() {
        let h = AuthHook::scoped(Some("email-password".to_string()), None, hook());
        assert!(h.matches("email-password", "login"));
        assert!(h.matches("email-password", "register"));
        assert!(!h.matches("oauth", "login"));
    }

    #[test]
    fn test_step_scope() {
        let h = AuthHook::scoped(
            None,
            Some(vec!["login".to_string(), "register".to_string()]),
            hook(),
        );
        assert!(h.matches("email-password", "login"));
        assert!(h.matches("oauth", "register"));
        assert!(!h.matches("oauth", "callback"));
    }

    #[test]
    fn test_combined_scope() {
        let h = AuthHook::scoped(
            Some("email-password".to_string()),
            Some(vec!["login".to_string()]),
            hook(),
        );
        assert!(h.matches("email-password", "login"));
        assert!(!h.matches("email-password", "register"));
        assert!(!h.matches("oauth", "login"));
    }
}
