//! Registration surface for plugin initialization.

use crate::engine::hooks::{AuthHook, Hook};
use crate::error::AuthResult;
use crate::orm::Orm;
use crate::scheduler::CleanupTask;
use crate::subject::{SubjectResolver, SubjectResolvers};
use serde_json::Value;
use std::sync::Arc;

/// What a plugin may register during `initialize`.
///
/// Registration only exists while the engine is being built; once built,
/// the plugin map, hook lists, and resolver registry are frozen.
pub struct Registrar<'a> {
    pub(crate) orm: &'a Arc<dyn Orm>,
    pub(crate) resolvers: &'a mut SubjectResolvers,
    pub(crate) auth_hooks: &'a mut Vec<AuthHook>,
    pub(crate) session_hooks: &'a mut Vec<Arc<dyn Hook>>,
    pub(crate) cleanup_tasks: &'a mut Vec<CleanupTask>,
    pub(crate) plugin_config: Value,
}

impl Registrar<'_> {
    /// The engine's store, for initialization-time reads and seeds.
    #[must_use]
    pub fn orm(&self) -> &Arc<dyn Orm> {
        self.orm
    }

    /// This plugin's configuration value.
    #[must_use]
    pub fn plugin_config(&self) -> &Value {
        &self.plugin_config
    }

    /// Register a subject resolver; subject types are unique.
    pub fn register_session_resolver(
        &mut self,
        subject_type: impl Into<String>,
        resolver: Arc<dyn SubjectResolver>,
    ) -> AuthResult<()> {
        self.resolvers.register(subject_type, resolver)
    }

    /// Register an engine-level step hook.
    pub fn register_auth_hook(&mut self, hook: AuthHook) {
        self.auth_hooks.push(hook);
    }

    /// Register a session hook, run by session issuance and checks.
    pub fn register_session_hook(&mut self, hook: Arc<dyn Hook>) {
        self.session_hooks.push(hook);
    }

    /// Register a periodic cleanup task.
    pub fn register_cleanup_task(&mut self, task: CleanupTask) {
        self.cleanup_tasks.push(task);
    }
}
