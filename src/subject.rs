//! Subject resolver registry.
//!
//! Maps a `subject_type` to the loader and scrubber for that kind of
//! principal. Plugins register resolvers during initialization; the
//! session service consults the registry after verifying a token.

use crate::error::{AuthError, AuthResult};
use crate::orm::Orm;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Loads and scrubs principals of one `subject_type`.
#[async_trait]
pub trait SubjectResolver: Send + Sync {
    /// Load the subject by id, or `None` when it no longer exists.
    async fn get_by_id(&self, id: &str, orm: &dyn Orm) -> AuthResult<Option<Value>>;

    /// Strip fields that must not reach callers. Defaults to identity.
    fn sanitize(&self, subject: Value) -> Value {
        subject
    }
}

/// Registry of subject resolvers, keyed by `subject_type`.
#[derive(Default)]
pub struct SubjectResolvers {
    resolvers: HashMap<String, Arc<dyn SubjectResolver>>,
}

impl SubjectResolvers {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver for a subject type.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Conflict`] when the type is already registered.
    pub fn register(
        &mut self,
        subject_type: impl Into<String>,
        resolver: Arc<dyn SubjectResolver>,
    ) -> AuthResult<()> {
        let subject_type = subject_type.into();
        if self.resolvers.contains_key(&subject_type) {
            return Err(AuthError::conflict(format!(
                "Subject resolver already registered for type '{subject_type}'"
            )));
        }
        self.resolvers.insert(subject_type, resolver);
        Ok(())
    }

    /// Look up the resolver for a subject type.
    #[must_use]
    pub fn get(&self, subject_type: &str) -> Option<&Arc<dyn SubjectResolver>> {
        self.resolvers.get(subject_type)
    }

    /// Registered subject-type names.
    #[must_use]
    pub fn subject_types(&self) -> Vec<&str> {
        self.resolvers.keys().map(String::as_str).collect()
    }
}

/// Resolver that loads rows straight from a table by primary key.
///
/// The common case for plugins whose subjects live in a single table; the
/// `hidden_columns` list is dropped by `sanitize`.
pub struct TableSubjectResolver {
    table: String,
    hidden_columns: Vec<String>,
}

impl TableSubjectResolver {
    /// Resolver over `table`, hiding the given columns from callers.
    #[must_use]
    pub fn new(table: impl Into<String>, hidden_columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            hidden_columns,
        }
    }
}

#[async_trait]
impl SubjectResolver for TableSubjectResolver {
    async fn get_by_id(&self, id: &str, orm: &dyn Orm) -> AuthResult<Option<Value>> {
        let row = orm
            .find_first(&self.table, &crate::orm::Predicate::eq("id", id))
            .await?;
        Ok(row.map(Value::Object))
    }

    fn sanitize(&self, subject: Value) -> Value {
        match subject {
            Value::Object(mut map) => {
                for column in &self.hidden_columns {
                    map.remove(column);
                }
                Value::Object(map)
            }
            other => other,
        }
    }
}
