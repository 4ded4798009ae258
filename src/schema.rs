//! Declarative schemas for step input and output.
//!
//! A schema validates the dynamic JSON a step exchanges with its caller
//! and emits a JSON-Schema description for introspection.

use crate::error::{AuthError, AuthResult};
use serde_json::{json, Value};

/// The JSON shape a field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Any string
    String,
    /// A string containing an email address
    Email,
    /// An integer
    Integer,
    /// Any number
    Number,
    /// A boolean
    Boolean,
    /// A JSON object
    Object,
    /// A JSON array
    Array,
}

impl FieldKind {
    fn json_type(self) -> &'static str {
        match self {
            Self::String | Self::Email => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Email => value
                .as_str()
                .is_some_and(|s| s.contains('@') && !s.starts_with('@') && !s.ends_with('@')),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone)]
struct Field {
    name: String,
    kind: FieldKind,
    required: bool,
}

/// Schema for a step's input or output object.
#[derive(Debug, Clone, Default)]
pub struct StepSchema {
    fields: Vec<Field>,
}

impl StepSchema {
    /// An empty schema accepting any object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required field.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Add an optional field.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Names of the declared fields.
    #[must_use]
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Assert a value conforms; errors name the offending field.
    pub fn validate(&self, value: &Value) -> AuthResult<()> {
        let Some(object) = value.as_object() else {
            return Err(AuthError::input_validation("payload must be an object"));
        };

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        return Err(AuthError::input_validation(format!(
                            "{} is required",
                            field.name
                        )));
                    }
                }
                Some(present) => {
                    if !field.kind.accepts(present) {
                        return Err(AuthError::input_validation(format!(
                            "{} must be {}",
                            field.name,
                            match field.kind {
                                FieldKind::Email => "an email address",
                                FieldKind::Integer => "an integer",
                                FieldKind::Number => "a number",
                                FieldKind::Boolean => "a boolean",
                                FieldKind::Object => "an object",
                                FieldKind::Array => "an array",
                                FieldKind::String => "a string",
                            }
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// The JSON-Schema description used by introspection.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut property = json!({ "type": field.kind.json_type() });
            if field.kind == FieldKind::Email {
                property["format"] = json!("email");
            }
            properties.insert(field.name.clone(), property);
            if field.required {
                required.push(json!(field.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_schema() -> StepSchema {
        StepSchema::new()
            .required("email", FieldKind::Email)
            .required("password", FieldKind::String)
            .optional("remember", FieldKind::Boolean)
    }

    #[test]
    fn test_accepts_valid_input() {
        let schema = login_schema();
        assert!(schema
            .validate(&json!({"email": "a@b.com", "password": "pw"}))
            .is_ok());
        assert!(schema
            .validate(&json!({"email": "a@b.com", "password": "pw", "remember": true}))
            .is_ok());
    }

    #[test]
    fn test_error_names_offending_field() {
        let schema = login_schema();

        let err = schema.validate(&json!({"password": "pw"})).unwrap_err();
        assert!(err.to_string().contains("email"));

        let err = schema
            .validate(&json!({"email": "not-an-email", "password": "pw"}))
            .unwrap_err();
        assert!(err.to_string().contains("email"));

        let err = schema
            .validate(&json!({"email": "a@b.com", "password": 42}))
            .unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(login_schema().validate(&json!("nope")).is_err());
        assert!(StepSchema::new().validate(&json!({})).is_ok());
    }

    #[test]
    fn test_null_optional_is_absent() {
        let schema = login_schema();
        assert!(schema
            .validate(&json!({"email": "a@b.com", "password": "pw", "remember": null}))
            .is_ok());
    }

    #[test]
    fn test_json_schema_emission() {
        let schema = login_schema().to_json_schema();

        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["email"]["type"], "string");
        assert_eq!(schema["properties"]["email"]["format"], "email");
        assert_eq!(schema["properties"]["remember"]["type"], "boolean");
        assert_eq!(schema["required"], json!(["email", "password"]));
    }
}
