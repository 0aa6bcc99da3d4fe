use jsonschema::JSONSchema;
use serde_json::Value;

use floe_core::error::{FloeError, Result};

/// A compiled JSON schema together with its source document.
pub struct SchemaValidator {
    schema: Value,
    compiled: JSONSchema,
}

impl SchemaValidator {
    pub fn compile(schema: Value) -> Result<Self> {
        let compiled = JSONSchema::compile(&schema).map_err(|e| FloeError::Schema(e.to_string()))?;
        Ok(Self { schema, compiled })
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Validate `instance`, joining every violation into one message.
    pub fn validate(&self, instance: &Value) -> std::result::Result<(), String> {
        match self.compiled.validate(instance) {
            Ok(()) => Ok(()),
            Err(errors) => Err(errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect::<Vec<_>>()
                .join("; ")),
        }
    }

    pub fn is_valid(&self, instance: &Value) -> bool {
        self.compiled.is_valid(instance)
    }

    /// Top-level `required` properties absent from `instance`.
    pub fn missing_required(&self, instance: &Value) -> Vec<String> {
        let Some(required) = self.schema.get("required").and_then(|r| r.as_array()) else {
            return Vec::new();
        };
        let present = instance.as_object();
        required
            .iter()
            .filter_map(|r| r.as_str())
            .filter(|field| {
                present
                    .and_then(|obj| obj.get(*field))
                    .map_or(true, |v| v.is_null())
            })
            .map(str::to_string)
            .collect()
    }
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator").field("schema", &self.schema).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topic_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"topic": {"type": "string"}, "limit": {"type": "integer"}},
            "required": ["topic", "limit"]
        })
    }

    #[test]
    fn test_validate_reports_errors() {
        let v = SchemaValidator::compile(topic_schema()).unwrap();
        assert!(v.validate(&json!({"topic": "metrics", "limit": 2})).is_ok());
        let err = v.validate(&json!({"topic": 3, "limit": 2})).unwrap_err();
        assert!(err.contains("/topic"));
    }

    #[test]
    fn test_missing_required() {
        let v = SchemaValidator::compile(topic_schema()).unwrap();
        assert_eq!(v.missing_required(&json!({"topic": "x"})), vec!["limit".to_string()]);
        assert_eq!(
            v.missing_required(&json!({"topic": null})),
            vec!["topic".to_string(), "limit".to_string()]
        );
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let err = SchemaValidator::compile(json!({"type": 12})).unwrap_err();
        assert!(matches!(err, FloeError::Schema(_)));
    }
}
