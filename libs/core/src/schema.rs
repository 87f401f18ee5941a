//! Structural validation of decoded payloads.

use serde_json::Value;

use crate::error::Error;

/// One field-level violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// JSON pointer into the payload, `/` for the root.
    pub path: String,
    pub message: String,
}

/// Pluggable validator bound to one subscription's schema.
///
/// The default is JSON-Schema-backed; embedders may supply anything that
/// answers with field-level errors.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<(), Vec<FieldError>>;
}

/// JSON Schema validator compiled once per subscription.
pub struct JsonSchema {
    validator: jsonschema::Validator,
}

impl std::fmt::Debug for JsonSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSchema").finish()
    }
}

impl JsonSchema {
    pub fn compile(schema: &Value) -> Result<Self, Error> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| Error::configuration(format!("invalid subscription schema: {e}")))?;
        Ok(Self { validator })
    }
}

impl SchemaValidator for JsonSchema {
    fn validate(&self, payload: &Value) -> Result<(), Vec<FieldError>> {
        let errors: Vec<FieldError> = self
            .validator
            .iter_errors(payload)
            .map(|err| FieldError {
                path: err.instance_path().to_string(),
                message: err.to_string(),
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Renders violations into one line for error records and logs.
pub fn describe(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| {
            if e.path.is_empty() || e.path == "/" {
                e.message.clone()
            } else {
                format!("{}: {}", e.path, e.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}
