//! Argument validation against a tool's JSON parameter schema.
//!
//! Only the subset the model actually sees is checked: the top level must be
//! an object, every `required` property must be present, and each present
//! property must match its declared `type`.

use serde_json::{Map, Value};

use crate::error::ToolError;

/// Property types understood by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Parse raw argument JSON and check it against `schema`.
///
/// An empty string means "no arguments". `null` properties count as absent.
pub fn validate_arguments(schema: &Value, raw: &str) -> Result<Value, ToolError> {
    let args: Value = if raw.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(raw)
            .map_err(|e| ToolError::Validation(format!("arguments are not valid JSON: {e}")))?
    };

    let Some(object) = args.as_object() else {
        return Err(ToolError::Validation(
            "arguments must be a JSON object".into(),
        ));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if object.get(name).is_none_or(Value::is_null) {
                return Err(ToolError::Validation(format!(
                    "missing required property '{name}'"
                )));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, spec) in properties {
            let Some(value) = object.get(name).filter(|v| !v.is_null()) else {
                continue;
            };
            let Some(expected) = spec.get("type").and_then(Value::as_str) else {
                continue;
            };
            let Some(param_type) = ParamType::parse(expected) else {
                continue;
            };
            if !param_type.matches(value) {
                return Err(ToolError::Validation(format!(
                    "property '{name}' must be of type {}",
                    param_type.as_str()
                )));
            }
            if let Some(allowed) = spec.get("enum").and_then(Value::as_array) {
                if !allowed.contains(value) {
                    return Err(ToolError::Validation(format!(
                        "property '{name}' must be one of {}",
                        Value::Array(allowed.clone())
                    )));
                }
            }
        }
    }

    Ok(args)
}
