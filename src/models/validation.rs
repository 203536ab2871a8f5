//! Declared deliverable schemas and validation results.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON value kinds a schema can require.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// JSON string.
    String,
    /// Any JSON number.
    Number,
    /// JSON number without a fractional part.
    Integer,
    /// JSON boolean.
    Boolean,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
    /// JSON null.
    Null,
}

impl FieldType {
    /// Whether `value` is of this kind.
    ///
    /// Whole-valued floats such as `1.0` count as integers.
    #[must_use]
    pub fn accepts(self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|n| n.is_finite() && n.fract() == 0.0)
            }
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Null => matches!(value, Value::Null),
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Null => "null",
        };
        f.write_str(name)
    }
}

/// Declared type of one deliverable property.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    /// Required JSON kind.
    #[serde(rename = "type")]
    pub kind: FieldType,
}

/// Structure a task's deliverable must have.
///
/// Shaped like a subset of JSON Schema so existing schema documents
/// (`required`, `properties.<name>.type`) deserialize directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputSchema {
    /// Fields that must be present.
    #[serde(default)]
    pub required: Vec<String>,
    /// Declared property types.
    #[serde(default)]
    pub properties: BTreeMap<String, FieldSpec>,
    /// Upper bound on the serialized deliverable; falls back to the configured bound.
    #[serde(default)]
    pub max_bytes: Option<usize>,
    /// Whether properties outside `properties` are accepted.
    #[serde(default = "default_allow_additional", rename = "additionalProperties")]
    pub allow_additional: bool,
}

fn default_allow_additional() -> bool {
    true
}

/// Outcome of validating one submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    /// Whether the submission satisfies the schema.
    pub valid: bool,
    /// Human-readable errors, in evaluation order.
    pub errors: Vec<String>,
    /// The submission, when valid.
    pub data: Option<serde_json::Value>,
}

impl ValidationResult {
    /// A passing result carrying `data`.
    #[must_use]
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            data,
        }
    }

    /// A failing result.
    #[must_use]
    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
            data: None,
        }
    }
}

/// An accepted deliverable with provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatedOutput {
    /// Validated payload; `None` for tasks without a declared schema.
    pub data: Option<serde_json::Value>,
    /// When the output was accepted.
    pub produced_at: DateTime<Utc>,
    /// Session that produced it.
    pub session_name: String,
}
