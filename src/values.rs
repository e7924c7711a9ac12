// 🧮 Value Coercion
// JSON scalar helpers shared by the rule predicates and the cleaner.
// Blank means null or a whitespace-only string; everything else is present.

use crate::error::ValueTypeError;
use serde_json::Value;

/// Shared null used when a field is absent from a row
pub static NULL: Value = Value::Null;

pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// JSON type name for diagnostics
pub fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_error(field_path: &str, expected: &str, value: &Value) -> ValueTypeError {
    ValueTypeError {
        field_path: field_path.to_string(),
        expected: expected.to_string(),
        found: kind_name(value).to_string(),
    }
}

/// Trimmed text of a scalar, `None` when blank.
/// Numbers and booleans are rendered the way they appear in the source JSON.
pub fn as_text(field_path: &str, value: &Value) -> Result<Option<String>, ValueTypeError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Array(_) | Value::Object(_) => Err(type_error(field_path, "scalar", value)),
    }
}

/// Numeric reading of a scalar. Unparseable text is `None`, not an error.
pub fn as_f64(field_path: &str, value: &Value) -> Result<Option<f64>, ValueTypeError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::Bool(b) => Ok(Some(if *b { 1.0 } else { 0.0 })),
        Value::String(s) => Ok(s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())),
        Value::Array(_) | Value::Object(_) => Err(type_error(field_path, "number", value)),
    }
}

/// Boolean reading of a scalar using the accepted truthy/falsy spellings
pub fn as_bool(field_path: &str, value: &Value) -> Result<Option<bool>, ValueTypeError> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        Value::Number(n) => Ok(match n.as_f64() {
            Some(v) if v == 1.0 => Some(true),
            Some(v) if v == 0.0 => Some(false),
            _ => None,
        }),
        Value::String(s) => Ok(match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Some(true),
            "false" | "0" | "no" | "n" => Some(false),
            _ => None,
        }),
        Value::Array(_) | Value::Object(_) => Err(type_error(field_path, "boolean", value)),
    }
}

/// True for a non-blank value that does not read as a number
pub fn is_non_numeric(field_path: &str, value: &Value) -> Result<bool, ValueTypeError> {
    if is_blank(value) {
        return Ok(false);
    }
    Ok(as_f64(field_path, value)?.is_none())
}

/// Build a JSON number, keeping whole numbers integral so they render without ".0"
pub fn number_value(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < 9.0e15 {
        Value::from(v as i64)
    } else {
        Value::from(v)
    }
}

/// Render a value for a flat table cell; null is an empty cell
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
