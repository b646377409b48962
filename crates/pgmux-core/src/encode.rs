//! Array bind parameter encoding
//!
//! Backends that are not handed typed arrays by the driver expect array
//! parameters as text literals such as `{1,"a",NULL}`. These helpers turn
//! `Value::Array` parameters into that form and leave every other parameter
//! untouched.

use crate::Value;

/// Literal for an array with no elements
pub const EMPTY_ARRAY_LITERAL: &str = "{}";

/// Literal for a NULL array element
pub const NULL_ELEMENT: &str = "NULL";

/// Replace every array-valued parameter with its array literal.
///
/// Returns `None` when no parameter list was given. The returned list has the
/// same length and order as the input.
///
/// # Example
///
/// ```
/// use pgmux_core::{Value, convert_array_params};
///
/// let params = vec![Value::Int64(1), Value::from(vec!["a", "b"])];
/// let converted = convert_array_params(Some(&params)).unwrap();
/// assert_eq!(converted[0], Value::Int64(1));
/// assert_eq!(converted[1], Value::from(r#"{"a","b"}"#));
/// ```
pub fn convert_array_params(params: Option<&[Value]>) -> Option<Vec<Value>> {
    let params = params?;
    Some(
        params
            .iter()
            .map(|param| match param {
                Value::Array(items) => Value::String(encode_array(items)),
                other => other.clone(),
            })
            .collect(),
    )
}

/// Encode one array as a backend array literal
pub fn encode_array(items: &[Value]) -> String {
    if items.is_empty() {
        return EMPTY_ARRAY_LITERAL.to_string();
    }

    let elements: Vec<String> = items.iter().map(encode_element).collect();
    format!("{{{}}}", elements.join(","))
}

fn encode_element(item: &Value) -> String {
    match item {
        Value::Null => NULL_ELEMENT.to_string(),
        Value::Bool(v) => v.to_string(),
        Value::Int16(v) => v.to_string(),
        Value::Int32(v) => v.to_string(),
        Value::Int64(v) => v.to_string(),
        Value::Float32(v) => format_float(*v),
        Value::Float64(v) => format_float(*v),
        Value::Decimal(v) => v.clone(),
        Value::String(v) => quote(v),
        Value::Uuid(v) => quote(&v.to_string()),
        // Compound values go through their JSON text.
        other => quote(&other.to_json().to_string()),
    }
}

/// Shortest text that reads back as the same value at its own width
fn format_float<T: Into<f64> + ToString + Copy>(value: T) -> String {
    let wide: f64 = value.into();
    if wide.is_infinite() {
        if wide > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        value.to_string()
    }
}

/// Escape backslashes first, then double quotes, and wrap in double quotes
fn quote(text: &str) -> String {
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}
