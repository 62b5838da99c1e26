//! Structural comparison of models.
//!
//! Two models are "different" when any domain field differs. The id and the
//! four reserved timestamps never take part: a model re-stamped by the
//! remote is the same model as far as change tracking is concerned.

use crate::Model;
use serde_json::{Map, Value};

/// Check whether two models differ in their domain fields.
pub fn is_different(old: &Model, new: &Model) -> bool {
    objects_differ(&old.fields, &new.fields)
}

/// Compare two JSON values recursively.
///
/// - A type mismatch is a difference.
/// - Objects or arrays with different sizes differ without further recursion.
/// - Numbers compare by value, so `1` and `1.0` are equal.
pub fn values_differ(old: &Value, new: &Value) -> bool {
    match (old, new) {
        (Value::Null, Value::Null) => false,
        (Value::Bool(a), Value::Bool(b)) => a != b,
        (Value::Number(a), Value::Number(b)) => {
            if a == b {
                return false;
            }
            match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x != y,
                _ => true,
            }
        }
        (Value::String(a), Value::String(b)) => a != b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() != b.len() || a.iter().zip(b).any(|(x, y)| values_differ(x, y))
        }
        (Value::Object(a), Value::Object(b)) => objects_differ(a, b),
        _ => true,
    }
}

fn objects_differ(old: &Map<String, Value>, new: &Map<String, Value>) -> bool {
    if old.len() != new.len() {
        return true;
    }
    old.iter().any(|(key, value)| match new.get(key) {
        Some(other) => values_differ(value, other),
        None => true,
    })
}
