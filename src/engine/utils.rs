//! # Utility Functions Module
//!
//! Small helpers for JSON value handling shared by the expansion,
//! context and transformation code:
//! - Value truthiness evaluation
//! - Shallow map merging
//! - Map/object conversion

use serde_json::{Map, Value};

/// Truthiness of a JSON value, following JSONLogic rules
///
/// `null`, `false`, `0`, `""` and empty arrays are falsy. Objects are
/// always truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

/// Merge `overlay` into `base`, overlay keys winning
///
/// # Arguments
/// * `base` - The map receiving the entries
/// * `overlay` - Entries to copy in; `None` is a no-op
pub fn merge_into(base: &mut Map<String, Value>, overlay: Option<&Map<String, Value>>) {
    if let Some(overlay) = overlay {
        for (key, value) in overlay {
            base.insert(key.clone(), value.clone());
        }
    }
}

/// Wrap an optional map as a JSON value, `null` when absent
pub fn object_or_null(map: Option<&Map<String, Value>>) -> Value {
    map.map(|m| Value::Object(m.clone())).unwrap_or(Value::Null)
}

/// Unwrap a JSON object, returning the offending type name otherwise
pub fn into_object(value: Value) -> Result<Map<String, Value>, &'static str> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Err("null"),
        Value::Bool(_) => Err("boolean"),
        Value::Number(_) => Err("number"),
        Value::String(_) => Err("string"),
        Value::Array(_) => Err("array"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_truthy() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(0.5)));
        assert!(is_truthy(&json!("false")));
        assert!(is_truthy(&json!([0])));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn test_merge_into_overlay_wins() {
        let mut base = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
        let overlay = json!({"b": 3, "c": 4}).as_object().cloned().unwrap();
        merge_into(&mut base, Some(&overlay));
        merge_into(&mut base, None);
        assert_eq!(Value::Object(base), json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_into_object() {
        assert!(into_object(json!({"k": 1})).is_ok());
        assert_eq!(into_object(json!([1])), Err("array"));
        assert_eq!(object_or_null(None), Value::Null);
    }
}
