//! Tagged variant for loosely-typed JSON values.
//!
//! Everything downstream (inference, coercion, row building) branches on
//! this tag instead of reflecting over `serde_json::Value` directly, so the
//! closed target type set stays in one place.

use crate::ordered_json::OrderedObject;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
    Map(OrderedObject),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Value::List(_) | Value::Map(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(a) => Value::List(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Map(OrderedObject::from_serde_map(map))
            }
        }
    }
}

impl Value {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(obj) => obj.to_json(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_round_trips_through_json() {
        let v = Value::from(serde_json::json!(9.5));
        assert_eq!(v.as_f64(), Some(9.5));
    }

    #[test]
    fn nested_object_becomes_map_variant() {
        let v = Value::from(serde_json::json!({"a": 1, "b": "x"}));
        assert!(matches!(v, Value::Map(_)));
    }

    #[test]
    fn array_becomes_list_variant() {
        let v = Value::from(serde_json::json!([1, 2, 3]));
        assert!(v.is_structured());
    }
}
