//! Order-preserving JSON object decoding.
//!
//! The default `serde_json::Value` hash map loses key order; schema
//! inference needs the order fields were first observed, so this module
//! decodes into an explicit (name, value) sequence plus a name→index map for
//! O(1) lookup. Requires the `preserve_order` feature on `serde_json` so the
//! intermediate `serde_json::Map` itself iterates in insertion order.

use std::collections::HashMap;

use crate::error::DecodeError;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderedObject {
    entries: Vec<(String, Value)>,
    index: HashMap<String, usize>,
}

impl OrderedObject {
    pub fn from_serde_map(map: serde_json::Map<String, serde_json::Value>) -> Self {
        let mut entries = Vec::with_capacity(map.len());
        let mut index = HashMap::with_capacity(map.len());

        for (key, value) in map {
            // Duplicate keys: last value wins, first position defines order.
            if let Some(&pos) = index.get(&key) {
                entries[pos].1 = Value::from(value);
            } else {
                index.insert(key.clone(), entries.len());
                entries.push((key, Value::from(value)));
            }
        }

        Self { entries, index }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.index.get(name).map(|&pos| &self.entries[pos].1)
    }

    pub fn ordered_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.entries {
            map.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

/// Decode a JSON object payload, preserving the insertion order of its keys.
pub fn decode_ordered(bytes: &[u8]) -> Result<OrderedObject, DecodeError> {
    let parsed: serde_json::Value = serde_json::from_slice(bytes)?;
    match parsed {
        serde_json::Value::Object(map) => Ok(OrderedObject::from_serde_map(map)),
        _ => Err(DecodeError::NotAnObject),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_insertion_order() {
        let obj = decode_ordered(br#"{"price":9.5,"region":"eu"}"#).unwrap();
        assert_eq!(
            obj.ordered_names().collect::<Vec<_>>(),
            vec!["price", "region"]
        );
    }

    #[test]
    fn rejects_non_object_payloads() {
        let err = decode_ordered(br#"[1,2,3]"#).unwrap_err();
        assert!(matches!(err, DecodeError::NotAnObject));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = decode_ordered(b"{not json}").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn duplicate_key_keeps_first_position_last_value() {
        let obj = decode_ordered(br#"{"a":1,"b":2,"a":3}"#).unwrap();
        assert_eq!(obj.ordered_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(obj.get("a").unwrap().as_f64(), Some(3.0));
    }
}
