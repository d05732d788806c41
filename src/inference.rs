//! Type inference over a multiset of observed field values.

use crate::temporal::{looks_like_date, looks_like_instant};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    Double,
    Timestamp,
    Date,
    Text,
    Json,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Bool => "BOOLEAN",
            ColumnType::Double => "DOUBLE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Date => "DATE",
            ColumnType::Text => "VARCHAR",
            ColumnType::Json => "JSON",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Bool,
    Number,
    Instant,
    Date,
    PlainText,
}

fn classify_string(s: &str) -> Family {
    // Same ordered pattern list as the parser; an instant match takes
    // precedence over a date-only match per spec §4.2.
    if looks_like_instant(s) {
        Family::Instant
    } else if looks_like_date(s) {
        Family::Date
    } else {
        Family::PlainText
    }
}

/// Infers a column's type from its non-null sample values across a batch.
/// `_id`/`_ts` bypass this entirely (handled by the row builder / reserved
/// column rules) — this is only ever called for non-reserved columns.
pub fn infer_column_type(samples: &[&Value]) -> ColumnType {
    let non_null: Vec<&Value> = samples.iter().copied().filter(|v| !v.is_null()).collect();

    if non_null.is_empty() {
        return ColumnType::Json;
    }

    if non_null.iter().any(|v| v.is_structured()) {
        return ColumnType::Json;
    }

    let families: Vec<Family> = non_null
        .iter()
        .map(|v| match v {
            Value::Bool(_) => Family::Bool,
            Value::Number(_) => Family::Number,
            Value::Text(s) => classify_string(s),
            Value::Null | Value::List(_) | Value::Map(_) => unreachable!("filtered above"),
        })
        .collect();

    let first = families[0];
    if families.iter().all(|f| *f == first) {
        match first {
            Family::Bool => ColumnType::Bool,
            Family::Number => ColumnType::Double,
            Family::Instant => ColumnType::Timestamp,
            Family::Date => ColumnType::Date,
            Family::PlainText => ColumnType::Text,
        }
    } else {
        // Mixed families: if every family observed is itself a "string"
        // family (Instant/Date/PlainText) the per-message values are still
        // just strings, so TEXT covers them; a mix involving Bool/Number
        // against anything else is incompatible and falls back to JSON.
        let string_families = [Family::Instant, Family::Date, Family::PlainText];
        let all_string_like = families.iter().all(|f| string_families.contains(f));

        if all_string_like {
            ColumnType::Text
        } else {
            ColumnType::Json
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(samples: &[Value]) -> Vec<&Value> {
        samples.iter().collect()
    }

    #[test]
    fn only_booleans_infers_bool() {
        let samples = [Value::Bool(true), Value::Bool(false)];
        let refs: Vec<&Value> = v(&samples);
        assert_eq!(infer_column_type(&refs), ColumnType::Bool);
    }

    #[test]
    fn only_numbers_infers_double() {
        let samples = [Value::Number(1.0), Value::Number(2.5)];
        let refs: Vec<&Value> = v(&samples);
        assert_eq!(infer_column_type(&refs), ColumnType::Double);
    }

    #[test]
    fn only_instant_strings_infers_timestamp() {
        let samples = [Value::Text("2024-01-02T03:04:05Z".into())];
        let refs: Vec<&Value> = v(&samples);
        assert_eq!(infer_column_type(&refs), ColumnType::Timestamp);
    }

    #[test]
    fn only_date_strings_infers_date() {
        let samples = [Value::Text("2024-01-02".into())];
        let refs: Vec<&Value> = v(&samples);
        assert_eq!(infer_column_type(&refs), ColumnType::Date);
    }

    #[test]
    fn mixed_string_families_infers_text() {
        let samples = [
            Value::Text("2024-01-02T03:04:05Z".into()),
            Value::Text("2024-01-02".into()),
        ];
        let refs: Vec<&Value> = v(&samples);
        assert_eq!(infer_column_type(&refs), ColumnType::Text);
    }

    #[test]
    fn any_structured_value_infers_json() {
        let samples = [Value::Number(1.0), Value::List(vec![Value::Number(2.0)])];
        let refs: Vec<&Value> = v(&samples);
        assert_eq!(infer_column_type(&refs), ColumnType::Json);
    }

    #[test]
    fn bool_and_number_mix_infers_json() {
        let samples = [Value::Bool(true), Value::Number(1.0)];
        let refs: Vec<&Value> = v(&samples);
        assert_eq!(infer_column_type(&refs), ColumnType::Json);
    }

    #[test]
    fn all_nulls_infers_json() {
        let samples = [Value::Null, Value::Null];
        let refs: Vec<&Value> = v(&samples);
        assert_eq!(infer_column_type(&refs), ColumnType::Json);
    }

    #[test]
    fn empty_samples_infers_json() {
        let refs: Vec<&Value> = Vec::new();
        assert_eq!(infer_column_type(&refs), ColumnType::Json);
    }
}
