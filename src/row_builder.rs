//! Row construction and bulk append.
//!
//! Maps each message's decoded JSON onto the cached column order, supplying
//! defaults for the reserved columns, coercing values to their column's
//! declared type, and streaming the result into a scoped appender.

use chrono::NaiveDate;
use duckdb::types::{TimeUnit, Value as SqlValue};

use crate::error::RowError;
use crate::id_gen::generate_id;
use crate::inference::ColumnType;
use crate::message::Message;
use crate::ordered_json::OrderedObject;
use crate::reconcile::{Column, RESERVED_ID, RESERVED_TS};
use crate::temporal::{numeric_to_instant, parse_date, parse_instant};
use crate::value::Value;

/// One row ready for the appender, tagged with the stream sequence of the
/// message it came from so append failures can name the offending row.
pub struct AppendableRow {
    pub values: Vec<SqlValue>,
    pub sequence: u64,
}

fn duckdb_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch date")
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Boolean(*b),
        Value::Number(n) => SqlValue::Double(*n),
        Value::Text(s) => SqlValue::Text(s.clone()),
        // JSON-typed and otherwise-structured columns carry their value as
        // its JSON text representation — DuckDB's JSON type accepts text.
        Value::List(_) | Value::Map(_) => SqlValue::Text(value.to_json().to_string()),
    }
}

fn coerce_timestamp(value: &Value, column: &str, sequence: u64) -> Result<SqlValue, RowError> {
    let instant = match value {
        Value::Text(s) => parse_instant(s)?,
        Value::Number(n) => numeric_to_instant(*n),
        _ => {
            return Err(RowError::UnsupportedShape {
                column: column.to_string(),
                sequence,
            })
        }
    };
    Ok(SqlValue::Timestamp(TimeUnit::Microsecond, instant.timestamp_micros()))
}

fn coerce_date(value: &Value, column: &str, sequence: u64) -> Result<SqlValue, RowError> {
    let date = match value {
        Value::Text(s) => parse_date(s)?,
        _ => {
            return Err(RowError::UnsupportedShape {
                column: column.to_string(),
                sequence,
            })
        }
    };
    let days = (date - duckdb_epoch_date()).num_days();
    Ok(SqlValue::Date32(days as i32))
}

fn resolve_id(payload: &OrderedObject, message: &Message) -> SqlValue {
    if let Some(v) = payload.get(RESERVED_ID) {
        if !v.is_null() {
            if let Some(s) = v.as_str() {
                return SqlValue::Text(s.to_string());
            }
            return SqlValue::Text(v.to_json().to_string());
        }
    }
    if let Some(header) = &message.id_header {
        return SqlValue::Text(header.clone());
    }
    SqlValue::Text(generate_id())
}

fn resolve_ts(
    payload: &OrderedObject,
    message: &Message,
    sequence: u64,
) -> Result<SqlValue, RowError> {
    if let Some(v) = payload.get(RESERVED_TS) {
        if !v.is_null() {
            return coerce_timestamp(v, RESERVED_TS, sequence);
        }
    }
    Ok(SqlValue::Timestamp(
        TimeUnit::Microsecond,
        message.timestamp.timestamp_micros(),
    ))
}

/// Builds one row for `message` against the table's reconciled column list.
pub fn build_row(
    columns: &[Column],
    payload: &OrderedObject,
    message: &Message,
) -> Result<AppendableRow, RowError> {
    let sequence = message.sequence;
    let mut values = Vec::with_capacity(columns.len());

    for column in columns {
        let value = if column.name == RESERVED_ID {
            resolve_id(payload, message)
        } else if column.name == RESERVED_TS {
            resolve_ts(payload, message, sequence)?
        } else {
            match payload.get(column.name.as_str()) {
                Some(field) if !field.is_null() => match column.ty {
                    ColumnType::Timestamp => coerce_timestamp(field, &column.name, sequence)?,
                    ColumnType::Date => coerce_date(field, &column.name, sequence)?,
                    // A JSON-typed column always carries its value as JSON
                    // text, regardless of the field's native shape — a
                    // bare Bool/Number/Text sample is just as much "the
                    // JSON representation" as a List/Map one.
                    ColumnType::Json => SqlValue::Text(field.to_json().to_string()),
                    _ => to_sql_value(field),
                },
                Some(_null) | None => {
                    if column.nullable {
                        SqlValue::Null
                    } else {
                        return Err(RowError::MissingColumn {
                            column: column.name.clone(),
                            sequence,
                        });
                    }
                }
            }
        };
        values.push(value);
    }

    Ok(AppendableRow { values, sequence })
}
