//! Error taxonomy for the ingest engine.
//!
//! Each stage of the pipeline has its own narrow error type (mirroring how
//! `ducklake_common::error::DuckLakeError` gives each failure mode its own
//! variant); `IngestError` is the umbrella the orchestrator logs and reacts
//! to. Every variant carries enough context (table, column, sequence) to
//! satisfy the logging contract in the external-interfaces section.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("malformed JSON payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("column {column} has no samples from which to infer a type")]
    NoSamples { column: String },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("value {value:?} does not match any recognized instant pattern")]
    NotAnInstant { value: String },
    #[error("value {value:?} does not match any recognized date pattern")]
    NotADate { value: String },
}

#[derive(Debug, Error)]
pub enum RowError {
    #[error("column {column:?} is non-nullable but missing in message sequence {sequence}")]
    MissingColumn { column: String, sequence: u64 },
    #[error("column {column:?} got an unsupported value shape for its declared type (sequence {sequence})")]
    UnsupportedShape { column: String, sequence: u64 },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("describe failed for table {table:?}: {source}")]
    Describe {
        table: String,
        #[source]
        source: duckdb::Error,
    },
    #[error("table {table:?} not found immediately after reconciliation")]
    MissingAfterReconcile { table: String },
    #[error("create table {table:?} failed: {source}")]
    Create {
        table: String,
        #[source]
        source: duckdb::Error,
    },
    #[error("alter table {table:?} column {column:?} failed: {source}")]
    Alter {
        table: String,
        column: String,
        #[source]
        source: duckdb::Error,
    },
}

#[derive(Debug, Error)]
pub enum AppendError {
    #[error("could not open appender for table {table:?}: {source}")]
    Open {
        table: String,
        #[source]
        source: duckdb::Error,
    },
    #[error("appender rejected row for table {table:?} at sequence {sequence}: {source}")]
    Row {
        table: String,
        sequence: u64,
        #[source]
        source: duckdb::Error,
    },
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("appender close failed for table {table:?}: {source}")]
    Flush {
        table: String,
        #[source]
        source: duckdb::Error,
    },
}

#[derive(Debug, Error)]
pub enum AckError {
    #[error("store succeeded but ack was refused for table {table:?}: {source}")]
    Refused {
        table: String,
        #[source]
        source: async_nats::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to create or update stream {stream:?}: {source}")]
    Stream {
        stream: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to create or update consumer {consumer:?}: {source}")]
    Consumer {
        consumer: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("pull iterator failed: {source}")]
    Pull {
        #[source]
        source: anyhow::Error,
    },
}

/// Umbrella error the orchestrator observes per batch; carries the table the
/// failure occurred on so recovery logging can name it.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Row(#[from] RowError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Append(#[from] AppendError),
    #[error(transparent)]
    Close(#[from] CloseError),
    #[error(transparent)]
    Ack(#[from] AckError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}
