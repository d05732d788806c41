//! Prometheus metrics, following the teacher's `register_*!`/`counter!`
//! facade pattern, retargeted at the seams spec §6's Logger interface
//! names: batch size, drain duration, DDL events, recovery events, plus
//! append/ack counts.

use anyhow::Result;
use metrics::{counter, gauge, histogram, register_counter, register_gauge, register_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Installs the global recorder and registers every metric the engine
/// emits. Returns a `PrometheusHandle` so `main.rs` can render `/metrics`
/// from its own `/healthz`-serving `hyper` listener instead of running a
/// second HTTP server, as the teacher's `main.rs` does for its stub.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_counter!("ingest_batches_total", "Total number of batches drained");
    register_counter!("ingest_batches_failed_total", "Total number of batches that failed to drain");
    register_counter!("ingest_rows_appended_total", "Total number of rows appended across all tables");
    register_counter!("ingest_acks_total", "Total number of messages acknowledged");
    register_counter!("ingest_ddl_total", "Total number of DDL statements issued (create or alter)");
    register_counter!("ingest_recoveries_total", "Total number of times the consumer was re-created after a failure");

    register_gauge!("ingest_last_batch_size", "Size of the most recently drained batch");

    register_histogram!("ingest_batch_size", "Number of messages in each drained batch");
    register_histogram!("ingest_drain_duration_seconds", "Time taken to drain one batch");

    info!("metrics recorder installed");
    Ok(handle)
}

/// Metrics helper functions, mirroring the teacher's `Metrics` facade.
pub struct Metrics;

impl Metrics {
    pub fn record_batch_size(size: usize) {
        histogram!("ingest_batch_size").record(size as f64);
        gauge!("ingest_last_batch_size").set(size as f64);
        counter!("ingest_batches_total").increment(1);
    }

    pub fn record_drain_duration(duration_seconds: f64) {
        histogram!("ingest_drain_duration_seconds").record(duration_seconds);
    }

    pub fn batch_failed() {
        counter!("ingest_batches_failed_total").increment(1);
    }

    pub fn rows_appended(count: usize) {
        counter!("ingest_rows_appended_total").increment(count as u64);
    }

    pub fn ack() {
        counter!("ingest_acks_total").increment(1);
    }

    pub fn ddl_issued() {
        counter!("ingest_ddl_total").increment(1);
    }

    pub fn recovery_entered() {
        counter!("ingest_recoveries_total").increment(1);
    }
}
