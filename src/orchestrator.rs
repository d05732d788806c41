//! Batch assembly, per-table reconciliation, row building and ack — the
//! engine's single supervised loop.
//!
//! Grounded on `simple_consumer.rs`'s `process_messages` pull loop,
//! generalized from per-message ack to the spec's batch state machine, and
//! on `delta_writer.rs`'s `start_background_writer` `tokio::select!` shape
//! (channel recv / timer tick / else-break) for the Filling/Draining loop.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::consumer;
use crate::error::{AckError, IngestError};
use crate::inference::infer_column_type;
use crate::message::{from_nats_time, Message};
use crate::metrics::Metrics;
use crate::ordered_json::{decode_ordered, OrderedObject};
use crate::reconcile::{reconcile, BatchSchema, ColumnStore, SchemaCache, RESERVED_ID, RESERVED_TS};
use crate::row_builder::build_row;
use crate::value::Value;

const ID_HEADER: &str = "Nats-Msg-Id";

/// One pulled message paired with the raw JetStream handle needed to ack
/// it — kept out of `message::Message` so that type stays usable in tests
/// without a live NATS connection.
struct Pulled {
    message: Message,
    raw: jetstream::Message,
}

fn to_engine_message(raw: &jetstream::Message) -> Message {
    let id_header = raw
        .headers
        .as_ref()
        .and_then(|headers| headers.get(ID_HEADER))
        .map(|value| value.to_string());

    let (sequence, timestamp) = match raw.info() {
        Ok(info) => (info.stream_sequence, from_nats_time(info.published)),
        Err(_) => (0, chrono::Utc::now()),
    };

    Message {
        payload: raw.payload.to_vec(),
        subject: raw.subject.to_string(),
        id_header,
        sequence,
        timestamp,
    }
}

/// The supervised ingest engine: owns the consumer handle, the store handle
/// and the per-table schema cache, and runs the Idle/Filling/Draining/
/// Recovering/Stopping state machine of spec §4.6.
#[derive(Clone)]
pub struct Engine {
    config: Config,
    jetstream: jetstream::Context,
    store: Arc<dyn ColumnStore>,
    cancellation: CancellationToken,
}

impl Engine {
    pub fn new(config: Config, jetstream: jetstream::Context, store: Arc<dyn ColumnStore>) -> Self {
        Self {
            config,
            jetstream,
            store,
            cancellation: CancellationToken::new(),
        }
    }

    /// Signals shutdown. Does not block — the caller should await the
    /// `JoinHandle` of the spawned `run()` to know when the engine has
    /// actually returned (consumer.rs §4.7's `stop()` contract).
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    /// Runs until `stop()` is called, draining best-effort on the way out,
    /// or returns an error only if the very first consumer creation fails
    /// (a mid-run re-creation failure is fatal to the process, per §4.6).
    pub async fn run(&self) -> Result<(), IngestError> {
        let mut cache = SchemaCache::new();
        let mut active_consumer = consumer::start(&self.jetstream, &self.config).await?;

        loop {
            let (tx, rx) = mpsc::channel(self.config.batch_size);
            let puller = tokio::spawn(run_puller(
                active_consumer.clone(),
                tx,
                self.cancellation.clone(),
            ));

            let outcome = fill_and_drain(&self.config, self.store.as_ref(), &mut cache, rx, &self.cancellation).await;
            let _ = puller.await;

            match outcome {
                DrainOutcome::Stopped => return Ok(()),
                DrainOutcome::Failed(err) => {
                    error!(
                        error = %err,
                        cooldown_secs = self.config.error_cooldown_secs,
                        "batch drain failed; entering recovery"
                    );
                    Metrics::batch_failed();
                    Metrics::recovery_entered();
                    // The failing table's cache entry may be stale relative
                    // to the store (a partially-applied ALTER before a
                    // later column's DDL failed); spec §3 forbids trusting
                    // any of it across this restart.
                    cache.clear();
                    sleep(Duration::from_secs(self.config.error_cooldown_secs)).await;

                    active_consumer = match consumer::start(&self.jetstream, &self.config).await {
                        Ok(c) => c,
                        Err(e) => {
                            error!(error = %e, "failed to re-create consumer after drain failure; exiting");
                            std::process::exit(1);
                        }
                    };
                }
            }
        }
    }
}

async fn run_puller(consumer: PullConsumer, tx: mpsc::Sender<Pulled>, cancellation: CancellationToken) {
    let mut messages = match consumer.messages().await {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "failed to start pull iterator");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            next = messages.next() => match next {
                Some(Ok(raw)) => {
                    let message = to_engine_message(&raw);
                    if tx.send(Pulled { message, raw }).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "pull iterator error");
                    break;
                }
                None => break,
            },
        }
    }
}

enum DrainOutcome {
    Stopped,
    Failed(IngestError),
}

type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn pending_forever() -> TimerFuture {
    Box::pin(std::future::pending())
}

/// Decides what a finished drain attempt means for the state machine,
/// isolated as a pure function so the Stopping-vs-Recovering split is
/// unit-testable without a live pull loop. A failure during the final,
/// best-effort drain of a Stopping batch must end the loop cleanly — spec
/// §5 "no new consumer is created during shutdown" — rather than falling
/// into the ordinary Recovering path that `Failed` drives.
fn finalize_drain(
    stopping: bool,
    channel_closed: bool,
    drained: Result<(), IngestError>,
) -> std::ops::ControlFlow<DrainOutcome> {
    use std::ops::ControlFlow;

    match drained {
        Err(err) if stopping => {
            error!(
                error = %err,
                "final drain on shutdown failed; messages will be redelivered, not re-creating consumer"
            );
            ControlFlow::Break(DrainOutcome::Stopped)
        }
        Err(err) => ControlFlow::Break(DrainOutcome::Failed(err)),
        Ok(()) if stopping || channel_closed => ControlFlow::Break(DrainOutcome::Stopped),
        Ok(()) => ControlFlow::Continue(()),
    }
}

/// Idle → Filling → Draining, repeated until the channel closes with an
/// empty batch (clean stop) or a drain fails (recovery).
async fn fill_and_drain(
    config: &Config,
    store: &dyn ColumnStore,
    cache: &mut SchemaCache,
    mut rx: mpsc::Receiver<Pulled>,
    cancellation: &CancellationToken,
) -> DrainOutcome {
    loop {
        let mut batch: Vec<Pulled> = Vec::new();
        let mut timer: TimerFuture = pending_forever();
        let mut channel_closed = false;
        // Set when cancellation forces this batch to its final, best-effort
        // drain (spec §4.6 Stopping / §5 "cancellation is propagated once").
        // A failure in that drain must not fall into the ordinary
        // Recovering path: no new consumer may be created during shutdown.
        let mut stopping = false;

        loop {
            tokio::select! {
                _ = cancellation.cancelled(), if batch.is_empty() => {
                    return DrainOutcome::Stopped;
                }
                _ = cancellation.cancelled(), if !batch.is_empty() => {
                    stopping = true;
                    break;
                }
                _ = &mut timer => {
                    break;
                }
                received = rx.recv() => match received {
                    Some(pulled) => {
                        if batch.is_empty() {
                            timer = Box::pin(sleep(Duration::from_millis(config.batch_timeout_ms)));
                        }
                        batch.push(pulled);
                        if batch.len() >= config.batch_size {
                            break;
                        }
                    }
                    None => {
                        channel_closed = true;
                        break;
                    }
                },
            }
        }

        if batch.is_empty() {
            if channel_closed {
                return DrainOutcome::Stopped;
            }
            continue;
        }

        let drained = drain_batch(config, store, cache, &batch).await;
        if let std::ops::ControlFlow::Break(outcome) = finalize_drain(stopping, channel_closed, drained) {
            return outcome;
        }
    }
}

/// Groups the batch by target table and drains each table sequentially
/// (spec §4.6 Draining): a failure on one table aborts the whole batch —
/// no further tables are processed, nothing not-yet-acked gets acked.
async fn drain_batch(
    config: &Config,
    store: &dyn ColumnStore,
    cache: &mut SchemaCache,
    batch: &[Pulled],
) -> Result<(), IngestError> {
    let start = Instant::now();
    let mut order: Vec<String> = Vec::new();
    let mut by_table: HashMap<String, Vec<&Pulled>> = HashMap::new();

    for pulled in batch {
        let table = match pulled.message.table_name(&config.subject_prefix) {
            Some(t) => t,
            None => {
                warn!(subject = %pulled.message.subject, "subject does not match configured prefix, skipping");
                continue;
            }
        };
        by_table.entry(table.clone()).or_insert_with(|| {
            order.push(table.clone());
            Vec::new()
        }).push(pulled);
    }

    for table in &order {
        let pulled = &by_table[table];
        let messages: Vec<&Message> = pulled.iter().map(|p| &p.message).collect();
        drain_table(store, cache, table, &messages)?;
        for p in pulled {
            ack(&p.raw, table).await?;
        }
    }

    let elapsed = start.elapsed();
    info!(
        batch_size = batch.len(),
        tables = order.len(),
        elapsed_ms = elapsed.as_millis(),
        "batch drained"
    );
    Metrics::record_batch_size(batch.len());
    Metrics::record_drain_duration(elapsed.as_secs_f64());
    Ok(())
}

/// Decodes, infers, reconciles, builds and appends rows for one table's
/// share of the batch. Synchronous from the orchestrator's point of view —
/// DDL/append calls block this task, per spec §5. Takes `message::Message`
/// rather than the NATS-coupled `Pulled` so it's unit-testable without a
/// live connection.
fn drain_table(
    store: &dyn ColumnStore,
    cache: &mut SchemaCache,
    table: &str,
    messages: &[&Message],
) -> Result<(), IngestError> {
    let mut decoded: Vec<OrderedObject> = Vec::with_capacity(messages.len());
    for message in messages {
        decoded.push(decode_ordered(&message.payload)?);
    }

    let mut schema = BatchSchema::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut field_order: Vec<&str> = Vec::new();
    for obj in &decoded {
        for name in obj.ordered_names() {
            if name == RESERVED_ID || name == RESERVED_TS {
                continue;
            }
            if seen.insert(name) {
                field_order.push(name);
            }
        }
    }

    for field in &field_order {
        let samples: Vec<&Value> = decoded.iter().filter_map(|o| o.get(field)).collect();
        schema.observe_field(field, infer_column_type(&samples));
    }

    let columns = reconcile(store, cache, table, &schema)?;

    let mut rows = Vec::with_capacity(messages.len());
    for (message, obj) in messages.iter().zip(decoded.iter()) {
        rows.push(build_row(&columns, obj, message)?);
    }

    store.append_rows(table, &rows)?;
    Ok(())
}

async fn ack(raw: &jetstream::Message, table: &str) -> Result<(), IngestError> {
    raw.ack()
        .await
        .map_err(|source| AckError::Refused {
            table: table.to_string(),
            source,
        })?;
    Metrics::ack();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::DuckDbStore;
    use chrono::{TimeZone, Utc};

    fn msg(payload: &'static [u8], sequence: u64) -> Message {
        Message {
            payload: payload.to_vec(),
            subject: "evt.sales".to_string(),
            id_header: None,
            sequence,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    #[test]
    fn create_on_first_message_matches_spec_scenario_1() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let mut cache = SchemaCache::new();
        let message = msg(br#"{"price":9.5,"region":"eu"}"#, 1);

        drain_table(&store, &mut cache, "sales", &[&message]).unwrap();

        let columns = store.describe("sales").unwrap().unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["_id", "_ts", "price", "region"]);
    }

    #[test]
    fn schema_evolves_across_batches_matches_spec_scenario_2() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let mut cache = SchemaCache::new();

        let first = msg(br#"{"a":1}"#, 1);
        drain_table(&store, &mut cache, "sales", &[&first]).unwrap();

        let second = msg(br#"{"a":2,"b":"x","c":true}"#, 2);
        drain_table(&store, &mut cache, "sales", &[&second]).unwrap();

        let columns = store.describe("sales").unwrap().unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["_id", "_ts", "a", "b", "c"]);
    }

    #[test]
    fn missing_non_nullable_column_fails_whole_table_drain_matches_spec_scenario_4() {
        let store = DuckDbStore::open_in_memory().unwrap();
        store.with_connection(|conn| {
            conn.execute(
                "CREATE TABLE sales (_id VARCHAR NOT NULL, _ts TIMESTAMP NOT NULL, price DOUBLE NOT NULL)",
                [],
            )
        }).unwrap();
        let mut cache = SchemaCache::new();

        let message = msg(br#"{"region":"eu"}"#, 42);
        let err = drain_table(&store, &mut cache, "sales", &[&message]).unwrap_err();

        match err {
            IngestError::Row(crate::error::RowError::MissingColumn { column, sequence }) => {
                assert_eq!(column, "price");
                assert_eq!(sequence, 42);
            }
            other => panic!("expected RowError::MissingColumn, got {other:?}"),
        }
    }

    #[test]
    fn mixed_type_field_infers_json_matches_spec_scenario_5() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let mut cache = SchemaCache::new();

        let a = msg(br#"{"x":1}"#, 1);
        let b = msg(br#"{"x":"a"}"#, 2);
        drain_table(&store, &mut cache, "sales", &[&a, &b]).unwrap();

        let columns = store.describe("sales").unwrap().unwrap();
        let x = columns.iter().find(|c| c.name == "x").unwrap();
        assert_eq!(x.ty, crate::inference::ColumnType::Json);

        // Both values must land as their JSON representations, not their
        // native SQL shape — spec §8 scenario 5.
        let stored: Vec<String> = store.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT x FROM sales").unwrap();
            stmt.query_map([], |row| row.get::<_, String>(0))
                .unwrap()
                .collect::<Result<Vec<_>, _>>()
                .unwrap()
        });
        let mut parsed: Vec<serde_json::Value> = stored
            .iter()
            .map(|s| serde_json::from_str(s).expect("stored JSON column value must be valid JSON"))
            .collect();
        parsed.sort_by_key(|v| v.to_string());
        let mut expected = vec![serde_json::json!(1.0), serde_json::json!("a")];
        expected.sort_by_key(|v| v.to_string());
        assert_eq!(parsed, expected);
    }

    #[test]
    fn failed_final_drain_during_stopping_returns_stopped_not_failed() {
        let err = IngestError::Row(crate::error::RowError::MissingColumn {
            column: "price".to_string(),
            sequence: 1,
        });
        let outcome = finalize_drain(true, false, Err(err));
        assert!(matches!(outcome, std::ops::ControlFlow::Break(DrainOutcome::Stopped)));
    }

    #[test]
    fn failed_drain_outside_stopping_triggers_recovery() {
        let err = IngestError::Row(crate::error::RowError::MissingColumn {
            column: "price".to_string(),
            sequence: 1,
        });
        let outcome = finalize_drain(false, false, Err(err));
        assert!(matches!(
            outcome,
            std::ops::ControlFlow::Break(DrainOutcome::Failed(_))
        ));
    }

    #[test]
    fn successful_drain_while_stopping_still_stops() {
        let outcome = finalize_drain(true, false, Ok(()));
        assert!(matches!(outcome, std::ops::ControlFlow::Break(DrainOutcome::Stopped)));
    }

    #[test]
    fn successful_drain_while_channel_closed_stops() {
        let outcome = finalize_drain(false, true, Ok(()));
        assert!(matches!(outcome, std::ops::ControlFlow::Break(DrainOutcome::Stopped)));
    }

    #[test]
    fn successful_drain_mid_run_continues_filling() {
        let outcome = finalize_drain(false, false, Ok(()));
        assert!(matches!(outcome, std::ops::ControlFlow::Continue(())));
    }

    #[test]
    fn pending_forever_timer_never_resolves() {
        let mut task = tokio_test::task::spawn(pending_forever());
        tokio_test::assert_pending!(task.poll());
    }

    #[tokio::test]
    async fn empty_batch_produces_no_ddl_and_no_appends() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let mut cache = SchemaCache::new();
        let config = Config {
            subject_prefix: "evt.".to_string(),
            ..Config::default()
        };
        let empty: Vec<Pulled> = Vec::new();

        drain_batch(&config, &store, &mut cache, &empty).await.unwrap();

        assert!(store.describe("sales").unwrap().is_none());
    }
}
