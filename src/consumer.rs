//! Consumer lifecycle: creates-or-updates the durable stream and pull
//! consumer the orchestrator pulls from.
//!
//! Grounded on `simple_consumer.rs`'s `ensure_stream`/`ensure_consumer`,
//! generalized from a hardcoded blockchain subject/limits pair to the
//! configurable prefix/retention/consumer-name the engine takes at start.

use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer::PullConsumer};
use tokio::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::error::ConsumerError;

/// Creates or updates the durable stream whose subjects are `prefix.>`.
pub async fn ensure_stream(
    jetstream: &jetstream::Context,
    config: &Config,
) -> Result<jetstream::stream::Stream, ConsumerError> {
    let stream_name = &config.stream_name;

    match jetstream.get_stream(stream_name).await {
        Ok(stream) => {
            info!(stream = %stream_name, "using existing stream");
            Ok(stream)
        }
        Err(_) => {
            info!(stream = %stream_name, subjects = %config.stream_subjects(), "creating stream");
            jetstream
                .create_stream(jetstream::stream::Config {
                    name: stream_name.clone(),
                    subjects: vec![config.stream_subjects()],
                    retention: jetstream::stream::RetentionPolicy::Limits,
                    max_age: Duration::from_secs(config.stream_retention_secs),
                    storage: jetstream::stream::StorageType::File,
                    discard: jetstream::stream::DiscardPolicy::Old,
                    ..Default::default()
                })
                .await
                .context("failed to create stream")
                .map_err(|source| ConsumerError::Stream {
                    stream: stream_name.clone(),
                    source,
                })
        }
    }
}

/// Creates or updates the durable pull consumer, with `max_ack_pending`
/// equal to the configured batch size bound (spec §4.7/§6).
pub async fn ensure_consumer(
    stream: &jetstream::stream::Stream,
    config: &Config,
) -> Result<PullConsumer, ConsumerError> {
    let consumer_name = &config.consumer_name;

    match stream.get_consumer(consumer_name).await {
        Ok(consumer) => {
            info!(consumer = %consumer_name, "using existing consumer");
            Ok(consumer)
        }
        Err(_) => {
            info!(consumer = %consumer_name, "creating consumer");
            stream
                .create_consumer(jetstream::consumer::pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    filter_subject: config.stream_subjects(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    max_ack_pending: config.batch_size as i64,
                    ..Default::default()
                })
                .await
                .context("failed to create consumer")
                .map_err(|source| ConsumerError::Consumer {
                    consumer: consumer_name.clone(),
                    source,
                })
        }
    }
}

/// Creates-or-updates the stream, then the consumer under it. Matches the
/// `start(prefix, streamName, retention, consumerName)` contract of §4.7 —
/// the prefix/retention/name are all carried on `config`.
pub async fn start(
    jetstream: &jetstream::Context,
    config: &Config,
) -> Result<PullConsumer, ConsumerError> {
    let stream = ensure_stream(jetstream, config).await?;
    ensure_consumer(&stream, config).await
}
