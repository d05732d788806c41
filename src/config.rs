use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Service configuration
    pub service_name: String,
    pub metrics_port: u16,

    // NATS configuration
    pub nats_url: String,
    pub subject_prefix: String,
    pub stream_name: String,
    pub stream_retention_secs: u64,
    pub consumer_name: String,

    // Store configuration
    pub duckdb_path: String,

    // Batching configuration
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub error_cooldown_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Ok(Config {
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "ekko-ingest-writer".to_string()),

            metrics_port: env::var("METRICS_PORT")
                .unwrap_or_else(|_| "9090".to_string())
                .parse()?,

            nats_url: env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),

            subject_prefix: env::var("SUBJECT_PREFIX").unwrap_or_else(|_| "evt.".to_string()),

            stream_name: env::var("STREAM_NAME").unwrap_or_else(|_| "EVENTS".to_string()),

            stream_retention_secs: env::var("STREAM_RETENTION_SECS")
                .unwrap_or_else(|_| "604800".to_string()) // 7 days
                .parse()?,

            consumer_name: env::var("CONSUMER_NAME").unwrap_or_else(|_| "ekko-ingest-writer".to_string()),

            duckdb_path: env::var("DUCKDB_PATH").unwrap_or_else(|_| "./ekko_ingest.duckdb".to_string()),

            batch_size: env::var("BATCH_SIZE")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,

            batch_timeout_ms: env::var("BATCH_TIMEOUT_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()?,

            error_cooldown_secs: env::var("ERROR_COOLDOWN_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
        })
    }

    /// Subjects the engine's stream should cover: `{prefix}>`.
    pub fn stream_subjects(&self) -> String {
        format!("{}>", self.subject_prefix)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "ekko-ingest-writer".to_string(),
            metrics_port: 9090,
            nats_url: "nats://localhost:4222".to_string(),
            subject_prefix: "evt.".to_string(),
            stream_name: "EVENTS".to_string(),
            stream_retention_secs: 604_800,
            consumer_name: "ekko-ingest-writer".to_string(),
            duckdb_path: "./ekko_ingest.duckdb".to_string(),
            batch_size: 3000,
            batch_timeout_ms: 2000,
            error_cooldown_secs: 10,
        }
    }
}
