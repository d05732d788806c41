//! The engine's own message representation, decoupled from `async-nats`'s
//! JetStream message type so the orchestrator/row-builder stay testable
//! without a live NATS connection.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Vec<u8>,
    pub subject: String,
    pub id_header: Option<String>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Target table name: the subject with the configured prefix stripped.
    /// A subject not matching the prefix should not occur given the
    /// consumer's filter subject, but is defensively reported by the caller.
    pub fn table_name(&self, prefix: &str) -> Option<String> {
        self.subject.strip_prefix(prefix).map(|s| s.to_string())
    }
}

/// `async-nats` surfaces JetStream delivery metadata (`Info::published`) as
/// `time::OffsetDateTime`, not `chrono`; this is the one seam that converts.
pub fn from_nats_time(t: time::OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(t.unix_timestamp(), t.nanosecond()).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_strips_configured_prefix() {
        let message = Message {
            payload: Vec::new(),
            subject: "evt.sales".to_string(),
            id_header: None,
            sequence: 1,
            timestamp: Utc::now(),
        };
        assert_eq!(message.table_name("evt."), Some("sales".to_string()));
        assert_eq!(message.table_name("other."), None);
    }

    #[test]
    fn nats_time_round_trips_through_unix_seconds() {
        let t = time::OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let converted = from_nats_time(t);
        assert_eq!(converted.timestamp(), 1_700_000_000);
    }
}
