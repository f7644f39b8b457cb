use serde::{Deserialize, Serialize};

use crate::RowId;

pub type Hash32 = [u8; 32];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Link,
    Unlink,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteEvent {
    pub operation: Operation,
    /// Registry name for row writes, relation name for link writes.
    pub target: String,
    pub row: RowId,
    pub prev_event_hash: Hash32,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub event_hash: Hash32,
    pub event: WriteEvent,
}

/// Append-only, hash-chained record of every write a database accepted.
#[derive(Default)]
pub struct EventLog {
    entries: Vec<LogEntry>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn latest_hash(&self) -> Hash32 {
        self.entries.last().map(|e| e.event_hash).unwrap_or([0u8; 32])
    }

    pub fn record(&mut self, operation: Operation, target: &str, row: RowId) -> crate::Result<Hash32> {
        let event = WriteEvent {
            operation,
            target: target.to_string(),
            row,
            prev_event_hash: self.latest_hash(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        let bytes = bincode::serialize(&event)
            .map_err(|e| crate::RecDbError::Serialization(e.to_string()))?;
        let event_hash: Hash32 = blake3::hash(&bytes).into();
        self.entries.push(LogEntry { event_hash, event });
        Ok(event_hash)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Number of logged writes of `operation` against `target`.
    pub fn count(&self, operation: Operation, target: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.event.operation == operation && e.event.target == target)
            .count()
    }

    pub fn verify_chain(&self) -> bool {
        let mut prev = [0u8; 32];

        for e in &self.entries {
            if e.event.prev_event_hash != prev {
                return false;
            }

            let bytes = match bincode::serialize(&e.event) {
                Ok(b) => b,
                Err(_) => return false,
            };
            let computed: Hash32 = blake3::hash(&bytes).into();
            if computed != e.event_hash {
                return false;
            }

            prev = e.event_hash;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_links_and_counts() {
        let mut log = EventLog::new();
        let h1 = log.record(Operation::Insert, "core.Feature", 1).unwrap();
        log.record(Operation::Insert, "core.Feature", 2).unwrap();
        log.record(Operation::Link, "feature_sets:core.Feature", 1).unwrap();

        assert_eq!(log.entries()[1].event.prev_event_hash, h1);
        assert_eq!(log.count(Operation::Insert, "core.Feature"), 2);
        assert!(log.verify_chain());

        if let Some(last) = log.entries.last_mut() {
            last.event.row ^= 1;
        }
        assert!(!log.verify_chain());
    }
}
