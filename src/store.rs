//! Telemetry persistence collaborator.
//!
//! Handlers consume this interface; the protocol core never touches it.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{GroundlinkError, Result};

/// Minimal document store for telemetry history.
pub trait TelemetryStore: Send + Sync + 'static {
    /// Store a telemetry document. Returns its id.
    ///
    /// The document must be an object with a numeric `time` field.
    fn insert(&self, doc: Value) -> Result<u64>;

    /// The document whose `time` is closest to `timestamp`, if any.
    fn find_nearest(&self, timestamp: f64) -> Result<Option<Value>>;
}

struct Record {
    id: u64,
    time: f64,
    doc: Value,
}

/// In-memory store ordered by `time`.
///
/// `time` is unique: inserting a document with an existing time replaces
/// the stored document and keeps its id.
#[derive(Default)]
pub struct MemoryTelemetryStore {
    records: RwLock<Vec<Record>>,
    next_id: AtomicU64,
}

impl MemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

fn time_of(doc: &Value) -> Result<f64> {
    doc.get("time")
        .and_then(Value::as_f64)
        .ok_or_else(|| GroundlinkError::malformed("telemetry document needs a numeric `time`"))
}

impl TelemetryStore for MemoryTelemetryStore {
    fn insert(&self, doc: Value) -> Result<u64> {
        if !doc.is_object() {
            return Err(GroundlinkError::malformed("telemetry document must be an object"));
        }
        let time = time_of(&doc)?;

        let mut records = self.records.write();
        let index = records.partition_point(|r| r.time < time);

        if let Some(existing) = records.get_mut(index).filter(|r| r.time == time) {
            existing.doc = doc;
            return Ok(existing.id);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        records.insert(index, Record { id, time, doc });
        Ok(id)
    }

    fn find_nearest(&self, timestamp: f64) -> Result<Option<Value>> {
        let records = self.records.read();
        if records.is_empty() {
            return Ok(None);
        }

        // First record at or after the timestamp.
        let after = records.partition_point(|r| r.time < timestamp);

        let nearest = if after == records.len() {
            &records[after - 1]
        } else if after == 0 || records[after].time == timestamp {
            &records[after]
        } else {
            let later = &records[after];
            let earlier = &records[after - 1];
            // Ties go to the later record.
            if (later.time - timestamp).abs() <= (timestamp - earlier.time).abs() {
                later
            } else {
                earlier
            }
        };

        Ok(Some(nearest.doc.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with(times: &[f64]) -> MemoryTelemetryStore {
        let store = MemoryTelemetryStore::new();
        for &time in times {
            store.insert(json!({"time": time, "alt": time * 10.0})).unwrap();
        }
        store
    }

    fn nearest_time(store: &MemoryTelemetryStore, t: f64) -> Option<f64> {
        store
            .find_nearest(t)
            .unwrap()
            .and_then(|doc| doc["time"].as_f64())
    }

    #[test]
    fn test_empty_store() {
        let store = MemoryTelemetryStore::new();
        assert_eq!(store.find_nearest(1.0).unwrap(), None);
    }

    #[test]
    fn test_nearest_picks_closest_side() {
        let store = store_with(&[30.0, 10.0, 20.0]);

        assert_eq!(nearest_time(&store, 14.0), Some(10.0));
        assert_eq!(nearest_time(&store, 16.0), Some(20.0));
        assert_eq!(nearest_time(&store, 15.0), Some(20.0));
        assert_eq!(nearest_time(&store, 20.0), Some(20.0));
    }

    #[test]
    fn test_nearest_out_of_range() {
        let store = store_with(&[10.0, 20.0]);

        assert_eq!(nearest_time(&store, -5.0), Some(10.0));
        assert_eq!(nearest_time(&store, 99.0), Some(20.0));
    }

    #[test]
    fn test_duplicate_time_replaces() {
        let store = MemoryTelemetryStore::new();
        let first = store.insert(json!({"time": 5.0, "alt": 1.0})).unwrap();
        let second = store.insert(json!({"time": 5.0, "alt": 2.0})).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.find_nearest(5.0).unwrap().unwrap()["alt"], json!(2.0));
    }

    #[test]
    fn test_rejects_documents_without_time() {
        let store = MemoryTelemetryStore::new();
        assert!(store.insert(json!({"alt": 1.0})).unwrap_err().is_malformed());
        assert!(store.insert(json!([1, 2])).unwrap_err().is_malformed());
        assert!(store.is_empty());
    }
}
