use crate::harvest::util::{iso_timestamp, utc_now};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Monotonic accumulator with its own lock.
#[derive(Debug, Default)]
pub struct Counter {
    value: Mutex<u64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, amount: u64) {
        *self.value.lock() += amount;
    }

    pub fn incr(&self) {
        self.increment(1);
    }

    pub fn value(&self) -> u64 {
        *self.value.lock()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub collection_id: String,
    pub harvest_timestamp: String,
    pub items: u64,
    pub files: u64,
    pub file_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harvest_end_timestamp: Option<String>,
}

/// Live counters for one session.
#[derive(Debug)]
pub struct HarvestStats {
    pub collection_id: String,
    pub harvest_timestamp: NaiveDateTime,
    pub items: Counter,
    pub files: Counter,
    pub bytes: Counter,
    end_timestamp: Mutex<Option<NaiveDateTime>>,
}

impl HarvestStats {
    pub fn new(collection_id: impl Into<String>, harvest_timestamp: NaiveDateTime) -> Self {
        Self {
            collection_id: collection_id.into(),
            harvest_timestamp,
            items: Counter::new(),
            files: Counter::new(),
            bytes: Counter::new(),
            end_timestamp: Mutex::new(None),
        }
    }

    /// Marks the collection phase as finished. Later calls keep the first timestamp.
    pub fn end(&self) {
        let mut end = self.end_timestamp.lock();
        if end.is_none() {
            *end = Some(utc_now());
        }
    }

    #[cfg(test)]
    pub fn ended(&self) -> bool {
        self.end_timestamp.lock().is_some()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            collection_id: self.collection_id.clone(),
            harvest_timestamp: iso_timestamp(&self.harvest_timestamp),
            items: self.items.value(),
            files: self.files.value(),
            file_bytes: self.bytes.value(),
            harvest_end_timestamp: self.end_timestamp.lock().as_ref().map(iso_timestamp),
        }
    }
}
