// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deduplicated error, exception and external-error records.
//!
//! Identical failures are folded under a filter key built from the action and
//! the failure's identity. Each table keeps one representative record per key
//! plus an occurrence count; the count is stamped onto the record when the
//! table is drained.

use crate::node::TrackerType;
use crate::util::FnvHashMap;
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use tracing::debug;

/// A record whose occurrence count is part of its upload shape.
pub trait Counted {
    fn set_count(&mut self, count: u64);
}

/// Error trace uploaded as
/// `[time, action, http_status, class, message, count, request_uri, params_json, trace_guid]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TracedError {
    pub error_time: i64,
    pub action: String,
    pub http_status: u16,
    pub class_name: String,
    pub message: String,
    pub count: u64,
    pub request_uri: String,
    pub params: String,
    pub trace_guid: Option<String>,
}

impl Counted for TracedError {
    fn set_count(&mut self, count: u64) {
        self.count = count;
    }
}

impl Serialize for TracedError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(9)?;
        tuple.serialize_element(&self.error_time)?;
        tuple.serialize_element(&self.action)?;
        tuple.serialize_element(&self.http_status)?;
        tuple.serialize_element(&self.class_name)?;
        tuple.serialize_element(&self.message)?;
        tuple.serialize_element(&self.count)?;
        tuple.serialize_element(&self.request_uri)?;
        tuple.serialize_element(&self.params)?;
        tuple.serialize_element(&self.trace_guid)?;
        tuple.end()
    }
}

/// Exception trace, same layout as an error trace with a zero status.
#[derive(Debug, Clone, PartialEq)]
pub struct TracedException {
    pub exception_time: i64,
    pub action: String,
    pub class_name: String,
    pub message: String,
    pub count: u64,
    pub request_uri: String,
    pub params: String,
    pub trace_guid: Option<String>,
}

impl Counted for TracedException {
    fn set_count(&mut self, count: u64) {
        self.count = count;
    }
}

impl Serialize for TracedException {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(9)?;
        tuple.serialize_element(&self.exception_time)?;
        tuple.serialize_element(&self.action)?;
        tuple.serialize_element(&0)?;
        tuple.serialize_element(&self.class_name)?;
        tuple.serialize_element(&self.message)?;
        tuple.serialize_element(&self.count)?;
        tuple.serialize_element(&self.request_uri)?;
        tuple.serialize_element(&self.params)?;
        tuple.serialize_element(&self.trace_guid)?;
        tuple.end()
    }
}

/// Failed outgoing call uploaded as
/// `[time, metric_name, status_code, class, count, action, params_json]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TracedExternalError {
    pub error_time: i64,
    pub metric_name: String,
    pub status_code: u16,
    pub class_name: String,
    pub count: u64,
    pub action: String,
    pub params: String,
}

impl Counted for TracedExternalError {
    fn set_count(&mut self, count: u64) {
        self.count = count;
    }
}

impl Serialize for TracedExternalError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(7)?;
        tuple.serialize_element(&self.error_time)?;
        tuple.serialize_element(&self.metric_name)?;
        tuple.serialize_element(&self.status_code)?;
        tuple.serialize_element(&self.class_name)?;
        tuple.serialize_element(&self.count)?;
        tuple.serialize_element(&self.action)?;
        tuple.serialize_element(&self.params)?;
        tuple.end()
    }
}

/// Where a failure happened, as used by the drain-time rollup counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub action: String,
    pub class_name: String,
    pub tracker_type: TrackerType,
    /// Status of the action an external call failed in.
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupEntry<T> {
    pub count: u64,
    pub origin: Origin,
    pub record: T,
}

impl<T> DedupEntry<T> {
    pub fn new(origin: Origin, record: T) -> Self {
        DedupEntry {
            count: 1,
            origin,
            record,
        }
    }
}

/// A freshly captured failure and the key it deduplicates under.
#[derive(Debug, Clone, PartialEq)]
pub struct Captured<T> {
    pub filter_key: String,
    pub entry: DedupEntry<T>,
}

/// Keyed dedup table of one failure category.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupTable<T> {
    entries: FnvHashMap<String, DedupEntry<T>>,
}

impl<T> Default for DedupTable<T> {
    fn default() -> Self {
        DedupTable {
            entries: FnvHashMap::default(),
        }
    }
}

impl<T> DedupTable<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, filter_key: &str) -> Option<&DedupEntry<T>> {
        self.entries.get(filter_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DedupEntry<T>)> {
        self.entries.iter()
    }

    /// Folds `entry` under `filter_key`. An existing key always accumulates;
    /// a new key is only admitted while the table holds fewer than `cap`
    /// entries. Returns whether the entry was kept.
    pub fn insert_capped(
        &mut self,
        filter_key: String,
        entry: DedupEntry<T>,
        cap: Option<usize>,
    ) -> bool {
        if let Some(existing) = self.entries.get_mut(&filter_key) {
            existing.count += entry.count;
            return true;
        }
        if let Some(cap) = cap {
            if self.entries.len() >= cap {
                debug!(
                    "Dedup table reached its limit of {} entries, dropping {}",
                    cap, filter_key
                );
                return false;
            }
        }
        self.entries.insert(filter_key, entry);
        true
    }

    /// Folds every entry of `other` into this table.
    pub fn absorb(&mut self, other: DedupTable<T>, cap: Option<usize>) {
        for (filter_key, entry) in other.entries {
            self.insert_capped(filter_key, entry, cap);
        }
    }
}

impl<T: Counted> DedupTable<T> {
    /// Empties the table, returning each representative stamped with its
    /// occurrence count.
    pub fn drain_records(&mut self) -> Vec<T> {
        self.entries
            .drain()
            .map(|(_, mut entry)| {
                entry.record.set_count(entry.count);
                entry.record
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(class_name: &str) -> DedupEntry<TracedExternalError> {
        DedupEntry::new(
            Origin {
                action: "WebAction/app/pay".to_string(),
                class_name: class_name.to_string(),
                tracker_type: TrackerType::External,
                status_code: Some(502),
            },
            TracedExternalError {
                error_time: 1_700_000_000,
                metric_name: "External/pay.local/reqwest".to_string(),
                status_code: 502,
                class_name: class_name.to_string(),
                count: 1,
                action: "WebAction/app/pay".to_string(),
                params: "{}".to_string(),
            },
        )
    }

    #[test]
    fn test_existing_keys_accumulate_past_cap() {
        let mut table = DedupTable::default();
        assert!(table.insert_capped("a".to_string(), entry("Timeout"), Some(1)));
        assert!(!table.insert_capped("b".to_string(), entry("Refused"), Some(1)));
        assert!(table.insert_capped("a".to_string(), entry("Timeout"), Some(1)));

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("a").map(|e| e.count), Some(2));
    }

    #[test]
    fn test_uncapped_absorb() {
        let mut live = DedupTable::default();
        live.insert_capped("a".to_string(), entry("Timeout"), None);

        let mut other = DedupTable::default();
        other.insert_capped("a".to_string(), entry("Timeout"), None);
        other.insert_capped("b".to_string(), entry("Refused"), None);

        live.absorb(other, None);
        assert_eq!(live.len(), 2);
        assert_eq!(live.get("a").map(|e| e.count), Some(2));
    }

    #[test]
    fn test_drain_stamps_count() {
        let mut table = DedupTable::default();
        for _ in 0..3 {
            table.insert_capped("a".to_string(), entry("Timeout"), Some(20));
        }

        let records = table.drain_records();
        assert!(table.is_empty());
        assert_eq!(
            serde_json::to_value(&records).expect("failed to serialize"),
            json!([[
                1_700_000_000,
                "External/pay.local/reqwest",
                502,
                "Timeout",
                3,
                "WebAction/app/pay",
                "{}"
            ]])
        );
    }
}
