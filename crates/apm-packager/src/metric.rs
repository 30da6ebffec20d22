// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metrics emitted by trace nodes and the keys they are aggregated under.

use crate::constants::GENERAL_PREFIX;
use serde::ser::{SerializeStruct, SerializeTuple};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::hash::BuildHasher;
use ustr::Ustr;

/// One timed observation produced while walking a trace tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeMetric {
    pub name: String,
    pub scope: String,
    pub duration: f64,
    pub exclusive: f64,
}

impl TimeMetric {
    pub fn new(name: String, scope: &str, duration: f64, exclusive: f64) -> Self {
        TimeMetric {
            name,
            scope: scope.to_string(),
            duration,
            exclusive,
        }
    }

    /// Name under which the metric lands in the general table, if it is a
    /// general rollup.
    #[must_use]
    pub fn general_name(&self) -> Option<&str> {
        self.name.strip_prefix(GENERAL_PREFIX)
    }
}

/// Apdex classification of a single web action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApdexMetric {
    pub name: Ustr,
    pub satisfying: u64,
    pub tolerating: u64,
    pub frustrating: u64,
    pub apdex_t: f64,
}

/// Aggregation key of a packet table entry. Unscoped tables use an empty scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub name: Ustr,
    pub scope: Ustr,
}

impl MetricKey {
    pub fn new(name: &str, scope: &str) -> Self {
        MetricKey {
            name: Ustr::from(name),
            scope: Ustr::from(scope),
        }
    }
}

/// Name to id translation maintained by the collector connection.
pub trait MetricIdLookup {
    fn metric_id(&self, key: &str) -> Option<u64>;
}

impl<S: BuildHasher> MetricIdLookup for HashMap<String, u64, S> {
    fn metric_id(&self, key: &str) -> Option<u64> {
        self.get(key).copied()
    }
}

/// How a metric is named in an upload: the server-assigned id when known,
/// the literal name otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadKey {
    Id(u64),
    Name {
        name: String,
        parent: Option<String>,
    },
}

impl UploadKey {
    /// Resolves a scoped component key, looked up as `name:scope`.
    pub fn scoped(key: &MetricKey, ids: &dyn MetricIdLookup) -> Self {
        match ids.metric_id(&format!("{}:{}", key.name, key.scope)) {
            Some(id) => UploadKey::Id(id),
            None => UploadKey::Name {
                name: key.name.to_string(),
                parent: Some(key.scope.to_string()),
            },
        }
    }

    /// Resolves an unscoped key, looked up by its bare name.
    pub fn named(name: &str, ids: &dyn MetricIdLookup) -> Self {
        match ids.metric_id(name) {
            Some(id) => UploadKey::Id(id),
            None => UploadKey::Name {
                name: name.to_string(),
                parent: None,
            },
        }
    }
}

impl Serialize for UploadKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            UploadKey::Id(id) => serializer.serialize_u64(*id),
            UploadKey::Name { name, parent } => {
                let len = if parent.is_some() { 2 } else { 1 };
                let mut state = serializer.serialize_struct("UploadKey", len)?;
                state.serialize_field("name", name)?;
                if let Some(parent) = parent {
                    state.serialize_field("parent", parent)?;
                }
                state.end()
            }
        }
    }
}

/// One drained table row: `[key, packet]`, or `[key, packet, markers]` for
/// actions with quantile tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEntry<P> {
    pub key: UploadKey,
    pub packet: P,
    pub markers: Option<Vec<f64>>,
}

impl<P: Serialize> Serialize for MetricEntry<P> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.markers.is_some() { 3 } else { 2 };
        let mut tuple = serializer.serialize_tuple(len)?;
        tuple.serialize_element(&self.key)?;
        tuple.serialize_element(&self.packet)?;
        if let Some(markers) = &self.markers {
            tuple.serialize_element(markers)?;
        }
        tuple.end()
    }
}

/// Counter computed at drain time, uploaded as `[key, [count]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountEntry {
    pub key: UploadKey,
    pub count: u64,
}

impl Serialize for CountEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.key, [self.count]).serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_general_name() {
        let general = TimeMetric::new("GENERAL/Redis/NULL/All".to_string(), "WebAction/x", 1.0, 1.0);
        assert_eq!(general.general_name(), Some("Redis/NULL/All"));

        let component = TimeMetric::new("Redis/h:1%2F0/GET".to_string(), "WebAction/x", 1.0, 1.0);
        assert_eq!(component.general_name(), None);
    }

    #[test]
    fn test_upload_key_resolution() {
        let mut ids: HashMap<String, u64> = HashMap::new();
        ids.insert("External/a/b:WebAction/x".to_string(), 7);
        ids.insert("Apdex/x".to_string(), 9);

        let known = UploadKey::scoped(&MetricKey::new("External/a/b", "WebAction/x"), &ids);
        assert_eq!(known, UploadKey::Id(7));

        let unknown = UploadKey::scoped(&MetricKey::new("External/a/c", "WebAction/x"), &ids);
        assert_eq!(
            serde_json::to_value(&unknown).expect("failed to serialize"),
            json!({"name": "External/a/c", "parent": "WebAction/x"})
        );

        assert_eq!(UploadKey::named("Apdex/x", &ids), UploadKey::Id(9));
        assert_eq!(
            serde_json::to_value(UploadKey::named("Apdex/y", &ids)).expect("failed to serialize"),
            json!({"name": "Apdex/y"})
        );
    }

    #[test]
    fn test_count_entry_shape() {
        let entry = CountEntry {
            key: UploadKey::Id(3),
            count: 12,
        };
        assert_eq!(
            serde_json::to_value(&entry).expect("failed to serialize"),
            json!([3, [12]])
        );
    }
}
