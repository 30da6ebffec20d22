// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The aggregation engine.
//!
//! A [`Packager`] owns every table that accumulates between two uploads.
//! Finished trackers are folded in with [`Packager::record`], either directly
//! or through a data zone ([`Packager::create_data_zone`]) that is later merged
//! into the live instance. The uploader takes a [`Packager::packets_snapshot`],
//! drains it through the accessors below and, if the upload fails, hands it
//! back with [`Packager::rollback`].
//!
//! All state sits behind one mutex. Trees are digested outside the lock, so a
//! record holds the lock only while folding precomputed values.

use crate::config::Settings;
use crate::errors;
use crate::metric::{
    ApdexMetric, CountEntry, MetricEntry, MetricIdLookup, MetricKey, TimeMetric, UploadKey,
};
use crate::node::{SlowActionRecord, SlowSqlNode, TrackerNode, TrackerType};
use crate::packet::{ApdexPacket, SlowSqlPacket, TimePacket};
use crate::payload::{ActionTraceData, SlowSqlTrace, SqlTraceData};
use crate::quantile::QuantileP2;
use crate::traced::{Captured, DedupTable, TracedError, TracedException, TracedExternalError};
use crate::util::FnvHashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};
use ustr::Ustr;

/// Everything one tracker contributes, computed before taking the lock.
struct TrackerDigest {
    time_metrics: Vec<TimeMetric>,
    quantile_sample: Option<(Ustr, f64)>,
    action_metric: Option<TimeMetric>,
    apdex_metric: Option<ApdexMetric>,
    slow_action: Option<SlowActionRecord>,
    error: Option<Captured<TracedError>>,
    exceptions: Vec<Captured<TracedException>>,
    external_errors: Vec<Captured<TracedExternalError>>,
    slow_sql: Vec<SlowSqlNode>,
}

impl TrackerDigest {
    fn new(tracker: &TrackerNode, settings: &Settings) -> Self {
        // Slow-action capture comes first: its record counts the errors and
        // exceptions of the tracker.
        let slow_action = if settings.action_tracer.enabled {
            tracker.slow_action_trace(
                settings.action_tracer_nodes,
                settings.action_tracer.action_threshold,
            )
        } else {
            None
        };

        let (error, exceptions, external_errors) = if settings.error_collector.enabled {
            (
                tracker.traced_error(),
                tracker.traced_exception(settings.exception.max_msg_character),
                tracker.traced_external_error(),
            )
        } else {
            (None, Vec::new(), Vec::new())
        };

        let quantile_sample = if settings.quantile_enabled() {
            let (action, duration) = tracker.quantile();
            Some((Ustr::from(action), duration))
        } else {
            None
        };

        TrackerDigest {
            time_metrics: tracker.time_metrics(),
            quantile_sample,
            action_metric: tracker.action_metrics(),
            apdex_metric: tracker.apdex_metrics(),
            slow_action,
            error,
            exceptions,
            external_errors,
            slow_sql: if settings.action_tracer.slow_sql {
                tracker.slow_sql_nodes()
            } else {
                Vec::new()
            },
        }
    }
}

/// Dedup tables are capped when folding fresh data and uncapped when
/// restoring a rolled back snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Capped,
    Restore,
}

#[derive(Debug, Clone, Default)]
struct PacketTables {
    time_packets: FnvHashMap<MetricKey, TimePacket>,
    general_packets: FnvHashMap<Ustr, TimePacket>,
    action_packets: FnvHashMap<Ustr, TimePacket>,
    apdex_packets: FnvHashMap<Ustr, ApdexPacket>,
    traced_errors: DedupTable<TracedError>,
    traced_exceptions: DedupTable<TracedException>,
    traced_external_errors: DedupTable<TracedExternalError>,
    slow_actions: FnvHashMap<Ustr, Vec<SlowActionRecord>>,
    slow_sql_packets: FnvHashMap<String, SlowSqlPacket>,
    /// One estimator per action.
    quantiles: FnvHashMap<Ustr, QuantileP2>,
}

fn merge_time_packets<K: std::hash::Hash + Eq>(
    live: &mut FnvHashMap<K, TimePacket>,
    other: FnvHashMap<K, TimePacket>,
) {
    for (key, packet) in other {
        live.entry(key).or_default().merge_packets(&packet);
    }
}

/// Keeps the `top_n` slowest traces of a bucket, slowest first.
fn keep_slowest(bucket: &mut Vec<SlowActionRecord>, top_n: usize) {
    if bucket.len() > top_n {
        bucket.sort_by(|a, b| b.duration.total_cmp(&a.duration));
        bucket.truncate(top_n);
    }
}

impl PacketTables {
    fn record_time_metric(&mut self, metric: &TimeMetric) {
        match metric.general_name() {
            Some(general) => self
                .general_packets
                .entry(Ustr::from(general))
                .or_default()
                .merge_time_metric(metric),
            None => self
                .time_packets
                .entry(MetricKey::new(&metric.name, &metric.scope))
                .or_default()
                .merge_time_metric(metric),
        }
    }

    fn record_slow_action(&mut self, record: SlowActionRecord, top_n: usize) {
        let bucket = self
            .slow_actions
            .entry(Ustr::from(record.path.as_str()))
            .or_default();
        bucket.push(record);
        keep_slowest(bucket, top_n);
    }

    fn record_slow_sql(&mut self, key: String, packet: SlowSqlPacket, max_sql: usize) {
        if let Some(existing) = self.slow_sql_packets.get_mut(&key) {
            existing.merge_packets(packet);
        } else if self.slow_sql_packets.len() < max_sql {
            self.slow_sql_packets.insert(key, packet);
        } else {
            debug!("Slow sql count reached its limit of {}, dropping {}", max_sql, key);
        }
    }

    fn apply(&mut self, digest: TrackerDigest, settings: &Settings) {
        for metric in &digest.time_metrics {
            self.record_time_metric(metric);
        }
        if let Some((action, duration)) = digest.quantile_sample {
            self.quantiles
                .entry(action)
                .or_insert_with(|| QuantileP2::new(&settings.quantile))
                .add(duration);
        }
        if let Some(metric) = digest.action_metric {
            self.action_packets
                .entry(Ustr::from(metric.name.as_str()))
                .or_default()
                .merge_time_metric(&metric);
        }
        if let Some(metric) = digest.apdex_metric {
            self.apdex_packets
                .entry(metric.name)
                .or_insert_with(|| ApdexPacket::new(metric.apdex_t))
                .merge_apdex_metric(&metric);
        }
        if let Some(record) = digest.slow_action {
            self.record_slow_action(record, settings.action_tracer.max_action_trace_per_action);
        }

        let error_cap = Some(settings.max_error_trace);
        if let Some(captured) = digest.error {
            self.traced_errors
                .insert_capped(captured.filter_key, captured.entry, error_cap);
        }
        for captured in digest.exceptions {
            self.traced_exceptions.insert_capped(
                captured.filter_key,
                captured.entry,
                Some(settings.exception.max_type_count),
            );
        }
        for captured in digest.external_errors {
            self.traced_external_errors
                .insert_capped(captured.filter_key, captured.entry, error_cap);
        }

        for node in digest.slow_sql {
            self.record_slow_sql(
                node.metric.clone(),
                SlowSqlPacket::new(node),
                settings.slow_sql_count,
            );
        }
    }

    fn absorb(&mut self, other: PacketTables, settings: &Settings, admission: Admission) {
        merge_time_packets(&mut self.time_packets, other.time_packets);
        merge_time_packets(&mut self.general_packets, other.general_packets);
        merge_time_packets(&mut self.action_packets, other.action_packets);
        for (key, packet) in other.apdex_packets {
            match self.apdex_packets.get_mut(&key) {
                Some(live) => live.merge_packets(&packet),
                None => {
                    self.apdex_packets.insert(key, packet);
                }
            }
        }

        let (error_cap, exception_cap) = match admission {
            Admission::Capped => (
                Some(settings.max_error_trace),
                Some(settings.exception.max_type_count),
            ),
            Admission::Restore => (None, None),
        };
        self.traced_errors.absorb(other.traced_errors, error_cap);
        self.traced_exceptions
            .absorb(other.traced_exceptions, exception_cap);
        self.traced_external_errors
            .absorb(other.traced_external_errors, error_cap);

        let top_n = settings.action_tracer.max_action_trace_per_action;
        for (action, records) in other.slow_actions {
            let bucket = self.slow_actions.entry(action).or_default();
            bucket.extend(records);
            keep_slowest(bucket, top_n);
        }

        for (key, packet) in other.slow_sql_packets {
            self.record_slow_sql(key, packet, settings.slow_sql_count);
        }

        if settings.quantile_enabled() {
            for (action, estimator) in other.quantiles {
                match self.quantiles.get_mut(&action) {
                    Some(live) => live.merge(estimator),
                    None => {
                        self.quantiles.insert(action, estimator);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    settings: Option<Arc<Settings>>,
    tables: PacketTables,
}

/// Thread-safe aggregator of finished trackers.
#[derive(Debug, Default)]
pub struct Packager {
    inner: Mutex<Inner>,
}

impl Clone for Packager {
    /// Deep copy of the tables; settings are shared.
    fn clone(&self) -> Self {
        let inner = self.lock();
        Packager::from_parts(inner.settings.clone(), inner.tables.clone())
    }
}

impl Packager {
    /// A packager without settings. Records are rejected until
    /// [`Packager::reset_packets`] attaches some.
    #[must_use]
    pub fn new() -> Self {
        Packager::default()
    }

    /// A packager ready to record with `settings`.
    pub fn with_settings(settings: Settings) -> Result<Self, errors::Creation> {
        let packager = Packager::new();
        packager.reset_packets(settings)?;
        Ok(packager)
    }

    fn from_parts(settings: Option<Arc<Settings>>, tables: PacketTables) -> Self {
        Packager {
            inner: Mutex::new(Inner { settings, tables }),
        }
    }

    fn into_parts(self) -> (Option<Arc<Settings>>, PacketTables) {
        let inner = self
            .inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        (inner.settings, inner.tables)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        #[allow(clippy::expect_used)]
        self.inner.lock().expect("lock poisoned")
    }

    pub fn settings(&self) -> Option<Arc<Settings>> {
        self.lock().settings.clone()
    }

    /// Attaches `settings` and empties every table.
    pub fn reset_packets(&self, settings: Settings) -> Result<(), errors::Creation> {
        settings.validate()?;
        let mut inner = self.lock();
        inner.settings = Some(Arc::new(settings));
        inner.tables = PacketTables::default();
        Ok(())
    }

    /// An empty packager sharing this one's settings, used to stage trackers
    /// before merging them in.
    #[must_use]
    pub fn create_data_zone(&self) -> Packager {
        Packager::from_parts(self.settings(), PacketTables::default())
    }

    /// Folds one finished tracker into the tables.
    pub fn record(&self, tracker: &TrackerNode) {
        let Some(settings) = self.settings() else {
            error!("Packager has no settings attached, dropping tracker {}", tracker.path);
            return;
        };

        let digest = TrackerDigest::new(tracker, &settings);
        self.lock().tables.apply(digest, &settings);
    }

    /// Takes every table in one critical section and returns them as a new
    /// packager with the same settings. The live tables restart empty.
    #[must_use]
    pub fn packets_snapshot(&self) -> Packager {
        let mut inner = self.lock();
        let tables = std::mem::take(&mut inner.tables);
        Packager::from_parts(inner.settings.clone(), tables)
    }

    /// Merges a data zone or snapshot. Dedup tables only admit new keys
    /// while below their caps.
    pub fn merge_metric_packets(&self, snapshot: Packager) {
        self.absorb(snapshot, Admission::Capped);
    }

    /// Restores a snapshot whose upload failed.
    pub fn rollback(&self, snapshot: Packager) {
        warn!("Rolling back the last snapshot, its upload did not go through");
        self.absorb(snapshot, Admission::Restore);
    }

    fn absorb(&self, snapshot: Packager, admission: Admission) {
        let (snapshot_settings, tables) = snapshot.into_parts();
        let mut inner = self.lock();
        let Some(settings) = inner.settings.clone().or(snapshot_settings) else {
            error!("Packager has no settings attached, dropping merged packets");
            return;
        };
        inner.tables.absorb(tables, &settings, admission);
    }

    pub fn component_metrics(&self, ids: &dyn MetricIdLookup) -> Vec<MetricEntry<TimePacket>> {
        let packets = std::mem::take(&mut self.lock().tables.time_packets);
        packets
            .into_iter()
            .map(|(key, packet)| MetricEntry {
                key: UploadKey::scoped(&key, ids),
                packet,
                markers: None,
            })
            .collect()
    }

    pub fn general_trace_metric(&self, ids: &dyn MetricIdLookup) -> Vec<MetricEntry<TimePacket>> {
        let packets = std::mem::take(&mut self.lock().tables.general_packets);
        packets
            .into_iter()
            .map(|(name, packet)| MetricEntry {
                key: UploadKey::named(&name, ids),
                packet,
                markers: None,
            })
            .collect()
    }

    pub fn apdex_data(&self, ids: &dyn MetricIdLookup) -> Vec<MetricEntry<ApdexPacket>> {
        let packets = std::mem::take(&mut self.lock().tables.apdex_packets);
        packets
            .into_iter()
            .map(|(name, packet)| MetricEntry {
                key: UploadKey::named(&name, ids),
                packet,
                markers: None,
            })
            .collect()
    }

    /// Action packets, each with its percentile markers when quantiles are
    /// configured. Empties the estimators too.
    pub fn action_metrics(&self, ids: &dyn MetricIdLookup) -> Vec<MetricEntry<TimePacket>> {
        let mut inner = self.lock();
        let quantile_enabled = inner
            .settings
            .as_ref()
            .is_some_and(|settings| settings.quantile_enabled());

        let tables = &mut inner.tables;
        let packets = std::mem::take(&mut tables.action_packets);
        let estimators = std::mem::take(&mut tables.quantiles);
        let estimators = quantile_enabled.then_some(estimators);

        packets
            .into_iter()
            .map(|(name, packet)| MetricEntry {
                key: UploadKey::named(&name, ids),
                packet,
                markers: estimators.as_ref().map(|estimators| {
                    estimators
                        .get(&name)
                        .map(QuantileP2::markers)
                        .unwrap_or_default()
                }),
            })
            .collect()
    }

    /// Error rollup counters over errors and external errors. Leaves the
    /// dedup tables in place for [`Packager::error_trace_data`] and
    /// [`Packager::external_error_data`].
    pub fn error_packets(&self, ids: &dyn MetricIdLookup) -> Vec<CountEntry> {
        let mut counts: BTreeMap<String, u64> = [
            "Errors/Count/All",
            "Errors/Count/AllWeb",
            "Errors/Count/AllBackground",
        ]
        .into_iter()
        .map(|name| (name.to_string(), 0))
        .collect();

        let inner = self.lock();
        let traced = inner
            .tables
            .traced_errors
            .iter()
            .map(|(_, entry)| (entry.count, &entry.origin));
        let external = inner
            .tables
            .traced_external_errors
            .iter()
            .map(|(_, entry)| (entry.count, &entry.origin));

        for (count, origin) in traced.chain(external) {
            *counts.entry("Errors/Count/All".to_string()).or_default() += count;
            if !origin.tracker_type.is_web() {
                *counts
                    .entry("Errors/Count/AllBackground".to_string())
                    .or_default() += count;
                continue;
            }

            *counts.entry("Errors/Count/AllWeb".to_string()).or_default() += count;
            *counts
                .entry(format!("Errors/Count/{}", origin.action))
                .or_default() += count;
            *counts
                .entry(format!("Errors/Type:{}/{}", origin.class_name, origin.action))
                .or_default() += count;
            if let (TrackerType::External, Some(status)) =
                (origin.tracker_type, origin.status_code)
            {
                *counts
                    .entry(format!("Errors/Type:{}/{}", status, origin.action))
                    .or_default() += count;
            }
        }
        drop(inner);

        count_entries(counts, ids)
    }

    /// Exception rollup counters. Leaves the dedup table in place for
    /// [`Packager::exception_trace_data`].
    pub fn exception_packets(&self, ids: &dyn MetricIdLookup) -> Vec<CountEntry> {
        let mut counts: BTreeMap<String, u64> = [
            "Exception/Count/All",
            "Exception/Count/AllWeb",
            "Exception/Count/AllBackground",
        ]
        .into_iter()
        .map(|name| (name.to_string(), 0))
        .collect();

        let inner = self.lock();
        for (_, entry) in inner.tables.traced_exceptions.iter() {
            let (count, origin) = (entry.count, &entry.origin);
            *counts.entry("Exception/Count/All".to_string()).or_default() += count;
            if !origin.tracker_type.is_web_action() {
                *counts
                    .entry("Exception/Count/AllBackground".to_string())
                    .or_default() += count;
                continue;
            }

            *counts
                .entry("Exception/Count/AllWeb".to_string())
                .or_default() += count;
            *counts
                .entry(format!("Exception/Count/{}", origin.action))
                .or_default() += count;
            *counts
                .entry(format!(
                    "Exception/Type:{}/{}",
                    origin.class_name, origin.action
                ))
                .or_default() += count;
        }
        drop(inner);

        count_entries(counts, ids)
    }

    pub fn error_trace_data(&self) -> Vec<TracedError> {
        self.lock().tables.traced_errors.drain_records()
    }

    pub fn exception_trace_data(&self) -> Vec<TracedException> {
        self.lock().tables.traced_exceptions.drain_records()
    }

    pub fn external_error_data(&self) -> Vec<TracedExternalError> {
        self.lock().tables.traced_external_errors.drain_records()
    }

    /// Slow-action traces, slowest first within each action. `None` when
    /// nothing was captured.
    pub fn action_trace_data(&self) -> Option<ActionTraceData> {
        let buckets = std::mem::take(&mut self.lock().tables.slow_actions);
        if buckets.is_empty() {
            return None;
        }
        Some(ActionTraceData::new(
            buckets.into_values().flatten().collect(),
        ))
    }

    /// The slowest `slow_sql_count` statements, fastest first. `None` when
    /// nothing was captured.
    pub fn slow_sql_data(&self) -> Option<SqlTraceData> {
        let mut inner = self.lock();
        let maximum = inner
            .settings
            .as_ref()
            .map_or(usize::MAX, |settings| settings.slow_sql_count);
        let packets = std::mem::take(&mut inner.tables.slow_sql_packets);
        drop(inner);

        if packets.is_empty() {
            return None;
        }
        let mut packets: Vec<SlowSqlPacket> = packets.into_values().collect();
        packets.sort_by(|a, b| a.max_call_time.total_cmp(&b.max_call_time));
        let skip = packets.len().saturating_sub(maximum);

        Some(SqlTraceData::new(
            packets.into_iter().skip(skip).map(SlowSqlTrace::from).collect(),
        ))
    }
}

fn count_entries(counts: BTreeMap<String, u64>, ids: &dyn MetricIdLookup) -> Vec<CountEntry> {
    counts
        .into_iter()
        .map(|(name, count)| CountEntry {
            key: UploadKey::named(&name, ids),
            count,
        })
        .collect()
}
