// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mergeable statistical summaries, one per aggregation key.
//!
//! Every packet merges field-wise: counters and sums add up, min and max keep
//! the extreme. An empty packet (zero calls) is the identity of the merge, so
//! merging is associative and commutative and the order in which concurrent
//! requests reach a table never shows in the result.

use crate::metric::{ApdexMetric, TimeMetric};
use crate::node::SlowSqlNode;
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};

/// Timing summary uploaded as
/// `[call_count, total, exclusive, max, min, sum_of_squares]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimePacket {
    pub call_count: u64,
    pub total_call_time: f64,
    pub total_exclusive_time: f64,
    pub max_call_time: f64,
    pub min_call_time: f64,
    pub sum_of_squares: f64,
}

impl TimePacket {
    pub fn merge_time_metric(&mut self, metric: &TimeMetric) {
        self.merge_sample(metric.duration, metric.exclusive);
    }

    pub fn merge_sample(&mut self, duration: f64, exclusive: f64) {
        self.merge_packets(&TimePacket {
            call_count: 1,
            total_call_time: duration,
            total_exclusive_time: exclusive,
            max_call_time: duration,
            min_call_time: duration,
            sum_of_squares: duration * duration,
        });
    }

    pub fn merge_packets(&mut self, other: &TimePacket) {
        if other.call_count == 0 {
            return;
        }
        if self.call_count == 0 {
            *self = other.clone();
            return;
        }
        self.call_count += other.call_count;
        self.total_call_time += other.total_call_time;
        self.total_exclusive_time += other.total_exclusive_time;
        self.max_call_time = self.max_call_time.max(other.max_call_time);
        self.min_call_time = self.min_call_time.min(other.min_call_time);
        self.sum_of_squares += other.sum_of_squares;
    }
}

impl Serialize for TimePacket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(6)?;
        tuple.serialize_element(&self.call_count)?;
        tuple.serialize_element(&self.total_call_time)?;
        tuple.serialize_element(&self.total_exclusive_time)?;
        tuple.serialize_element(&self.max_call_time)?;
        tuple.serialize_element(&self.min_call_time)?;
        tuple.serialize_element(&self.sum_of_squares)?;
        tuple.end()
    }
}

/// Apdex counters uploaded as `[satisfying, tolerating, frustrating, apdex_t]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApdexPacket {
    pub satisfying: u64,
    pub tolerating: u64,
    pub frustrating: u64,
    /// Threshold in effect when the first sample for the key was classified.
    pub apdex_t: f64,
}

impl ApdexPacket {
    pub fn new(apdex_t: f64) -> Self {
        ApdexPacket {
            apdex_t,
            ..ApdexPacket::default()
        }
    }

    pub fn merge_apdex_metric(&mut self, metric: &ApdexMetric) {
        self.satisfying += metric.satisfying;
        self.tolerating += metric.tolerating;
        self.frustrating += metric.frustrating;
    }

    pub fn merge_packets(&mut self, other: &ApdexPacket) {
        self.satisfying += other.satisfying;
        self.tolerating += other.tolerating;
        self.frustrating += other.frustrating;
    }
}

impl Serialize for ApdexPacket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            self.satisfying,
            self.tolerating,
            self.frustrating,
            self.apdex_t,
        )
            .serialize(serializer)
    }
}

/// Occurrences of one slow SQL statement, keeping the slowest sample as
/// representative.
#[derive(Debug, Clone, PartialEq)]
pub struct SlowSqlPacket {
    pub call_count: u64,
    pub total_call_time: f64,
    pub max_call_time: f64,
    pub min_call_time: f64,
    pub slow_sql_node: SlowSqlNode,
}

impl SlowSqlPacket {
    pub fn new(node: SlowSqlNode) -> Self {
        SlowSqlPacket {
            call_count: 1,
            total_call_time: node.duration,
            max_call_time: node.duration,
            min_call_time: node.duration,
            slow_sql_node: node,
        }
    }

    pub fn merge_slow_sql_node(&mut self, node: SlowSqlNode) {
        self.merge_packets(SlowSqlPacket::new(node));
    }

    pub fn merge_packets(&mut self, other: SlowSqlPacket) {
        self.call_count += other.call_count;
        self.total_call_time += other.total_call_time;
        self.min_call_time = self.min_call_time.min(other.min_call_time);
        if other.max_call_time > self.max_call_time {
            self.max_call_time = other.max_call_time;
            self.slow_sql_node = other.slow_sql_node;
        }
    }
}
