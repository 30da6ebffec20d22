// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace payloads handed to the uploader.

use crate::constants::{ACTION_TRACE_DATA_TYPE, SQL_TRACE_DATA_TYPE};
use crate::node::{format_stack_trace, SlowActionRecord};
use crate::packet::SlowSqlPacket;
use crate::util::to_json_blob;
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use serde_json::json;

/// `{"type": "actionTraceData", "actionTraces": [...]}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionTraceData {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "actionTraces")]
    pub action_traces: Vec<SlowActionRecord>,
}

impl ActionTraceData {
    pub fn new(action_traces: Vec<SlowActionRecord>) -> Self {
        ActionTraceData {
            kind: ACTION_TRACE_DATA_TYPE,
            action_traces,
        }
    }
}

/// `{"type": "sqlTraceData", "sqlTraces": [...]}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlTraceData {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "sqlTraces")]
    pub sql_traces: Vec<SlowSqlTrace>,
}

impl SqlTraceData {
    pub fn new(sql_traces: Vec<SlowSqlTrace>) -> Self {
        SqlTraceData {
            kind: SQL_TRACE_DATA_TYPE,
            sql_traces,
        }
    }
}

/// Uploaded as
/// `[start, action, metric, request_uri, sql, count, total, max, min, params_json]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SlowSqlTrace {
    pub start_time: i64,
    pub action: String,
    pub metric: String,
    pub request_uri: String,
    pub sql: String,
    pub call_count: u64,
    pub total_call_time: f64,
    pub max_call_time: f64,
    pub min_call_time: f64,
    pub params: String,
}

impl From<SlowSqlPacket> for SlowSqlTrace {
    fn from(packet: SlowSqlPacket) -> Self {
        let node = packet.slow_sql_node;
        let params = json!({
            "explainPlan": node.explain_plan.unwrap_or_else(|| json!({})),
            "stacktrace": format_stack_trace(&node.stack_trace),
        });

        SlowSqlTrace {
            start_time: node.start_time,
            action: node.path,
            metric: node.metric,
            request_uri: node.request_uri,
            sql: node.sql,
            call_count: packet.call_count,
            total_call_time: packet.total_call_time,
            max_call_time: packet.max_call_time,
            min_call_time: packet.min_call_time,
            params: to_json_blob(&params),
        }
    }
}

impl Serialize for SlowSqlTrace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(10)?;
        tuple.serialize_element(&self.start_time)?;
        tuple.serialize_element(&self.action)?;
        tuple.serialize_element(&self.metric)?;
        tuple.serialize_element(&self.request_uri)?;
        tuple.serialize_element(&self.sql)?;
        tuple.serialize_element(&self.call_count)?;
        tuple.serialize_element(&self.total_call_time)?;
        tuple.serialize_element(&self.max_call_time)?;
        tuple.serialize_element(&self.min_call_time)?;
        tuple.serialize_element(&self.params)?;
        tuple.end()
    }
}
