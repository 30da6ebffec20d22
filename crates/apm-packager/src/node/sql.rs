// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::node::{StackFrame, TrackerNode};

/// A database statement that crossed the slow-SQL threshold, as captured by
/// instrumentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlowSqlSample {
    /// Epoch seconds.
    pub start_time: i64,
    /// Database metric the statement was timed under; groups occurrences.
    pub metric: String,
    /// Obfuscated statement text.
    pub sql: String,
    pub duration: f64,
    pub stack_trace: Vec<StackFrame>,
    pub explain_plan: Option<serde_json::Value>,
}

impl SlowSqlSample {
    /// Binds the sample to the action it ran in.
    pub fn to_node(&self, root: &TrackerNode) -> SlowSqlNode {
        SlowSqlNode {
            start_time: self.start_time,
            path: root.path.clone(),
            metric: self.metric.clone(),
            request_uri: root.request_uri.clone(),
            sql: self.sql.clone(),
            duration: self.duration,
            stack_trace: self.stack_trace.clone(),
            explain_plan: self.explain_plan.clone(),
        }
    }
}

/// Slow SQL occurrence with its action context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlowSqlNode {
    pub start_time: i64,
    pub path: String,
    pub metric: String,
    pub request_uri: String,
    pub sql: String,
    pub duration: f64,
    pub stack_trace: Vec<StackFrame>,
    pub explain_plan: Option<serde_json::Value>,
}
