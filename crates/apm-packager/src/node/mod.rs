// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Timing nodes of an action trace tree.
//!
//! A finished request arrives as a [`TrackerNode`] (the root) holding a tree of
//! [`TraceNode`]s. Every node kind answers the same two questions:
//!
//! - which metrics does it contribute ([`TraceNode::emit_metrics`]), and
//! - how does it look in a rendered slow-action trace ([`TraceNode::render_trace`]).
//!
//! Rendering is bounded by a [`TraceBudget`] threaded through the walk. A node
//! is rendered only after it claims a slot, so a trace never holds more nodes
//! than the configured limit, and once the budget is spent no later sibling or
//! descendant is appended.

mod exception;
mod external;
mod function;
mod memcache;
mod redis;
mod sql;
mod tracker;

pub use exception::{format_stack_trace, ExceptionDetail, ExceptionNode, StackFrame};
pub use external::ExternalNode;
pub use function::FunctionNode;
pub use memcache::MemcacheNode;
pub use redis::RedisNode;
pub use sql::{SlowSqlNode, SlowSqlSample};
pub use tracker::{
    CrossAppData, CrossAppTime, ExternalError, SlowActionRecord, TrackerError, TrackerNode,
};

use crate::metric::TimeMetric;
use derive_more::Display;
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};

/// Kind of work a tracker (or an error captured in it) belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display)]
pub enum TrackerType {
    #[default]
    #[display("WebAction")]
    WebAction,
    #[display("BackgroundAction")]
    BackgroundAction,
    #[display("External")]
    External,
}

impl TrackerType {
    #[must_use]
    pub fn is_web_action(self) -> bool {
        self == TrackerType::WebAction
    }

    /// Errors of these kinds count towards the web rollups.
    #[must_use]
    pub fn is_web(self) -> bool {
        matches!(self, TrackerType::WebAction | TrackerType::External)
    }
}

/// A node below the tracker root.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceNode {
    Function(FunctionNode),
    External(ExternalNode),
    Memcache(MemcacheNode),
    Redis(RedisNode),
}

impl TraceNode {
    /// Pushes this node's metrics, then its children's in child order.
    pub fn emit_metrics(&self, root: &TrackerNode, out: &mut Vec<TimeMetric>) {
        match self {
            TraceNode::Function(node) => node.emit_metrics(root, out),
            TraceNode::External(node) => node.emit_metrics(root, out),
            TraceNode::Memcache(node) => node.emit_metrics(root, out),
            TraceNode::Redis(node) => node.emit_metrics(root, out),
        }
    }

    /// Renders this node. The caller has already claimed its budget slot.
    pub fn render_trace(&self, root: &TrackerNode, budget: &mut TraceBudget) -> TraceRecord {
        match self {
            TraceNode::Function(node) => node.render_trace(root, budget),
            TraceNode::External(node) => node.render_trace(root),
            TraceNode::Memcache(node) => node.render_trace(root),
            TraceNode::Redis(node) => node.render_trace(root),
        }
    }

    #[must_use]
    pub fn duration(&self) -> f64 {
        match self {
            TraceNode::Function(node) => node.duration,
            TraceNode::External(node) => node.duration,
            TraceNode::Memcache(node) => node.duration,
            TraceNode::Redis(node) => node.duration,
        }
    }
}

impl From<FunctionNode> for TraceNode {
    fn from(node: FunctionNode) -> Self {
        TraceNode::Function(node)
    }
}

impl From<ExternalNode> for TraceNode {
    fn from(node: ExternalNode) -> Self {
        TraceNode::External(node)
    }
}

impl From<MemcacheNode> for TraceNode {
    fn from(node: MemcacheNode) -> Self {
        TraceNode::Memcache(node)
    }
}

impl From<RedisNode> for TraceNode {
    fn from(node: RedisNode) -> Self {
        TraceNode::Redis(node)
    }
}

/// Node allowance of one trace rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceBudget {
    limit: usize,
    rendered: usize,
}

impl TraceBudget {
    /// The root always renders, so a limit below 1 is raised to 1.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        TraceBudget {
            limit: limit.max(1),
            rendered: 0,
        }
    }

    /// The root of a trace is always rendered.
    pub fn claim_root(&mut self) {
        self.rendered += 1;
    }

    /// Claims a slot for the next node; `false` once the limit is reached.
    pub fn try_claim(&mut self) -> bool {
        if self.rendered >= self.limit {
            return false;
        }
        self.rendered += 1;
        true
    }

    #[must_use]
    pub fn rendered(&self) -> usize {
        self.rendered
    }
}

/// Renders `children` in order while the budget lasts.
pub(crate) fn render_children(
    children: &[TraceNode],
    root: &TrackerNode,
    budget: &mut TraceBudget,
) -> Vec<TraceRecord> {
    let mut rendered = Vec::new();
    for child in children {
        if !budget.try_claim() {
            break;
        }
        rendered.push(child.render_trace(root, budget));
    }
    rendered
}

/// Milliseconds between the root start and `at` (both epoch seconds).
pub(crate) fn offset_ms(root: &TrackerNode, at: f64) -> i64 {
    ((at - root.start_time) * 1000.0).round() as i64
}

/// Extra data attached to a rendered node. Absent fields are left out of the
/// rendering entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceParams {
    #[serde(rename = "externalId", skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(rename = "txId", skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(rename = "txData", skip_serializing_if = "Option::is_none")]
    pub tx_data: Option<CrossAppData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<Vec<ExceptionDetail>>,
}

/// A rendered node, uploaded as
/// `[start, end, metric_name, call_url, call_count, class_name, method_name, params, children]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub start: i64,
    pub end: i64,
    pub metric_name: String,
    pub call_url: String,
    pub call_count: u32,
    pub class_name: String,
    pub method_name: String,
    pub params: TraceParams,
    pub children: Vec<TraceRecord>,
}

impl TraceRecord {
    /// Number of nodes in this subtree, itself included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TraceRecord::node_count).sum::<usize>()
    }
}

impl Serialize for TraceRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(9)?;
        tuple.serialize_element(&self.start)?;
        tuple.serialize_element(&self.end)?;
        tuple.serialize_element(&self.metric_name)?;
        tuple.serialize_element(&self.call_url)?;
        tuple.serialize_element(&self.call_count)?;
        tuple.serialize_element(&self.class_name)?;
        tuple.serialize_element(&self.method_name)?;
        tuple.serialize_element(&self.params)?;
        tuple.serialize_element(&self.children)?;
        tuple.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_stops_at_limit() {
        let mut budget = TraceBudget::new(3);
        budget.claim_root();
        assert!(budget.try_claim());
        assert!(budget.try_claim());
        assert!(!budget.try_claim());
        assert_eq!(budget.rendered(), 3);
    }

    #[test]
    fn test_zero_limit_renders_root_only() {
        let mut budget = TraceBudget::new(0);
        budget.claim_root();
        assert!(!budget.try_claim());
        assert_eq!(budget.rendered(), 1);
    }

    #[test]
    fn test_tracker_type_display() {
        assert_eq!(TrackerType::WebAction.to_string(), "WebAction");
        assert_eq!(TrackerType::BackgroundAction.to_string(), "BackgroundAction");
        assert!(TrackerType::External.is_web());
        assert!(!TrackerType::BackgroundAction.is_web());
    }

    #[test]
    fn test_empty_params_render_as_empty_object() {
        assert_eq!(
            serde_json::to_string(&TraceParams::default()).expect("failed to serialize"),
            "{}"
        );
    }
}
