// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::FUNCTION_CATEGORY;
use crate::metric::TimeMetric;
use crate::node::exception::exception_details;
use crate::node::{
    format_stack_trace, offset_ms, render_children, ExceptionNode, StackFrame, TraceBudget,
    TraceNode, TraceParams, TraceRecord, TrackerNode,
};

/// A traced function call. The only variant that nests further nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionNode {
    pub group: String,
    pub name: String,
    pub children: Vec<TraceNode>,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub exclusive: f64,
    pub stack_trace: Vec<StackFrame>,
    pub exceptions: Vec<ExceptionNode>,
}

impl FunctionNode {
    fn metric_name(&self) -> String {
        format!("{}/{}/{}", FUNCTION_CATEGORY, self.group, self.name)
    }

    pub fn emit_metrics(&self, root: &TrackerNode, out: &mut Vec<TimeMetric>) {
        out.push(TimeMetric::new(
            self.metric_name(),
            &root.path,
            self.duration,
            self.exclusive,
        ));
        for child in &self.children {
            child.emit_metrics(root, out);
        }
    }

    pub fn render_trace(&self, root: &TrackerNode, budget: &mut TraceBudget) -> TraceRecord {
        TraceRecord {
            start: offset_ms(root, self.start_time),
            end: offset_ms(root, self.end_time),
            metric_name: self.metric_name(),
            call_url: root.request_uri.clone(),
            call_count: 1,
            class_name: String::new(),
            method_name: self.name.clone(),
            params: TraceParams {
                sql: Some(String::new()),
                stacktrace: Some(format_stack_trace(&self.stack_trace)),
                exception: exception_details(&self.exceptions),
                ..TraceParams::default()
            },
            children: render_children(&self.children, root, budget),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root() -> TrackerNode {
        TrackerNode {
            path: "WebAction/app/index".to_string(),
            request_uri: "/index".to_string(),
            start_time: 100.0,
            ..TrackerNode::default()
        }
    }

    #[test]
    fn test_metrics_recurse_in_child_order() {
        let node = FunctionNode {
            group: "views".to_string(),
            name: "index".to_string(),
            duration: 30.0,
            exclusive: 10.0,
            children: vec![FunctionNode {
                group: "db".to_string(),
                name: "query".to_string(),
                duration: 20.0,
                exclusive: 20.0,
                ..FunctionNode::default()
            }
            .into()],
            ..FunctionNode::default()
        };

        let mut metrics = Vec::new();
        node.emit_metrics(&root(), &mut metrics);

        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Python/views/index", "Python/db/query"]);
        assert!(metrics.iter().all(|m| m.scope == "WebAction/app/index"));
        assert_eq!(metrics[0].exclusive, 10.0);
    }

    #[test]
    fn test_render_shape() {
        let node = FunctionNode {
            group: "views".to_string(),
            name: "index".to_string(),
            start_time: 100.25,
            end_time: 100.5,
            ..FunctionNode::default()
        };

        let mut budget = TraceBudget::new(10);
        let rendered = node.render_trace(&root(), &mut budget);

        assert_eq!(
            serde_json::to_value(&rendered).expect("failed to serialize"),
            json!([
                250,
                500,
                "Python/views/index",
                "/index",
                1,
                "",
                "index",
                {"sql": "", "stacktrace": []},
                []
            ])
        );
    }
}
