// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::ESCAPED_SLASH;
use crate::metric::TimeMetric;
use crate::node::exception::exception_details;
use crate::node::{offset_ms, ExceptionNode, TraceParams, TraceRecord, TrackerNode};

/// A single redis command against one logical database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedisNode {
    pub command: String,
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub exclusive: f64,
    pub exceptions: Vec<ExceptionNode>,
}

impl RedisNode {
    /// `host:port%2Fdb`
    fn instance(&self) -> String {
        format!("{}:{}{}{}", self.host, self.port, ESCAPED_SLASH, self.db)
    }

    pub fn emit_metrics(&self, root: &TrackerNode, out: &mut Vec<TimeMetric>) {
        let command = self.command.to_uppercase();
        let instance = self.instance();
        let rollup = if root.tracker_type.is_web_action() {
            "GENERAL/Redis/NULL/AllWeb"
        } else {
            "GENERAL/Redis/NULL/AllBackgound"
        };

        for name in [
            format!("GENERAL/Redis/{}:{}/All", self.host, self.port),
            "GENERAL/Redis/NULL/All".to_string(),
            rollup.to_string(),
            format!("Redis/{}/{}", instance, command),
            format!("GENERAL/Redis/{}/{}", instance, command),
        ] {
            out.push(TimeMetric::new(
                name,
                &root.path,
                self.duration,
                self.exclusive,
            ));
        }
    }

    pub fn render_trace(&self, root: &TrackerNode) -> TraceRecord {
        let method_name = format!("Redis:{}", self.command);
        let metric_name = format!("Redis/{}/{}", self.instance(), method_name);
        TraceRecord {
            start: offset_ms(root, self.start_time),
            end: offset_ms(root, self.end_time),
            call_url: metric_name.clone(),
            metric_name,
            call_count: 1,
            class_name: String::new(),
            method_name,
            params: TraceParams {
                exception: exception_details(&self.exceptions),
                ..TraceParams::default()
            },
            children: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn get() -> RedisNode {
        RedisNode {
            command: "get".to_string(),
            host: "db1".to_string(),
            port: 6379,
            db: 0,
            duration: 2.0,
            exclusive: 2.0,
            ..RedisNode::default()
        }
    }

    #[test]
    fn test_metrics() {
        let root = TrackerNode {
            path: "WebAction/app/cart".to_string(),
            ..TrackerNode::default()
        };
        let mut metrics = Vec::new();
        get().emit_metrics(&root, &mut metrics);

        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "GENERAL/Redis/db1:6379/All",
                "GENERAL/Redis/NULL/All",
                "GENERAL/Redis/NULL/AllWeb",
                "Redis/db1:6379%2F0/GET",
                "GENERAL/Redis/db1:6379%2F0/GET",
            ]
        );
    }

    #[test]
    fn test_render_with_exception() {
        let mut node = get();
        node.exceptions.push(ExceptionNode {
            class_name: "ConnectionError".to_string(),
            message: "reset by peer".to_string(),
            ..ExceptionNode::default()
        });

        let rendered = node.render_trace(&TrackerNode::default());
        assert_eq!(rendered.metric_name, "Redis/db1:6379%2F0/Redis:get");
        assert_eq!(rendered.call_url, rendered.metric_name);
        assert_eq!(
            serde_json::to_value(&rendered.params).expect("failed to serialize"),
            json!({"exception": [{"message": "reset by peer", "class": "ConnectionError", "stacktrace": []}]})
        );
    }
}
