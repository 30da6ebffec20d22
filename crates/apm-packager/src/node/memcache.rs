// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::metric::TimeMetric;
use crate::node::exception::exception_details;
use crate::node::{offset_ms, ExceptionNode, TraceParams, TraceRecord, TrackerNode};

/// A single memcached command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemcacheNode {
    pub command: String,
    pub host: String,
    pub port: u16,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub exclusive: f64,
    pub exceptions: Vec<ExceptionNode>,
}

impl MemcacheNode {
    pub fn emit_metrics(&self, root: &TrackerNode, out: &mut Vec<TimeMetric>) {
        let command = self.command.to_uppercase();
        let server = format!("{}:{}", self.host, self.port);
        let rollup = if root.tracker_type.is_web_action() {
            "GENERAL/Memcached/NULL/AllWeb"
        } else {
            "GENERAL/Memcached/NULL/AllBackgound"
        };

        for name in [
            format!("GENERAL/Memcached/{}/All", server),
            "GENERAL/Memcached/NULL/All".to_string(),
            rollup.to_string(),
            format!("Memcached/{}/{}", server, command),
            format!("GENERAL/Memcached/{}/{}", server, command),
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
        let method_name = format!("Memcached:{}", self.command);
        TraceRecord {
            start: offset_ms(root, self.start_time),
            end: offset_ms(root, self.end_time),
            metric_name: format!("Memcached/{}:{}/{}", self.host, self.port, method_name),
            call_url: String::new(),
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
    use crate::node::TrackerType;

    fn get() -> MemcacheNode {
        MemcacheNode {
            command: "get".to_string(),
            host: "cache".to_string(),
            port: 11211,
            duration: 3.0,
            exclusive: 3.0,
            ..MemcacheNode::default()
        }
    }

    #[test]
    fn test_web_metrics() {
        let root = TrackerNode {
            path: "WebAction/app/home".to_string(),
            ..TrackerNode::default()
        };
        let mut metrics = Vec::new();
        get().emit_metrics(&root, &mut metrics);

        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "GENERAL/Memcached/cache:11211/All",
                "GENERAL/Memcached/NULL/All",
                "GENERAL/Memcached/NULL/AllWeb",
                "Memcached/cache:11211/GET",
                "GENERAL/Memcached/cache:11211/GET",
            ]
        );
    }

    #[test]
    fn test_background_rollup() {
        let root = TrackerNode {
            tracker_type: TrackerType::BackgroundAction,
            path: "BackgroundAction/jobs/sync".to_string(),
            ..TrackerNode::default()
        };
        let mut metrics = Vec::new();
        get().emit_metrics(&root, &mut metrics);
        assert_eq!(metrics[2].name, "GENERAL/Memcached/NULL/AllBackgound");
    }

    #[test]
    fn test_render_names() {
        let rendered = get().render_trace(&TrackerNode::default());
        assert_eq!(rendered.metric_name, "Memcached/cache:11211/Memcached:get");
        assert_eq!(rendered.method_name, "Memcached:get");
        assert_eq!(rendered.call_url, "");
        assert_eq!(rendered.params, TraceParams::default());
    }
}
