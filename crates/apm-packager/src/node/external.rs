// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{ESCAPED_SLASH, MISSING_CALLEE_ID, NONE_LITERAL};
use crate::metric::TimeMetric;
use crate::node::exception::exception_details;
use crate::node::{offset_ms, CrossAppData, ExceptionNode, TraceParams, TraceRecord, TrackerNode};
use crate::util::escape_slashes;

/// An outgoing call to another service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalNode {
    pub library: String,
    pub url: String,
    pub protocol: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub exclusive: f64,
    /// Correlation id sent to the callee; keys the root's cross-app data.
    pub external_id: Option<String>,
    pub exceptions: Vec<ExceptionNode>,
}

impl ExternalNode {
    fn cross_app_data<'a>(&self, root: &'a TrackerNode) -> Option<&'a CrossAppData> {
        self.external_id
            .as_ref()
            .and_then(|id| root.trace_data.get(id))
    }

    pub fn emit_metrics(&self, root: &TrackerNode, out: &mut Vec<TimeMetric>) {
        let url = escape_slashes(&self.url);
        let scope = root.path.as_str();

        if let Some(data) = self.cross_app_data(root) {
            let backend = data.backend_time(self.exclusive);
            let callee_action = data
                .action
                .as_deref()
                .unwrap_or(NONE_LITERAL)
                .replace(ESCAPED_SLASH, "/");
            let callee_id = data.id.as_deref();

            out.push(TimeMetric::new(
                format!(
                    "ExternalTransaction/{}/{}{}{}",
                    url,
                    callee_id.unwrap_or(MISSING_CALLEE_ID),
                    ESCAPED_SLASH,
                    callee_action
                ),
                scope,
                self.duration,
                backend,
            ));

            let callee_id = callee_id.unwrap_or(NONE_LITERAL);
            for name in [
                format!("GENERAL/ExternalTransaction/NULL/{}", callee_id),
                format!("GENERAL/ExternalTransaction/{}/{}", self.protocol, callee_id),
                format!("GENERAL/ExternalTransaction/{}:sync/{}", self.protocol, callee_id),
            ] {
                out.push(TimeMetric::new(name, scope, backend, 0.0));
            }
        }

        out.push(TimeMetric::new(
            "GENERAL/External/NULL/All".to_string(),
            scope,
            self.duration,
            0.0,
        ));
        out.push(TimeMetric::new(
            "GENERAL/External/NULL/AllWeb".to_string(),
            scope,
            self.duration,
            0.0,
        ));
        out.push(TimeMetric::new(
            format!("External/{}/{}", url, self.library),
            scope,
            self.duration,
            self.duration,
        ));
        out.push(TimeMetric::new(
            format!("GENERAL/External/{}/{}", url, self.library),
            scope,
            self.duration,
            0.0,
        ));
    }

    pub fn render_trace(&self, root: &TrackerNode) -> TraceRecord {
        let params = TraceParams {
            external_id: self.external_id.clone().filter(|id| !id.is_empty()),
            tx_id: root.trace_id.clone(),
            tx_data: self.cross_app_data(root).cloned(),
            exception: exception_details(&self.exceptions),
            ..TraceParams::default()
        };

        TraceRecord {
            start: offset_ms(root, self.start_time),
            end: offset_ms(root, self.end_time),
            metric_name: format!("External/{}/{}", escape_slashes(&self.url), self.library),
            call_url: self.url.clone(),
            call_count: 1,
            class_name: String::new(),
            method_name: self.library.clone(),
            params,
            children: Vec::new(),
        }
    }
}
