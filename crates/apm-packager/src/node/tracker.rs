// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{
    ESCAPED_SLASH, FILTER_KEY_SEPARATOR, NESTED_TRACKER_METHOD, QUEUE_TIME_METRIC,
};
use crate::metric::{ApdexMetric, TimeMetric};
use crate::node::{
    format_stack_trace, offset_ms, render_children, ExceptionNode, SlowSqlNode, SlowSqlSample,
    StackFrame, TraceBudget, TraceNode, TraceParams, TraceRecord, TrackerType,
};
use crate::traced::{Captured, DedupEntry, Origin, TracedError, TracedException, TracedExternalError};
use crate::util::{escape_slashes, to_json_blob, truncate_chars, FnvHashMap};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};
use tracing::debug;
use ustr::Ustr;

/// Timing reported back by a callee for cross-application tracing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossAppTime {
    /// Time spent in the callee application (ms).
    pub duration: f64,
    /// Time the request waited in the callee's queue (ms).
    pub qu: f64,
}

/// Correlation data returned by a callee, keyed by the external id the caller
/// sent along.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossAppData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub time: CrossAppTime,
    /// Non-zero when the callee recorded a slow trace for this call.
    pub tr: u32,
}

impl CrossAppData {
    #[must_use]
    pub fn forces_trace(&self) -> bool {
        self.tr != 0
    }

    /// Part of the caller-side `exclusive` time spent in the callee. Queue time
    /// only counts when the network time it leaves is not negative.
    #[must_use]
    pub fn backend_time(&self, exclusive: f64) -> f64 {
        let app = self.time.duration;
        let queue = self.time.qu;
        let net = exclusive - app - queue;
        if net >= 0.0 {
            app + queue
        } else {
            app
        }
    }
}

/// Error that ended an action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerError {
    /// Epoch seconds.
    pub error_time: i64,
    pub class_name: String,
    pub message: String,
    pub http_status: u16,
    pub stack_trace: Vec<StackFrame>,
    pub thread_name: String,
    pub referer: String,
    pub request_params: Map<String, Value>,
    pub tracker_type: TrackerType,
}

/// Failed outgoing call made while serving an action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalError {
    /// Epoch seconds.
    pub error_time: i64,
    pub url: String,
    pub module_name: String,
    pub status_code: u16,
    pub class_name: String,
    pub stack_trace: Vec<StackFrame>,
    pub thread_name: String,
    pub request_params: Map<String, Value>,
    pub tracker_type: TrackerType,
}

/// Slow action trace uploaded as
/// `[start_secs, duration, action, request_uri, trace_json, trace_id, trace_guid, error_count, exception_count]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SlowActionRecord {
    pub start_time: i64,
    pub duration: f64,
    pub path: String,
    pub request_uri: String,
    pub trace: String,
    pub trace_id: Option<String>,
    pub trace_guid: Option<String>,
    pub error_count: u32,
    pub exception_count: usize,
}

impl Serialize for SlowActionRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(9)?;
        tuple.serialize_element(&self.start_time)?;
        tuple.serialize_element(&self.duration)?;
        tuple.serialize_element(&self.path)?;
        tuple.serialize_element(&self.request_uri)?;
        tuple.serialize_element(&self.trace)?;
        tuple.serialize_element(&self.trace_id)?;
        tuple.serialize_element(&self.trace_guid)?;
        tuple.serialize_element(&self.error_count)?;
        tuple.serialize_element(&self.exception_count)?;
        tuple.end()
    }
}

/// Root of one action's trace tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerNode {
    pub tracker_type: TrackerType,
    pub group: String,
    pub name: String,
    /// Action metric name, e.g. `WebAction/app/index`.
    pub path: String,
    /// Epoch seconds.
    pub start_time: f64,
    pub end_time: f64,
    pub request_uri: String,
    /// Milliseconds.
    pub duration: f64,
    pub exclusive: f64,
    pub http_status: u16,
    pub children: Vec<TraceNode>,
    pub error: Option<TrackerError>,
    /// Apdex threshold in milliseconds.
    pub apdex_t: f64,
    pub request_params: Map<String, Value>,
    pub custom_params: Map<String, Value>,
    pub thread_name: String,
    pub trace_data: FnvHashMap<String, CrossAppData>,
    pub referer: String,
    pub slow_sql: Vec<SlowSqlSample>,
    pub queue_time: f64,
    pub trace_guid: Option<String>,
    pub trace_id: Option<String>,
    pub external_errors: Vec<ExternalError>,
    pub is_root: bool,
    pub exceptions: Vec<ExceptionNode>,
}

impl TrackerNode {
    /// Component and general metrics of the whole tree.
    pub fn time_metrics(&self) -> Vec<TimeMetric> {
        let mut metrics = Vec::new();
        if self.is_root {
            metrics.push(TimeMetric::new(
                self.path.clone(),
                &self.path,
                self.duration,
                self.exclusive,
            ));
            metrics.push(TimeMetric::new(
                QUEUE_TIME_METRIC.to_string(),
                QUEUE_TIME_METRIC,
                self.queue_time,
                self.queue_time,
            ));
        }
        for child in &self.children {
            child.emit_metrics(self, &mut metrics);
        }
        metrics
    }

    /// Sample fed to the action's percentile estimator.
    #[must_use]
    pub fn quantile(&self) -> (&str, f64) {
        (&self.path, self.duration)
    }

    /// Unscoped action metric. Only root web actions without a server-side
    /// failure status produce one.
    pub fn action_metrics(&self) -> Option<TimeMetric> {
        if !self.tracker_type.is_web_action() {
            return None;
        }
        if self.http_status > 401 {
            debug!(
                "Abnormal status code {} with uri {}",
                self.http_status, self.request_uri
            );
            return None;
        }
        if !self.is_root {
            return None;
        }
        Some(TimeMetric::new(
            self.path.clone(),
            "",
            self.duration,
            self.exclusive,
        ))
    }

    pub fn apdex_metrics(&self) -> Option<ApdexMetric> {
        if !self.tracker_type.is_web_action() {
            debug!("Skipping apdex for {} tracker", self.tracker_type);
            return None;
        }

        let (mut satisfying, mut tolerating, mut frustrating) = (0, 0, 0);
        if (self.http_status >= 400 && self.http_status != 401) || self.error.is_some() {
            frustrating = 1;
        } else if self.duration <= self.apdex_t {
            satisfying = 1;
        } else if self.duration <= 4.0 * self.apdex_t {
            tolerating = 1;
        } else {
            frustrating = 1;
        }

        Some(ApdexMetric {
            name: Ustr::from(self.path.replace("WebAction", "Apdex").as_str()),
            satisfying,
            tolerating,
            frustrating,
            apdex_t: self.apdex_t,
        })
    }

    /// Renders the whole tree, the root first.
    pub fn render_trace(&self, budget: &mut TraceBudget) -> TraceRecord {
        budget.claim_root();
        TraceRecord {
            start: offset_ms(self, self.start_time),
            end: offset_ms(self, self.end_time),
            metric_name: self.path.clone(),
            call_url: self.request_uri.clone(),
            call_count: 1,
            class_name: String::new(),
            method_name: if self.is_root {
                self.name.clone()
            } else {
                NESTED_TRACKER_METHOD.to_string()
            },
            params: TraceParams::default(),
            children: render_children(&self.children, self, budget),
        }
    }

    /// Renders a slow-action trace when the action crossed `threshold` (ms)
    /// or a callee asked for one.
    pub fn slow_action_trace(&self, limit: usize, threshold: f64) -> Option<SlowActionRecord> {
        let forced = self.trace_data.values().any(CrossAppData::forces_trace);
        if self.duration < threshold && !forced {
            return None;
        }

        let mut budget = TraceBudget::new(limit);
        let trace = self.render_trace(&mut budget);

        let mut custom_params = Map::new();
        custom_params.insert("httpStatus".to_string(), json!(self.http_status));
        custom_params.insert("threadName".to_string(), json!(self.thread_name));
        custom_params.insert("referer".to_string(), json!(self.referer));
        custom_params.extend(self.custom_params.clone());

        let start_time = self.start_time as i64;
        let payload = (start_time, &self.request_params, &custom_params, &trace);

        Some(SlowActionRecord {
            start_time,
            duration: self.duration,
            path: self.path.clone(),
            request_uri: self.request_uri.clone(),
            trace: to_json_blob(&payload),
            trace_id: self.trace_id.clone(),
            trace_guid: self.trace_guid.clone(),
            error_count: u32::from(self.error.is_some()),
            exception_count: self.exceptions.len(),
        })
    }

    pub fn traced_error(&self) -> Option<Captured<TracedError>> {
        let error = self.error.as_ref()?;

        let filter_key = [
            self.path.as_str(),
            &error.http_status.to_string(),
            &error.class_name,
            &error.message,
        ]
        .join(FILTER_KEY_SEPARATOR);
        let params = json!({
            "params": {
                "threadName": error.thread_name,
                "httpStatus": self.http_status,
                "referer": error.referer,
            },
            "requestParams": error.request_params,
            "stacktrace": format_stack_trace(&error.stack_trace),
        });

        Some(Captured {
            filter_key,
            entry: DedupEntry::new(
                Origin {
                    action: self.path.clone(),
                    class_name: error.class_name.clone(),
                    tracker_type: error.tracker_type,
                    status_code: None,
                },
                TracedError {
                    error_time: error.error_time,
                    action: self.path.clone(),
                    http_status: self.http_status,
                    class_name: error.class_name.clone(),
                    message: error.message.clone(),
                    count: 1,
                    request_uri: self.request_uri.clone(),
                    params: to_json_blob(&params),
                    trace_guid: self.trace_guid.clone(),
                },
            ),
        })
    }

    /// Exceptions of an action that did not end in an error. Messages longer
    /// than `max_msg_character` only dedup on their prefix.
    pub fn traced_exception(&self, max_msg_character: usize) -> Vec<Captured<TracedException>> {
        if self.error.is_some() {
            return Vec::new();
        }

        let action = self.path.replace(ESCAPED_SLASH, "/");
        self.exceptions
            .iter()
            .map(|exception| {
                let filter_key = [
                    action.as_str(),
                    &exception.class_name,
                    truncate_chars(&exception.message, max_msg_character),
                ]
                .join(FILTER_KEY_SEPARATOR);
                let params = json!({ "stacktrace": format_stack_trace(&exception.stack_trace) });

                Captured {
                    filter_key,
                    entry: DedupEntry::new(
                        Origin {
                            action: action.clone(),
                            class_name: exception.class_name.clone(),
                            tracker_type: exception.tracker_type,
                            status_code: None,
                        },
                        TracedException {
                            exception_time: exception.exception_time,
                            action: self.path.clone(),
                            class_name: exception.class_name.clone(),
                            message: exception.message.clone(),
                            count: 1,
                            request_uri: self.request_uri.clone(),
                            params: to_json_blob(&params),
                            trace_guid: self.trace_guid.clone(),
                        },
                    ),
                }
            })
            .collect()
    }

    /// Failed outgoing calls. Dropped entirely when the action carries
    /// exceptions.
    pub fn traced_external_error(&self) -> Vec<Captured<TracedExternalError>> {
        if !self.exceptions.is_empty() {
            return Vec::new();
        }

        self.external_errors
            .iter()
            .map(|error| {
                let metric_name =
                    format!("External/{}/{}", escape_slashes(&error.url), error.module_name);
                let filter_key = [
                    metric_name.as_str(),
                    &self.http_status.to_string(),
                    &error.class_name,
                ]
                .join(FILTER_KEY_SEPARATOR);
                let params = json!({
                    "params": {
                        "threadName": error.thread_name,
                        "httpStatus": self.http_status,
                    },
                    "requestParams": error.request_params,
                    "stacktrace": format_stack_trace(&error.stack_trace),
                });

                Captured {
                    filter_key,
                    entry: DedupEntry::new(
                        Origin {
                            action: metric_name.clone(),
                            class_name: error.class_name.clone(),
                            tracker_type: error.tracker_type,
                            status_code: Some(self.http_status),
                        },
                        TracedExternalError {
                            error_time: error.error_time,
                            metric_name,
                            status_code: error.status_code,
                            class_name: error.class_name.clone(),
                            count: 1,
                            action: self.path.clone(),
                            params: to_json_blob(&params),
                        },
                    ),
                }
            })
            .collect()
    }

    pub fn slow_sql_nodes(&self) -> Vec<SlowSqlNode> {
        self.slow_sql.iter().map(|sample| sample.to_node(self)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FunctionNode, RedisNode};

    fn web_root(duration: f64) -> TrackerNode {
        TrackerNode {
            tracker_type: TrackerType::WebAction,
            name: "checkout".to_string(),
            path: "WebAction/shop/checkout".to_string(),
            request_uri: "/checkout".to_string(),
            start_time: 1_700_000_000.0,
            end_time: 1_700_000_000.0 + duration / 1000.0,
            duration,
            exclusive: duration,
            http_status: 200,
            apdex_t: 200.0,
            is_root: true,
            ..TrackerNode::default()
        }
    }

    fn counters(root: &TrackerNode) -> (u64, u64, u64) {
        let metric = root.apdex_metrics().expect("web actions produce apdex");
        (metric.satisfying, metric.tolerating, metric.frustrating)
    }

    #[test]
    fn test_apdex_classification() {
        assert_eq!(counters(&web_root(200.0)), (1, 0, 0));
        assert_eq!(counters(&web_root(500.0)), (0, 1, 0));
        assert_eq!(counters(&web_root(800.0)), (0, 1, 0));
        assert_eq!(counters(&web_root(900.0)), (0, 0, 1));

        let mut not_found = web_root(10.0);
        not_found.http_status = 404;
        assert_eq!(counters(&not_found), (0, 0, 1));

        let mut unauthorized = web_root(10.0);
        unauthorized.http_status = 401;
        assert_eq!(counters(&unauthorized), (1, 0, 0));

        let mut failed = web_root(10.0);
        failed.error = Some(TrackerError::default());
        assert_eq!(counters(&failed), (0, 0, 1));

        assert_eq!(
            web_root(10.0).apdex_metrics().map(|m| m.name.to_string()),
            Some("Apdex/shop/checkout".to_string())
        );
    }

    #[test]
    fn test_background_actions_have_no_apdex_or_action_metric() {
        let mut root = web_root(10.0);
        root.tracker_type = TrackerType::BackgroundAction;
        assert!(root.apdex_metrics().is_none());
        assert!(root.action_metrics().is_none());
    }

    #[test]
    fn test_action_metric_skips_server_errors() {
        let mut root = web_root(10.0);
        assert_eq!(
            root.action_metrics().map(|m| (m.name, m.scope)),
            Some(("WebAction/shop/checkout".to_string(), String::new()))
        );
        root.http_status = 500;
        assert!(root.action_metrics().is_none());
    }

    #[test]
    fn test_root_time_metrics() {
        let mut root = web_root(100.0);
        root.queue_time = 5.0;
        root.children.push(
            RedisNode {
                command: "get".to_string(),
                host: "db1".to_string(),
                port: 6379,
                ..RedisNode::default()
            }
            .into(),
        );

        let metrics = root.time_metrics();
        assert_eq!(metrics[0].name, "WebAction/shop/checkout");
        assert_eq!(metrics[0].scope, "WebAction/shop/checkout");
        assert_eq!(metrics[1].name, "GENERAL/WebFrontend/NULL/QueueTime");
        assert_eq!(metrics[1].scope, "GENERAL/WebFrontend/NULL/QueueTime");
        assert_eq!(metrics[1].duration, 5.0);
        assert_eq!(metrics.len(), 7);
    }

    #[test]
    fn test_render_budget_stops_deep_tree() {
        let mut root = web_root(10.0);
        let leaf = FunctionNode {
            group: "g".to_string(),
            name: "leaf".to_string(),
            ..FunctionNode::default()
        };
        let middle = FunctionNode {
            group: "g".to_string(),
            name: "middle".to_string(),
            children: vec![leaf.into()],
            ..FunctionNode::default()
        };
        root.children.push(middle.into());

        let mut budget = TraceBudget::new(2);
        let trace = root.render_trace(&mut budget);
        assert_eq!(trace.node_count(), 2);
        assert_eq!(budget.rendered(), 2);

        let mut budget = TraceBudget::new(10);
        assert_eq!(root.render_trace(&mut budget).node_count(), 3);
    }

    #[test]
    fn test_slow_action_threshold_and_forced_capture() {
        let root = web_root(1500.0);
        assert!(root.slow_action_trace(100, 2000.0).is_none());

        let mut forced = web_root(1500.0);
        forced.trace_data.insert(
            "ext".to_string(),
            CrossAppData {
                tr: 1,
                ..CrossAppData::default()
            },
        );
        assert!(forced.slow_action_trace(100, 2000.0).is_some());

        let mut slow = web_root(2500.0);
        slow.custom_params.insert("tenant".to_string(), json!("acme"));
        slow.exceptions.push(ExceptionNode::default());
        let record = slow.slow_action_trace(100, 2000.0).expect("slow action");

        assert_eq!(record.start_time, 1_700_000_000);
        assert_eq!(record.error_count, 0);
        assert_eq!(record.exception_count, 1);

        let trace: Value = serde_json::from_str(&record.trace).expect("trace is json");
        assert_eq!(trace[0], json!(1_700_000_000i64));
        assert_eq!(trace[2]["httpStatus"], json!(200));
        assert_eq!(trace[2]["tenant"], json!("acme"));
        assert_eq!(trace[3][0], json!(0));
        assert_eq!(trace[3][1], json!(2500));
        assert_eq!(trace[3][6], json!("checkout"));
    }

    #[test]
    fn test_traced_error_shape() {
        let mut root = web_root(10.0);
        root.http_status = 500;
        root.trace_guid = Some("guid-1".to_string());
        root.error = Some(TrackerError {
            error_time: 1_700_000_001,
            class_name: "ValueError".to_string(),
            message: "bad input".to_string(),
            http_status: 500,
            ..TrackerError::default()
        });

        let captured = root.traced_error().expect("error captured");
        assert_eq!(
            captured.filter_key,
            "WebAction/shop/checkout_|500_|ValueError_|bad input"
        );
        let value = serde_json::to_value(&captured.entry.record).expect("failed to serialize");
        assert_eq!(value[0], json!(1_700_000_001));
        assert_eq!(value[2], json!(500));
        assert_eq!(value[5], json!(1));
        assert_eq!(value[8], json!("guid-1"));

        // An error swallows the action's exceptions.
        root.exceptions.push(ExceptionNode::default());
        assert!(root.traced_exception(1024).is_empty());
    }

    #[test]
    fn test_exception_key_truncates_message() {
        let mut root = web_root(10.0);
        root.path = "WebAction/shop%2Fcart".to_string();
        root.exceptions.push(ExceptionNode {
            class_name: "KeyError".to_string(),
            message: "missing key".to_string(),
            ..ExceptionNode::default()
        });

        let captured = root.traced_exception(4);
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].filter_key, "WebAction/shop/cart_|KeyError_|miss");
        assert_eq!(captured[0].entry.origin.action, "WebAction/shop/cart");
        assert_eq!(captured[0].entry.record.action, "WebAction/shop%2Fcart");
    }

    #[test]
    fn test_external_errors_dropped_with_exceptions() {
        let mut root = web_root(10.0);
        root.external_errors.push(ExternalError {
            url: "http://pay.local/charge".to_string(),
            module_name: "reqwest".to_string(),
            status_code: 503,
            class_name: "HttpError".to_string(),
            tracker_type: TrackerType::External,
            ..ExternalError::default()
        });

        let captured = root.traced_external_error();
        assert_eq!(captured.len(), 1);
        assert_eq!(
            captured[0].filter_key,
            "External/http:%2F%2Fpay.local%2Fcharge/reqwest_|200_|HttpError"
        );
        assert_eq!(captured[0].entry.record.status_code, 503);
        assert_eq!(captured[0].entry.origin.status_code, Some(200));

        root.exceptions.push(ExceptionNode::default());
        assert!(root.traced_external_error().is_empty());
    }

    #[test]
    fn test_slow_sql_nodes_carry_action_context() {
        let mut root = web_root(10.0);
        root.slow_sql.push(SlowSqlSample {
            metric: "Database/orders/SELECT".to_string(),
            sql: "SELECT * FROM orders".to_string(),
            duration: 700.0,
            ..SlowSqlSample::default()
        });

        let nodes = root.slow_sql_nodes();
        assert_eq!(nodes[0].path, "WebAction/shop/checkout");
        assert_eq!(nodes[0].request_uri, "/checkout");
        assert_eq!(nodes[0].duration, 700.0);
    }
}
