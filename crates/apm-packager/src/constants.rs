// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric name fragments and default limits shared across the crate.

/// Prefix routing a metric into the general (unscoped rollup) table.
pub const GENERAL_PREFIX: &str = "GENERAL/";

/// Queue time metric emitted by a root tracker.
pub const QUEUE_TIME_METRIC: &str = "GENERAL/WebFrontend/NULL/QueueTime";

/// Category of metrics emitted by instrumented function calls. The collector
/// matches on this exact name.
pub const FUNCTION_CATEGORY: &str = "Python";

/// Substring identifying the agent's own frames in captured stack traces.
pub const AGENT_FRAME_MARKER: &str = "apm_packager";

/// Method name rendered for a tracker that is not the root of its trace.
pub const NESTED_TRACKER_METHOD: &str = "execute";

/// Fallback callee id when cross-application data carries none.
pub const MISSING_CALLEE_ID: &str = "No-Id-Exist";

/// Rendering of an absent cross-application field.
pub const NONE_LITERAL: &str = "None";

/// Escaped form of `/` inside metric name segments.
pub const ESCAPED_SLASH: &str = "%2F";

/// Separator between the parts of a dedup filter key.
pub const FILTER_KEY_SEPARATOR: &str = "_|";

pub const ACTION_TRACE_DATA_TYPE: &str = "actionTraceData";
pub const SQL_TRACE_DATA_TYPE: &str = "sqlTraceData";

pub const DEFAULT_ACTION_THRESHOLD_MS: f64 = 2000.0;
pub const DEFAULT_ACTION_TRACER_NODES: usize = 2000;
pub const DEFAULT_TOP_N_PER_ACTION: usize = 5;
pub const DEFAULT_MAX_ERROR_TRACE: usize = 20;
pub const DEFAULT_MAX_EXCEPTION_TYPES: usize = 20;
pub const DEFAULT_MAX_MSG_CHARACTERS: usize = 1024;
pub const DEFAULT_SLOW_SQL_COUNT: usize = 20;
