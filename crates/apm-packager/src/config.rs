// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector settings consumed by the packager.
//!
//! Settings are merged from the local configuration file and the values
//! pushed by the collector server. Loading them is the embedder's job; this
//! module only describes their shape and defaults. Every section is
//! `#[serde(default)]`, so a partial document such as
//! `{"action_tracer": {"action_threshold": 500}}` keeps the defaults for
//! everything it leaves out.

use crate::constants;
use crate::errors;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ActionTracerSettings {
    /// Capture slow-action traces.
    pub enabled: bool,
    /// Duration in milliseconds from which an action is traced.
    pub action_threshold: f64,
    /// Slow-action traces kept per action name between two uploads.
    pub max_action_trace_per_action: usize,
    /// Capture slow SQL statements.
    pub slow_sql: bool,
}

impl Default for ActionTracerSettings {
    fn default() -> Self {
        ActionTracerSettings {
            enabled: true,
            action_threshold: constants::DEFAULT_ACTION_THRESHOLD_MS,
            max_action_trace_per_action: constants::DEFAULT_TOP_N_PER_ACTION,
            slow_sql: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ErrorCollectorSettings {
    pub enabled: bool,
}

impl Default for ErrorCollectorSettings {
    fn default() -> Self {
        ErrorCollectorSettings { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExceptionSettings {
    /// Characters of the message that take part in the exception dedup key.
    pub max_msg_character: usize,
    /// Distinct exception keys kept between two uploads.
    pub max_type_count: usize,
}

impl Default for ExceptionSettings {
    fn default() -> Self {
        ExceptionSettings {
            max_msg_character: constants::DEFAULT_MAX_MSG_CHARACTERS,
            max_type_count: constants::DEFAULT_MAX_EXCEPTION_TYPES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub action_tracer: ActionTracerSettings,
    /// Maximum number of nodes rendered into one slow-action trace. The root
    /// always renders, so values below 1 act as 1.
    pub action_tracer_nodes: usize,
    pub error_collector: ErrorCollectorSettings,
    pub exception: ExceptionSettings,
    /// Distinct error keys (and external error keys) kept between two uploads.
    pub max_error_trace: usize,
    /// Distinct slow SQL statements kept between two uploads.
    pub slow_sql_count: usize,
    /// Percentiles tracked per action, ascending, each in (0, 100).
    /// Empty disables quantile tracking.
    pub quantile: Vec<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            action_tracer: ActionTracerSettings::default(),
            action_tracer_nodes: constants::DEFAULT_ACTION_TRACER_NODES,
            error_collector: ErrorCollectorSettings::default(),
            exception: ExceptionSettings::default(),
            max_error_trace: constants::DEFAULT_MAX_ERROR_TRACE,
            slow_sql_count: constants::DEFAULT_SLOW_SQL_COUNT,
            quantile: Vec::new(),
        }
    }
}

impl Settings {
    #[must_use]
    pub fn quantile_enabled(&self) -> bool {
        !self.quantile.is_empty()
    }

    /// Checks the values the packager cannot recover from at record time.
    pub fn validate(&self) -> Result<(), errors::Creation> {
        for percentile in &self.quantile {
            if !(*percentile > 0.0 && *percentile < 100.0) {
                return Err(errors::Creation::InvalidQuantile(*percentile));
            }
        }
        if self.quantile.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(errors::Creation::UnorderedQuantiles);
        }
        Ok(())
    }
}
