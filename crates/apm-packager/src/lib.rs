// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process aggregation engine for APM action traces.
//!
//! Instrumentation builds one [`node::TrackerNode`] tree per finished unit of
//! work. [`packager::Packager::record`] fans that tree out into metric packets,
//! apdex counters, slow-action traces, error and exception records and quantile
//! samples. An uploader periodically takes a [`packager::Packager::packets_snapshot`],
//! drains it, and hands it back through [`packager::Packager::rollback`] when the
//! upload fails.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod errors;
pub mod metric;
pub mod node;
pub mod packager;
pub mod packager_service;
pub mod packet;
pub mod payload;
pub mod quantile;
pub mod traced;
pub mod util;
