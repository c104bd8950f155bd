// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging and metrics infrastructure.
//!
//! - **Tracing**: structured logs through `tracing`, configured once by the
//!   binary with [`init_telemetry`].
//! - **Metrics**: per-instance counters and latency histograms for external
//!   commands and lock waits.
//!
//! Library code never installs a subscriber; it only emits events. Public
//! async operations carry `#[instrument]` when the `telemetry` feature is on.

mod init;
pub mod metrics;

pub use init::{init_telemetry, TelemetryConfig};
pub use metrics::{CommandMetrics, Histogram, Metrics, MetricsSnapshot, OperationMetrics};
