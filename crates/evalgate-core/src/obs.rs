//! Structured observability hooks for suite lifecycle events.
//!
//! This module provides:
//! - Suite-scoped tracing spans via `SuiteSpan` RAII guard
//! - Emission functions for key lifecycle events: suite start/finish,
//!   cache poisoning, fan-out completion, gate evaluation
//!
//! Events are emitted at `info!` level (filter with `EVALGATE_LOG`).
//! For JSON output, set `EVALGATE_LOG_FORMAT=json`.

use tracing::info;

/// RAII guard that enters a suite-scoped tracing span.
///
/// Only use this in synchronous code; async code should attach a span with
/// `tracing::Instrument` instead of holding the guard across awaits.
pub struct SuiteSpan {
    _span: tracing::span::EnteredSpan,
}

impl SuiteSpan {
    /// Create and enter a span tagged with the suite id.
    pub fn enter(suite_id: &str) -> Self {
        let span = tracing::info_span!("evalgate.suite", suite_id = %suite_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: suite execution started.
pub fn emit_suite_started(run_id: &str, suite_id: &str, cases: usize) {
    info!(event = "suite.started", run_id = %run_id, suite_id = %suite_id, cases = cases);
}

/// Emit event: suite execution finished with its counts.
pub fn emit_suite_finished(run_id: &str, suite_id: &str, passed: u64, total: u64, duration_ms: u64) {
    info!(
        event = "suite.finished",
        run_id = %run_id,
        suite_id = %suite_id,
        passed = passed,
        total = total,
        duration_ms = duration_ms,
    );
}

/// Emit event: a suite could not produce a result (warning level).
pub fn emit_suite_failed(run_id: &str, suite_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "suite.failed", run_id = %run_id, suite_id = %suite_id, error = %error);
}

/// Emit event: pending suites were poisoned (warning level).
pub fn emit_cache_poisoned(run_id: &str, count: usize, reason: &str) {
    tracing::warn!(event = "cache.poisoned", run_id = %run_id, count = count, reason = %reason);
}

/// Emit event: a fan-out over several suites settled.
pub fn emit_fanout_finished(run_id: &str, requested: usize, failed: usize, duration_ms: u64) {
    info!(
        event = "fanout.finished",
        run_id = %run_id,
        requested = requested,
        failed = failed,
        duration_ms = duration_ms,
    );
}

/// Emit event: gate evaluation completed with pass rate and verdict.
pub fn emit_gate_evaluated(tier: &str, pass_rate: f64, threshold: f64, ok: bool) {
    info!(
        event = "gate.evaluated",
        tier = %tier,
        pass_rate = pass_rate,
        threshold = threshold,
        ok = ok,
    );
}
