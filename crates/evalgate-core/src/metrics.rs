//! Global atomic counters for evalgate observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at orchestrator shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters without allocation or locking.
pub struct Metrics {
    suites_executed: AtomicU64,
    cases_graded: AtomicU64,
    case_failures_isolated: AtomicU64,
    gates_evaluated: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            suites_executed: AtomicU64::new(0),
            cases_graded: AtomicU64::new(0),
            case_failures_isolated: AtomicU64::new(0),
            gates_evaluated: AtomicU64::new(0),
        }
    }

    /// Increment the suites-executed counter by one.
    pub fn inc_suites_executed(&self) {
        self.suites_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "suites_executed", "counter incremented");
    }

    /// Increment the cases-graded counter by one.
    pub fn inc_cases_graded(&self) {
        self.cases_graded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cases_graded", "counter incremented");
    }

    /// Count a subject or grader failure that was downgraded to a `Fail` grade.
    pub fn inc_case_failures_isolated(&self) {
        self.case_failures_isolated.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "case_failures_isolated", "counter incremented");
    }

    /// Increment the gates-evaluated counter by one.
    pub fn inc_gates_evaluated(&self) {
        self.gates_evaluated.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "gates_evaluated", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            suites_executed = self.suites_executed(),
            cases_graded = self.cases_graded(),
            case_failures_isolated = self.case_failures_isolated(),
            gates_evaluated = self.gates_evaluated(),
        );
    }

    pub fn suites_executed(&self) -> u64 {
        self.suites_executed.load(Ordering::Relaxed)
    }

    pub fn cases_graded(&self) -> u64 {
        self.cases_graded.load(Ordering::Relaxed)
    }

    pub fn case_failures_isolated(&self) -> u64 {
        self.case_failures_isolated.load(Ordering::Relaxed)
    }

    pub fn gates_evaluated(&self) -> u64 {
        self.gates_evaluated.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.suites_executed.store(0, Ordering::Relaxed);
        self.cases_graded.store(0, Ordering::Relaxed);
        self.case_failures_isolated.store(0, Ordering::Relaxed);
        self.gates_evaluated.store(0, Ordering::Relaxed);
    }
}
