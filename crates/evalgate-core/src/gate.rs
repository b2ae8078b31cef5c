//! Threshold gate.
//!
//! Compares an [`AggregateResult`] against the threshold of a
//! [`ThresholdTier`] and produces a [`GateVerdict`]: the pass rate, the
//! threshold it was held to, and a diagnostic for every failing case.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateResult;
use crate::domain::{CaseResult, EvalGateError, Result, ThresholdSource, ThresholdTable, ThresholdTier};
use crate::metrics::METRICS;
use crate::obs;

/// Default width, in characters, of the input fragment in a diagnostic.
pub const DEFAULT_DIAGNOSTIC_WIDTH: usize = 60;

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// One failing case, summarized for a human.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaseDiagnostic {
    /// Leading characters of the case input.
    pub input_fragment: String,
    pub failed_checks: Vec<String>,
}

impl fmt::Display for CaseDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" failed [{}]", self.input_fragment, self.failed_checks.join(", "))
    }
}

/// The outcome of holding an aggregate to a tier's threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateVerdict {
    pub ok: bool,
    /// `100 * passed / total`.
    pub pass_rate: f64,
    pub threshold: f64,
    pub tier: ThresholdTier,
    pub source: ThresholdSource,
    pub passed: u64,
    pub total: u64,
    /// Every failing case, in merge order. May be non-empty on a passing
    /// verdict.
    pub diagnostics: Vec<CaseDiagnostic>,
}

impl GateVerdict {
    /// Turn a failing verdict into [`EvalGateError::GateFailed`].
    pub fn assert_ok(&self) -> Result<()> {
        if self.ok {
            Ok(())
        } else {
            Err(EvalGateError::GateFailed {
                summary: self.to_string(),
            })
        }
    }
}

impl fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}/{} passed ({:.2}%, required {:.2}%)",
            self.tier,
            if self.ok { "passed" } else { "FAILED" },
            self.passed,
            self.total,
            self.pass_rate,
            self.threshold,
        )?;
        for d in &self.diagnostics {
            write!(f, "\n  - {d}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Holds aggregates to the thresholds of a [`ThresholdTable`].
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdGate {
    table: ThresholdTable,
    diagnostic_width: usize,
}

impl Default for ThresholdGate {
    fn default() -> Self {
        Self::new(ThresholdTable::standard())
    }
}

impl ThresholdGate {
    pub fn new(table: ThresholdTable) -> Self {
        Self {
            table,
            diagnostic_width: DEFAULT_DIAGNOSTIC_WIDTH,
        }
    }

    /// Override how many characters of each failing input are kept.
    pub fn with_diagnostic_width(mut self, width: usize) -> Self {
        self.diagnostic_width = width;
        self
    }

    pub fn table(&self) -> &ThresholdTable {
        &self.table
    }

    /// Threshold for `tier`, after fallback.
    pub fn threshold(&self, tier: ThresholdTier) -> f64 {
        self.table.threshold(tier)
    }

    /// Evaluate `aggregate` against `tier`.
    ///
    /// Fails with [`EvalGateError::ThresholdUndefined`] when the aggregate has
    /// no cases: a 0/0 pass rate is never compared.
    pub fn passes(&self, aggregate: &AggregateResult, tier: ThresholdTier) -> Result<GateVerdict> {
        let Some(pass_rate) = aggregate.pass_rate() else {
            return Err(EvalGateError::ThresholdUndefined {
                reason: format!("no cases to gate against {tier}"),
            });
        };
        let (threshold, source) = self.table.resolve(tier);
        let ok = pass_rate >= threshold;

        let diagnostics = aggregate
            .failing_cases()
            .map(|case| self.diagnose(case))
            .collect();

        METRICS.inc_gates_evaluated();
        obs::emit_gate_evaluated(&tier.to_string(), pass_rate, threshold, ok);

        Ok(GateVerdict {
            ok,
            pass_rate,
            threshold,
            tier,
            source,
            passed: aggregate.passed(),
            total: aggregate.total(),
            diagnostics,
        })
    }

    fn diagnose(&self, case: &CaseResult) -> CaseDiagnostic {
        CaseDiagnostic {
            input_fragment: truncate(case.input(), self.diagnostic_width).to_string(),
            failed_checks: case.failed_checks().to_vec(),
        }
    }
}

/// First `width` chars of `s`, cut on a char boundary.
pub(crate) fn truncate(s: &str, width: usize) -> &str {
    match s.char_indices().nth(width) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
