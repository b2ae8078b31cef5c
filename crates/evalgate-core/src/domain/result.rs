//! Graded results: per case and per suite.
//!
//! [`SuiteResult`] is only ever built from a materialized list of
//! [`CaseResult`]s, so its counts cannot drift from its cases.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Pass/fail verdict for a single case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Pass,
    Fail,
}

impl Grade {
    pub fn is_pass(self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// What a grader returns for one response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeOutcome {
    pub grade: Grade,
    pub failed_checks: Vec<String>,
}

impl GradeOutcome {
    pub fn pass() -> Self {
        Self {
            grade: Grade::Pass,
            failed_checks: Vec::new(),
        }
    }

    pub fn fail(failed_checks: Vec<String>) -> Self {
        Self {
            grade: Grade::Fail,
            failed_checks,
        }
    }
}

/// Check name recorded when a grader reports `Fail` without naming a check.
pub const UNNAMED_FAILURE: &str = "unnamed_check_failure";

/// Result of one graded case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseResult {
    input: String,
    output: String,
    grade: Grade,
    failed_checks: Vec<String>,
}

impl CaseResult {
    /// Build a case result from a grader outcome.
    ///
    /// A `Pass` that still names failed checks is treated as a `Fail`, and a
    /// `Fail` with no named check gets [`UNNAMED_FAILURE`], so that
    /// `failed_checks` is empty exactly when the case passed.
    pub fn graded(input: String, output: String, outcome: GradeOutcome) -> Self {
        let GradeOutcome {
            grade,
            mut failed_checks,
        } = outcome;
        let grade = if failed_checks.is_empty() {
            if grade == Grade::Fail {
                failed_checks.push(UNNAMED_FAILURE.to_string());
            }
            grade
        } else {
            Grade::Fail
        };
        Self {
            input,
            output,
            grade,
            failed_checks,
        }
    }

    /// A case that could not be graded, recorded as `Fail` with a synthetic
    /// check naming the failure.
    pub fn errored(input: String, output: String, synthetic_check: String) -> Self {
        Self {
            input,
            output,
            grade: Grade::Fail,
            failed_checks: vec![synthetic_check],
        }
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn grade(&self) -> Grade {
        self.grade
    }

    pub fn passed(&self) -> bool {
        self.grade.is_pass()
    }

    pub fn failed_checks(&self) -> &[String] {
        &self.failed_checks
    }
}

/// Ordered results of one suite run plus its counts.
///
/// # Invariants
///
/// `passed == cases.iter().filter(passed).count()`, `total == cases.len()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteResult {
    passed: u64,
    total: u64,
    cases: Vec<CaseResult>,
}

impl SuiteResult {
    /// Materialize a suite result; counts are derived from `cases`.
    pub fn from_cases(cases: Vec<CaseResult>) -> Self {
        let passed = cases.iter().filter(|c| c.passed()).count() as u64;
        Self {
            passed,
            total: cases.len() as u64,
            cases,
        }
    }

    pub fn passed(&self) -> u64 {
        self.passed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn failed(&self) -> u64 {
        self.total - self.passed
    }

    /// Cases in declaration order.
    pub fn cases(&self) -> &[CaseResult] {
        &self.cases
    }

    /// Positional slice of cases, clamped to the available range.
    pub fn slice(&self, range: Range<usize>) -> &[CaseResult] {
        let end = range.end.min(self.cases.len());
        let start = range.start.min(end);
        &self.cases[start..end]
    }

    /// First case whose input contains `needle`.
    pub fn find_case(&self, needle: &str) -> Option<&CaseResult> {
        self.cases.iter().find(|c| c.input.contains(needle))
    }

    /// Cases graded `Fail`, in declaration order.
    pub fn failing_cases(&self) -> impl Iterator<Item = &CaseResult> {
        self.cases.iter().filter(|c| !c.passed())
    }

    /// Percentage of passing cases, `None` for an empty suite.
    pub fn pass_rate(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(100.0 * self.passed as f64 / self.total as f64)
        }
    }
}
