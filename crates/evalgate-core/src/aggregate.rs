//! Cross-suite aggregation.
//!
//! Aggregates are sums of suite counts, so merging is O(number of suites),
//! commutative and associative. Failing suites are retained by reference so
//! the gate can list their failing cases.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Serialize, Serializer};

use crate::domain::{CaseResult, EvalGateError, Result, SuiteResult};

/// Merge suite results into one aggregate. An empty input yields `{0, 0}`.
pub fn merge<'a, I>(results: I) -> AggregateResult
where
    I: IntoIterator<Item = &'a Arc<SuiteResult>>,
{
    results
        .into_iter()
        .fold(AggregateResult::default(), |acc, r| acc.merge(AggregateResult::of(r)))
}

/// Summed counts over a set of suites.
#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    passed: u64,
    total: u64,
    failing: Vec<Arc<SuiteResult>>,
}

impl AggregateResult {
    /// Aggregate of a single suite.
    pub fn of(result: &Arc<SuiteResult>) -> Self {
        Self {
            passed: result.passed(),
            total: result.total(),
            failing: if result.failed() > 0 {
                vec![Arc::clone(result)]
            } else {
                Vec::new()
            },
        }
    }

    /// Aggregate over a keyed set of suites, merged in key order.
    pub fn from_map<K>(results: &BTreeMap<K, Arc<SuiteResult>>) -> Self {
        merge(results.values())
    }

    /// Aggregate from bare counts, with no case detail for diagnostics.
    pub fn from_counts(passed: u64, total: u64) -> Result<Self> {
        if passed > total {
            return Err(EvalGateError::InvalidAggregate { passed, total });
        }
        Ok(Self {
            passed,
            total,
            failing: Vec::new(),
        })
    }

    /// Sum two aggregates.
    pub fn merge(mut self, other: Self) -> Self {
        self.passed += other.passed;
        self.total += other.total;
        self.failing.extend(other.failing);
        self
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

    /// Percentage of passing cases; `None` when there are no cases.
    pub fn pass_rate(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(100.0 * self.passed as f64 / self.total as f64)
        }
    }

    /// Failing cases of the merged suites, suite by suite in merge order.
    pub fn failing_cases(&self) -> impl Iterator<Item = &CaseResult> {
        self.failing.iter().flat_map(|s| s.failing_cases())
    }
}

/// Equality compares counts only; retained suites are diagnostic context.
impl PartialEq for AggregateResult {
    fn eq(&self, other: &Self) -> bool {
        self.passed == other.passed && self.total == other.total
    }
}

impl Eq for AggregateResult {}

impl Serialize for AggregateResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Counts {
            passed: u64,
            total: u64,
        }
        Counts {
            passed: self.passed,
            total: self.total,
        }
        .serialize(serializer)
    }
}
