//! Suite execution: subject invocation and grading for every case.
//!
//! One failed or timed-out case never voids the suite. It is recorded as
//! `Fail` with a synthetic check naming the cause, and the remaining cases
//! still run.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::collaborators::{CaseGrader, Subject};
use crate::domain::{CaseResult, ConfigError, EvalCase, SuiteDefinition, SuiteResult};
use crate::gate::{truncate, DEFAULT_DIAGNOSTIC_WIDTH};
use crate::metrics::METRICS;

/// Synthetic check recorded when the subject call times out.
pub const SUBJECT_TIMEOUT_CHECK: &str = "subject_timeout";
/// Synthetic check recorded when the grader call times out.
pub const GRADER_TIMEOUT_CHECK: &str = "grader_timeout";
/// Prefix of the synthetic check recorded when the subject call errors.
pub const SUBJECT_ERROR_PREFIX: &str = "subject_error";
/// Prefix of the synthetic check recorded when the grader call errors.
pub const GRADER_ERROR_PREFIX: &str = "grader_error";

/// How cases inside one suite are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CaseConcurrency {
    /// One case at a time, in declaration order.
    Sequential,
    /// Up to `max_in_flight` cases at once; results are still returned in
    /// declaration order.
    Concurrent { max_in_flight: usize },
}

/// Configuration for a [`SuiteExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub case_concurrency: CaseConcurrency,
    /// Bound on a single subject call.
    pub subject_timeout_secs: u64,
    /// Bound on a single grader call.
    pub grader_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            case_concurrency: CaseConcurrency::Concurrent { max_in_flight: 4 },
            subject_timeout_secs: 60,
            grader_timeout_secs: 120,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let CaseConcurrency::Concurrent { max_in_flight: 0 } = self.case_concurrency {
            return Err(ConfigError::ZeroValue {
                field: "case_concurrency.max_in_flight",
            });
        }
        if self.subject_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue {
                field: "subject_timeout_secs",
            });
        }
        if self.grader_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue {
                field: "grader_timeout_secs",
            });
        }
        Ok(())
    }
}

/// Runs every case of a suite against the subject and grades the responses.
pub struct SuiteExecutor {
    subject: Arc<dyn Subject>,
    grader: Arc<dyn CaseGrader>,
    config: ExecutorConfig,
    fragment_width: usize,
}

impl SuiteExecutor {
    pub fn new(subject: Arc<dyn Subject>, grader: Arc<dyn CaseGrader>, config: ExecutorConfig) -> Self {
        Self {
            subject,
            grader,
            config,
            fragment_width: DEFAULT_DIAGNOSTIC_WIDTH,
        }
    }

    /// Characters of case input quoted in warning logs.
    pub fn with_fragment_width(mut self, width: usize) -> Self {
        self.fragment_width = width;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `suite` and return its results in declaration order.
    #[instrument(skip(self, suite), fields(suite_id = %suite.id, cases = suite.cases.len()))]
    pub async fn execute(&self, suite: &SuiteDefinition) -> SuiteResult {
        let cases = match self.config.case_concurrency {
            CaseConcurrency::Sequential => {
                let mut out = Vec::with_capacity(suite.cases.len());
                for case in &suite.cases {
                    out.push(self.run_case(case).await);
                }
                out
            }
            CaseConcurrency::Concurrent { max_in_flight } => {
                // `buffered` yields in input order regardless of completion order.
                let pending: Vec<_> = suite.cases.iter().map(|case| self.run_case(case)).collect();
                stream::iter(pending)
                    .buffered(max_in_flight.max(1))
                    .collect::<Vec<_>>()
                    .await
            }
        };

        SuiteResult::from_cases(cases)
    }

    fn fragment<'a>(&self, input: &'a str) -> &'a str {
        truncate(input, self.fragment_width)
    }

    async fn run_case(&self, case: &EvalCase) -> CaseResult {
        let subject_timeout = Duration::from_secs(self.config.subject_timeout_secs);
        let grader_timeout = Duration::from_secs(self.config.grader_timeout_secs);

        let output = match timeout(subject_timeout, self.subject.invoke(&case.input, &case.context)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(input = %self.fragment(&case.input), error = %e, "subject invocation failed");
                return isolated(case, String::new(), format!("{SUBJECT_ERROR_PREFIX}: {e}"));
            }
            Err(_) => {
                warn!(
                    input = %self.fragment(&case.input),
                    timeout_secs = self.config.subject_timeout_secs,
                    "subject invocation timed out"
                );
                return isolated(case, String::new(), SUBJECT_TIMEOUT_CHECK.to_string());
            }
        };

        match timeout(grader_timeout, self.grader.grade(&output, &case.checks)).await {
            Ok(Ok(outcome)) => {
                METRICS.inc_cases_graded();
                CaseResult::graded(case.input.clone(), output, outcome)
            }
            Ok(Err(e)) => {
                warn!(input = %self.fragment(&case.input), error = %e, "grader failed");
                isolated(case, output, format!("{GRADER_ERROR_PREFIX}: {e}"))
            }
            Err(_) => {
                warn!(
                    input = %self.fragment(&case.input),
                    timeout_secs = self.config.grader_timeout_secs,
                    "grader timed out"
                );
                isolated(case, output, GRADER_TIMEOUT_CHECK.to_string())
            }
        }
    }
}

fn isolated(case: &EvalCase, output: String, check: String) -> CaseResult {
    METRICS.inc_case_failures_isolated();
    CaseResult::errored(case.input.clone(), output, check)
}
