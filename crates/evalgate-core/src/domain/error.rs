//! Domain-level error taxonomy for evalgate.

use crate::domain::suite::SuiteId;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("threshold for {tier} must be within 0..=100, got {value}")]
    ThresholdOutOfRange { tier: String, value: f64 },

    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },
}

/// evalgate domain errors.
///
/// Every variant is cloneable so a cached failure can be replayed verbatim
/// to each waiter of a suite.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalGateError {
    #[error("subject invocation failed: {0}")]
    SubjectInvocation(String),

    #[error("grader failed: {0}")]
    Grader(String),

    #[error("no cached result for suite {suite_id}: {reason}")]
    CacheAccess { suite_id: SuiteId, reason: String },

    #[error("pass rate undefined: {reason}")]
    ThresholdUndefined { reason: String },

    #[error("failed to load suite {suite_id}: {reason}")]
    SuiteLoad { suite_id: SuiteId, reason: String },

    #[error("evals not available for suite {suite_id}: {reason}")]
    SuiteFailed { suite_id: SuiteId, reason: String },

    #[error("fan-out deadline of {after_secs}s exceeded with {} suite(s) unresolved: [{}]", pending.len(), join_ids(pending))]
    DeadlineExceeded { after_secs: u64, pending: Vec<SuiteId> },

    #[error("gate failed: {summary}")]
    GateFailed { summary: String },

    #[error("invalid aggregate: passed {passed} > total {total}")]
    InvalidAggregate { passed: u64, total: u64 },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

fn join_ids(ids: &[SuiteId]) -> String {
    ids.iter()
        .map(SuiteId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for evalgate domain operations.
pub type Result<T> = std::result::Result<T, EvalGateError>;
