//! Domain models for evalgate.
//!
//! Canonical definitions for the core entities:
//! - `SuiteDefinition`: ordered cases handed over by a suite loader
//! - `CaseResult` / `SuiteResult`: graded output, built once by the executor
//! - `ThresholdTable`: typed pass-rate thresholds with total fallback

pub mod error;
pub mod result;
pub mod suite;
pub mod threshold;

// Re-export main types and errors
pub use error::{ConfigError, EvalGateError, Result};
pub use result::{CaseResult, Grade, GradeOutcome, SuiteResult, UNNAMED_FAILURE};
pub use suite::{Check, EvalCase, SuiteDefinition, SuiteId};
pub use threshold::{
    Category, Strictness, ThresholdSource, ThresholdTable, ThresholdTier, TierThreshold,
};
