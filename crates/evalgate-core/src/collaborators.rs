//! Traits for the systems evalgate drives but does not own.
//!
//! - [`SuiteLoader`] turns a suite id into a [`SuiteDefinition`]
//! - [`Subject`] is the system under test
//! - [`CaseGrader`] applies a case's checks to a response
//!
//! Implementations return `anyhow::Result` so they can carry any cause; the
//! executor downgrades subject and grader errors to case-level failures.

use async_trait::async_trait;

use crate::domain::{Check, GradeOutcome, SuiteDefinition, SuiteId};

/// Supplies suite definitions by id (e.g. by reading eval files).
#[async_trait]
pub trait SuiteLoader: Send + Sync {
    async fn load(&self, id: &SuiteId) -> anyhow::Result<SuiteDefinition>;
}

/// The system under test.
#[async_trait]
pub trait Subject: Send + Sync {
    /// Produce a response for one prompt.
    async fn invoke(&self, prompt: &str, context: &serde_json::Value) -> anyhow::Result<String>;
}

/// Grades one response against its checks.
///
/// An `Err` means the grader could not run (e.g. the judge call failed);
/// a response that fails its checks is `Ok(GradeOutcome::fail(..))`.
#[async_trait]
pub trait CaseGrader: Send + Sync {
    async fn grade(&self, response: &str, checks: &[Check]) -> anyhow::Result<GradeOutcome>;
}
