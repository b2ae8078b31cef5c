//! Eval suite definitions as handed over by a suite loader.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable key identifying one eval suite (a file path or logical name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuiteId(String);

impl SuiteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SuiteId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SuiteId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One check attached to a case. Opaque to the core: only the grader
/// interprets `kind` and `params`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Check {
    /// Identifier reported in `failed_checks` when this check fails.
    pub id: String,

    /// Check kind understood by the grader (e.g. `llm_judge`, `match`).
    pub kind: String,

    /// Check-specific parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Check {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            params,
        }
    }
}

/// A single prompt within a suite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalCase {
    /// Prompt sent to the subject, preserved verbatim in results.
    pub input: String,

    /// Extra context forwarded to the subject alongside the prompt.
    #[serde(default)]
    pub context: serde_json::Value,

    /// Checks the grader applies to the response.
    #[serde(default)]
    pub checks: Vec<Check>,

    /// Tags for categorizing cases.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl EvalCase {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            context: serde_json::Value::Null,
            checks: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// Attach a check.
    pub fn with_check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    /// Set the subject context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A complete suite: an ordered list of cases under one identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuiteDefinition {
    pub id: SuiteId,

    /// Human-readable name for reporting.
    pub name: String,

    /// Cases in declaration order.
    pub cases: Vec<EvalCase>,
}

impl SuiteDefinition {
    pub fn new(id: impl Into<SuiteId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            cases: Vec::new(),
        }
    }

    /// Append a case, keeping declaration order.
    pub fn add_case(mut self, case: EvalCase) -> Self {
        self.cases.push(case);
        self
    }
}
