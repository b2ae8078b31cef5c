//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `MemorySuiteLoader`, `ScriptedSubject`, and `KeywordGrader`
//! that satisfy the trait contracts without any external services.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;

use crate::collaborators::{CaseGrader, SuiteLoader, Subject};
use crate::domain::{Check, GradeOutcome, SuiteDefinition, SuiteId};

// ---------------------------------------------------------------------------
// MemorySuiteLoader
// ---------------------------------------------------------------------------

/// Suite loader backed by a `HashMap<SuiteId, SuiteDefinition>` that counts
/// every load per id.
#[derive(Debug, Default)]
pub struct MemorySuiteLoader {
    suites: Mutex<HashMap<SuiteId, SuiteDefinition>>,
    failing: Mutex<HashSet<SuiteId>>,
    loads: Mutex<HashMap<SuiteId, usize>>,
    delay: Option<Duration>,
}

impl MemorySuiteLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a suite under its own id.
    pub fn with_suite(self, suite: SuiteDefinition) -> Self {
        self.suites.lock().unwrap().insert(suite.id.clone(), suite);
        self
    }

    /// Make loading `id` fail.
    pub fn failing(self, id: impl Into<SuiteId>) -> Self {
        self.failing.lock().unwrap().insert(id.into());
        self
    }

    /// Sleep this long inside every load (to widen race windows in tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many times `id` was loaded.
    pub fn load_count(&self, id: &SuiteId) -> usize {
        self.loads.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    /// Total loads across every id.
    pub fn total_loads(&self) -> usize {
        self.loads.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl SuiteLoader for MemorySuiteLoader {
    async fn load(&self, id: &SuiteId) -> anyhow::Result<SuiteDefinition> {
        *self.loads.lock().unwrap().entry(id.clone()).or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(id) {
            bail!("eval file {id} could not be read");
        }
        self.suites
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no suite registered for {id}"))
    }
}

// ---------------------------------------------------------------------------
// ScriptedSubject
// ---------------------------------------------------------------------------

/// Subject that echoes prompts unless a scripted response, failure, or
/// delay matches the prompt.
#[derive(Debug, Default)]
pub struct ScriptedSubject {
    responses: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    fail_substrings: Vec<String>,
    calls: AtomicUsize,
}

impl ScriptedSubject {
    /// A subject that answers every prompt with the prompt itself.
    pub fn echo() -> Self {
        Self::default()
    }

    /// Answer the exact prompt `prompt` with `response`.
    pub fn respond(mut self, prompt: impl Into<String>, response: impl Into<String>) -> Self {
        self.responses.insert(prompt.into(), response.into());
        self
    }

    /// Delay the answer to the exact prompt `prompt`.
    pub fn delay(mut self, prompt: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(prompt.into(), delay);
        self
    }

    /// Fail every prompt containing `needle`.
    pub fn fail_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_substrings.push(needle.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subject for ScriptedSubject {
    async fn invoke(&self, prompt: &str, _context: &serde_json::Value) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(prompt) {
            tokio::time::sleep(*delay).await;
        }
        if self.fail_substrings.iter().any(|n| prompt.contains(n.as_str())) {
            bail!("connection reset while invoking subject");
        }
        Ok(self
            .responses
            .get(prompt)
            .cloned()
            .unwrap_or_else(|| prompt.to_string()))
    }
}

// ---------------------------------------------------------------------------
// KeywordGrader
// ---------------------------------------------------------------------------

/// Grader understanding two check kinds: `contains` and `not_contains`, each
/// reading the keyword from `params.value`. Any other kind is a grader error.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordGrader;

#[async_trait]
impl CaseGrader for KeywordGrader {
    async fn grade(&self, response: &str, checks: &[Check]) -> anyhow::Result<GradeOutcome> {
        let mut failed = Vec::new();
        for check in checks {
            let value = check
                .params
                .get("value")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("check {} has no string `value` param", check.id))?;
            let ok = match check.kind.as_str() {
                "contains" => response.contains(value),
                "not_contains" => !response.contains(value),
                other => bail!("unsupported check kind `{other}`"),
            };
            if !ok {
                failed.push(check.id.clone());
            }
        }
        Ok(if failed.is_empty() {
            GradeOutcome::pass()
        } else {
            GradeOutcome::fail(failed)
        })
    }
}
