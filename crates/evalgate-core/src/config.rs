//! Run configuration.
//!
//! A [`RunConfig`] is built from defaults, optionally a TOML document, then
//! `EVALGATE_*` environment overrides, and is validated before an
//! orchestrator accepts it.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::{ConfigError, ThresholdTable};
use crate::executor::{CaseConcurrency, ExecutorConfig};
use crate::fan_out::{FanOutConfig, JoinPolicy};
use crate::gate::DEFAULT_DIAGNOSTIC_WIDTH;

/// A number of suites, or `0`/`unbounded` for no cap.
pub const MAX_SUITES_ENV: &str = "EVALGATE_MAX_SUITES";
/// `sequential`, or the number of cases in flight per suite.
pub const CASE_CONCURRENCY_ENV: &str = "EVALGATE_CASE_CONCURRENCY";
pub const SUBJECT_TIMEOUT_ENV: &str = "EVALGATE_SUBJECT_TIMEOUT_SECS";
pub const GRADER_TIMEOUT_ENV: &str = "EVALGATE_GRADER_TIMEOUT_SECS";
pub const DEADLINE_ENV: &str = "EVALGATE_DEADLINE_SECS";
pub const FAIL_FAST_ENV: &str = "EVALGATE_FAIL_FAST";

/// Everything an [`EvalOrchestrator`](crate::EvalOrchestrator) is configured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub executor: ExecutorConfig,
    pub fan_out: FanOutConfig,
    pub thresholds: ThresholdTable,
    /// Characters of failing input kept in gate diagnostics.
    pub diagnostic_width: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            fan_out: FanOutConfig::default(),
            thresholds: ThresholdTable::standard(),
            diagnostic_width: DEFAULT_DIAGNOSTIC_WIDTH,
        }
    }
}

impl RunConfig {
    /// Parse a TOML document. Missing sections take their defaults; a
    /// `[thresholds]` section is layered over the standard table.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults with `EVALGATE_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Apply `EVALGATE_*` environment overrides on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup` (keyed by env var name).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(MAX_SUITES_ENV) {
            self.fan_out.max_concurrent_suites = if v.trim().eq_ignore_ascii_case("unbounded") {
                None
            } else {
                match parse(MAX_SUITES_ENV, &v)? {
                    0 => None,
                    n => Some(n),
                }
            };
        }
        if let Some(v) = lookup(CASE_CONCURRENCY_ENV) {
            self.executor.case_concurrency = if v.trim().eq_ignore_ascii_case("sequential") {
                CaseConcurrency::Sequential
            } else {
                CaseConcurrency::Concurrent {
                    max_in_flight: parse(CASE_CONCURRENCY_ENV, &v)?,
                }
            };
        }
        if let Some(v) = lookup(SUBJECT_TIMEOUT_ENV) {
            self.executor.subject_timeout_secs = parse(SUBJECT_TIMEOUT_ENV, &v)?;
        }
        if let Some(v) = lookup(GRADER_TIMEOUT_ENV) {
            self.executor.grader_timeout_secs = parse(GRADER_TIMEOUT_ENV, &v)?;
        }
        if let Some(v) = lookup(DEADLINE_ENV) {
            self.fan_out.deadline_secs = Some(parse(DEADLINE_ENV, &v)?);
        }
        if let Some(v) = lookup(FAIL_FAST_ENV) {
            self.fan_out.join_policy = if parse_bool(FAIL_FAST_ENV, &v)? {
                JoinPolicy::FailFast
            } else {
                JoinPolicy::SettleAll
            };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.executor.validate()?;
        self.fan_out.validate()?;
        if self.diagnostic_width == 0 {
            return Err(ConfigError::ZeroValue {
                field: "diagnostic_width",
            });
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    }
}
