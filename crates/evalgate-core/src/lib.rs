//! evalgate Core Library
//!
//! Runs eval suites against a subject system at most once per orchestrator,
//! aggregates their grades, and gates the aggregate against typed pass-rate
//! thresholds.

pub mod aggregate;
pub mod collaborators;
pub mod config;
pub mod domain;
pub mod executor;
pub mod fakes;
pub mod fan_out;
pub mod gate;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod single_flight;
pub mod telemetry;

pub use aggregate::AggregateResult;

pub use collaborators::{CaseGrader, Subject, SuiteLoader};

pub use config::RunConfig;

pub use domain::{
    Category, CaseResult, Check, ConfigError, EvalCase, EvalGateError, Grade, GradeOutcome,
    Result, Strictness, SuiteDefinition, SuiteId, SuiteResult, ThresholdSource, ThresholdTable,
    ThresholdTier,
};

pub use executor::{CaseConcurrency, ExecutorConfig, SuiteExecutor};

pub use fan_out::{FanOutConfig, FanOutError, JoinPolicy, ParallelFanOut};

pub use gate::{CaseDiagnostic, GateVerdict, ThresholdGate};

pub use orchestrator::{EvalOrchestrator, RunSummary};

pub use single_flight::{EntryState, FlightError, FlightStats, Outcome, SingleFlight};

/// evalgate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
