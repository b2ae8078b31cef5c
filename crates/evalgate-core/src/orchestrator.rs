//! Caller-facing entry point.
//!
//! An [`EvalOrchestrator`] owns one single-flight cache of suite results.
//! Every suite id it is asked for is loaded and executed at most once for
//! the orchestrator's lifetime; every caller, concurrent or later, sees the
//! same `Arc<SuiteResult>` or the same failure. Orchestrators share nothing,
//! so several can live in one process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tracing::{info, info_span, instrument, Instrument};
use uuid::Uuid;

use crate::aggregate::{self, AggregateResult};
use crate::collaborators::{CaseGrader, Subject, SuiteLoader};
use crate::config::RunConfig;
use crate::domain::{
    Category, EvalGateError, Result, Strictness, SuiteId, SuiteResult, ThresholdTier,
};
use crate::executor::SuiteExecutor;
use crate::fan_out::{FanOutError, ParallelFanOut};
use crate::gate::{GateVerdict, ThresholdGate};
use crate::metrics::METRICS;
use crate::obs;
use crate::single_flight::{EntryState, FlightError, FlightStats, SingleFlight};

type SuiteFanOut = ParallelFanOut<SuiteId, SuiteResult, EvalGateError>;

/// Snapshot of what an orchestrator has done so far.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Cache entry and request counters.
    pub suites: FlightStats,
    /// Counts over every suite that settled successfully.
    pub aggregate: AggregateResult,
}

/// Runs eval suites once each and gates their aggregate.
pub struct EvalOrchestrator {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    loader: Arc<dyn SuiteLoader>,
    executor: Arc<SuiteExecutor>,
    fan_out: SuiteFanOut,
    gate: ThresholdGate,
}

impl EvalOrchestrator {
    /// Build an orchestrator with an empty cache. Fails on invalid config.
    pub fn new(
        config: RunConfig,
        loader: Arc<dyn SuiteLoader>,
        subject: Arc<dyn Subject>,
        grader: Arc<dyn CaseGrader>,
    ) -> Result<Self> {
        config.validate()?;
        let RunConfig {
            executor,
            fan_out,
            thresholds,
            diagnostic_width,
        } = config;

        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, "eval orchestrator created");

        Ok(Self {
            run_id,
            started_at: Utc::now(),
            loader,
            executor: Arc::new(
                SuiteExecutor::new(subject, grader, executor).with_fragment_width(diagnostic_width),
            ),
            fan_out: ParallelFanOut::new(SingleFlight::new(), fan_out),
            gate: ThresholdGate::new(thresholds).with_diagnostic_width(diagnostic_width),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Run every suite in `ids` (at most once each) and return their results.
    ///
    /// Under the default settle-all policy every suite finishes, and is
    /// cached, before the first failure in request order is returned as
    /// [`EvalGateError::SuiteFailed`].
    #[instrument(skip(self, ids), fields(run_id = %self.run_id, suites = ids.len()))]
    pub async fn run_all_once(&self, ids: &[SuiteId]) -> Result<BTreeMap<SuiteId, Arc<SuiteResult>>> {
        let started = Instant::now();
        let result = self.fan_out.run_all(ids, self.suite_runner()).await;
        self.finish_fan_out(ids, started);
        result.map_err(|e| self.fan_out_error(e))
    }

    /// Run every suite in `ids` and return each one's own outcome, in
    /// request order with duplicates collapsed.
    #[instrument(skip(self, ids), fields(run_id = %self.run_id, suites = ids.len()))]
    pub async fn run_all_settled(
        &self,
        ids: &[SuiteId],
    ) -> Result<Vec<(SuiteId, Result<Arc<SuiteResult>>)>> {
        let started = Instant::now();
        let result = self.fan_out.run_all_settled(ids, self.suite_runner()).await;
        self.finish_fan_out(ids, started);
        let outcomes = result.map_err(|e| self.fan_out_error(e))?;
        Ok(outcomes
            .into_iter()
            .map(|(id, outcome)| {
                let outcome = outcome.map_err(|cause| suite_failed(&id, &cause));
                (id, outcome)
            })
            .collect())
    }

    /// Result of a suite that already ran.
    ///
    /// Never triggers execution: an id that was never requested, or is still
    /// running, is an [`EvalGateError::CacheAccess`].
    pub fn get_cached(&self, id: &SuiteId) -> Result<Arc<SuiteResult>> {
        let _span = obs::SuiteSpan::enter(id.as_str());
        let reason = match self.fan_out.cache().state(id) {
            EntryState::Absent => "suite was never requested",
            EntryState::Pending => "suite is still running",
            EntryState::Succeeded | EntryState::Failed => {
                return match self.fan_out.cache().peek(id) {
                    Some(Ok(result)) => Ok(result),
                    Some(Err(cause)) => Err(suite_failed(id, &cause)),
                    // Settled entries are never evicted.
                    None => Err(EvalGateError::CacheAccess {
                        suite_id: id.clone(),
                        reason: "entry vanished".to_string(),
                    }),
                };
            }
        };
        Err(EvalGateError::CacheAccess {
            suite_id: id.clone(),
            reason: reason.to_string(),
        })
    }

    /// Threshold for `(category, strictness)`, after fallback.
    pub fn threshold(&self, category: Category, strictness: Strictness) -> f64 {
        self.gate.threshold(ThresholdTier::new(category, strictness))
    }

    /// Hold `aggregate` to the threshold of `tier`.
    pub fn gate(&self, aggregate: &AggregateResult, tier: ThresholdTier) -> Result<GateVerdict> {
        self.gate.passes(aggregate, tier)
    }

    /// Run `ids`, merge their results and gate the aggregate.
    pub async fn gate_suites(&self, ids: &[SuiteId], tier: ThresholdTier) -> Result<GateVerdict> {
        let results = self.run_all_once(ids).await?;
        self.gate(&AggregateResult::from_map(&results), tier)
    }

    pub fn summary(&self) -> RunSummary {
        let mut settled = self.fan_out.cache().succeeded();
        settled.sort_by(|a, b| a.0.cmp(&b.0));
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            suites: self.fan_out.cache().stats(),
            aggregate: aggregate::merge(settled.iter().map(|(_, r)| r)),
        }
    }

    /// Abandon suites still running, flush metrics, and return the final
    /// summary.
    pub fn shutdown(self) -> RunSummary {
        let reason = "orchestrator shut down";
        let abandoned = self.fan_out.cache().poison_pending(reason);
        if !abandoned.is_empty() {
            obs::emit_cache_poisoned(&self.run_id.to_string(), abandoned.len(), reason);
        }
        METRICS.flush();
        let summary = self.summary();
        info!(
            run_id = %self.run_id,
            succeeded = summary.suites.succeeded,
            failed = summary.suites.failed,
            passed = summary.aggregate.passed(),
            total = summary.aggregate.total(),
            "eval orchestrator shut down"
        );
        summary
    }

    fn suite_runner(&self) -> impl Fn(SuiteId) -> BoxFuture<'static, Result<SuiteResult>> {
        let run_id = self.run_id.to_string();
        let loader = Arc::clone(&self.loader);
        let executor = Arc::clone(&self.executor);
        move |id: SuiteId| {
            let span = info_span!("evalgate.suite", run_id = %run_id, suite_id = %id);
            run_suite(run_id.clone(), Arc::clone(&loader), Arc::clone(&executor), id)
                .instrument(span)
                .boxed()
        }
    }

    fn finish_fan_out(&self, ids: &[SuiteId], started: Instant) {
        let cache = self.fan_out.cache();
        let failed = ids
            .iter()
            .filter(|id| cache.state(id) == EntryState::Failed)
            .count();
        obs::emit_fanout_finished(
            &self.run_id.to_string(),
            ids.len(),
            failed,
            started.elapsed().as_millis() as u64,
        );
    }

    fn fan_out_error(&self, err: FanOutError<SuiteId, EvalGateError>) -> EvalGateError {
        match err {
            FanOutError::Key { key, cause } => suite_failed(&key, &cause),
            FanOutError::DeadlineExceeded { after, pending } => {
                obs::emit_cache_poisoned(
                    &self.run_id.to_string(),
                    pending.len(),
                    "fan-out deadline exceeded",
                );
                EvalGateError::DeadlineExceeded {
                    after_secs: after.as_secs(),
                    pending,
                }
            }
        }
    }
}

async fn run_suite(
    run_id: String,
    loader: Arc<dyn SuiteLoader>,
    executor: Arc<SuiteExecutor>,
    id: SuiteId,
) -> Result<SuiteResult> {
    let started = Instant::now();
    let suite = match loader.load(&id).await {
        Ok(suite) => suite,
        Err(e) => {
            let err = EvalGateError::SuiteLoad {
                suite_id: id.clone(),
                reason: format!("{e:#}"),
            };
            obs::emit_suite_failed(&run_id, id.as_str(), &err);
            return Err(err);
        }
    };

    obs::emit_suite_started(&run_id, id.as_str(), suite.cases.len());
    let result = executor.execute(&suite).await;
    METRICS.inc_suites_executed();
    obs::emit_suite_finished(
        &run_id,
        id.as_str(),
        result.passed(),
        result.total(),
        started.elapsed().as_millis() as u64,
    );
    Ok(result)
}

fn suite_failed(id: &SuiteId, cause: &FlightError<EvalGateError>) -> EvalGateError {
    EvalGateError::SuiteFailed {
        suite_id: id.clone(),
        reason: cause.to_string(),
    }
}
