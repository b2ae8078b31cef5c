//! Concurrent fan-out over a [`SingleFlight`] cache.
//!
//! Every requested key is dispatched to the cache at once. An optional cap
//! bounds how many runs execute at the same time across every fan-out that
//! shares this [`ParallelFanOut`]; the permit is taken inside the spawned
//! run, so a caller that gives up never frees a slot early. Keys that are
//! already pending or settled cost nothing extra. The returned map is keyed,
//! so completion order never matters.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::domain::ConfigError;
use crate::single_flight::{FlightError, Outcome, SingleFlight};

/// How a fan-out reports failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Let every key settle, then report the first failure in request order.
    #[default]
    SettleAll,
    /// Report the first failure to complete without waiting for the rest.
    /// Executions already started keep running and still populate the cache.
    FailFast,
}

/// Configuration for a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
    /// Maximum number of runs executing at once; `None` (the default) means
    /// unbounded.
    pub max_concurrent_suites: Option<usize>,
    pub join_policy: JoinPolicy,
    /// Soft deadline for the whole fan-out. On expiry every pending cache
    /// entry is poisoned.
    pub deadline_secs: Option<u64>,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            max_concurrent_suites: None,
            join_policy: JoinPolicy::SettleAll,
            deadline_secs: None,
        }
    }
}

impl FanOutConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_suites == Some(0) {
            return Err(ConfigError::ZeroValue {
                field: "max_concurrent_suites",
            });
        }
        if self.deadline_secs == Some(0) {
            return Err(ConfigError::ZeroValue {
                field: "deadline_secs",
            });
        }
        Ok(())
    }
}

/// Why a fan-out did not return a complete map.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FanOutError<K, E> {
    #[error("key {key:?} failed: {cause}")]
    Key { key: K, cause: FlightError<E> },

    #[error("deadline of {after:?} exceeded with {} key(s) unresolved", pending.len())]
    DeadlineExceeded { after: Duration, pending: Vec<K> },
}

/// Fan-out over a shared single-flight cache.
pub struct ParallelFanOut<K, V, E> {
    cache: SingleFlight<K, V, E>,
    config: FanOutConfig,
    limiter: Option<Arc<Semaphore>>,
}

impl<K, V, E> ParallelFanOut<K, V, E>
where
    K: Eq + Hash + Ord + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(cache: SingleFlight<K, V, E>, config: FanOutConfig) -> Self {
        let limiter = config
            .max_concurrent_suites
            .map(|n| Arc::new(Semaphore::new(n.clamp(1, Semaphore::MAX_PERMITS))));
        Self {
            cache,
            config,
            limiter,
        }
    }

    pub fn cache(&self) -> &SingleFlight<K, V, E> {
        &self.cache
    }

    pub fn config(&self) -> &FanOutConfig {
        &self.config
    }

    /// Run every key and return each individual outcome in request order
    /// (duplicates collapsed to their first occurrence).
    ///
    /// Only a deadline expiry makes this fail.
    #[instrument(skip(self, keys, make_run), fields(keys = keys.len()))]
    pub async fn run_all_settled<F, Fut>(
        &self,
        keys: &[K],
        make_run: F,
    ) -> Result<Vec<(K, Outcome<V, E>)>, FanOutError<K, E>>
    where
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let keys = dedup(keys);
        let join = async {
            let mut pending = self.dispatch(&keys, &make_run);
            let mut settled: Vec<Option<Outcome<V, E>>> = vec![None; keys.len()];
            while let Some((idx, outcome)) = pending.next().await {
                settled[idx] = Some(outcome);
            }
            keys.iter()
                .cloned()
                .zip(settled)
                .filter_map(|(k, o)| o.map(|o| (k, o)))
                .collect::<Vec<_>>()
        };
        self.with_deadline(&keys, join).await
    }

    /// Run every key and return the settled values keyed by id.
    ///
    /// Under [`JoinPolicy::SettleAll`] all keys finish before the first
    /// failure (in request order) is reported. Under
    /// [`JoinPolicy::FailFast`] the first failure to complete is reported
    /// immediately.
    #[instrument(skip(self, keys, make_run), fields(keys = keys.len(), policy = ?self.config.join_policy))]
    pub async fn run_all<F, Fut>(
        &self,
        keys: &[K],
        make_run: F,
    ) -> Result<BTreeMap<K, Arc<V>>, FanOutError<K, E>>
    where
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        match self.config.join_policy {
            JoinPolicy::SettleAll => {
                let outcomes = self.run_all_settled(keys, make_run).await?;
                let mut values = BTreeMap::new();
                for (key, outcome) in outcomes {
                    match outcome {
                        Ok(value) => {
                            values.insert(key, value);
                        }
                        Err(cause) => return Err(FanOutError::Key { key, cause }),
                    }
                }
                Ok(values)
            }
            JoinPolicy::FailFast => {
                let keys = dedup(keys);
                let join = async {
                    let mut pending = self.dispatch(&keys, &make_run);
                    let mut values = BTreeMap::new();
                    while let Some((idx, outcome)) = pending.next().await {
                        match outcome {
                            Ok(value) => {
                                values.insert(keys[idx].clone(), value);
                            }
                            Err(cause) => {
                                return Err(FanOutError::Key {
                                    key: keys[idx].clone(),
                                    cause,
                                })
                            }
                        }
                    }
                    Ok(values)
                };
                self.with_deadline(&keys, join).await?
            }
        }
    }

    fn dispatch<'a, F, Fut>(
        &'a self,
        keys: &'a [K],
        make_run: &'a F,
    ) -> FuturesUnordered<impl Future<Output = (usize, Outcome<V, E>)> + 'a>
    where
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        keys.iter()
            .enumerate()
            .map(|(idx, key)| async move {
                let outcome = self
                    .cache
                    .get_or_run(key.clone(), || self.limited(make_run(key.clone())))
                    .await;
                (idx, outcome)
            })
            .collect()
    }

    /// Wrap a run so it holds a permit of the shared limiter while it executes.
    fn limited<Fut>(&self, run: Fut) -> impl Future<Output = Result<V, E>> + Send + 'static
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let limiter = self.limiter.clone();
        async move {
            // The semaphore is never closed, so acquire cannot fail.
            let _permit = match limiter {
                Some(sem) => sem.acquire_owned().await.ok(),
                None => None,
            };
            run.await
        }
    }

    async fn with_deadline<T, Fut>(&self, keys: &[K], join: Fut) -> Result<T, FanOutError<K, E>>
    where
        Fut: Future<Output = T>,
    {
        let Some(secs) = self.config.deadline_secs else {
            return Ok(join.await);
        };
        let after = Duration::from_secs(secs);
        match tokio::time::timeout(after, join).await {
            Ok(value) => Ok(value),
            Err(_) => {
                let reason = format!("fan-out deadline of {secs}s exceeded");
                let mut pending = self.cache.poison_pending(&reason);
                pending.extend(self.cache.poison_absent(keys, &reason));
                pending.sort();
                warn!(deadline_secs = secs, pending = pending.len(), "fan-out deadline exceeded");
                Err(FanOutError::DeadlineExceeded { after, pending })
            }
        }
    }
}

fn dedup<K: Eq + Hash + Clone>(keys: &[K]) -> Vec<K> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter().filter(|k| seen.insert(*k)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type FanOut = ParallelFanOut<String, u32, String>;

    fn keys(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_duplicate_keys_run_once() {
        let fan = FanOut::new(SingleFlight::new(), FanOutConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let out = fan
            .run_all(&keys(&["a", "a", "b"]), |k| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(k.len() as u32)
                }
            })
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_is_respected() {
        let config = FanOutConfig {
            max_concurrent_suites: Some(2),
            ..FanOutConfig::default()
        };
        let fan = FanOut::new(SingleFlight::new(), config);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let out = fan
            .run_all(&keys(&["a", "b", "c", "d", "e"]), |_| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(1)
                }
            })
            .await
            .unwrap();

        assert_eq!(out.len(), 5);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_is_shared_across_concurrent_fan_outs() {
        let config = FanOutConfig {
            max_concurrent_suites: Some(1),
            ..FanOutConfig::default()
        };
        let fan = FanOut::new(SingleFlight::new(), config);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let run = |_: String| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<u32, String>(1)
            }
        };

        // A caller that gives up keeps its run, and its permit, alive.
        let gave_up =
            tokio::time::timeout(Duration::from_millis(10), fan.run_all(&keys(&["x"]), run)).await;
        assert!(gave_up.is_err());

        let left_keys = keys(&["a", "b"]);
        let right_keys = keys(&["c", "d"]);
        let (left, right) = tokio::join!(
            fan.run_all(&left_keys, run),
            fan.run_all(&right_keys, run),
        );

        assert_eq!(left.unwrap().len(), 2);
        assert_eq!(right.unwrap().len(), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_config_does_not_serialize() {
        let fan = FanOut::new(SingleFlight::new(), FanOutConfig::default());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let ids: Vec<String> = (0..12).map(|i| format!("suite-{i}")).collect();

        let out = fan
            .run_all(&ids, |_| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(1)
                }
            })
            .await
            .unwrap();

        assert_eq!(out.len(), 12);
        assert_eq!(peak.load(Ordering::SeqCst), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_under_cap_poisons_queued_keys() {
        let config = FanOutConfig {
            max_concurrent_suites: Some(1),
            deadline_secs: Some(5),
            ..FanOutConfig::default()
        };
        let fan = FanOut::new(SingleFlight::new(), config);
        let started = Arc::new(AtomicUsize::new(0));
        let stuck = keys(&["stuck0", "stuck1", "stuck2"]);
        let run = |_: String| {
            let started = Arc::clone(&started);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<u32, String>(1)
            }
        };

        let err = fan.run_all(&stuck, run).await.unwrap_err();
        assert_eq!(
            err,
            FanOutError::DeadlineExceeded {
                after: Duration::from_secs(5),
                pending: stuck.clone(),
            }
        );
        assert!(err.to_string().contains("3 key(s) unresolved"));
        for key in &stuck {
            assert!(matches!(
                fan.cache().peek(key),
                Some(Err(FlightError::Poisoned(_)))
            ));
        }

        // Replayed from the cache, never run fresh.
        let again = fan.run_all_settled(&keys(&["stuck2"]), run).await.unwrap();
        assert!(matches!(again[0].1, Err(FlightError::Poisoned(_))));
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_all_reports_first_failure_in_request_order() {
        let fan = FanOut::new(SingleFlight::new(), FanOutConfig::default());

        let err = fan
            .run_all(&keys(&["slow-bad", "fast-bad", "ok"]), |k| async move {
                if k == "slow-bad" {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                if k.ends_with("bad") {
                    Err(format!("{k} exploded"))
                } else {
                    Ok(1)
                }
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FanOutError::Key {
                key: "slow-bad".to_string(),
                cause: FlightError::Failed("slow-bad exploded".to_string()),
            }
        );
        // Siblings were allowed to settle.
        assert!(fan.cache().peek(&"ok".to_string()).unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_returns_first_completed_failure() {
        let config = FanOutConfig {
            join_policy: JoinPolicy::FailFast,
            ..FanOutConfig::default()
        };
        let fan = FanOut::new(SingleFlight::new(), config);

        let err = fan
            .run_all(&keys(&["slow", "bad"]), |k| async move {
                if k == "slow" {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(1)
                } else {
                    Err("bad".to_string())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, FanOutError::Key { ref key, .. } if key == "bad"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_poisons_pending_entries() {
        let config = FanOutConfig {
            deadline_secs: Some(5),
            ..FanOutConfig::default()
        };
        let fan = FanOut::new(SingleFlight::new(), config);

        let err = fan
            .run_all(&keys(&["quick", "stuck"]), |k| async move {
                if k == "stuck" {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(1)
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FanOutError::DeadlineExceeded {
                after: Duration::from_secs(5),
                pending: vec!["stuck".to_string()],
            }
        );
        assert!(fan.cache().peek(&"quick".to_string()).unwrap().is_ok());
        assert!(matches!(
            fan.cache().peek(&"stuck".to_string()),
            Some(Err(FlightError::Poisoned(_)))
        ));
    }

    #[tokio::test]
    async fn test_run_all_settled_returns_every_outcome() {
        let fan = FanOut::new(SingleFlight::new(), FanOutConfig::default());

        let outcomes = fan
            .run_all_settled(&keys(&["a", "b", "c"]), |k| async move {
                if k == "b" {
                    Err("nope".to_string())
                } else {
                    Ok(1)
                }
            })
            .await
            .unwrap();

        let summary: Vec<(&str, bool)> = outcomes
            .iter()
            .map(|(k, o)| (k.as_str(), o.is_ok()))
            .collect();
        assert_eq!(summary, vec![("a", true), ("b", false), ("c", true)]);
    }

    #[test]
    fn test_config_validation() {
        assert!(FanOutConfig::default().validate().is_ok());
        assert_eq!(FanOutConfig::default().max_concurrent_suites, None);
        let zero = FanOutConfig {
            max_concurrent_suites: Some(0),
            ..FanOutConfig::default()
        };
        assert!(zero.validate().is_err());
    }
}
