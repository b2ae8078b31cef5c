//! Keyed single-flight execution cache.
//!
//! [`SingleFlight`] maps a key to either an in-flight execution or its
//! settled outcome. The first caller for a key registers a pending entry and
//! spawns the work as its own task; every other caller, concurrent or later,
//! observes that same outcome. Entries move from pending to settled exactly
//! once and are never evicted: the cache lives as long as its owner.
//!
//! Failures are cached like successes. A failed key stays failed.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn, Instrument};

/// Why a key has no value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlightError<E> {
    /// The run function returned an error.
    #[error("{0}")]
    Failed(E),

    /// The run function panicked.
    #[error("execution panicked: {0}")]
    Panicked(String),

    /// The entry was settled externally before the run finished.
    #[error("execution abandoned: {0}")]
    Poisoned(String),
}

/// Settled outcome shared by every caller of a key.
pub type Outcome<V, E> = Result<Arc<V>, FlightError<E>>;

type Slot<V, E> = Option<Outcome<V, E>>;

enum Entry<V, E> {
    Pending {
        tx: Arc<watch::Sender<Slot<V, E>>>,
        rx: watch::Receiver<Slot<V, E>>,
        task: Option<AbortHandle>,
    },
    Settled(Outcome<V, E>),
}

/// Observable state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Absent,
    Pending,
    Succeeded,
    Failed,
}

/// Point-in-time counters for a cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlightStats {
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Requests answered by an existing entry.
    pub hits: u64,
    /// Run functions actually started.
    pub executions: u64,
}

struct Inner<K, V, E> {
    entries: Mutex<HashMap<K, Entry<V, E>>>,
    hits: AtomicU64,
    executions: AtomicU64,
}

impl<K, V, E> Inner<K, V, E>
where
    K: Eq + Hash,
{
    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<V, E>>> {
        // The map is only touched in short non-panicking sections.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V, E> Inner<K, V, E>
where
    K: Eq + Hash,
    E: Clone,
{
    /// Transition `key` from pending to settled. Returns the sender to notify
    /// waiters with, or `None` if the entry was already settled.
    fn settle(&self, key: &K, outcome: &Outcome<V, E>) -> Option<Arc<watch::Sender<Slot<V, E>>>> {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        let Entry::Pending { tx, .. } = entry else {
            return None;
        };
        let tx = Arc::clone(tx);
        *entry = Entry::Settled(outcome.clone());
        Some(tx)
    }
}

/// Cheaply cloneable handle to a keyed single-flight cache.
pub struct SingleFlight<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for SingleFlight<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                executions: AtomicU64::new(0),
            }),
        }
    }

    /// Return the outcome for `key`, running `run` only if no entry exists.
    ///
    /// `run` is invoked at most once per key for the lifetime of the cache,
    /// no matter how many callers race here. The work is spawned onto the
    /// runtime, so dropping the calling future does not cancel it.
    pub async fn get_or_run<F, Fut>(&self, key: K, run: F) -> Outcome<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (rx, leader) = {
            let mut entries = self.inner.lock();
            match entries.get(&key) {
                Some(Entry::Settled(outcome)) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = ?key, "single-flight hit (settled)");
                    return outcome.clone();
                }
                Some(Entry::Pending { rx, .. }) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = ?key, "single-flight hit (pending)");
                    (rx.clone(), false)
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    entries.insert(
                        key.clone(),
                        Entry::Pending {
                            tx: Arc::new(tx),
                            rx: rx.clone(),
                            task: None,
                        },
                    );
                    self.inner.executions.fetch_add(1, Ordering::Relaxed);
                    (rx, true)
                }
            }
        };

        if leader {
            // `run` is user code: call it outside the map lock.
            match std::panic::catch_unwind(AssertUnwindSafe(run)) {
                Ok(fut) => self.start(&key, fut),
                Err(panic) => self.settle_panicked(&key, panic.as_ref()),
            }
        }

        self.wait(&key, rx).await
    }

    /// Spawn `fut` for a key still pending. The map lock is held across the
    /// spawn so a concurrent `poison_pending` either sees the task handle or
    /// settles the entry first, in which case `fut` is dropped unrun.
    fn start<Fut>(&self, key: &K, fut: Fut)
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let mut entries = self.inner.lock();
        match entries.get_mut(key) {
            Some(Entry::Pending { task, .. }) => {
                *task = Some(self.spawn_run(key.clone(), fut));
            }
            _ => debug!(key = ?key, "entry settled before its run started"),
        }
    }

    fn spawn_run<Fut>(&self, key: K, fut: Fut) -> AbortHandle
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let run = async move {
            let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(value)) => Ok(Arc::new(value)),
                Ok(Err(e)) => Err(FlightError::Failed(e)),
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    warn!(key = ?key, panic = %msg, "single-flight run panicked");
                    Err(FlightError::Panicked(msg))
                }
            };
            if let Some(tx) = inner.settle(&key, &outcome) {
                tx.send_replace(Some(outcome));
            }
        };
        // The run inherits the leader's span.
        tokio::spawn(run.in_current_span()).abort_handle()
    }

    fn settle_panicked(&self, key: &K, panic: &(dyn std::any::Any + Send)) {
        let msg = panic_message(panic);
        warn!(key = ?key, panic = %msg, "single-flight run panicked before starting");
        let outcome: Outcome<V, E> = Err(FlightError::Panicked(msg));
        if let Some(tx) = self.inner.settle(key, &outcome) {
            tx.send_replace(Some(outcome));
        }
    }

    async fn wait(&self, key: &K, mut rx: watch::Receiver<Slot<V, E>>) -> Outcome<V, E> {
        if let Ok(slot) = rx.wait_for(Option::is_some).await {
            if let Some(outcome) = &*slot {
                return outcome.clone();
            }
        }
        // The sender only goes away after the entry settled.
        match self.inner.lock().get(key) {
            Some(Entry::Settled(outcome)) => outcome.clone(),
            _ => Err(FlightError::Poisoned("in-flight execution dropped".to_string())),
        }
    }

    /// Settled outcome for `key`, or `None` while absent or pending.
    pub fn peek(&self, key: &K) -> Option<Outcome<V, E>> {
        match self.inner.lock().get(key) {
            Some(Entry::Settled(outcome)) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// Current state of `key`.
    pub fn state(&self, key: &K) -> EntryState {
        match self.inner.lock().get(key) {
            None => EntryState::Absent,
            Some(Entry::Pending { .. }) => EntryState::Pending,
            Some(Entry::Settled(Ok(_))) => EntryState::Succeeded,
            Some(Entry::Settled(Err(_))) => EntryState::Failed,
        }
    }

    /// Keys whose execution has not settled yet.
    pub fn pending_keys(&self) -> Vec<K> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, e)| matches!(e, Entry::Pending { .. }))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Every successfully settled value.
    pub fn succeeded(&self) -> Vec<(K, Arc<V>)> {
        self.inner
            .lock()
            .iter()
            .filter_map(|(k, e)| match e {
                Entry::Settled(Ok(v)) => Some((k.clone(), Arc::clone(v))),
                _ => None,
            })
            .collect()
    }

    /// Settle every pending entry as [`FlightError::Poisoned`] and abort its
    /// task. Waiters wake with the poisoned outcome; later callers get it
    /// from the cache. Returns the poisoned keys.
    pub fn poison_pending(&self, reason: &str) -> Vec<K> {
        let mut notify = Vec::new();
        {
            let mut entries = self.inner.lock();
            for (key, entry) in entries.iter_mut() {
                if let Entry::Pending { tx, task, .. } = entry {
                    if let Some(task) = task.take() {
                        task.abort();
                    }
                    let outcome: Outcome<V, E> = Err(FlightError::Poisoned(reason.to_string()));
                    notify.push((key.clone(), Arc::clone(tx), outcome.clone()));
                    *entry = Entry::Settled(outcome);
                }
            }
        }

        let mut keys = Vec::with_capacity(notify.len());
        for (key, tx, outcome) in notify {
            tx.send_replace(Some(outcome));
            keys.push(key);
        }
        if !keys.is_empty() {
            warn!(count = keys.len(), reason = %reason, "poisoned pending single-flight entries");
        }
        keys
    }

    /// Settle each of `keys` that has no entry yet as
    /// [`FlightError::Poisoned`], so a later request replays the failure
    /// instead of running. Returns the keys that were inserted.
    pub fn poison_absent(&self, keys: &[K], reason: &str) -> Vec<K> {
        let mut entries = self.inner.lock();
        let mut poisoned = Vec::new();
        for key in keys {
            if !entries.contains_key(key) {
                let outcome: Outcome<V, E> = Err(FlightError::Poisoned(reason.to_string()));
                entries.insert(key.clone(), Entry::Settled(outcome));
                poisoned.push(key.clone());
            }
        }
        poisoned
    }

    /// Snapshot of entry and request counters.
    pub fn stats(&self) -> FlightStats {
        let entries = self.inner.lock();
        let mut stats = FlightStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            executions: self.inner.executions.load(Ordering::Relaxed),
            ..FlightStats::default()
        };
        for entry in entries.values() {
            match entry {
                Entry::Pending { .. } => stats.pending += 1,
                Entry::Settled(Ok(_)) => stats.succeeded += 1,
                Entry::Settled(Err(_)) => stats.failed += 1,
            }
        }
        stats
    }

    /// Number of keys ever requested.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type Cache = SingleFlight<String, u32, String>;

    #[tokio::test]
    async fn test_settled_entry_is_returned_without_rerun() {
        let cache = Cache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value = cache
                .get_or_run("k".to_string(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(7)
                })
                .await
                .unwrap();
            assert_eq!(*value, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn test_failure_is_cached_and_replayed() {
        let cache = Cache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let err = cache
                .get_or_run("bad".to_string(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>("boom".to_string())
                })
                .await
                .unwrap_err();
            assert_eq!(err, FlightError::Failed("boom".to_string()));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.state(&"bad".to_string()), EntryState::Failed);
    }

    #[tokio::test]
    async fn test_panic_becomes_cached_failure() {
        let cache = Cache::new();
        let err = cache
            .get_or_run("p".to_string(), || async {
                if true {
                    panic!("executor blew up");
                }
                Ok::<u32, String>(0)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlightError::Panicked(ref m) if m.contains("blew up")));

        // Replayed, not rerun.
        let again = cache
            .get_or_run("p".to_string(), || async { Ok::<u32, String>(1) })
            .await;
        assert!(matches!(again, Err(FlightError::Panicked(_))));
    }

    #[tokio::test]
    async fn test_panic_while_building_run_settles_entry() {
        let cache = Cache::new();
        let err = cache
            .get_or_run("sync".to_string(), || -> std::future::Ready<Result<u32, String>> {
                panic!("bad suite builder")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlightError::Panicked(ref m) if m.contains("bad suite builder")));
        assert_eq!(cache.state(&"sync".to_string()), EntryState::Failed);

        let later = tokio::time::timeout(
            Duration::from_secs(5),
            cache.get_or_run("sync".to_string(), || async { Ok::<u32, String>(1) }),
        )
        .await
        .expect("later caller must not hang");
        assert!(matches!(later, Err(FlightError::Panicked(_))));
        assert_eq!(cache.stats().executions, 1);
    }

    #[tokio::test]
    async fn test_run_poisoned_before_spawn_never_executes() {
        let cache = Cache::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let outcome = {
            let poisoner = cache.clone();
            let ran = Arc::clone(&ran);
            cache
                .get_or_run("late".to_string(), move || {
                    // Shutdown lands between registration and spawn.
                    poisoner.poison_pending("orchestrator shut down");
                    async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok::<u32, String>(3)
                    }
                })
                .await
        };

        assert_eq!(
            outcome.unwrap_err(),
            FlightError::Poisoned("orchestrator shut down".to_string())
        );
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_poison_absent_only_inserts_missing_keys() {
        let cache = Cache::new();
        let keys = vec!["a".to_string(), "b".to_string()];

        assert_eq!(cache.poison_absent(&keys, "deadline"), keys);
        assert!(cache.poison_absent(&keys, "again").is_empty());
        assert_eq!(
            cache.peek(&"a".to_string()),
            Some(Err(FlightError::Poisoned("deadline".to_string())))
        );
    }

    #[tokio::test]
    async fn test_peek_and_state_track_lifecycle() {
        let cache = Cache::new();
        let key = "slow".to_string();
        assert_eq!(cache.state(&key), EntryState::Absent);
        assert!(cache.peek(&key).is_none());

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_run(key, move || async move {
                        let _ = release_rx.await;
                        Ok::<u32, String>(42)
                    })
                    .await
            })
        };

        while cache.state(&key) == EntryState::Absent {
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.state(&key), EntryState::Pending);
        assert!(cache.peek(&key).is_none());
        assert_eq!(cache.pending_keys(), vec![key.clone()]);

        release_tx.send(()).unwrap();
        let value = waiter.await.unwrap().unwrap();
        assert_eq!(*value, 42);
        assert_eq!(cache.state(&key), EntryState::Succeeded);
        assert!(Arc::ptr_eq(&cache.peek(&key).unwrap().unwrap(), &value));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poison_pending_wakes_waiters() {
        let cache = Cache::new();
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_run("hang".to_string(), || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok::<u32, String>(1)
                    })
                    .await
            })
        };

        while cache.is_empty() {
            tokio::task::yield_now().await;
        }
        let poisoned = cache.poison_pending("deadline exceeded");
        assert_eq!(poisoned, vec!["hang".to_string()]);

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, FlightError::Poisoned("deadline exceeded".to_string()));

        // Later callers fail fast from the cache instead of hanging.
        let later = cache
            .get_or_run("hang".to_string(), || async { Ok::<u32, String>(2) })
            .await;
        assert!(matches!(later, Err(FlightError::Poisoned(_))));
        assert_eq!(cache.stats().executions, 1);
    }

    #[tokio::test]
    async fn test_dropping_first_caller_does_not_cancel_run() {
        let cache = Cache::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_run("k".to_string(), move || async move {
                        let _ = release_rx.await;
                        Ok::<u32, String>(5)
                    })
                    .await
            })
        };
        while cache.is_empty() {
            tokio::task::yield_now().await;
        }
        first.abort();
        let _ = first.await;

        release_tx.send(()).unwrap();
        let value = cache
            .get_or_run("k".to_string(), || async { Ok::<u32, String>(9) })
            .await
            .unwrap();
        assert_eq!(*value, 5);
    }
}
