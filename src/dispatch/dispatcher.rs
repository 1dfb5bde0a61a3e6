//! Keyed Dispatcher
//!
//! Fans tasks out over per-key serial lanes that share one bounded pool.
//!
//! ```text
//! submit(key, task) ─▶ lanes[key].push ──first push──▶ spawn runner
//!                                                        │ acquire pool permit
//!                                                        ▼
//!                                          pop ▶ run ▶ pop ▶ run ▶ … ▶ empty: running = false
//! ```
//!
//! # Lock order
//! lane map shard, then lane state. Runners only take the lane state lock.

use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::failure::{FailureObserver, LaneTaskFailure, LogFailureObserver, panic_message};
use super::lane::{LaneTask, SerialLane};

/// Lane used for messages that carry no correlation key
pub const UNKNOWN_KEY: &str = "__unknown__";

/// Submission refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::ShuttingDown => "DISPATCHER_SHUTTING_DOWN",
        }
    }
}

/// Result of [`KeyedDispatcher::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Every submitted task finished within the drain timeout
    pub drained: bool,
    /// Queued tasks dropped without running
    pub abandoned: usize,
    /// Tasks still executing when the timeout hit
    pub still_running: usize,
}

/// State shared between the dispatcher and its lane runners
struct PoolState {
    permits: Semaphore,
    /// Tasks queued or running
    pending: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

impl PoolState {
    fn finish(&self, n: usize) {
        if n > 0 && self.pending.fetch_sub(n, Ordering::SeqCst) == n {
            self.idle.notify_waiters();
        }
    }
}

/// Key-ordered concurrent dispatcher
///
/// Same-key tasks run one at a time in submission order; different keys run
/// concurrently, at most `parallelism` lanes at once. A hot key holds a
/// single pool slot while its lane has work.
pub struct KeyedDispatcher {
    name: Arc<str>,
    parallelism: usize,
    lanes: DashMap<String, Arc<SerialLane>>,
    pool: Arc<PoolState>,
    observer: Arc<dyn FailureObserver>,
    runtime: Handle,
}

impl KeyedDispatcher {
    /// Create a dispatcher on the current tokio runtime
    ///
    /// `parallelism` is clamped to at least 1.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn new(parallelism: usize) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            name: Arc::from("dispatcher"),
            parallelism,
            lanes: DashMap::new(),
            pool: Arc::new(PoolState {
                permits: Semaphore::new(parallelism),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
            }),
            observer: Arc::new(LogFailureObserver),
            runtime: Handle::current(),
        }
    }

    /// Report lane task failures to `observer` instead of the log
    pub fn with_observer(mut self, observer: Arc<dyn FailureObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_name(mut self, name: impl AsRef<str>) -> Self {
        self.name = Arc::from(name.as_ref());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Number of lanes currently in the map
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Tasks queued or running
    pub fn pending(&self) -> usize {
        self.pool.pending.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.pool.closed.load(Ordering::SeqCst)
    }

    /// Queue `task` on the lane for `key`
    ///
    /// Never waits for the task. An empty key goes to [`UNKNOWN_KEY`].
    pub fn submit<F>(&self, key: &str, task: F) -> Result<(), DispatchError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        // Count first, then check: shutdown stores `closed` before reading
        // `pending`, so one of the two sides sees the other
        self.pool.pending.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            self.pool.finish(1);
            return Err(DispatchError::ShuttingDown);
        }

        let key = if key.is_empty() { UNKNOWN_KEY } else { key };
        let task: LaneTask = task.boxed();

        // Push while the shard guard is held so reclaim cannot drop the lane
        // between lookup and enqueue
        let to_schedule = if let Some(lane) = self.lanes.get(key) {
            lane.push(task).then(|| Arc::clone(lane.value()))
        } else {
            let lane = self
                .lanes
                .entry(key.to_string())
                .or_insert_with(|| {
                    if key == UNKNOWN_KEY {
                        debug!(dispatcher = %self.name, "Messages without a key share the {} lane", UNKNOWN_KEY);
                    }
                    Arc::new(SerialLane::new(key))
                });
            lane.push(task).then(|| Arc::clone(lane.value()))
        };

        if let Some(lane) = to_schedule {
            self.runtime.spawn(run_lane(
                lane,
                Arc::clone(&self.pool),
                Arc::clone(&self.observer),
            ));
        }

        Ok(())
    }

    /// Drop lanes that are empty and not running
    ///
    /// Returns the number of lanes removed.
    pub fn reclaim(&self) -> usize {
        let mut removed = 0;
        self.lanes.retain(|_, lane| {
            if lane.is_idle() {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            debug!(dispatcher = %self.name, removed, remaining = self.lanes.len(), "Reclaimed idle lanes");
        }
        removed
    }

    /// Run [`reclaim`](Self::reclaim) every `interval` until the dispatcher
    /// is dropped or shut down
    pub fn spawn_reclaimer(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let dispatcher: Weak<Self> = Arc::downgrade(self);
        let interval = interval.max(Duration::from_millis(1));

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                if dispatcher.is_closed() {
                    break;
                }
                dispatcher.reclaim();
            }
        })
    }

    /// Wait until no task is queued or running
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a concurrent finish is not missed
            let notified = self.pool.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting tasks and drain
    ///
    /// Waits up to `drain_timeout` for everything submitted to finish. After
    /// that, queued tasks are dropped without running; tasks already running
    /// are left to complete on their own.
    pub async fn shutdown(&self, drain_timeout: Duration) -> DrainReport {
        self.pool.closed.store(true, Ordering::SeqCst);
        info!(
            dispatcher = %self.name,
            pending = self.pending(),
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "Dispatcher shutting down"
        );

        if tokio::time::timeout(drain_timeout, self.wait_idle())
            .await
            .is_ok()
        {
            info!(dispatcher = %self.name, "Dispatcher drained");
            return DrainReport {
                drained: true,
                abandoned: 0,
                still_running: 0,
            };
        }

        let dropped: Vec<LaneTask> = self
            .lanes
            .iter()
            .flat_map(|lane| lane.take_queued())
            .collect();
        let abandoned = dropped.len();
        // Dropping outside the lane locks; a task may own reply channels
        drop(dropped);
        self.pool.finish(abandoned);

        let still_running = self.pending();
        warn!(
            dispatcher = %self.name,
            abandoned,
            still_running,
            "Drain timeout, queued tasks abandoned"
        );

        DrainReport {
            drained: false,
            abandoned,
            still_running,
        }
    }
}

/// Drain one lane on a pool slot
async fn run_lane(lane: Arc<SerialLane>, pool: Arc<PoolState>, observer: Arc<dyn FailureObserver>) {
    // The semaphore is never closed
    let _permit = pool.permits.acquire().await;

    let mut next = lane.next();
    while let Some(task) = next {
        let outcome = AssertUnwindSafe(task).catch_unwind().await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(LaneTaskFailure::Failed {
                key: lane.key().to_string(),
                error: format!("{e:#}"),
            }),
            Err(payload) => Some(LaneTaskFailure::Panicked {
                key: lane.key().to_string(),
                message: panic_message(payload.as_ref()),
            }),
        };

        if let Some(failure) = failure {
            observer.on_failure(&failure);
        }

        // Clear `running` before the count drops, so an idle pool means
        // idle lanes
        next = lane.next();
        pool.finish(1);
    }
}
