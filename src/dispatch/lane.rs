//! Serial Lane
//!
//! Per-key FIFO plus a running flag. At most one runner drains a lane at a
//! time; whoever flips `running` from false to true owns the scheduling.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Unit of work queued on a lane
pub(crate) type LaneTask = BoxFuture<'static, anyhow::Result<()>>;

#[derive(Default)]
struct LaneState {
    queue: VecDeque<LaneTask>,
    running: bool,
}

pub(crate) struct SerialLane {
    key: String,
    state: Mutex<LaneState>,
}

impl SerialLane {
    pub(crate) fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(LaneState::default()),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    // State is consistent after every statement, so poisoning is ignored
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `task`; returns true when the caller must schedule a runner
    pub(crate) fn push(&self, task: LaneTask) -> bool {
        let mut state = self.lock();
        state.queue.push_back(task);
        if state.running {
            false
        } else {
            state.running = true;
            true
        }
    }

    /// Next task for the runner, or `None` after clearing `running`
    pub(crate) fn next(&self) -> Option<LaneTask> {
        let mut state = self.lock();
        let task = state.queue.pop_front();
        if task.is_none() {
            state.running = false;
        }
        task
    }

    /// Empty and not running, safe to drop from the lane map
    pub(crate) fn is_idle(&self) -> bool {
        let state = self.lock();
        !state.running && state.queue.is_empty()
    }

    /// Take every queued (not yet started) task out of the lane
    pub(crate) fn take_queued(&self) -> Vec<LaneTask> {
        self.lock().queue.drain(..).collect()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.lock().queue.len()
    }
}
