//! Lane task failures and the observer they are reported to

use std::any::Any;
use thiserror::Error;
use tracing::error;

/// A lane task that did not complete normally
///
/// The lane itself keeps going; this is only a report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaneTaskFailure {
    #[error("Task on lane {key} failed: {error}")]
    Failed { key: String, error: String },

    #[error("Task on lane {key} panicked: {message}")]
    Panicked { key: String, message: String },
}

impl LaneTaskFailure {
    /// Key of the lane the task ran on
    pub fn key(&self) -> &str {
        match self {
            LaneTaskFailure::Failed { key, .. } | LaneTaskFailure::Panicked { key, .. } => key,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LaneTaskFailure::Failed { .. } => "LANE_TASK_FAILED",
            LaneTaskFailure::Panicked { .. } => "LANE_TASK_PANICKED",
        }
    }
}

/// Receives failures of lane tasks
///
/// Called on the lane's own task, so implementations should return quickly.
pub trait FailureObserver: Send + Sync {
    fn on_failure(&self, failure: &LaneTaskFailure);
}

/// Default observer: one `error!` line per failure
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFailureObserver;

impl FailureObserver for LogFailureObserver {
    fn on_failure(&self, failure: &LaneTaskFailure) {
        error!(
            key = %failure.key(),
            code = failure.code(),
            failure = %failure,
            "Lane task failed"
        );
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
