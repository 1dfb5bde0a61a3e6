//! Check-back Worker
//!
//! Background worker that asks the coordinator to re-derive the outcome of
//! half messages left UNKNOWN (producer crashed before deciding, or the
//! decision never reached the broker).

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::coordinator::TransactionCoordinator;
use super::error::TransportError;
use super::state::TransactionState;
use crate::broker::CheckBackSource;
use crate::config::CoordinatorConfig;

/// Halves checked this many times without a decision are worth an alert
const STUCK_CHECK_THRESHOLD: u32 = 10;

/// Configuration for the check-back worker
#[derive(Debug, Clone)]
pub struct CheckBackConfig {
    /// How often to sweep for unresolved halves
    pub scan_interval: Duration,
    /// Maximum halves checked per sweep
    pub batch_size: usize,
}

impl Default for CheckBackConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

impl From<&CoordinatorConfig> for CheckBackConfig {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            scan_interval: config.check_interval(),
            batch_size: config.check_batch_size,
        }
    }
}

/// Counts from one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckBackStats {
    pub checked: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub unresolved: usize,
}

/// Check-back Worker
///
/// Periodically pulls unresolved halves from the broker, asks the
/// coordinator for each one, and hands decided outcomes back.
pub struct CheckBackWorker {
    coordinator: Arc<TransactionCoordinator>,
    source: Arc<dyn CheckBackSource>,
    config: CheckBackConfig,
}

impl CheckBackWorker {
    /// Create a new CheckBackWorker
    pub fn new(
        coordinator: Arc<TransactionCoordinator>,
        source: Arc<dyn CheckBackSource>,
        config: CheckBackConfig,
    ) -> Self {
        Self {
            coordinator,
            source,
            config,
        }
    }

    /// Run the check-back loop forever
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_ms = self.config.scan_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting check-back worker"
        );

        loop {
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, code = e.code(), "Check-back sweep failed");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// Run a single sweep
    pub async fn sweep_once(&self) -> Result<CheckBackStats, TransportError> {
        let halves = self.source.unresolved(self.config.batch_size).await?;

        if halves.is_empty() {
            debug!("No unresolved half messages");
            return Ok(CheckBackStats::default());
        }

        let mut stats = CheckBackStats::default();

        for half in &halves {
            stats.checked += 1;
            let state = self.coordinator.check_transaction_status(half).await;

            if !state.is_decided() {
                stats.unresolved += 1;
                if half.check_times > STUCK_CHECK_THRESHOLD {
                    warn!(
                        msg_id = %half.msg_id,
                        check_times = half.check_times,
                        "Half message still UNKNOWN after many checks"
                    );
                }
                continue;
            }

            match self.source.resolve(&half.msg_id, state).await {
                Ok(()) => match state {
                    TransactionState::Commit => stats.committed += 1,
                    TransactionState::Rollback => stats.rolled_back += 1,
                    TransactionState::Unknown => {}
                },
                // Decided meanwhile by the producer or a parallel sweep
                Err(TransportError::AlreadyDecided(current)) => {
                    debug!(msg_id = %half.msg_id, current = %current, "Half already decided");
                }
                Err(e) => {
                    error!(
                        msg_id = %half.msg_id,
                        state = %state,
                        error = %e,
                        "Failed to resolve half message"
                    );
                    stats.unresolved += 1;
                }
            }
        }

        info!(
            checked = stats.checked,
            committed = stats.committed,
            rolled_back = stats.rolled_back,
            unresolved = stats.unresolved,
            "Check-back sweep finished"
        );

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_back_config_default() {
        let config = CheckBackConfig::default();
        assert_eq!(config.scan_interval, Duration::from_secs(60));
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_check_back_config_from_coordinator_config() {
        let coordinator = CoordinatorConfig {
            check_interval_ms: 250,
            check_batch_size: 7,
            ..CoordinatorConfig::default()
        };
        let config = CheckBackConfig::from(&coordinator);
        assert_eq!(config.scan_interval, Duration::from_millis(250));
        assert_eq!(config.batch_size, 7);
    }
}
