//! Orphaned correlation cleanup
//!
//! A caller that times out leaves its entry Pending. If no reply ever comes,
//! the entry would stay forever; the reaper deletes Pending entries older than
//! `max_age`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::correlation::{CorrelationStore, StoreError};

/// Reaper configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(with = "crate::config::duration_millis")]
    pub interval: Duration,

    /// Pending entries older than this are removed
    #[serde(with = "crate::config::duration_millis")]
    pub max_age: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            // Twice the default result timeout
            max_age: Duration::from_secs(1200),
        }
    }
}

/// Periodically purges stale Pending correlation entries
pub struct CorrelationReaper {
    store: Arc<dyn CorrelationStore>,
    config: ReaperConfig,
}

impl CorrelationReaper {
    pub fn new(store: Arc<dyn CorrelationStore>, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    /// Purge once, returning how many entries were removed
    pub async fn run_cycle(&self) -> Result<usize, StoreError> {
        let purged = self
            .store
            .purge_pending_older_than(self.config.max_age)
            .await?;
        if purged > 0 {
            info!(purged, max_age = ?self.config.max_age, "purged orphaned correlations");
        }
        Ok(purged)
    }

    /// Run until `shutdown_rx` flips to true
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("Correlation purge failed: {}", e);
                    }
                }
                changed = shutdown_rx.changed() => {
                    debug!("Correlation reaper: shutdown requested");
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
