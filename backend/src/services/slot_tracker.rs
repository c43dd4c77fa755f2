use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::indexer::LedgerIndexer;
use super::ServiceHandle;

#[derive(Debug, Clone)]
pub struct SlotTrackerConfig {
    pub refresh_interval: Duration,
    /// Unix time of slot zero used when nothing has been observed yet.
    pub genesis_offset: i64,
}

impl Default for SlotTrackerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(20),
            genesis_offset: crate::config::CardanoNetwork::Preprod.genesis_offset(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotSource {
    Indexer,
    Estimated,
}

#[derive(Debug, Clone, Copy)]
struct SlotObservation {
    slot: u64,
    observed_at: DateTime<Utc>,
}

/// The engine's view of the ledger tip.
///
/// Reads never touch the network: `current_slot` extrapolates from the last
/// indexer observation at one slot per second, or from the era genesis
/// offset when the indexer has never answered.
pub struct SlotTracker {
    indexer: Arc<dyn LedgerIndexer>,
    config: SlotTrackerConfig,
    last_observation: RwLock<Option<SlotObservation>>,
    clock: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl SlotTracker {
    pub fn new(indexer: Arc<dyn LedgerIndexer>, config: SlotTrackerConfig) -> Self {
        Self {
            indexer,
            config,
            last_observation: RwLock::new(None),
            clock: Box::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    pub fn current_slot(&self) -> u64 {
        let now = (self.clock)();
        match *self.last_observation.read() {
            Some(observation) => {
                let elapsed = (now - observation.observed_at).num_seconds().max(0) as u64;
                observation.slot.saturating_add(elapsed)
            }
            None => (now.timestamp() - self.config.genesis_offset).max(0) as u64,
        }
    }

    pub fn source(&self) -> SlotSource {
        if self.last_observation.read().is_some() {
            SlotSource::Indexer
        } else {
            SlotSource::Estimated
        }
    }

    /// Never fails: on any indexer problem the previous estimate stays in place.
    pub async fn refresh(&self) -> SlotSource {
        if !self.indexer.is_configured() {
            tracing::debug!("Indexer not configured, estimating slot {}", self.current_slot());
            return SlotSource::Estimated;
        }

        match self.indexer.tip_slot().await {
            Ok(slot) => {
                *self.last_observation.write() = Some(SlotObservation {
                    slot,
                    observed_at: (self.clock)(),
                });
                tracing::debug!("Ledger tip at slot {}", slot);
                SlotSource::Indexer
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    "Failed to refresh tip slot, estimating {}: {}",
                    self.current_slot(),
                    e
                );
                SlotSource::Estimated
            }
            Err(e) => {
                // retrying will not help, e.g. a revoked API key
                tracing::error!(
                    "Indexer refused tip slot request, estimating {}: {}",
                    self.current_slot(),
                    e
                );
                SlotSource::Estimated
            }
        }
    }

    pub fn start(self: &Arc<Self>) -> ServiceHandle {
        let tracker = Arc::clone(self);
        let interval = self.config.refresh_interval;

        ServiceHandle::spawn("slot-tracker", move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracker.refresh().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
