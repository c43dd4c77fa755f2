pub mod broadcast;
pub mod coin_selection;
pub mod confirmation;
pub mod indexer;
pub mod monitor;
pub mod presign;
pub mod slot_tracker;
pub mod submission;
pub mod transitions;
pub mod vault;
pub mod wallet_bridge;

#[cfg(test)]
pub mod testing;

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A background loop that can be asked to stop.
///
/// The closure receives a watch receiver that flips to `true` on shutdown;
/// loops select on `changed()` next to their own timers.
pub struct ServiceHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn spawn<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(f(shutdown_rx));
        tracing::info!("Started {}", name);

        Self {
            name,
            shutdown_tx,
            join,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::error!("{} task ended abnormally: {}", self.name, e);
        } else {
            tracing::info!("Stopped {}", self.name);
        }
    }
}
