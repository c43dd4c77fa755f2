use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::broadcast::Broadcaster;
use super::indexer::LedgerIndexer;
use super::transitions::{apply_transition_from, audit_then_emit, TransitionOutcome};
use crate::error::EngineError;
use crate::models::{AuditEvent, AuditEventType, BroadcastEvent, RequestStatus, SignedRequestRecord};
use crate::storage::Persistence;

#[derive(Debug, Clone)]
pub struct ConfirmationConfig {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            // about an hour at the default interval
            max_polls: 180,
        }
    }
}

/// What `recover` did with requests left mid-flight by a previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Requests handed back to the watcher.
    pub watching: usize,
    /// Interrupted submissions that never reached a block.
    pub failed: usize,
    /// Interrupted submissions the indexer could not answer for; retried on next start.
    pub unresolved: usize,
}

/// Receives submitted transactions and eventually drives them to CONFIRMED.
pub trait ConfirmationWatcher: Send + Sync {
    fn watch(&self, request_id: &str, tx_hash: &str);
}

#[derive(Clone)]
pub struct IndexerConfirmationWatcher {
    store: Arc<dyn Persistence>,
    indexer: Arc<dyn LedgerIndexer>,
    broadcaster: Arc<dyn Broadcaster>,
    config: ConfirmationConfig,
}

impl IndexerConfirmationWatcher {
    pub fn new(
        store: Arc<dyn Persistence>,
        indexer: Arc<dyn LedgerIndexer>,
        broadcaster: Arc<dyn Broadcaster>,
        config: ConfirmationConfig,
    ) -> Self {
        Self {
            store,
            indexer,
            broadcaster,
            config,
        }
    }

    /// Polls until the transaction is in a block or the poll budget runs out.
    /// Returns true once the request is CONFIRMED.
    pub async fn poll_until_confirmed(&self, request_id: &str, tx_hash: &str) -> bool {
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        for _ in 0..self.config.max_polls {
            ticker.tick().await;

            match self.indexer.tx_confirmation(tx_hash).await {
                Ok(Some(confirmation)) => return self.confirm(request_id, tx_hash, confirmation.block_height),
                Ok(None) => {
                    tracing::debug!(request_id = %request_id, tx_hash = %tx_hash, "Not yet in a block");
                }
                Err(e) => {
                    tracing::warn!(request_id = %request_id, "Confirmation lookup failed: {}", e);
                }
            }
        }

        tracing::warn!(
            request_id = %request_id,
            tx_hash = %tx_hash,
            "Transaction not seen on chain after {} polls, leaving SUBMITTED",
            self.config.max_polls
        );
        false
    }

    fn confirm(&self, request_id: &str, tx_hash: &str, block_height: Option<u64>) -> bool {
        match apply_transition_from(
            self.store.as_ref(),
            request_id,
            RequestStatus::Submitted,
            RequestStatus::Confirmed,
        ) {
            Ok(TransitionOutcome::Applied { .. }) => {
                tracing::info!(request_id = %request_id, tx_hash = %tx_hash, "Transaction confirmed");
                audit_then_emit(
                    self.store.as_ref(),
                    self.broadcaster.as_ref(),
                    AuditEvent::new(
                        request_id,
                        AuditEventType::RequestConfirmed,
                        json!({ "tx_hash": tx_hash, "block_height": block_height }),
                    ),
                    vec![BroadcastEvent::RequestUpdated {
                        request_id: request_id.to_string(),
                        status: RequestStatus::Confirmed,
                        reason: None,
                    }],
                );
                true
            }
            Ok(TransitionOutcome::AlreadyTerminal(status)) => status == RequestStatus::Confirmed,
            Ok(TransitionOutcome::Superseded(status)) => {
                tracing::warn!(request_id = %request_id, status = %status, "Request is not SUBMITTED, not confirming");
                false
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, "Failed to mark request confirmed: {}", e);
                false
            }
        }
    }

    /// Picks up requests a previous run left SUBMITTED or SUBMITTING.
    ///
    /// SUBMITTED requests are watched again. A SUBMITTING request whose
    /// transaction is already in a block is moved to SUBMITTED and watched;
    /// one the indexer has never seen is failed as interrupted.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();

        for record in self.store.get_by_status(RequestStatus::Submitted)? {
            let tx_hash = self
                .store
                .get_transaction_for_request(&record.request_id)?
                .map(|tx| tx.tx_hash)
                .unwrap_or_else(|| record.transaction_hash.clone());
            self.watch(&record.request_id, &tx_hash);
            report.watching += 1;
        }

        for record in self.store.get_by_status(RequestStatus::Submitting)? {
            match self.indexer.tx_confirmation(&record.transaction_hash).await {
                Ok(Some(_)) => {
                    if self.settle_interrupted(&record, RequestStatus::Submitted) {
                        self.watch(&record.request_id, &record.transaction_hash);
                        report.watching += 1;
                    }
                }
                Ok(None) => {
                    if self.settle_interrupted(&record, RequestStatus::Failed) {
                        report.failed += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %record.request_id,
                        "Cannot resolve interrupted submission yet: {}",
                        e
                    );
                    report.unresolved += 1;
                }
            }
        }

        tracing::info!(
            watching = report.watching,
            failed = report.failed,
            unresolved = report.unresolved,
            "Recovered in-flight submissions"
        );
        Ok(report)
    }

    fn settle_interrupted(&self, record: &SignedRequestRecord, next: RequestStatus) -> bool {
        let request_id = record.request_id.as_str();
        match apply_transition_from(self.store.as_ref(), request_id, RequestStatus::Submitting, next) {
            Ok(TransitionOutcome::Applied { .. }) => {
                let (event_type, details, reason) = if next == RequestStatus::Submitted {
                    (
                        AuditEventType::SubmissionSucceeded,
                        json!({ "tx_hash": record.transaction_hash, "recovered": true }),
                        None,
                    )
                } else {
                    (
                        AuditEventType::SubmissionFailed,
                        json!({ "error": "interrupted before reaching a block", "recovered": true }),
                        Some("interrupted".to_string()),
                    )
                };
                audit_then_emit(
                    self.store.as_ref(),
                    self.broadcaster.as_ref(),
                    AuditEvent::new(request_id, event_type, details),
                    vec![BroadcastEvent::RequestUpdated {
                        request_id: request_id.to_string(),
                        status: next,
                        reason,
                    }],
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::error!(request_id = %request_id, "Failed to settle interrupted submission: {}", e);
                false
            }
        }
    }
}

impl ConfirmationWatcher for IndexerConfirmationWatcher {
    fn watch(&self, request_id: &str, tx_hash: &str) {
        let watcher = self.clone();
        let request_id = request_id.to_string();
        let tx_hash = tx_hash.to_string();

        tokio::spawn(async move {
            watcher.poll_until_confirmed(&request_id, &tx_hash).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{seed_signed_request, test_vault, utxo, MockIndexer, RecordingBroadcaster};
    use crate::models::{SubmissionMode, TransactionRecord};
    use crate::storage::{AuditDao, RequestDao, SqliteStore, TransactionDao};
    use chrono::Utc;

    fn fast_config(max_polls: u32) -> ConfirmationConfig {
        ConfirmationConfig {
            poll_interval: Duration::from_millis(1),
            max_polls,
        }
    }

    fn submitted_request(store: &SqliteStore, request_id: &str) {
        seed_signed_request(store, &test_vault(), request_id, 1_000, vec![utxo("txA", 0, 1)]);
        store.update_status(request_id, RequestStatus::Submitting).unwrap();
        store.update_status(request_id, RequestStatus::Submitted).unwrap();
    }

    #[tokio::test]
    async fn test_confirms_once_in_block() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let indexer = Arc::new(MockIndexer::new());
        let events = Arc::new(RecordingBroadcaster::new());
        submitted_request(&store, "request-cf1");
        indexer.confirm("txHashCf1");

        let watcher =
            IndexerConfirmationWatcher::new(store.clone(), indexer, events.clone(), fast_config(5));
        assert!(watcher.poll_until_confirmed("request-cf1", "txHashCf1").await);

        assert_eq!(
            store.get_request("request-cf1").unwrap().unwrap().status,
            RequestStatus::Confirmed
        );
        assert_eq!(events.status_updates("request-cf1"), vec![RequestStatus::Confirmed]);
        let audits = store.events_for_request("request-cf1").unwrap();
        assert!(audits.iter().any(|e| e.event_type == AuditEventType::RequestConfirmed));

        // a second observation is a no-op
        assert!(watcher.poll_until_confirmed("request-cf1", "txHashCf1").await);
        assert_eq!(events.count("request_updated"), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_poll_budget() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let indexer = Arc::new(MockIndexer::new());
        submitted_request(&store, "request-cf2");

        let watcher = IndexerConfirmationWatcher::new(
            store.clone(),
            indexer,
            Arc::new(RecordingBroadcaster::new()),
            fast_config(3),
        );
        assert!(!watcher.poll_until_confirmed("request-cf2", "missing").await);
        assert_eq!(
            store.get_request("request-cf2").unwrap().unwrap().status,
            RequestStatus::Submitted
        );
    }

    async fn wait_for_status(store: &SqliteStore, request_id: &str, status: RequestStatus) {
        for _ in 0..500 {
            if store.get_request(request_id).unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("{} never reached {}", request_id, status);
    }

    #[tokio::test]
    async fn test_recover_resumes_watching_after_restart() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let indexer = Arc::new(MockIndexer::new());
        let events = Arc::new(RecordingBroadcaster::new());

        let submitted = "request-rc1";
        submitted_request(&store, submitted);
        store
            .insert_transaction(&TransactionRecord {
                tx_hash: "ab".repeat(32),
                request_id: submitted.to_string(),
                fee_amount: 170_000,
                submission_mode: SubmissionMode::Server,
                submitted_at: Utc::now(),
            })
            .unwrap();

        // crashed between the push and the SUBMITTED write
        let landed = "request-rc2";
        seed_signed_request(&store, &test_vault(), landed, 1_000, vec![utxo("txB", 0, 1)]);
        store.update_status(landed, RequestStatus::Submitting).unwrap();
        indexer.confirm(&"ab".repeat(32));

        let watcher =
            IndexerConfirmationWatcher::new(store.clone(), indexer, events.clone(), fast_config(50));
        let report = watcher.recover().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                watching: 2,
                failed: 0,
                unresolved: 0
            }
        );

        wait_for_status(&store, submitted, RequestStatus::Confirmed).await;
        wait_for_status(&store, landed, RequestStatus::Confirmed).await;
        assert_eq!(
            events.status_updates(landed),
            vec![RequestStatus::Submitted, RequestStatus::Confirmed]
        );
    }

    #[tokio::test]
    async fn test_recover_fails_interrupted_submission_not_on_chain() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let events = Arc::new(RecordingBroadcaster::new());
        seed_signed_request(&store, &test_vault(), "request-rc3", 1_000, vec![utxo("txC", 0, 1)]);
        store.update_status("request-rc3", RequestStatus::Submitting).unwrap();

        let watcher = IndexerConfirmationWatcher::new(
            store.clone(),
            Arc::new(MockIndexer::new()),
            events.clone(),
            fast_config(3),
        );
        let report = watcher.recover().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.watching, 0);

        assert_eq!(
            store.get_request("request-rc3").unwrap().unwrap().status,
            RequestStatus::Failed
        );
        let audits = store.events_for_request("request-rc3").unwrap();
        assert!(audits.iter().any(|e| e.event_type == AuditEventType::SubmissionFailed));
        assert!(events.events().iter().any(|e| matches!(
            e,
            BroadcastEvent::RequestUpdated { reason: Some(reason), .. } if reason == "interrupted"
        )));

        // a second start has nothing left to do
        assert_eq!(watcher.recover().await.unwrap(), RecoveryReport::default());
    }
}
