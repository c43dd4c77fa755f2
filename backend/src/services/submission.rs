use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::broadcast::Broadcaster;
use super::confirmation::ConfirmationWatcher;
use super::indexer::LedgerIndexer;
use super::slot_tracker::SlotTracker;
use super::transitions::{apply_transition, apply_transition_from, audit_then_emit, TransitionOutcome};
use super::vault::PayloadVault;
use super::wallet_bridge::WalletBridge;
use crate::error::EngineError;
use crate::models::{
    AuditEvent, AuditEventType, BroadcastEvent, RequestStatus, SignedRequestRecord,
    SubmissionMode, TransactionRecord,
};
use crate::storage::Persistence;

const CBOR_ARRAY_OF_FOUR: u8 = 0x84;
const CBOR_TRUE: u8 = 0xf5;
const CBOR_NULL: u8 = 0xf6;

#[derive(Debug, Clone)]
pub struct SubmissionConfig {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each further failure.
    pub base_delay: Duration,
    /// Pause between requests in `submit_queued`.
    pub queue_pause: Duration,
    /// Concurrent submissions in `submit_batch`.
    pub batch_concurrency: usize,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2_000),
            queue_pause: Duration::from_millis(500),
            batch_concurrency: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl SubmissionResult {
    fn succeeded(tx_hash: String, attempts: u32, submitted_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            tx_hash: Some(tx_hash),
            error: None,
            attempts,
            submitted_at: Some(submitted_at),
        }
    }

    fn failed(error: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: false,
            tx_hash: None,
            error: Some(error.into()),
            attempts,
            submitted_at: None,
        }
    }
}

/// Result of a single push to the network.
struct AttemptError {
    message: String,
    definitive: bool,
}

type SharedSubmission = Shared<BoxFuture<'static, SubmissionResult>>;

struct InFlight {
    generation: u64,
    future: SharedSubmission,
    cancel: watch::Sender<bool>,
}

/// Builds the wire form of a signed transaction: `[body, witness_set, true, null]`.
pub fn assemble_signed_transaction(
    tx_body_hex: &str,
    witness_set_hex: &str,
) -> Result<Vec<u8>, EngineError> {
    let body = hex::decode(tx_body_hex)
        .map_err(|e| EngineError::InvalidRequest(format!("transaction body is not hex: {}", e)))?;
    let witness = hex::decode(witness_set_hex)
        .map_err(|e| EngineError::InvalidRequest(format!("witness set is not hex: {}", e)))?;

    let mut signed = Vec::with_capacity(body.len() + witness.len() + 3);
    signed.push(CBOR_ARRAY_OF_FOUR);
    signed.extend_from_slice(&body);
    signed.extend_from_slice(&witness);
    signed.push(CBOR_TRUE);
    signed.push(CBOR_NULL);
    Ok(signed)
}

pub struct SubmissionPipeline {
    store: Arc<dyn Persistence>,
    vault: Arc<PayloadVault>,
    indexer: Arc<dyn LedgerIndexer>,
    slots: Arc<SlotTracker>,
    broadcaster: Arc<dyn Broadcaster>,
    confirmations: Option<Arc<dyn ConfirmationWatcher>>,
    config: SubmissionConfig,
    in_flight: Mutex<HashMap<String, InFlight>>,
    generation: AtomicU64,
}

impl SubmissionPipeline {
    pub fn new(
        store: Arc<dyn Persistence>,
        vault: Arc<PayloadVault>,
        indexer: Arc<dyn LedgerIndexer>,
        slots: Arc<SlotTracker>,
        broadcaster: Arc<dyn Broadcaster>,
        config: SubmissionConfig,
    ) -> Self {
        Self {
            store,
            vault,
            indexer,
            slots,
            broadcaster,
            confirmations: None,
            config,
            in_flight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_confirmation_watcher(mut self, watcher: Arc<dyn ConfirmationWatcher>) -> Self {
        self.confirmations = Some(watcher);
        self
    }

    #[cfg(test)]
    pub fn is_in_flight(&self, request_id: &str) -> bool {
        self.in_flight.lock().contains_key(request_id)
    }

    /// Submits a signed request. A call made while another submission for
    /// the same request is running resolves to that submission's result.
    pub async fn submit(
        self: &Arc<Self>,
        request_id: &str,
        mode: SubmissionMode,
        wallet: Option<Arc<dyn WalletBridge>>,
    ) -> SubmissionResult {
        let future = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(request_id) {
                Some(existing) => {
                    tracing::debug!(request_id = %request_id, "Joining in-flight submission");
                    existing.future.clone()
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst);
                    let (cancel_tx, cancel_rx) = watch::channel(false);
                    let pipeline = Arc::clone(self);
                    let id = request_id.to_string();

                    // runs to completion even if every caller goes away
                    let task = tokio::spawn(async move {
                        let result = pipeline.execute(&id, mode, wallet, cancel_rx).await;
                        pipeline.finish(&id, generation);
                        result
                    });
                    let future = async move {
                        task.await.unwrap_or_else(|e| {
                            SubmissionResult::failed(format!("submission task failed: {}", e), 0)
                        })
                    }
                    .boxed()
                    .shared();

                    in_flight.insert(
                        request_id.to_string(),
                        InFlight {
                            generation,
                            future: future.clone(),
                            cancel: cancel_tx,
                        },
                    );
                    future
                }
            }
        };

        future.await
    }

    fn finish(&self, request_id: &str, generation: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(request_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            in_flight.remove(request_id);
        }
    }

    /// Aborts a pending retry and fails the request with reason `cancelled`.
    /// Returns false when the request was already terminal.
    pub fn cancel(&self, request_id: &str) -> Result<bool, EngineError> {
        if let Some(entry) = self.in_flight.lock().remove(request_id) {
            let _ = entry.cancel.send(true);
            tracing::info!(request_id = %request_id, "Cancelled in-flight submission");
        }

        match apply_transition(self.store.as_ref(), request_id, RequestStatus::Failed)? {
            TransitionOutcome::Applied { from } => {
                audit_then_emit(
                    self.store.as_ref(),
                    self.broadcaster.as_ref(),
                    AuditEvent::new(
                        request_id,
                        AuditEventType::SubmissionCancelled,
                        json!({ "from": from.as_str() }),
                    ),
                    vec![BroadcastEvent::RequestUpdated {
                        request_id: request_id.to_string(),
                        status: RequestStatus::Failed,
                        reason: Some("cancelled".into()),
                    }],
                );
                Ok(true)
            }
            TransitionOutcome::AlreadyTerminal(_) | TransitionOutcome::Superseded(_) => Ok(false),
        }
    }

    /// Server-mode submissions one after another with a pause in between.
    pub async fn submit_queued(self: &Arc<Self>, request_ids: &[String]) -> Vec<SubmissionResult> {
        let mut results = Vec::with_capacity(request_ids.len());
        for (i, request_id) in request_ids.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.queue_pause).await;
            }
            results.push(self.submit(request_id, SubmissionMode::Server, None).await);
        }
        results
    }

    /// Server-mode submissions with bounded concurrency. Order of the output
    /// follows completion, not input.
    pub async fn submit_batch(
        self: &Arc<Self>,
        request_ids: Vec<String>,
    ) -> Vec<(String, SubmissionResult)> {
        stream::iter(request_ids)
            .map(|request_id| {
                let pipeline = Arc::clone(self);
                async move {
                    let result = pipeline.submit(&request_id, SubmissionMode::Server, None).await;
                    (request_id, result)
                }
            })
            .buffer_unordered(self.config.batch_concurrency.max(1))
            .collect()
            .await
    }

    async fn execute(
        &self,
        request_id: &str,
        mode: SubmissionMode,
        wallet: Option<Arc<dyn WalletBridge>>,
        mut cancel: watch::Receiver<bool>,
    ) -> SubmissionResult {
        let (request, record) = match self.store.get_complete_data(request_id) {
            Ok(Some(data)) => data,
            Ok(None) => return SubmissionResult::failed("signed request not found", 0),
            Err(e) => return SubmissionResult::failed(e.to_string(), 0),
        };

        if request.status != RequestStatus::Signed {
            return SubmissionResult::failed(
                format!("request is {}, expected SIGNED", request.status),
                0,
            );
        }
        if self.expire_if_past_ttl(&record) {
            return SubmissionResult::failed("request expired before submission", 0);
        }

        match mode {
            SubmissionMode::Server if !self.indexer.is_configured() => {
                return SubmissionResult::failed("ledger indexer is not configured", 0);
            }
            SubmissionMode::Wallet if wallet.is_none() => {
                return SubmissionResult::failed("wallet mode requires a wallet bridge", 0);
            }
            _ => {}
        }

        match apply_transition_from(
            self.store.as_ref(),
            request_id,
            RequestStatus::Signed,
            RequestStatus::Submitting,
        ) {
            Ok(TransitionOutcome::Applied { .. }) => {}
            Ok(TransitionOutcome::AlreadyTerminal(status) | TransitionOutcome::Superseded(status)) => {
                return SubmissionResult::failed(format!("request is already {}", status), 0);
            }
            Err(e) => return SubmissionResult::failed(e.to_string(), 0),
        }
        audit_then_emit(
            self.store.as_ref(),
            self.broadcaster.as_ref(),
            AuditEvent::new(
                request_id,
                AuditEventType::SubmissionStarted,
                json!({ "mode": mode.as_str() }),
            ),
            vec![BroadcastEvent::RequestUpdated {
                request_id: request_id.to_string(),
                status: RequestStatus::Submitting,
                reason: None,
            }],
        );

        let signed_tx = match self.load_signed_transaction(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(request_id = %request_id, "Cannot load signed payload: {}", e);
                self.fail(request_id, mode, &e.to_string(), 0);
                return SubmissionResult::failed(e.to_string(), 0);
            }
        };

        let mut attempts = 0;
        let mut last_error = String::new();

        while attempts < self.config.max_attempts {
            if *cancel.borrow() {
                return SubmissionResult::failed("cancelled", attempts);
            }
            if self.expire_if_past_ttl(&record) {
                return SubmissionResult::failed("request expired during submission", attempts);
            }

            attempts += 1;
            let outcome = match mode {
                SubmissionMode::Server => self.push_to_indexer(&signed_tx).await,
                SubmissionMode::Wallet => match &wallet {
                    Some(wallet) => push_to_wallet(wallet.as_ref(), &signed_tx).await,
                    None => Err(AttemptError {
                        message: "wallet bridge missing".into(),
                        definitive: true,
                    }),
                },
            };

            match outcome {
                Ok(returned_hash) => {
                    return self.succeed(&record, mode, &returned_hash, attempts);
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %request_id,
                        attempt = attempts,
                        mode = mode.as_str(),
                        definitive = e.definitive,
                        "Submission attempt failed: {}",
                        e.message
                    );
                    if let Err(log_err) = self.store.log_event(&AuditEvent::new(
                        request_id,
                        AuditEventType::SubmissionAttemptFailed,
                        json!({
                            "attempt": attempts,
                            "mode": mode.as_str(),
                            "error": e.message,
                            "definitive": e.definitive,
                        }),
                    )) {
                        tracing::error!(request_id = %request_id, "Failed to audit attempt: {}", log_err);
                    }

                    last_error = e.message;
                    if e.definitive {
                        break;
                    }
                }
            }

            if attempts < self.config.max_attempts {
                let delay = self.config.base_delay * 2u32.saturating_pow(attempts - 1);
                tracing::debug!(request_id = %request_id, "Retrying in {:?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.changed() => {
                        return SubmissionResult::failed("cancelled", attempts);
                    }
                }
            }
        }

        self.fail(request_id, mode, &last_error, attempts);
        SubmissionResult::failed(last_error, attempts)
    }

    fn load_signed_transaction(&self, record: &SignedRequestRecord) -> Result<Vec<u8>, EngineError> {
        let payload = self.vault.decrypt(
            &record.request_id,
            &record.encrypted_tx_body,
            &record.encrypted_witness_set,
            &record.encryption_metadata,
        )?;
        assemble_signed_transaction(&payload.tx_body_hex, &payload.witness_set_hex)
    }

    async fn push_to_indexer(&self, signed_tx: &[u8]) -> Result<String, AttemptError> {
        self.indexer.submit_tx(signed_tx).await.map_err(|e| AttemptError {
            definitive: e.is_definitive(),
            message: e.to_string(),
        })
    }

    fn expire_if_past_ttl(&self, record: &SignedRequestRecord) -> bool {
        let current_slot = self.slots.current_slot();
        if current_slot <= record.ttl_slot {
            return false;
        }

        match apply_transition(self.store.as_ref(), &record.request_id, RequestStatus::Expired) {
            Ok(TransitionOutcome::Applied { .. }) => {
                tracing::warn!(
                    request_id = %record.request_id,
                    ttl_slot = record.ttl_slot,
                    current_slot,
                    "Request expired before it could be submitted"
                );
                audit_then_emit(
                    self.store.as_ref(),
                    self.broadcaster.as_ref(),
                    AuditEvent::new(
                        &record.request_id,
                        AuditEventType::RequestExpired,
                        json!({ "ttl_slot": record.ttl_slot, "current_slot": current_slot }),
                    ),
                    vec![BroadcastEvent::RequestUpdated {
                        request_id: record.request_id.clone(),
                        status: RequestStatus::Expired,
                        reason: Some("ttl_expired".into()),
                    }],
                );
            }
            Ok(TransitionOutcome::AlreadyTerminal(_) | TransitionOutcome::Superseded(_)) => {}
            Err(e) => {
                tracing::error!(request_id = %record.request_id, "Failed to expire request: {}", e);
            }
        }
        true
    }

    fn succeed(
        &self,
        record: &SignedRequestRecord,
        mode: SubmissionMode,
        returned_hash: &str,
        attempts: u32,
    ) -> SubmissionResult {
        let request_id = record.request_id.as_str();
        let tx_hash = record.transaction_hash.clone();
        if !returned_hash.eq_ignore_ascii_case(&tx_hash) {
            tracing::warn!(
                request_id = %request_id,
                expected = %tx_hash,
                returned = %returned_hash,
                "Submitted transaction hash differs from the signed one"
            );
        }

        let submitted_at = Utc::now();
        if let Err(e) = self.store.insert_transaction(&TransactionRecord {
            tx_hash: tx_hash.clone(),
            request_id: request_id.to_string(),
            fee_amount: record.fee_amount,
            submission_mode: mode,
            submitted_at,
        }) {
            tracing::error!(request_id = %request_id, "Failed to persist transaction record: {}", e);
        }

        match apply_transition_from(
            self.store.as_ref(),
            request_id,
            RequestStatus::Submitting,
            RequestStatus::Submitted,
        ) {
            Ok(TransitionOutcome::Applied { .. }) => {
                tracing::info!(
                    request_id = %request_id,
                    tx_hash = %tx_hash,
                    attempts,
                    mode = mode.as_str(),
                    "Transaction submitted"
                );
                audit_then_emit(
                    self.store.as_ref(),
                    self.broadcaster.as_ref(),
                    AuditEvent::new(
                        request_id,
                        AuditEventType::SubmissionSucceeded,
                        json!({ "attempt": attempts, "mode": mode.as_str(), "tx_hash": tx_hash }),
                    ),
                    vec![BroadcastEvent::RequestUpdated {
                        request_id: request_id.to_string(),
                        status: RequestStatus::Submitted,
                        reason: None,
                    }],
                );
                if let Some(watcher) = &self.confirmations {
                    watcher.watch(request_id, &tx_hash);
                }
            }
            Ok(TransitionOutcome::AlreadyTerminal(status) | TransitionOutcome::Superseded(status)) => {
                tracing::warn!(
                    request_id = %request_id,
                    status = %status,
                    "Transaction reached the network after the request was closed"
                );
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, "Failed to mark request submitted: {}", e);
            }
        }

        SubmissionResult::succeeded(tx_hash, attempts, submitted_at)
    }

    fn fail(&self, request_id: &str, mode: SubmissionMode, error: &str, attempts: u32) {
        match apply_transition(self.store.as_ref(), request_id, RequestStatus::Failed) {
            Ok(TransitionOutcome::Applied { .. }) => {
                tracing::error!(
                    request_id = %request_id,
                    attempts,
                    "Submission failed: {}",
                    error
                );
                audit_then_emit(
                    self.store.as_ref(),
                    self.broadcaster.as_ref(),
                    AuditEvent::new(
                        request_id,
                        AuditEventType::SubmissionFailed,
                        json!({ "attempts": attempts, "mode": mode.as_str(), "error": error }),
                    ),
                    vec![BroadcastEvent::RequestUpdated {
                        request_id: request_id.to_string(),
                        status: RequestStatus::Failed,
                        reason: Some(error.to_string()),
                    }],
                );
            }
            Ok(TransitionOutcome::AlreadyTerminal(_) | TransitionOutcome::Superseded(_)) => {}
            Err(e) => {
                tracing::error!(request_id = %request_id, "Failed to mark request failed: {}", e);
            }
        }
    }
}

async fn push_to_wallet(wallet: &dyn WalletBridge, signed_tx: &[u8]) -> Result<String, AttemptError> {
    wallet
        .submit_tx(&hex::encode(signed_tx))
        .await
        .map_err(|e| AttemptError {
            definitive: e.is_definitive(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{IndexerError, WalletError};
    use crate::services::slot_tracker::SlotTrackerConfig;
    use crate::services::testing::{
        seed_signed_request, test_vault, utxo, MockIndexer, MockWallet, RecordingBroadcaster,
        RecordingWatcher, TEST_BODY_HEX, TEST_WITNESS_HEX,
    };
    use crate::storage::{AuditDao, RequestDao, SqliteStore, TransactionDao};
    use chrono::TimeZone;

    struct Harness {
        store: Arc<SqliteStore>,
        indexer: Arc<MockIndexer>,
        events: Arc<RecordingBroadcaster>,
        watcher: Arc<RecordingWatcher>,
        pipeline: Arc<SubmissionPipeline>,
    }

    impl Harness {
        async fn new(indexer: MockIndexer, config: SubmissionConfig) -> Self {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            let indexer = Arc::new(indexer);
            indexer.set_tip(500);
            let tracker = SlotTracker::new(indexer.clone(), SlotTrackerConfig::default())
                .with_clock(|| Utc.timestamp_opt(1_700_000_000, 0).unwrap());
            tracker.refresh().await;
            let events = Arc::new(RecordingBroadcaster::new());
            let watcher = Arc::new(RecordingWatcher::new());

            let pipeline = SubmissionPipeline::new(
                store.clone(),
                Arc::new(test_vault()),
                indexer.clone(),
                Arc::new(tracker),
                events.clone(),
                config,
            )
            .with_confirmation_watcher(watcher.clone());

            Self {
                store,
                indexer,
                events,
                watcher,
                pipeline: Arc::new(pipeline),
            }
        }

        fn seed(&self, request_id: &str, ttl_slot: u64) {
            seed_signed_request(
                &self.store,
                &test_vault(),
                request_id,
                ttl_slot,
                vec![utxo("txA", 0, 5_000_000)],
            );
        }

        fn status(&self, request_id: &str) -> RequestStatus {
            self.store.get_request(request_id).unwrap().unwrap().status
        }

        fn audits(&self, request_id: &str, event_type: AuditEventType) -> usize {
            self.store
                .events_for_request(request_id)
                .unwrap()
                .iter()
                .filter(|e| e.event_type == event_type)
                .count()
        }
    }

    fn fast_config() -> SubmissionConfig {
        SubmissionConfig {
            base_delay: Duration::from_millis(1),
            queue_pause: Duration::from_millis(1),
            ..SubmissionConfig::default()
        }
    }

    fn unavailable() -> Result<String, IndexerError> {
        Err(IndexerError::Http {
            status: 503,
            body: "upstream unavailable".into(),
        })
    }

    #[test]
    fn test_assembles_signed_transaction_envelope() {
        let bytes = assemble_signed_transaction("a0", "a1").unwrap();
        assert_eq!(bytes, vec![0x84, 0xa0, 0xa1, 0xf5, 0xf6]);
        assert!(assemble_signed_transaction("zz", "a1").is_err());
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt_after_two_failures() {
        let h = Harness::new(MockIndexer::new(), fast_config()).await;
        h.seed("request-ok01", 1_000);
        h.indexer
            .script_submit(vec![unavailable(), unavailable(), Ok("ab".repeat(32))]);

        let result = h
            .pipeline
            .submit("request-ok01", SubmissionMode::Server, None)
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.tx_hash.as_deref(), Some("ab".repeat(32).as_str()));
        assert_eq!(h.status("request-ok01"), RequestStatus::Submitted);
        assert_eq!(h.audits("request-ok01", AuditEventType::SubmissionAttemptFailed), 2);
        assert_eq!(h.audits("request-ok01", AuditEventType::SubmissionSucceeded), 1);
        assert!(h.store.get_transaction_for_request("request-ok01").unwrap().is_some());
        assert_eq!(
            h.watcher.watched(),
            vec![("request-ok01".to_string(), "ab".repeat(32))]
        );
        assert_eq!(
            h.events.status_updates("request-ok01"),
            vec![RequestStatus::Submitting, RequestStatus::Submitted]
        );

        let expected = assemble_signed_transaction(TEST_BODY_HEX, TEST_WITNESS_HEX).unwrap();
        assert!(h.indexer.submitted().iter().all(|tx| *tx == expected));
        assert!(!h.pipeline.is_in_flight("request-ok01"));
    }

    #[tokio::test]
    async fn test_user_declined_is_not_retried() {
        let h = Harness::new(MockIndexer::new(), fast_config()).await;
        h.seed("request-dec1", 1_000);
        let wallet = Arc::new(MockWallet::new(vec![Err(WalletError::UserDeclined)]));

        let result = h
            .pipeline
            .submit("request-dec1", SubmissionMode::Wallet, Some(wallet.clone()))
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(wallet.calls(), 1);
        assert_eq!(h.status("request-dec1"), RequestStatus::Failed);
        assert_eq!(h.audits("request-dec1", AuditEventType::SubmissionFailed), 1);
    }

    #[tokio::test]
    async fn test_ledger_rejection_is_not_retried() {
        let h = Harness::new(MockIndexer::new(), fast_config()).await;
        h.seed("request-rej1", 1_000);
        h.indexer
            .script_submit(vec![Err(IndexerError::Rejected("BadInputsUTxO".into()))]);

        let result = h
            .pipeline
            .submit("request-rej1", SubmissionMode::Server, None)
            .await;

        assert_eq!(result.attempts, 1);
        assert_eq!(h.indexer.submitted().len(), 1);
        assert!(result.error.unwrap().contains("BadInputsUTxO"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_request() {
        let h = Harness::new(MockIndexer::new(), fast_config()).await;
        h.seed("request-exh1", 1_000);
        h.indexer
            .script_submit(vec![unavailable(), unavailable(), unavailable()]);

        let result = h
            .pipeline
            .submit("request-exh1", SubmissionMode::Server, None)
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(h.status("request-exh1"), RequestStatus::Failed);
        assert_eq!(h.audits("request-exh1", AuditEventType::SubmissionAttemptFailed), 3);
        assert_eq!(h.audits("request-exh1", AuditEventType::SubmissionFailed), 1);
    }

    #[tokio::test]
    async fn test_concurrent_submits_share_one_execution() {
        let config = SubmissionConfig {
            base_delay: Duration::from_millis(20),
            ..fast_config()
        };
        let h = Harness::new(MockIndexer::new(), config).await;
        h.seed("request-dup1", 1_000);
        h.indexer.script_submit(vec![unavailable(), Ok("ab".repeat(32))]);

        let (first, second) = tokio::join!(
            h.pipeline.submit("request-dup1", SubmissionMode::Server, None),
            h.pipeline.submit("request-dup1", SubmissionMode::Server, None),
        );

        assert_eq!(first, second);
        assert!(first.success);
        assert_eq!(h.indexer.submitted().len(), 2);
        assert_eq!(h.audits("request-dup1", AuditEventType::SubmissionStarted), 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_retry() {
        let config = SubmissionConfig {
            base_delay: Duration::from_secs(60),
            ..fast_config()
        };
        let h = Harness::new(MockIndexer::new(), config).await;
        h.seed("request-can1", 1_000);
        h.indexer.script_submit(vec![unavailable(), unavailable()]);

        let pipeline = h.pipeline.clone();
        let task = tokio::spawn(async move {
            pipeline
                .submit("request-can1", SubmissionMode::Server, None)
                .await
        });

        while h.indexer.submitted().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(h.pipeline.cancel("request-can1").unwrap());

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.error.as_deref(), Some("cancelled"));
        assert_eq!(result.attempts, 1);
        assert_eq!(h.status("request-can1"), RequestStatus::Failed);
        assert_eq!(h.audits("request-can1", AuditEventType::SubmissionCancelled), 1);
        assert!(!h.pipeline.is_in_flight("request-can1"));

        // cancelling again is a no-op
        assert!(!h.pipeline.cancel("request-can1").unwrap());
    }

    #[tokio::test]
    async fn test_expired_request_is_never_submitted() {
        let h = Harness::new(MockIndexer::new(), fast_config()).await;
        h.seed("request-ttl1", 400);

        let result = h
            .pipeline
            .submit("request-ttl1", SubmissionMode::Server, None)
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 0);
        assert!(h.indexer.submitted().is_empty());
        assert_eq!(h.status("request-ttl1"), RequestStatus::Expired);
    }

    #[tokio::test]
    async fn test_unconfigured_indexer_fails_fast_without_state_change() {
        let h = Harness::new(MockIndexer::unconfigured(), fast_config()).await;
        h.seed("request-nc01", u64::MAX);

        let result = h
            .pipeline
            .submit("request-nc01", SubmissionMode::Server, None)
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("not configured"));
        assert_eq!(h.status("request-nc01"), RequestStatus::Signed);
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_not_a_failure() {
        let h = Harness::new(MockIndexer::new(), fast_config()).await;
        h.seed("request-hash1", 1_000);
        h.indexer.script_submit(vec![Ok("ff".repeat(32))]);

        let result = h
            .pipeline
            .submit("request-hash1", SubmissionMode::Server, None)
            .await;

        assert!(result.success);
        assert_eq!(result.tx_hash.as_deref(), Some("ab".repeat(32).as_str()));
    }

    #[tokio::test]
    async fn test_batch_and_queue_wrappers() {
        let h = Harness::new(MockIndexer::new(), fast_config()).await;
        for id in ["request-b001", "request-b002", "request-q001"] {
            h.seed(id, 1_000);
        }

        let batch = h
            .pipeline
            .submit_batch(vec!["request-b001".into(), "request-b002".into()])
            .await;
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|(_, result)| result.success));

        let queued = h.pipeline.submit_queued(&["request-q001".to_string()]).await;
        assert!(queued[0].success);
        assert_eq!(h.status("request-q001"), RequestStatus::Submitted);
    }
}
