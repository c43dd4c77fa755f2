use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::broadcast::Broadcaster;
use super::indexer::LedgerIndexer;
use super::slot_tracker::SlotTracker;
use super::transitions::{apply_transition_from, audit_then_emit, TransitionOutcome};
use super::ServiceHandle;
use crate::error::EngineError;
use crate::models::{
    AuditEvent, AuditEventType, BroadcastEvent, OutputRef, RequestStatus, SignedRequestRecord,
    TtlStatus, UnspentOutput,
};
use crate::storage::Persistence;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Records checked more often than this are dropped from tracking.
    pub max_checks: u32,
    /// Records signed longer ago than this are dropped from tracking.
    pub max_age: chrono::Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_checks: 1_000,
            max_age: chrono::Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CheckOutcome {
    Expired,
    Consumed(Vec<OutputRef>),
    Alive,
    /// The request left SIGNED outside this monitor.
    NotSigned(RequestStatus),
    Errored,
}

impl CheckOutcome {
    fn ends_tracking(&self) -> bool {
        matches!(
            self,
            CheckOutcome::Expired | CheckOutcome::Consumed(_) | CheckOutcome::NotSigned(_)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub checked: usize,
    pub expired: usize,
    pub failed: usize,
    pub alive: usize,
    pub errors: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackedSummary {
    pub request_id: String,
    pub transaction_hash: String,
    pub ttl_slot: u64,
    pub inputs: Vec<OutputRef>,
    pub check_count: u32,
    pub signed_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Watches signed requests until they expire, lose an input, or are handed
/// to the submission pipeline.
///
/// The tracked map is the only mutable state. Cycles are serialised by
/// `cycle_lock`; each one works on a snapshot and writes back check counts
/// only for records that are still tracked afterwards, so concurrent
/// `track`/`untrack` calls never race a cycle.
pub struct UtxoMonitor {
    store: Arc<dyn Persistence>,
    indexer: Arc<dyn LedgerIndexer>,
    slots: Arc<SlotTracker>,
    broadcaster: Arc<dyn Broadcaster>,
    config: MonitorConfig,
    tracked: RwLock<HashMap<String, SignedRequestRecord>>,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl UtxoMonitor {
    pub fn new(
        store: Arc<dyn Persistence>,
        indexer: Arc<dyn LedgerIndexer>,
        slots: Arc<SlotTracker>,
        broadcaster: Arc<dyn Broadcaster>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            indexer,
            slots,
            broadcaster,
            config,
            tracked: RwLock::new(HashMap::new()),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn track(&self, record: SignedRequestRecord) {
        tracing::info!(
            request_id = %record.request_id,
            ttl_slot = record.ttl_slot,
            inputs = record.selected_inputs.len(),
            "Tracking signed request"
        );
        self.tracked
            .write()
            .insert(record.request_id.clone(), record);
    }

    /// Administrative removal. Does not change the request's status.
    pub fn untrack(&self, request_id: &str) -> bool {
        let removed = self.tracked.write().remove(request_id).is_some();
        if removed {
            tracing::info!(request_id = %request_id, "Stopped tracking signed request");
            let audit = AuditEvent::new(
                request_id,
                AuditEventType::TrackingRemoved,
                json!({ "reason": "administrative" }),
            );
            if let Err(e) = self.store.log_event(&audit) {
                tracing::error!(request_id = %request_id, "Failed to audit tracking removal: {}", e);
            }
        }
        removed
    }

    #[cfg(test)]
    pub fn is_tracked(&self, request_id: &str) -> bool {
        self.tracked.read().contains_key(request_id)
    }

    #[cfg(test)]
    pub fn tracked_count(&self) -> usize {
        self.tracked.read().len()
    }

    /// Re-tracks every persisted request still in SIGNED.
    pub fn load_signed(&self) -> Result<usize, EngineError> {
        let records = self.store.get_by_status(RequestStatus::Signed)?;
        let count = records.len();
        {
            let mut tracked = self.tracked.write();
            for record in records {
                tracked.insert(record.request_id.clone(), record);
            }
        }
        tracing::info!("Recovered {} signed requests for monitoring", count);
        Ok(count)
    }

    /// Inputs committed to by tracked records; new selections must avoid them.
    pub fn claimed_inputs(&self) -> HashSet<OutputRef> {
        self.tracked
            .read()
            .values()
            .flat_map(|record| record.selected_inputs.iter().map(UnspentOutput::output_ref))
            .collect()
    }

    pub fn tracked(&self) -> Vec<TrackedSummary> {
        let mut summaries: Vec<TrackedSummary> = self
            .tracked
            .read()
            .values()
            .map(|record| TrackedSummary {
                request_id: record.request_id.clone(),
                transaction_hash: record.transaction_hash.clone(),
                ttl_slot: record.ttl_slot,
                inputs: record.selected_inputs.iter().map(UnspentOutput::output_ref).collect(),
                check_count: record.check_count,
                signed_at: record.signed_at,
                last_checked_at: record.last_checked_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.signed_at.cmp(&b.signed_at));
        summaries
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let _cycle = self.cycle_lock.lock().await;

        let snapshot: Vec<SignedRequestRecord> = self.tracked.read().values().cloned().collect();
        if snapshot.is_empty() {
            return CycleReport::default();
        }

        let current_slot = self.slots.current_slot();
        tracing::debug!(
            "Monitoring cycle over {} records at slot {}",
            snapshot.len(),
            current_slot
        );

        let outcomes = join_all(
            snapshot
                .iter()
                .map(|record| self.check_record(record, current_slot)),
        )
        .await;

        let mut report = CycleReport {
            checked: snapshot.len(),
            ..CycleReport::default()
        };
        let now = Utc::now();
        let mut updated_checks = Vec::with_capacity(snapshot.len());

        {
            let mut tracked = self.tracked.write();
            for (record, outcome) in snapshot.iter().zip(outcomes.iter()) {
                match outcome {
                    CheckOutcome::Expired => report.expired += 1,
                    CheckOutcome::Consumed(_) => report.failed += 1,
                    CheckOutcome::Alive => report.alive += 1,
                    CheckOutcome::Errored => report.errors += 1,
                    CheckOutcome::NotSigned(_) => {}
                }

                let Some(entry) = tracked.get_mut(&record.request_id) else {
                    continue;
                };
                entry.check_count = entry.check_count.saturating_add(1);
                entry.last_checked_at = Some(now);
                updated_checks.push((entry.request_id.clone(), entry.check_count));

                let stale = entry.check_count > self.config.max_checks
                    || now - entry.signed_at > self.config.max_age;
                if outcome.ends_tracking() || stale {
                    if stale && !outcome.ends_tracking() {
                        tracing::info!(
                            request_id = %entry.request_id,
                            check_count = entry.check_count,
                            "Dropping stale record from monitoring"
                        );
                    }
                    tracked.remove(&record.request_id);
                    report.dropped += 1;
                }
            }
        }

        for (request_id, check_count) in updated_checks {
            if let Err(e) = self.store.record_check(&request_id, check_count, now) {
                tracing::warn!(request_id = %request_id, "Failed to persist check count: {}", e);
            }
        }

        report
    }

    async fn check_record(&self, record: &SignedRequestRecord, current_slot: u64) -> CheckOutcome {
        match self.evaluate(record, current_slot).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(request_id = %record.request_id, "Monitoring check failed: {}", e);
                CheckOutcome::Errored
            }
        }
    }

    async fn evaluate(
        &self,
        record: &SignedRequestRecord,
        current_slot: u64,
    ) -> Result<CheckOutcome, EngineError> {
        let request_id = record.request_id.as_str();
        let status = self
            .store
            .get_request(request_id)?
            .map(|request| request.status)
            .ok_or_else(|| EngineError::NotFound(format!("request {}", request_id)))?;
        if status != RequestStatus::Signed {
            return Ok(CheckOutcome::NotSigned(status));
        }

        if current_slot > record.ttl_slot {
            return self.expire(record, current_slot);
        }

        let consumed = self.consumed_inputs(record).await;
        if !consumed.is_empty() {
            return self.fail_consumed(record, consumed);
        }

        let remaining_slots = record.ttl_slot - current_slot;
        self.broadcaster.emit(BroadcastEvent::TtlUpdate {
            request_id: request_id.to_string(),
            current_slot,
            ttl_slot: record.ttl_slot,
            remaining_slots,
            remaining_seconds: remaining_slots,
            status: TtlStatus::from_remaining(remaining_slots),
        });
        Ok(CheckOutcome::Alive)
    }

    fn expire(&self, record: &SignedRequestRecord, current_slot: u64) -> Result<CheckOutcome, EngineError> {
        let request_id = record.request_id.as_str();
        match apply_transition_from(
            self.store.as_ref(),
            request_id,
            RequestStatus::Signed,
            RequestStatus::Expired,
        )? {
            TransitionOutcome::Applied { .. } => {
                tracing::warn!(
                    request_id = %request_id,
                    ttl_slot = record.ttl_slot,
                    current_slot,
                    "Signed request expired"
                );
                audit_then_emit(
                    self.store.as_ref(),
                    self.broadcaster.as_ref(),
                    AuditEvent::new(
                        request_id,
                        AuditEventType::RequestExpired,
                        json!({ "ttl_slot": record.ttl_slot, "current_slot": current_slot }),
                    ),
                    vec![BroadcastEvent::RequestUpdated {
                        request_id: request_id.to_string(),
                        status: RequestStatus::Expired,
                        reason: Some("ttl_expired".into()),
                    }],
                );
                Ok(CheckOutcome::Expired)
            }
            TransitionOutcome::AlreadyTerminal(status) | TransitionOutcome::Superseded(status) => {
                Ok(CheckOutcome::NotSigned(status))
            }
        }
    }

    fn fail_consumed(
        &self,
        record: &SignedRequestRecord,
        consumed: Vec<OutputRef>,
    ) -> Result<CheckOutcome, EngineError> {
        let request_id = record.request_id.as_str();
        match apply_transition_from(
            self.store.as_ref(),
            request_id,
            RequestStatus::Signed,
            RequestStatus::Failed,
        )? {
            TransitionOutcome::Applied { .. } => {
                tracing::warn!(
                    request_id = %request_id,
                    consumed = consumed.len(),
                    "Selected inputs were spent elsewhere"
                );
                audit_then_emit(
                    self.store.as_ref(),
                    self.broadcaster.as_ref(),
                    AuditEvent::new(
                        request_id,
                        AuditEventType::UtxoConsumed,
                        json!({
                            "consumed_inputs": consumed.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        }),
                    ),
                    vec![
                        BroadcastEvent::UtxoUpdate {
                            request_id: request_id.to_string(),
                            checked_inputs: record.selected_inputs.len(),
                            consumed_inputs: consumed.clone(),
                        },
                        BroadcastEvent::RequestUpdated {
                            request_id: request_id.to_string(),
                            status: RequestStatus::Failed,
                            reason: Some("utxo_consumed".into()),
                        },
                    ],
                );
                Ok(CheckOutcome::Consumed(consumed))
            }
            TransitionOutcome::AlreadyTerminal(status) | TransitionOutcome::Superseded(status) => {
                Ok(CheckOutcome::NotSigned(status))
            }
        }
    }

    async fn consumed_inputs(&self, record: &SignedRequestRecord) -> Vec<OutputRef> {
        let checks = record
            .selected_inputs
            .iter()
            .map(|input| self.is_consumed(input, &record.transaction_hash));
        let results = join_all(checks).await;

        record
            .selected_inputs
            .iter()
            .zip(results)
            .filter(|(_, consumed)| *consumed)
            .map(|(input, _)| input.output_ref())
            .collect()
    }

    /// True only on positive evidence that another transaction spent `input`.
    async fn is_consumed(&self, input: &UnspentOutput, own_tx_hash: &str) -> bool {
        let output = input.output_ref();

        let utxos = match self.indexer.tx_utxos(&input.tx_hash).await {
            Ok(utxos) => utxos,
            Err(e) => return self.assume_unspent(&output, &e.to_string()),
        };

        let address = match utxos
            .outputs
            .iter()
            .find(|o| o.output_index == input.output_index)
        {
            Some(tx_output) => match &tx_output.consumed_by_tx {
                Some(Some(spender)) => return spender != own_tx_hash,
                Some(None) => return false,
                // not reported by this indexer, look for a spender instead
                None => tx_output.address.clone(),
            },
            None => input.address.clone(),
        };

        match self.spent_by_recent_address_tx(&address, &output, own_tx_hash).await {
            Ok(found) => found,
            Err(e) => self.assume_unspent(&output, &e),
        }
    }

    async fn spent_by_recent_address_tx(
        &self,
        address: &str,
        output: &OutputRef,
        own_tx_hash: &str,
    ) -> Result<bool, String> {
        let transactions = self
            .indexer
            .address_transactions(address)
            .await
            .map_err(|e| e.to_string())?;

        for tx in transactions.iter().filter(|tx| tx.tx_hash != own_tx_hash) {
            let utxos = self.indexer.tx_utxos(&tx.tx_hash).await.map_err(|e| e.to_string())?;
            if utxos
                .inputs
                .iter()
                .any(|i| i.tx_hash == output.tx_hash && i.output_index == output.output_index)
            {
                tracing::debug!(output = %output, spender = %tx.tx_hash, "Found spending transaction");
                return Ok(true);
            }
        }
        Ok(false)
    }

    // TODO: query a local node here once one is part of the deployment
    fn assume_unspent(&self, output: &OutputRef, reason: &str) -> bool {
        tracing::warn!(output = %output, "Survival check unavailable, assuming unspent: {}", reason);
        false
    }

    pub fn start(self: &Arc<Self>) -> ServiceHandle {
        let monitor = Arc::clone(self);
        let interval = self.config.interval;

        ServiceHandle::spawn("utxo-monitor", move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = monitor.run_cycle().await;
                        if report.checked > 0 {
                            tracing::info!(
                                checked = report.checked,
                                expired = report.expired,
                                failed = report.failed,
                                dropped = report.dropped,
                                "Monitoring cycle complete"
                            );
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
