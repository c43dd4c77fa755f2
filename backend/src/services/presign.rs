use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use super::broadcast::Broadcaster;
use super::coin_selection::{self, Selection, SelectionStrategy};
use super::monitor::UtxoMonitor;
use super::slot_tracker::SlotTracker;
use super::transitions::{apply_transition_from, audit_then_emit, TransitionOutcome};
use super::vault::PayloadVault;
use crate::error::{EngineError, Result, SelectionError};
use crate::models::{
    AmountSpec, AuditEvent, AuditEventType, BroadcastEvent, Request, RequestStatus,
    SignedPayload, SignedRequestRecord, UnspentOutput,
};
use crate::storage::Persistence;

#[derive(Debug, Clone, Serialize)]
pub struct CandidatePlan {
    pub request_id: String,
    /// Lovelace delivered to the recipient.
    pub amount: u64,
    pub fee: u64,
    pub selection: Selection,
}

/// Intake side of the engine: creates requests, plans their inputs and
/// accepts the payload once the user has signed.
pub struct PreSignService {
    store: Arc<dyn Persistence>,
    vault: Arc<PayloadVault>,
    slots: Arc<SlotTracker>,
    monitor: Arc<UtxoMonitor>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl PreSignService {
    pub fn new(
        store: Arc<dyn Persistence>,
        vault: Arc<PayloadVault>,
        slots: Arc<SlotTracker>,
        monitor: Arc<UtxoMonitor>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            store,
            vault,
            slots,
            monitor,
            broadcaster,
        }
    }

    pub fn create_request(
        &self,
        recipient: &str,
        amount_spec: AmountSpec,
        ttl_slot: u64,
    ) -> Result<Request> {
        if recipient.trim().is_empty() {
            return Err(EngineError::InvalidRequest("recipient is required".into()));
        }
        let current_slot = self.slots.current_slot();
        if ttl_slot <= current_slot {
            return Err(EngineError::InvalidRequest(format!(
                "ttl slot {} is not after current slot {}",
                ttl_slot, current_slot
            )));
        }

        let request = Request::new(
            uuid::Uuid::new_v4().to_string(),
            recipient.trim(),
            amount_spec,
            ttl_slot,
        );
        self.store.insert_request(&request)?;
        tracing::info!(request_id = %request.id, ttl_slot, "Created transfer request");
        Ok(request)
    }

    pub fn get_request(&self, request_id: &str) -> Result<Request> {
        self.store
            .get_request(request_id)?
            .ok_or_else(|| EngineError::NotFound(format!("request {}", request_id)))
    }

    /// Chooses inputs for a request that has not been signed yet. Outputs
    /// already committed to tracked signed requests are never offered.
    pub fn plan_inputs(
        &self,
        request_id: &str,
        utxos: &[UnspentOutput],
        strategy: SelectionStrategy,
        fee: u64,
        rate: Option<f64>,
    ) -> Result<CandidatePlan> {
        let request = self.get_request(request_id)?;
        if request.status != RequestStatus::Requested {
            return Err(EngineError::InvalidRequest(format!(
                "request {} is {}, inputs can only be planned while REQUESTED",
                request_id, request.status
            )));
        }

        let claimed = self.monitor.claimed_inputs();
        let available = spendable_total(utxos, &claimed);

        let amount = match request.amount_spec {
            AmountSpec::Sweep => available.checked_sub(fee).ok_or(SelectionError::Insufficient {
                needed: fee,
                available,
            })?,
            ref spec => spec.resolve(available, rate)?,
        };
        let target = amount.checked_add(fee).ok_or_else(|| {
            EngineError::InvalidRequest("amount plus fee overflows".into())
        })?;

        let selection = coin_selection::select(utxos, target, &claimed, strategy)?;
        if selection.fell_back {
            tracing::info!(request_id = %request_id, "Branch-and-bound fell back to largest-first");
        }
        tracing::debug!(
            request_id = %request_id,
            inputs = selection.selected.len(),
            change = selection.change,
            "Planned inputs"
        );

        Ok(CandidatePlan {
            request_id: request_id.to_string(),
            amount,
            fee,
            selection,
        })
    }

    /// Seals and stores the signed payload, moves the request to SIGNED and
    /// starts monitoring it.
    pub fn register_signed(&self, request_id: &str, payload: SignedPayload) -> Result<SignedRequestRecord> {
        let request = self.get_request(request_id)?;
        if request.status != RequestStatus::Requested {
            return Err(EngineError::InvalidRequest(format!(
                "request {} is {}, expected REQUESTED",
                request_id, request.status
            )));
        }

        let current_slot = self.slots.current_slot();
        if current_slot > request.ttl_slot {
            self.expire(&request, current_slot);
            return Err(EngineError::Expired {
                request_id: request_id.to_string(),
                ttl_slot: request.ttl_slot,
                current_slot,
            });
        }

        if payload.transaction_hash.trim().is_empty() {
            return Err(EngineError::InvalidRequest("transaction hash is required".into()));
        }
        if payload.selected_inputs.is_empty() {
            return Err(EngineError::InvalidRequest("signed payload has no inputs".into()));
        }
        let claimed = self.monitor.claimed_inputs();
        if let Some(conflict) = payload
            .selected_inputs
            .iter()
            .find(|input| claimed.contains(&input.output_ref()))
        {
            return Err(EngineError::InvalidRequest(format!(
                "input {} is already committed to another signed request",
                conflict.output_ref()
            )));
        }

        let sealed = self
            .vault
            .encrypt(request_id, &payload.tx_body_hex, &payload.witness_set_hex)?;

        let record = SignedRequestRecord {
            request_id: request_id.to_string(),
            transaction_hash: payload.transaction_hash,
            encrypted_tx_body: sealed.encrypted_tx_body,
            encrypted_witness_set: sealed.encrypted_witness_set,
            encryption_metadata: sealed.metadata,
            fee_amount: payload.fee_amount,
            ttl_slot: request.ttl_slot,
            selected_inputs: payload.selected_inputs,
            wallet_used: payload.wallet_used,
            signed_at: Utc::now(),
            check_count: 0,
            last_checked_at: None,
        };
        self.store.insert_signed(&record)?;

        match apply_transition_from(
            self.store.as_ref(),
            request_id,
            RequestStatus::Requested,
            RequestStatus::Signed,
        )? {
            TransitionOutcome::Applied { .. } => {}
            TransitionOutcome::AlreadyTerminal(status) | TransitionOutcome::Superseded(status) => {
                return Err(EngineError::InvalidRequest(format!(
                    "request {} became {} while registering",
                    request_id, status
                )));
            }
        }

        tracing::info!(
            request_id = %request_id,
            tx_hash = %record.transaction_hash,
            wallet = %record.wallet_used,
            "Registered signed transaction"
        );
        audit_then_emit(
            self.store.as_ref(),
            self.broadcaster.as_ref(),
            AuditEvent::new(
                request_id,
                AuditEventType::RequestSigned,
                json!({
                    "tx_hash": record.transaction_hash,
                    "fee_amount": record.fee_amount,
                    "inputs": record.selected_inputs.len(),
                    "wallet": record.wallet_used,
                }),
            ),
            vec![BroadcastEvent::RequestUpdated {
                request_id: request_id.to_string(),
                status: RequestStatus::Signed,
                reason: None,
            }],
        );

        self.monitor.track(record.clone());
        Ok(record)
    }

    fn expire(&self, request: &Request, current_slot: u64) {
        match apply_transition_from(
            self.store.as_ref(),
            &request.id,
            RequestStatus::Requested,
            RequestStatus::Expired,
        ) {
            Ok(TransitionOutcome::Applied { .. }) => {
                audit_then_emit(
                    self.store.as_ref(),
                    self.broadcaster.as_ref(),
                    AuditEvent::new(
                        &request.id,
                        AuditEventType::RequestExpired,
                        json!({ "ttl_slot": request.ttl_slot, "current_slot": current_slot }),
                    ),
                    vec![BroadcastEvent::RequestUpdated {
                        request_id: request.id.clone(),
                        status: RequestStatus::Expired,
                        reason: Some("ttl_expired".into()),
                    }],
                );
            }
            Ok(TransitionOutcome::AlreadyTerminal(_) | TransitionOutcome::Superseded(_)) => {}
            Err(e) => tracing::error!(request_id = %request.id, "Failed to expire request: {}", e),
        }
    }
}

fn spendable_total(utxos: &[UnspentOutput], claimed: &HashSet<crate::models::OutputRef>) -> u64 {
    let mut seen = HashSet::new();
    utxos
        .iter()
        .filter(|u| !claimed.contains(&u.output_ref()) && seen.insert(u.output_ref()))
        .fold(0u64, |acc, u| acc.saturating_add(u.amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::monitor::MonitorConfig;
    use crate::services::slot_tracker::SlotTrackerConfig;
    use crate::services::testing::{
        test_vault, utxo, MockIndexer, RecordingBroadcaster, TEST_BODY_HEX, TEST_WITNESS_HEX,
    };
    use crate::storage::{AuditDao, PreSignedDao, RequestDao, SqliteStore};
    use chrono::TimeZone;

    struct Harness {
        store: Arc<SqliteStore>,
        indexer: Arc<MockIndexer>,
        slots: Arc<SlotTracker>,
        events: Arc<RecordingBroadcaster>,
        monitor: Arc<UtxoMonitor>,
        vault: Arc<PayloadVault>,
        service: PreSignService,
    }

    impl Harness {
        async fn at_slot(slot: u64) -> Self {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            let indexer = Arc::new(MockIndexer::new());
            indexer.set_tip(slot);
            let tracker = SlotTracker::new(indexer.clone(), SlotTrackerConfig::default())
                .with_clock(|| Utc.timestamp_opt(1_700_000_000, 0).unwrap());
            tracker.refresh().await;
            let slots = Arc::new(tracker);
            let events = Arc::new(RecordingBroadcaster::new());
            let monitor = Arc::new(UtxoMonitor::new(
                store.clone(),
                indexer.clone(),
                slots.clone(),
                events.clone(),
                MonitorConfig::default(),
            ));
            let vault = Arc::new(test_vault());
            let service = PreSignService::new(
                store.clone(),
                vault.clone(),
                slots.clone(),
                monitor.clone(),
                events.clone(),
            );

            Self {
                store,
                indexer,
                slots,
                events,
                monitor,
                vault,
                service,
            }
        }
    }

    fn payload(inputs: Vec<UnspentOutput>) -> SignedPayload {
        SignedPayload {
            transaction_hash: "ab".repeat(32),
            tx_body_hex: TEST_BODY_HEX.into(),
            witness_set_hex: TEST_WITNESS_HEX.into(),
            fee_amount: 170_000,
            selected_inputs: inputs,
            wallet_used: "lace".into(),
        }
    }

    #[tokio::test]
    async fn test_register_signed_seals_tracks_and_audits() {
        let h = Harness::at_slot(500).await;
        let request = h
            .service
            .create_request("addr_test1vrrecipient", AmountSpec::Fixed { lovelace: 3_000_000 }, 1_000)
            .unwrap();

        let record = h
            .service
            .register_signed(&request.id, payload(vec![utxo("txA", 0, 5_000_000)]))
            .unwrap();

        assert_eq!(record.ttl_slot, 1_000);
        assert_ne!(record.encrypted_tx_body, TEST_BODY_HEX);
        assert_eq!(
            h.store.get_request(&request.id).unwrap().unwrap().status,
            RequestStatus::Signed
        );
        assert!(h.monitor.is_tracked(&request.id));
        assert_eq!(h.events.status_updates(&request.id), vec![RequestStatus::Signed]);

        let stored = h.store.get_by_request_id(&request.id).unwrap().unwrap();
        let opened = h
            .vault
            .decrypt(
                &request.id,
                &stored.encrypted_tx_body,
                &stored.encrypted_witness_set,
                &stored.encryption_metadata,
            )
            .unwrap();
        assert_eq!(opened.tx_body_hex, TEST_BODY_HEX);

        let audits = h.store.events_for_request(&request.id).unwrap();
        assert_eq!(audits[0].event_type, AuditEventType::RequestSigned);
        assert!(!audits[0].details.to_string().contains(TEST_BODY_HEX));

        // a second registration is refused
        assert!(h
            .service
            .register_signed(&request.id, payload(vec![utxo("txB", 0, 5_000_000)]))
            .is_err());
    }

    #[tokio::test]
    async fn test_register_after_ttl_expires_request() {
        let h = Harness::at_slot(500).await;
        let request = h
            .service
            .create_request("addr_test1vrrecipient", AmountSpec::Sweep, 600)
            .unwrap();

        h.indexer.set_tip(601);
        h.slots.refresh().await;

        let err = h
            .service
            .register_signed(&request.id, payload(vec![utxo("txA", 0, 5_000_000)]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Expired { ttl_slot: 600, current_slot: 601, .. }));
        assert_eq!(
            h.store.get_request(&request.id).unwrap().unwrap().status,
            RequestStatus::Expired
        );
        assert!(!h.monitor.is_tracked(&request.id));
    }

    #[tokio::test]
    async fn test_planning_skips_inputs_claimed_by_tracked_requests() {
        let h = Harness::at_slot(500).await;
        let first = h
            .service
            .create_request("addr_test1vrone", AmountSpec::Fixed { lovelace: 3_000_000 }, 1_000)
            .unwrap();
        h.service
            .register_signed(&first.id, payload(vec![utxo("txA", 0, 5_000_000)]))
            .unwrap();

        let second = h
            .service
            .create_request("addr_test1vrtwo", AmountSpec::Fixed { lovelace: 1_000_000 }, 1_000)
            .unwrap();
        let wallet = vec![utxo("txA", 0, 5_000_000), utxo("txB", 1, 2_000_000)];

        let plan = h
            .service
            .plan_inputs(&second.id, &wallet, SelectionStrategy::LargestFirst, 200_000, None)
            .unwrap();
        assert_eq!(plan.selection.selected, vec![utxo("txB", 1, 2_000_000)]);
        assert_eq!(plan.selection.change, 800_000);

        // the claimed output cannot be registered twice either
        let err = h
            .service
            .register_signed(&second.id, payload(vec![utxo("txA", 0, 5_000_000)]))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_sweep_and_rate_based_planning() {
        let h = Harness::at_slot(500).await;
        let wallet = vec![utxo("txA", 0, 4_000_000), utxo("txB", 0, 6_000_000)];

        let sweep = h
            .service
            .create_request("addr_test1vrsweep", AmountSpec::Sweep, 1_000)
            .unwrap();
        let plan = h
            .service
            .plan_inputs(&sweep.id, &wallet, SelectionStrategy::SmallestFirst, 200_000, None)
            .unwrap();
        assert_eq!(plan.amount, 9_800_000);
        assert_eq!(plan.selection.selected.len(), 2);
        assert_eq!(plan.selection.change, 0);

        let rated = h
            .service
            .create_request(
                "addr_test1vrrate",
                AmountSpec::RateBased {
                    fiat_amount: 2.0,
                    currency: "USD".into(),
                },
                1_000,
            )
            .unwrap();
        let plan = h
            .service
            .plan_inputs(&rated.id, &wallet, SelectionStrategy::LargestFirst, 200_000, Some(0.5))
            .unwrap();
        assert_eq!(plan.amount, 4_000_000);

        assert!(matches!(
            h.service
                .plan_inputs(&rated.id, &wallet, SelectionStrategy::LargestFirst, 200_000, None),
            Err(EngineError::Selection(SelectionError::UnresolvedAmount(_)))
        ));
    }

    #[tokio::test]
    async fn test_create_request_rejects_past_ttl() {
        let h = Harness::at_slot(500).await;
        assert!(matches!(
            h.service.create_request("addr_test1vr", AmountSpec::Sweep, 500),
            Err(EngineError::InvalidRequest(_))
        ));
    }
}
