//! In-memory doubles for the external collaborators.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::broadcast::Broadcaster;
use super::confirmation::ConfirmationWatcher;
use super::indexer::{AddressTransaction, LedgerIndexer, TxConfirmation, TxInput, TxOutput, TxUtxos};
use super::vault::PayloadVault;
use super::wallet_bridge::WalletBridge;
use crate::error::{IndexerError, WalletError};
use crate::models::{
    AmountSpec, BroadcastEvent, EncryptionMetadata, FieldEncryption, OutputRef, Request,
    RequestStatus, SignedRequestRecord, UnspentOutput,
};
use crate::storage::{PreSignedDao, RequestDao, SqliteStore};

pub const TEST_SECRET: &str = "k3P9xQ2mV7tR1wZ8nB4cL6yH0sD5fJ2a";
pub const TEST_BODY_HEX: &str = "a400818258203b40265111d8bb3c3c608d95b3a0bf83461ace32";
pub const TEST_WITNESS_HEX: &str = "a10081825820c1d2e3f4a5b6c7d8e9f0a1b2c3d4e5f6a7b8c9d0";
pub const MOCK_ADDRESS: &str = "addr_test1qzmockaddress";
const MOCK_OUTPUTS_PER_TX: u32 = 4;

#[derive(Default)]
struct IndexerState {
    tip: u64,
    tip_failing: bool,
    utxos_failing: bool,
    hide_consumed_by: bool,
    spent: HashMap<OutputRef, String>,
    submit_script: VecDeque<Result<String, IndexerError>>,
    submitted: Vec<Vec<u8>>,
    confirmed: HashSet<String>,
}

type Hook = Box<dyn Fn() + Send + Sync>;

pub struct MockIndexer {
    configured: bool,
    state: Mutex<IndexerState>,
    utxo_calls: AtomicUsize,
    utxos_hook: Mutex<Option<Hook>>,
}

impl MockIndexer {
    pub fn new() -> Self {
        Self {
            configured: true,
            state: Mutex::new(IndexerState::default()),
            utxo_calls: AtomicUsize::new(0),
            utxos_hook: Mutex::new(None),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            configured: false,
            ..Self::new()
        }
    }

    pub fn set_tip(&self, slot: u64) {
        self.state.lock().tip = slot;
    }

    pub fn set_tip_failing(&self, failing: bool) {
        self.state.lock().tip_failing = failing;
    }

    pub fn set_utxos_failing(&self, failing: bool) {
        self.state.lock().utxos_failing = failing;
    }

    /// Simulates an indexer that never fills `consumed_by_tx`.
    pub fn hide_consumed_by(&self) {
        self.state.lock().hide_consumed_by = true;
    }

    pub fn spend(&self, output: OutputRef, spending_tx: &str) {
        self.state.lock().spent.insert(output, spending_tx.to_string());
    }

    pub fn script_submit(&self, results: Vec<Result<String, IndexerError>>) {
        self.state.lock().submit_script.extend(results);
    }

    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.state.lock().submitted.clone()
    }

    pub fn confirm(&self, tx_hash: &str) {
        self.state.lock().confirmed.insert(tx_hash.to_string());
    }

    /// Runs `hook` at the start of every `tx_utxos` call.
    pub fn on_tx_utxos(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.utxos_hook.lock() = Some(Box::new(hook));
    }

    pub fn utxo_calls(&self) -> usize {
        self.utxo_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerIndexer for MockIndexer {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn tip_slot(&self) -> Result<u64, IndexerError> {
        let state = self.state.lock();
        if !self.configured {
            return Err(IndexerError::NotConfigured);
        }
        if state.tip_failing {
            return Err(IndexerError::Timeout);
        }
        Ok(state.tip)
    }

    async fn tx_utxos(&self, tx_hash: &str) -> Result<TxUtxos, IndexerError> {
        self.utxo_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.utxos_hook.lock().as_ref() {
            hook();
        }
        let state = self.state.lock();
        if state.utxos_failing {
            return Err(IndexerError::Http {
                status: 503,
                body: "unavailable".into(),
            });
        }

        let inputs = state
            .spent
            .iter()
            .filter(|(_, spender)| spender.as_str() == tx_hash)
            .map(|(output, _)| TxInput {
                address: MOCK_ADDRESS.to_string(),
                tx_hash: output.tx_hash.clone(),
                output_index: output.output_index,
                amount: Vec::new(),
            })
            .collect();

        let outputs = (0..MOCK_OUTPUTS_PER_TX)
            .map(|index| {
                let consumed_by_tx = if state.hide_consumed_by {
                    None
                } else {
                    Some(state.spent.get(&OutputRef::new(tx_hash, index)).cloned())
                };
                TxOutput {
                    address: MOCK_ADDRESS.to_string(),
                    output_index: index,
                    amount: Vec::new(),
                    consumed_by_tx,
                }
            })
            .collect();

        Ok(TxUtxos {
            hash: tx_hash.to_string(),
            inputs,
            outputs,
        })
    }

    async fn address_transactions(&self, _address: &str) -> Result<Vec<AddressTransaction>, IndexerError> {
        let state = self.state.lock();
        if state.utxos_failing {
            return Err(IndexerError::Timeout);
        }
        let hashes: HashSet<&String> = state.spent.values().collect();
        Ok(hashes
            .into_iter()
            .map(|hash| AddressTransaction {
                tx_hash: hash.clone(),
                block_height: None,
                block_time: None,
            })
            .collect())
    }

    async fn submit_tx(&self, signed_tx: &[u8]) -> Result<String, IndexerError> {
        if !self.configured {
            return Err(IndexerError::NotConfigured);
        }
        let mut state = self.state.lock();
        state.submitted.push(signed_tx.to_vec());
        state
            .submit_script
            .pop_front()
            .unwrap_or_else(|| Ok("ab".repeat(32)))
    }

    async fn tx_confirmation(&self, tx_hash: &str) -> Result<Option<TxConfirmation>, IndexerError> {
        let state = self.state.lock();
        Ok(state.confirmed.contains(tx_hash).then(|| TxConfirmation {
            hash: tx_hash.to_string(),
            block: "blockhash".into(),
            block_height: Some(100),
            slot: Some(state.tip),
        }))
    }
}

#[derive(Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<BroadcastEvent>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BroadcastEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    /// `request_updated` events for one request, in emission order.
    pub fn status_updates(&self, request_id: &str) -> Vec<RequestStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                BroadcastEvent::RequestUpdated {
                    request_id: id,
                    status,
                    ..
                } if id == request_id => Some(*status),
                _ => None,
            })
            .collect()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn emit(&self, event: BroadcastEvent) {
        self.events.lock().push(event);
    }
}

pub struct MockWallet {
    script: Mutex<VecDeque<Result<String, WalletError>>>,
    calls: AtomicUsize,
}

impl MockWallet {
    pub fn new(results: Vec<Result<String, WalletError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletBridge for MockWallet {
    async fn submit_tx(&self, _signed_tx_hex: &str) -> Result<String, WalletError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(WalletError::Unavailable("no scripted result".into())))
    }
}

#[derive(Default)]
pub struct RecordingWatcher {
    watched: Mutex<Vec<(String, String)>>,
}

impl RecordingWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watched(&self) -> Vec<(String, String)> {
        self.watched.lock().clone()
    }
}

impl ConfirmationWatcher for RecordingWatcher {
    fn watch(&self, request_id: &str, tx_hash: &str) {
        self.watched
            .lock()
            .push((request_id.to_string(), tx_hash.to_string()));
    }
}

pub fn test_vault() -> PayloadVault {
    PayloadVault::new(Some(TEST_SECRET)).unwrap()
}

pub fn utxo(tx_hash: &str, output_index: u32, amount: u64) -> UnspentOutput {
    UnspentOutput {
        tx_hash: tx_hash.to_string(),
        output_index,
        address: MOCK_ADDRESS.to_string(),
        amount,
        native_assets: None,
    }
}

/// A record with placeholder ciphertext, for storage-only tests.
pub fn sample_signed(request_id: &str) -> SignedRequestRecord {
    let field = FieldEncryption {
        salt: "00".repeat(32),
        iv: "11".repeat(12),
        auth_tag: "22".repeat(16),
    };
    SignedRequestRecord {
        request_id: request_id.to_string(),
        transaction_hash: "ab".repeat(32),
        encrypted_tx_body: "deadbeef".into(),
        encrypted_witness_set: "cafebabe".into(),
        encryption_metadata: EncryptionMetadata {
            algorithm: "aes-256-gcm".into(),
            kdf: "pbkdf2-sha256".into(),
            iterations: 210_000,
            tx_body: field.clone(),
            witness_set: field,
            version: 1,
        },
        fee_amount: 170_000,
        ttl_slot: 1_000,
        selected_inputs: vec![utxo(&"cd".repeat(32), 0, 5_000_000)],
        wallet_used: "eternl".into(),
        signed_at: Utc::now(),
        check_count: 0,
        last_checked_at: None,
    }
}

/// Inserts a SIGNED request whose payload was sealed by `vault`.
pub fn seed_signed_request(
    store: &SqliteStore,
    vault: &PayloadVault,
    request_id: &str,
    ttl_slot: u64,
    inputs: Vec<UnspentOutput>,
) -> SignedRequestRecord {
    let request = Request::new(
        request_id,
        "addr_test1vrrecipient",
        AmountSpec::Fixed { lovelace: 3_000_000 },
        ttl_slot,
    );
    store.insert_request(&request).unwrap();

    let sealed = vault
        .encrypt(request_id, TEST_BODY_HEX, TEST_WITNESS_HEX)
        .unwrap();
    let record = SignedRequestRecord {
        request_id: request_id.to_string(),
        transaction_hash: "ab".repeat(32),
        encrypted_tx_body: sealed.encrypted_tx_body,
        encrypted_witness_set: sealed.encrypted_witness_set,
        encryption_metadata: sealed.metadata,
        fee_amount: 170_000,
        ttl_slot,
        selected_inputs: inputs,
        wallet_used: "eternl".into(),
        signed_at: Utc::now(),
        check_count: 0,
        last_checked_at: None,
    };
    store.insert_signed(&record).unwrap();
    store.update_status(request_id, RequestStatus::Signed).unwrap();
    record
}
