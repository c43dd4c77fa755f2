use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::utxo::UnspentOutput;

/// Per-field KDF and cipher parameters. Never holds key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldEncryption {
    pub salt: String,
    pub iv: String,
    pub auth_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    pub algorithm: String,
    pub kdf: String,
    pub iterations: u32,
    pub tx_body: FieldEncryption,
    pub witness_set: FieldEncryption,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedRequestRecord {
    pub request_id: String,
    pub transaction_hash: String,
    pub encrypted_tx_body: String,
    pub encrypted_witness_set: String,
    pub encryption_metadata: EncryptionMetadata,
    pub fee_amount: u64,
    pub ttl_slot: u64,
    pub selected_inputs: Vec<UnspentOutput>,
    pub wallet_used: String,
    pub signed_at: DateTime<Utc>,
    pub check_count: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// What the browser hands back after the user signs a candidate transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedPayload {
    pub transaction_hash: String,
    pub tx_body_hex: String,
    pub witness_set_hex: String,
    pub fee_amount: u64,
    pub selected_inputs: Vec<UnspentOutput>,
    pub wallet_used: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionMode {
    Server,
    Wallet,
}

impl SubmissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionMode::Server => "server",
            SubmissionMode::Wallet => "wallet",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tx_hash: String,
    pub request_id: String,
    pub fee_amount: u64,
    pub submission_mode: SubmissionMode,
    pub submitted_at: DateTime<Utc>,
}
