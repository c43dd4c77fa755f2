use thiserror::Error;

use crate::models::request::RequestStatus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Insufficient funds: need {needed} lovelace, have {available}")]
    Insufficient { needed: u64, available: u64 },

    #[error("Cannot resolve amount: {0}")]
    UnresolvedAmount(String),
}

/// Errors raised by the signed-payload vault.
///
/// Tag verification failures are kept apart from every other failure so
/// callers can tell a wrong request id or tampered ciphertext from a
/// malformed record.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("ENCRYPTION_MASTER_KEY is not set")]
    MissingMasterSecret,

    #[error("Master secret must be at least {min} characters, got {actual}")]
    WeakMasterSecret { min: usize, actual: usize },

    #[error("Master secret is a known placeholder value")]
    PlaceholderMasterSecret,

    #[error("Request id must be at least {min} characters")]
    InvalidRequestId { min: usize },

    #[error("Refusing to encrypt an empty {0}")]
    EmptyPayload(&'static str),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Iteration count {0} is below the allowed minimum")]
    IterationsTooLow(u32),

    #[error("Malformed encrypted field: {0}")]
    Malformed(String),

    #[error("Authentication tag verification failed")]
    AuthenticationFailed,

    #[error("Encryption failed")]
    Encryption,
}

#[derive(Debug, Error, Clone)]
pub enum IndexerError {
    #[error("Ledger indexer is not configured (missing API key)")]
    NotConfigured,

    #[error("Ledger indexer request timed out")]
    Timeout,

    #[error("Ledger indexer returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transaction rejected by ledger: {0}")]
    Rejected(String),

    #[error("Ledger indexer transport error: {0}")]
    Transport(String),

    #[error("Failed to decode indexer response: {0}")]
    Decode(String),
}

impl IndexerError {
    /// Timeouts, transport failures, throttling and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexerError::Timeout | IndexerError::Transport(_) => true,
            IndexerError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Failures that will not change by retrying the same payload.
    pub fn is_definitive(&self) -> bool {
        match self {
            IndexerError::NotConfigured | IndexerError::Rejected(_) => true,
            IndexerError::Http { status, .. } => (400..500).contains(status) && *status != 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for IndexerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            IndexerError::Timeout
        } else if e.is_decode() {
            IndexerError::Decode(e.to_string())
        } else {
            IndexerError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("User declined to sign or submit")]
    UserDeclined,

    #[error("Wallet rejected transaction: {0}")]
    Rejected(String),

    #[error("Wallet unavailable: {0}")]
    Unavailable(String),
}

impl WalletError {
    pub fn is_definitive(&self) -> bool {
        matches!(self, WalletError::UserDeclined | WalletError::Rejected(_))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to lock connection: {0}")]
    Lock(String),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Indexer(#[from] IndexerError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Request {request_id} expired at slot {ttl_slot} (current slot {current_slot})")]
    Expired {
        request_id: String,
        ttl_slot: u64,
        current_slot: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
