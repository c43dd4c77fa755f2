use async_trait::async_trait;

use crate::error::WalletError;

/// Submission through the end user's own wallet.
#[async_trait]
pub trait WalletBridge: Send + Sync {
    /// Takes the full signed transaction as hex and returns its hash.
    async fn submit_tx(&self, signed_tx_hex: &str) -> Result<String, WalletError>;
}

/// Bridge for the case where the browser wallet already broadcast the
/// transaction and the client reports the outcome back.
pub struct ReportedSubmission {
    outcome: Result<String, WalletError>,
}

impl ReportedSubmission {
    pub fn submitted(tx_hash: impl Into<String>) -> Self {
        Self {
            outcome: Ok(tx_hash.into()),
        }
    }

    pub fn declined() -> Self {
        Self {
            outcome: Err(WalletError::UserDeclined),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: Err(WalletError::Rejected(reason.into())),
        }
    }
}

#[async_trait]
impl WalletBridge for ReportedSubmission {
    async fn submit_tx(&self, _signed_tx_hex: &str) -> Result<String, WalletError> {
        self.outcome.clone()
    }
}
