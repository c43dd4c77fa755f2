use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::config::CardanoNetwork;
use crate::error::IndexerError;

const ADDRESS_TX_PAGE_SIZE: u32 = 25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantity {
    pub unit: String,
    pub quantity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub address: String,
    pub tx_hash: String,
    pub output_index: u32,
    #[serde(default)]
    pub amount: Vec<Quantity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub output_index: u32,
    #[serde(default)]
    pub amount: Vec<Quantity>,
    /// `None` when the field is absent, `Some(None)` when it is reported as
    /// null (the output is unspent), `Some(Some(hash))` once spent.
    #[serde(
        default,
        deserialize_with = "reported",
        skip_serializing_if = "Option::is_none"
    )]
    pub consumed_by_tx: Option<Option<String>>,
}

/// Keeps an explicit `null` apart from a missing field.
fn reported<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxUtxos {
    pub hash: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTransaction {
    pub tx_hash: String,
    #[serde(default)]
    pub block_height: Option<u64>,
    #[serde(default)]
    pub block_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxConfirmation {
    pub hash: String,
    pub block: String,
    pub block_height: Option<u64>,
    pub slot: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LatestBlock {
    slot: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BlockfrostErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Read and submit access to a Cardano chain indexer.
#[async_trait]
pub trait LedgerIndexer: Send + Sync {
    /// False when no API credential is available.
    fn is_configured(&self) -> bool;

    async fn tip_slot(&self) -> Result<u64, IndexerError>;

    async fn tx_utxos(&self, tx_hash: &str) -> Result<TxUtxos, IndexerError>;

    /// Most recent first.
    async fn address_transactions(&self, address: &str) -> Result<Vec<AddressTransaction>, IndexerError>;

    /// Pushes raw signed transaction CBOR, returning the hash reported by the indexer.
    async fn submit_tx(&self, signed_tx: &[u8]) -> Result<String, IndexerError>;

    /// `None` while the transaction is not yet in a block.
    async fn tx_confirmation(&self, tx_hash: &str) -> Result<Option<TxConfirmation>, IndexerError>;
}

pub struct BlockfrostIndexer {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl BlockfrostIndexer {
    pub fn new(
        network: CardanoNetwork,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, IndexerError> {
        Self::with_base_url(network.blockfrost_url(), api_key, timeout)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, IndexerError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IndexerError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        if api_key.is_none() {
            tracing::warn!("No Blockfrost API key configured; slot tracking will use estimation");
        }

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn api_key(&self) -> Result<&str, IndexerError> {
        self.api_key.as_deref().ok_or(IndexerError::NotConfigured)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, IndexerError> {
        let api_key = self.api_key()?;
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("GET {}", url);

        let response = self
            .http_client
            .get(&url)
            .header("project_id", api_key)
            .send()
            .await?;
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, IndexerError> {
        let response = self.get(path).await?;
        let response = error_for_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| IndexerError::Decode(e.to_string()))
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, IndexerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(IndexerError::Http {
        status: status.as_u16(),
        body,
    })
}

fn rejection_message(body: &str) -> String {
    match serde_json::from_str::<BlockfrostErrorBody>(body) {
        Ok(parsed) => parsed
            .message
            .or(parsed.error)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => body.to_string(),
    }
}

#[async_trait]
impl LedgerIndexer for BlockfrostIndexer {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn tip_slot(&self) -> Result<u64, IndexerError> {
        let block: LatestBlock = self.get_json("/blocks/latest").await?;
        block
            .slot
            .ok_or_else(|| IndexerError::Decode("latest block has no slot".into()))
    }

    async fn tx_utxos(&self, tx_hash: &str) -> Result<TxUtxos, IndexerError> {
        self.get_json(&format!("/txs/{}/utxos", tx_hash)).await
    }

    async fn address_transactions(&self, address: &str) -> Result<Vec<AddressTransaction>, IndexerError> {
        let path = format!(
            "/addresses/{}/transactions?order=desc&count={}",
            address, ADDRESS_TX_PAGE_SIZE
        );
        let response = self.get(&path).await?;
        // unused addresses are a 404, not an error
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = error_for_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| IndexerError::Decode(e.to_string()))
    }

    async fn submit_tx(&self, signed_tx: &[u8]) -> Result<String, IndexerError> {
        let api_key = self.api_key()?;
        let url = format!("{}/tx/submit", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .header("project_id", api_key)
            .header("Content-Type", "application/cbor")
            .body(signed_tx.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexerError::Rejected(rejection_message(&body)));
        }
        let response = error_for_status(response).await?;

        let tx_hash: String = response
            .json()
            .await
            .map_err(|e| IndexerError::Decode(e.to_string()))?;
        Ok(tx_hash)
    }

    async fn tx_confirmation(&self, tx_hash: &str) -> Result<Option<TxConfirmation>, IndexerError> {
        let response = self.get(&format!("/txs/{}", tx_hash)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = error_for_status(response).await?;
        let confirmation = response
            .json::<TxConfirmation>()
            .await
            .map_err(|e| IndexerError::Decode(e.to_string()))?;
        Ok(Some(confirmation))
    }
}
