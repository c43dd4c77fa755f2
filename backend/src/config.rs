use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::services::confirmation::ConfirmationConfig;
use crate::services::monitor::MonitorConfig;
use crate::services::slot_tracker::SlotTrackerConfig;
use crate::services::submission::SubmissionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardanoNetwork {
    Mainnet,
    Preprod,
    Preview,
}

impl CardanoNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardanoNetwork::Mainnet => "mainnet",
            CardanoNetwork::Preprod => "preprod",
            CardanoNetwork::Preview => "preview",
        }
    }

    pub fn blockfrost_url(&self) -> String {
        format!("https://cardano-{}.blockfrost.io/api/v0", self.as_str())
    }

    /// Unix time of slot zero for the current era, so `slot ≈ now - offset`.
    pub fn genesis_offset(&self) -> i64 {
        match self {
            CardanoNetwork::Mainnet => 1_591_566_291,
            CardanoNetwork::Preprod => 1_655_769_600,
            CardanoNetwork::Preview => 1_666_656_000,
        }
    }
}

impl From<&str> for CardanoNetwork {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "mainnet" => CardanoNetwork::Mainnet,
            "preview" => CardanoNetwork::Preview,
            _ => CardanoNetwork::Preprod,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub network: CardanoNetwork,
    pub blockfrost_api_key: Option<String>,
    pub master_secret: Option<String>,
    pub data_dir: String,
    pub port: u16,
    pub indexer_timeout: Duration,
    pub monitor: MonitorConfig,
    pub slot_tracker: SlotTrackerConfig,
    pub submission: SubmissionConfig,
    pub confirmation: ConfirmationConfig,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let network = CardanoNetwork::from(
            std::env::var("CARDANO_NETWORK")
                .unwrap_or_else(|_| "preprod".to_string())
                .as_str(),
        );

        let blockfrost_api_key = std::env::var("BLOCKFROST_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());

        let monitor = MonitorConfig {
            interval: Duration::from_secs(env_or("MONITOR_INTERVAL_SECS", 30)?),
            max_checks: env_or("MONITOR_MAX_CHECKS", 1000)?,
            max_age: chrono::Duration::hours(env_or("MONITOR_MAX_AGE_HOURS", 24)?),
        };

        let slot_tracker = SlotTrackerConfig {
            refresh_interval: Duration::from_secs(env_or("SLOT_REFRESH_INTERVAL_SECS", 20)?),
            genesis_offset: network.genesis_offset(),
        };

        let submission = SubmissionConfig {
            max_attempts: env_or("SUBMIT_MAX_ATTEMPTS", 3)?,
            base_delay: Duration::from_millis(env_or("SUBMIT_BASE_DELAY_MS", 2000)?),
            ..SubmissionConfig::default()
        };

        Ok(Self {
            network,
            blockfrost_api_key,
            master_secret: std::env::var("ENCRYPTION_MASTER_KEY").ok(),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            port: env_or("PORT", 3000)?,
            indexer_timeout: Duration::from_secs(env_or("INDEXER_TIMEOUT_SECS", 10)?),
            monitor,
            slot_tracker,
            submission,
            confirmation: ConfirmationConfig::default(),
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("{} must be a number: {}", key, e)),
        Err(_) => Ok(default),
    }
}
