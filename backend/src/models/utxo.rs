use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// policy id -> asset name -> quantity
pub type NativeAssets = BTreeMap<String, BTreeMap<String, u64>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub tx_hash: String,
    pub output_index: u32,
}

impl OutputRef {
    pub fn new(tx_hash: impl Into<String>, output_index: u32) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            output_index,
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tx_hash, self.output_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub tx_hash: String,
    pub output_index: u32,
    pub address: String,
    /// lovelace
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_assets: Option<NativeAssets>,
}

impl UnspentOutput {
    pub fn output_ref(&self) -> OutputRef {
        OutputRef::new(self.tx_hash.clone(), self.output_index)
    }

    pub fn has_native_assets(&self) -> bool {
        self.native_assets
            .as_ref()
            .map(|policies| policies.values().any(|assets| assets.values().any(|q| *q > 0)))
            .unwrap_or(false)
    }
}
