// Numan Thabit 2025
//! Raw `getBlock` shapes as providers return them.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawBlock {
    #[serde(default)]
    pub block_time: Option<i64>,
    /// Kept as raw values so one bad transaction cannot fail the block.
    #[serde(default)]
    pub transactions: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawTransaction {
    pub transaction: RawEnvelope,
    #[serde(default)]
    pub meta: Option<RawMeta>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawEnvelope {
    #[serde(default)]
    pub signatures: Vec<String>,
    pub message: RawMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawMessage {
    #[serde(alias = "staticAccountKeys")]
    pub account_keys: Vec<RawAccountKey>,
    #[serde(default)]
    pub instructions: Vec<RawInstruction>,
}

/// Either a bare base58 key or a parsed `{pubkey, signer, writable, source}` entry.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawAccountKey {
    Plain(String),
    Parsed {
        pubkey: String,
        #[serde(default)]
        source: Option<String>,
    },
}

impl RawAccountKey {
    pub fn pubkey(&self) -> &str {
        match self {
            Self::Plain(key) => key,
            Self::Parsed { pubkey, .. } => pubkey,
        }
    }

    /// Parsed entries flag keys that were already pulled in from a lookup table.
    pub fn from_lookup_table(&self) -> bool {
        matches!(self, Self::Parsed { source: Some(source), .. } if source == "lookupTable")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawInstruction {
    #[serde(default)]
    pub program_id_index: Option<usize>,
    #[serde(default)]
    pub program_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawMeta {
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub fee: u64,
    #[serde(default)]
    pub pre_balances: Vec<u64>,
    #[serde(default)]
    pub post_balances: Vec<u64>,
    #[serde(default)]
    pub inner_instructions: Option<Vec<RawInnerInstructions>>,
    #[serde(default)]
    pub loaded_addresses: Option<RawLoadedAddresses>,
    #[serde(default)]
    pub compute_units_consumed: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawInnerInstructions {
    #[serde(default)]
    pub instructions: Vec<RawInstruction>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawLoadedAddresses {
    #[serde(default)]
    pub writable: Vec<String>,
    #[serde(default)]
    pub readonly: Vec<String>,
}
