// Numan Thabit 2025
//! Normalization of raw `getBlock` payloads into [`SlotBlock`] records.
//!
//! Two account addressing schemes show up in provider replies. Legacy messages
//! carry one flat `accountKeys` list. Versioned messages carry their static keys
//! in the message and the keys loaded from lookup tables in
//! `meta.loadedAddresses`, which are appended writable first, then readonly.
//! Every instruction index resolves against that concatenation.

mod programs;
mod tx_error;
mod wire;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use programs::{is_tip_account, TxCategory, BASE_FEE_LAMPORTS_PER_SIGNATURE, TIP_ACCOUNTS};
pub use tx_error::{TxError, UNKNOWN_ERROR_KIND};

use wire::{RawBlock, RawInstruction, RawTransaction};

/// Decode failure for a block or one of its transactions.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The top-level payload was not a block object.
    #[error("slot {slot}: unexpected block shape: {source}")]
    Block {
        /// Slot the payload was fetched for.
        slot: u64,
        /// Underlying decode failure.
        #[source]
        source: serde_json::Error,
    },
    /// A transaction entry did not match any known shape.
    #[error("undecodable transaction: {0}")]
    Transaction(#[from] serde_json::Error),
    /// The transaction carried no signature.
    #[error("transaction has no signature")]
    MissingSignature,
    /// The message carried no account keys.
    #[error("transaction has no account keys")]
    MissingAccounts,
    /// The transaction had no status metadata.
    #[error("transaction {0} has no meta")]
    MissingMeta(String),
}

/// One decoded transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    /// First signature, base58.
    pub signature: String,
    /// True when `meta.err` was null.
    pub success: bool,
    /// Fee charged, in lamports.
    pub fee: u64,
    /// Compute units consumed; zero when the provider omits it.
    pub compute_units: u64,
    /// Distinct invoked program ids, top-level then inner, in first-seen order.
    pub programs: Vec<String>,
    /// Signature count, never below one.
    pub num_signatures: u64,
    /// First static account key.
    pub fee_payer: String,
    /// Lamports paid into the public tip accounts.
    pub jito_tip: u64,
    /// Fee payer balance delta with the fee added back.
    pub sol_movement: i64,
    /// Decoded failure reason.
    pub error: Option<TxError>,
    /// Coarse category derived from `programs`.
    pub category: TxCategory,
}

impl TransactionRecord {
    /// `fee` minus the per-signature base fee; negative under estimation error.
    pub fn priority_fee_estimate(&self) -> i64 {
        let base = self
            .num_signatures
            .saturating_mul(BASE_FEE_LAMPORTS_PER_SIGNATURE);
        self.fee as i64 - base as i64
    }
}

/// Normalized view of one confirmed block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotBlock {
    /// Slot number.
    pub slot: u64,
    /// Unix seconds, when the provider knows it.
    pub block_time: Option<i64>,
    /// Decoded transactions in block order.
    pub transactions: Vec<TransactionRecord>,
    /// Sum of transaction fees.
    pub total_fees: u64,
    /// Sum of compute units.
    pub total_compute_units: u64,
    /// Transactions skipped because they failed to decode.
    pub dropped_transactions: u64,
}

impl SlotBlock {
    /// Number of successful transactions.
    pub fn success_count(&self) -> u64 {
        self.transactions.iter().filter(|tx| tx.success).count() as u64
    }

    /// Number of failed transactions.
    pub fn failed_count(&self) -> u64 {
        self.transactions.len() as u64 - self.success_count()
    }

    /// Percentage of successful transactions; 100 for an empty block.
    pub fn success_rate(&self) -> f64 {
        if self.transactions.is_empty() {
            return 100.0;
        }
        self.success_count() as f64 / self.transactions.len() as f64 * 100.0
    }

    /// Sum of tips across the block.
    pub fn total_jito_tips(&self) -> u64 {
        self.transactions.iter().map(|tx| tx.jito_tip).sum()
    }

    /// Signed priority fee estimate across the block.
    pub fn priority_fee_estimate(&self) -> i64 {
        self.transactions
            .iter()
            .map(TransactionRecord::priority_fee_estimate)
            .sum()
    }

    /// Priority fees clamped at zero.
    pub fn priority_fees(&self) -> u64 {
        self.priority_fee_estimate().max(0) as u64
    }

    /// Transaction count per category.
    pub fn category_counts(&self) -> BTreeMap<TxCategory, u64> {
        let mut counts = BTreeMap::new();
        for tx in &self.transactions {
            *counts.entry(tx.category).or_insert(0) += 1;
        }
        counts
    }
}

/// Normalize a raw `getBlock` result. `null` means the slot has no block.
pub fn normalize(raw: &Value, slot: u64) -> Result<Option<SlotBlock>, NormalizeError> {
    if raw.is_null() {
        return Ok(None);
    }
    let block = RawBlock::deserialize(raw).map_err(|source| NormalizeError::Block { slot, source })?;

    let mut transactions = Vec::with_capacity(block.transactions.len());
    let mut dropped = 0u64;
    for (position, entry) in block.transactions.iter().enumerate() {
        match decode_transaction(entry) {
            Ok(record) => transactions.push(record),
            Err(err) => {
                dropped += 1;
                debug!(slot, position, error = %err, "dropping undecodable transaction");
            }
        }
    }

    let total_fees = transactions.iter().map(|tx| tx.fee).sum();
    let total_compute_units = transactions.iter().map(|tx| tx.compute_units).sum();
    Ok(Some(SlotBlock {
        slot,
        block_time: block.block_time,
        transactions,
        total_fees,
        total_compute_units,
        dropped_transactions: dropped,
    }))
}

fn decode_transaction(entry: &Value) -> Result<TransactionRecord, NormalizeError> {
    let raw = RawTransaction::deserialize(entry)?;
    let message = raw.transaction.message;
    let signature = raw
        .transaction
        .signatures
        .first()
        .cloned()
        .ok_or(NormalizeError::MissingSignature)?;
    let meta = raw
        .meta
        .ok_or_else(|| NormalizeError::MissingMeta(signature.clone()))?;
    if message.account_keys.is_empty() {
        return Err(NormalizeError::MissingAccounts);
    }

    let already_resolved = message.account_keys.iter().any(|key| key.from_lookup_table());
    let mut accounts: Vec<&str> = message.account_keys.iter().map(|key| key.pubkey()).collect();
    if !already_resolved {
        if let Some(loaded) = meta.loaded_addresses.as_ref() {
            accounts.extend(loaded.writable.iter().map(String::as_str));
            accounts.extend(loaded.readonly.iter().map(String::as_str));
        }
    }

    let inner = meta
        .inner_instructions
        .iter()
        .flatten()
        .flat_map(|group| group.instructions.iter());
    let mut programs: Vec<String> = Vec::new();
    for instruction in message.instructions.iter().chain(inner) {
        if let Some(program) = resolve_program(instruction, &accounts) {
            if !programs.iter().any(|seen| seen == program) {
                programs.push(program.to_owned());
            }
        }
    }

    let delta = |index: usize| -> Option<i64> {
        let pre = *meta.pre_balances.get(index)?;
        let post = *meta.post_balances.get(index)?;
        Some(post as i64 - pre as i64)
    };

    let jito_tip = accounts
        .iter()
        .enumerate()
        .filter(|(_, key)| is_tip_account(key))
        .filter_map(|(index, _)| delta(index))
        .filter(|change| *change > 0)
        .map(|change| change as u64)
        .sum();
    let sol_movement = delta(0).unwrap_or(0) + meta.fee as i64;

    let error = meta.err.as_ref().filter(|err| !err.is_null()).map(TxError::decode);
    let category = TxCategory::classify(programs.as_slice());

    Ok(TransactionRecord {
        success: error.is_none(),
        fee: meta.fee,
        compute_units: meta.compute_units_consumed.unwrap_or(0),
        num_signatures: raw.transaction.signatures.len().max(1) as u64,
        fee_payer: accounts[0].to_owned(),
        jito_tip,
        sol_movement,
        error,
        category,
        programs,
        signature,
    })
}

/// Program id for one instruction, only ever taken from `accounts`.
fn resolve_program<'a>(instruction: &RawInstruction, accounts: &[&'a str]) -> Option<&'a str> {
    if let Some(index) = instruction.program_id_index {
        return accounts.get(index).copied();
    }
    let named = instruction.program_id.as_deref()?;
    accounts.iter().copied().find(|key| *key == named)
}
