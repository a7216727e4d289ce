// Numan Thabit 2025
//! Block fetch fan-out feeding the session, the history store and the stream.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::accumulator::Session;
use crate::history::{HistoricalAggregate, HistoricalStore};
use crate::metrics::TelemetryMetrics;
use crate::normalize::{normalize, NormalizeError, SlotBlock, TransactionRecord, TxCategory};
use crate::provider::{ProviderClient, ProviderError, RpcMethod};
use crate::stream::UpdateBuffer;

/// JSON-RPC codes meaning the slot was skipped or its block is unavailable.
pub const SKIPPED_SLOT_CODES: [i64; 3] = [-32004, -32007, -32009];

/// Failure to obtain one block.
#[derive(Debug, Error)]
pub enum BlockFetchError {
    /// No upstream answered, or it answered with a non-skip error.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// The block payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] NormalizeError),
}

/// Fetch and normalize `slot`. Skipped slots yield `None`.
pub async fn fetch_block(
    client: &ProviderClient,
    slot: u64,
) -> Result<Option<SlotBlock>, BlockFetchError> {
    let params = json!([
        slot,
        {
            "encoding": "json",
            "maxSupportedTransactionVersion": 0,
            "transactionDetails": "full",
            "rewards": false,
            "commitment": "confirmed",
        }
    ]);
    match client.call_method(RpcMethod::GetBlock, params).await {
        Ok(raw) => Ok(normalize(&raw, slot)?),
        Err(err)
            if err
                .rpc_code()
                .is_some_and(|code| SKIPPED_SLOT_CODES.contains(&code)) =>
        {
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Per-transaction update pushed to stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionUpdate {
    /// Slot of the containing block.
    pub slot: u64,
    /// Transaction signature.
    pub signature: String,
    /// Whether it succeeded.
    pub success: bool,
    /// Fee, lamports.
    pub fee: u64,
    /// Compute units consumed.
    pub compute_units: u64,
    /// Tip paid, lamports.
    pub jito_tip: u64,
    /// Category.
    pub category: TxCategory,
    /// Decoded error kind for failures.
    pub error_kind: Option<String>,
}

impl TransactionUpdate {
    fn from_record(slot: u64, record: &TransactionRecord) -> Self {
        Self {
            slot,
            signature: record.signature.clone(),
            success: record.success,
            fee: record.fee,
            compute_units: record.compute_units,
            jito_tip: record.jito_tip,
            category: record.category,
            error_kind: record.error.as_ref().map(|err| err.kind().to_owned()),
        }
    }
}

/// Fan-out tunables.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Slots behind (and including) the tip examined per cycle.
    pub fan_out: u64,
    /// Concurrent block fetches.
    pub concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fan_out: 8,
            concurrency: 4,
        }
    }
}

/// Outcome counts of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Blocks fetched and ingested.
    pub fetched: usize,
    /// Slots with no block.
    pub skipped: usize,
    /// Slots whose fetch failed.
    pub failed: usize,
    /// Slots not fetched because they were already ingested.
    pub already_seen: usize,
}

/// Everything a block flows into after it is fetched.
pub struct BlockPipeline {
    client: Arc<ProviderClient>,
    session: Arc<Mutex<Session>>,
    store: Option<Arc<HistoricalStore>>,
    updates: UpdateBuffer<TransactionUpdate>,
    metrics: TelemetryMetrics,
    settings: PipelineSettings,
}

impl BlockPipeline {
    /// Wire a pipeline. Without a store nothing is persisted.
    pub fn new(
        client: Arc<ProviderClient>,
        session: Arc<Mutex<Session>>,
        store: Option<Arc<HistoricalStore>>,
        updates: UpdateBuffer<TransactionUpdate>,
        metrics: TelemetryMetrics,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            client,
            session,
            store,
            updates,
            metrics,
            settings,
        }
    }

    /// Shared session the pipeline ingests into.
    pub fn session(&self) -> &Arc<Mutex<Session>> {
        &self.session
    }

    /// Fetch the newest `fan_out` slots up to `tip` and absorb new blocks.
    pub async fn run_cycle(&self, tip: u64) -> CycleReport {
        let first = tip.saturating_sub(self.settings.fan_out.saturating_sub(1));
        let mut report = CycleReport::default();
        let pending: Vec<u64> = {
            let session = self.session.lock();
            (first..=tip)
                .filter(|slot| !session.seen.contains(*slot))
                .collect()
        };
        report.already_seen = (tip - first + 1) as usize - pending.len();

        let mut results: Vec<_> = stream::iter(pending)
            .map(|slot| async move { (slot, fetch_block(&self.client, slot).await) })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(slot, _)| *slot);

        for (slot, result) in results {
            match result {
                Ok(Some(block)) => {
                    if self.absorb(block).await {
                        report.fetched += 1;
                    } else {
                        report.already_seen += 1;
                    }
                }
                Ok(None) => {
                    self.session.lock().seen.insert(slot);
                    self.metrics.inc_slots_skipped();
                    report.skipped += 1;
                }
                Err(err) => {
                    if matches!(err, BlockFetchError::Decode(_)) {
                        self.metrics.add_decode_failures("block", 1);
                    }
                    self.metrics.inc_slot_fetch_failure();
                    warn!(slot, error = %err, "block fetch failed; dropping slot");
                    report.failed += 1;
                }
            }
        }
        debug!(tip, ?report, "block cycle finished");
        report
    }

    /// Re-fetch `slot` and overwrite its stored aggregate without touching
    /// session counters.
    pub async fn refetch(&self, slot: u64) -> Result<Option<HistoricalAggregate>, BlockFetchError> {
        let Some(block) = fetch_block(&self.client, slot).await? else {
            return Ok(None);
        };
        let aggregate = HistoricalAggregate::from_block(&block, Utc::now().timestamp_millis());
        self.persist(aggregate.clone()).await;
        Ok(Some(aggregate))
    }

    async fn absorb(&self, block: SlotBlock) -> bool {
        self.metrics
            .add_decode_failures("transaction", block.dropped_transactions);
        let now = Utc::now();
        let fresh = self.session.lock().ingest_new(&block, now);
        if !fresh {
            return false;
        }
        self.metrics.inc_blocks_ingested();
        for record in &block.transactions {
            self.updates
                .push(TransactionUpdate::from_record(block.slot, record));
        }
        self.persist(HistoricalAggregate::from_block(&block, now.timestamp_millis()))
            .await;
        true
    }

    async fn persist(&self, aggregate: HistoricalAggregate) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let slot = aggregate.slot;
        let written = tokio::task::spawn_blocking(move || store.put(&aggregate)).await;
        match written {
            Ok(Ok(outcome)) => self.metrics.record_history_write(outcome.evicted),
            Ok(Err(err)) => warn!(slot, error = %err, "failed to persist block aggregate"),
            Err(err) => warn!(slot, error = %err, "history write task failed"),
        }
    }
}
