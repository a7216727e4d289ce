// Numan Thabit 2025
#![deny(missing_docs)]
//! solana-telemetry-core: chain-telemetry ingestion and aggregation engine for Solana.

/// Session-scoped failure accumulator and snapshot ring.
pub mod accumulator;
/// TTL cache for per-epoch aggregate statistics.
pub mod epoch_cache;
/// Persisted, retention-windowed per-block aggregates.
pub mod history;
/// Block fetch fan-out and ingestion pipeline.
pub mod ingest;
/// Prometheus instruments shared by every component.
pub mod metrics;
/// Raw block decoding into normalized records.
pub mod normalize;
/// Short-TTL price quotes served stale on error.
pub mod prices;
/// Dual-endpoint JSON-RPC client.
pub mod provider;
/// Fixed-cadence buffering of streamed updates.
pub mod stream;
/// Validator metadata directory.
pub mod validators;

pub use accumulator::{AccumulatorSettings, FailureAccumulator, FailureView, SeenSlots, Session};
pub use epoch_cache::{EpochBatch, EpochCache, EpochCacheSettings, EpochFetchError, EpochFetcher};
pub use history::{HistoricalAggregate, HistoricalStore, RollupBucket, StoreError};
pub use ingest::{fetch_block, BlockPipeline, CycleReport, PipelineSettings, TransactionUpdate};
pub use metrics::TelemetryMetrics;
pub use normalize::{normalize, NormalizeError, SlotBlock, TransactionRecord, TxError};
pub use prices::{PriceBoard, PriceCache, PriceError};
pub use provider::{EndpointRole, ProviderClient, ProviderEndpoint, ProviderError, RpcMethod};
pub use stream::UpdateBuffer;
pub use validators::{ValidatorDirectory, ValidatorInfo};
