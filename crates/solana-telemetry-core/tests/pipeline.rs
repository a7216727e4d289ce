// Numan Thabit 2025
mod common;

use std::sync::Arc;

use anyhow::Result;
use axum::http::StatusCode;
use parking_lot::Mutex;
use serde_json::Value;
use solana_telemetry_core::history::DEFAULT_RETENTION;
use solana_telemetry_core::{
    AccumulatorSettings, BlockPipeline, CycleReport, HistoricalStore, PipelineSettings, Session,
    TelemetryMetrics, UpdateBuffer,
};

use common::{block_payload, client, requested_slot, result, rpc_error, spawn_upstream};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cycle_ingests_new_blocks_once_and_tolerates_bad_slots() -> Result<()> {
    let upstream = spawn_upstream(|req| match requested_slot(req) {
        101 => rpc_error(req, -32007, "Slot 101 was skipped"),
        103 => (StatusCode::INTERNAL_SERVER_ERROR, Value::Null),
        slot => result(req, block_payload(slot)),
    })
    .await?;
    let metrics = TelemetryMetrics::new();
    let client = Arc::new(client(&upstream, None, metrics.clone())?);
    let session = Arc::new(Mutex::new(Session::new(AccumulatorSettings::default(), 1_000)));
    let store = Arc::new(HistoricalStore::open_in_memory(DEFAULT_RETENTION)?);
    let updates = UpdateBuffer::new(64, 8, metrics.clone());
    let mut batches = updates.subscribe();

    let pipeline = BlockPipeline::new(
        client,
        session.clone(),
        Some(store.clone()),
        updates.clone(),
        metrics.clone(),
        PipelineSettings {
            fan_out: 4,
            concurrency: 2,
        },
    );

    let report = pipeline.run_cycle(103).await;
    assert_eq!(
        report,
        CycleReport {
            fetched: 2,
            skipped: 1,
            failed: 1,
            already_seen: 0,
        }
    );
    {
        let session = session.lock();
        let view = session.accumulator.view();
        assert_eq!(view.total_blocks, 2);
        assert_eq!(view.total_transactions, 4);
        assert_eq!(view.total_failed, 2);
        assert_eq!(session.accumulator.error_count("Custom"), 2);
    }
    assert_eq!(store.len()?, 2);

    assert_eq!(updates.flush(), 4);
    let batch = batches.recv().await?;
    assert_eq!(batch.len(), 4);
    assert!(batch.iter().any(|u| u.error_kind.as_deref() == Some("Custom")));

    let again = pipeline.run_cycle(103).await;
    assert_eq!(again.already_seen, 3);
    assert_eq!(again.failed, 1);
    assert_eq!(again.fetched, 0);
    assert_eq!(session.lock().accumulator.total_transactions(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refetch_overwrites_history_without_recounting() -> Result<()> {
    let upstream = spawn_upstream(|req| result(req, block_payload(requested_slot(req)))).await?;
    let metrics = TelemetryMetrics::new();
    let client = Arc::new(client(&upstream, None, metrics.clone())?);
    let session = Arc::new(Mutex::new(Session::new(AccumulatorSettings::default(), 1_000)));
    let store = Arc::new(HistoricalStore::open_in_memory(DEFAULT_RETENTION)?);
    let pipeline = BlockPipeline::new(
        client,
        session.clone(),
        Some(store.clone()),
        UpdateBuffer::new(64, 8, metrics.clone()),
        metrics,
        PipelineSettings {
            fan_out: 1,
            concurrency: 1,
        },
    );

    assert_eq!(pipeline.run_cycle(500).await.fetched, 1);
    let refreshed = pipeline.refetch(500).await?.expect("block present");
    assert_eq!(refreshed.tx_count, 2);
    assert_eq!(refreshed.timestamp, (1_700_000_000 + 500) * 1_000);
    assert_eq!(store.len()?, 1);
    assert_eq!(session.lock().accumulator.total_blocks(), 1);
    Ok(())
}
