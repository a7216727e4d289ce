// Numan Thabit 2025
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use serde_json::json;
use solana_telemetry_core::{BlockPipeline, ProviderClient, RpcMethod};
use tokio::{
    task::JoinHandle,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ObserverConfig,
    http::AppState,
    state::{NetworkSnapshot, ObserverState},
};

const PERFORMANCE_SAMPLES: u64 = 5;

pub struct Pollers {
    pub client: Arc<ProviderClient>,
    pub pipeline: Arc<BlockPipeline>,
    pub app: AppState,
}

pub fn spawn_pollers(config: &ObserverConfig, pollers: Pollers) -> Vec<JoinHandle<()>> {
    let Pollers {
        client,
        pipeline,
        app,
    } = pollers;
    let cancel = app.shutdown.clone();
    let mut handles = Vec::new();

    let slot_client = client.clone();
    let slot_state = app.observer.clone();
    handles.push(spawn_periodic(
        "slot",
        config.polling.slot_interval(),
        cancel.clone(),
        move || poll_slot(slot_client.clone(), slot_state.clone()),
    ));

    let block_state = app.observer.clone();
    handles.push(spawn_periodic(
        "blocks",
        config.polling.block_interval(),
        cancel.clone(),
        move || {
            let pipeline = pipeline.clone();
            let tip = block_state.latest_slot();
            async move {
                match tip {
                    Some(tip) => {
                        pipeline.run_cycle(tip).await;
                    }
                    None => tracing::debug!("no slot height yet; skipping block cycle"),
                }
            }
        },
    ));

    let prewarm = config.epochs.as_ref().map(|epochs| epochs.prewarm()).unwrap_or(0);
    let prewarmed = Arc::new(AtomicU64::new(u64::MAX));
    let network_app = app.clone();
    handles.push(spawn_periodic(
        "network",
        config.polling.network_interval(),
        cancel.clone(),
        move || {
            let client = client.clone();
            let app = network_app.clone();
            let prewarmed = prewarmed.clone();
            async move {
                let Some(epoch) = poll_network(&client, &app.observer).await else {
                    return;
                };
                let Some(service) = app.epochs.as_ref() else {
                    return;
                };
                if prewarm > 0 && prewarmed.swap(epoch, Ordering::Relaxed) != epoch {
                    tracing::info!(epoch, count = prewarm, "prewarming epoch cache");
                    let _ = service.cache.prewarm(epoch, prewarm);
                }
            }
        },
    ));

    let session = app.observer.session().clone();
    handles.push(spawn_periodic(
        "session-snapshot",
        config.session.snapshot_interval(),
        cancel.clone(),
        move || {
            session.lock().accumulator.maybe_snapshot(Utc::now());
            async {}
        },
    ));

    if let (Some(directory), Some(validators)) = (app.validators.clone(), &config.validators) {
        handles.push(spawn_periodic(
            "validators",
            validators.refresh_interval(),
            cancel.clone(),
            move || {
                let directory = directory.clone();
                async move {
                    // failures are logged by the directory and retried next tick
                    let _ = directory.refresh().await;
                }
            },
        ));
    }

    handles.push(
        app.updates
            .spawn_flusher(config.stream.flush_interval(), cancel),
    );
    handles
}

/// Run `tick` every `period` until cancelled. A tick still running when
/// its period elapses is dropped and the loop moves on to the next one.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                finished = timeout(period, tick()) => {
                    if finished.is_err() {
                        tracing::warn!(task = name, ?period, "poll tick overran its interval; abandoned");
                    }
                }
            }
        }
        tracing::debug!(task = name, "poll loop stopped");
    })
}

async fn poll_slot(client: Arc<ProviderClient>, state: ObserverState) {
    match client
        .call_method(RpcMethod::GetSlot, json!([{ "commitment": "confirmed" }]))
        .await
    {
        Ok(value) => match value.as_u64() {
            Some(slot) => {
                if state.observe_slot(slot) {
                    tracing::trace!(slot, "slot tip advanced");
                }
            }
            None => tracing::warn!(%value, "getSlot returned a non-integer result"),
        },
        Err(err) => tracing::warn!(error = %err, "slot poll failed"),
    }
}

/// Refresh the network snapshot; returns the current epoch on success.
async fn poll_network(client: &ProviderClient, state: &ObserverState) -> Option<u64> {
    let epoch_info = match client
        .call_method(RpcMethod::GetEpochInfo, json!([{ "commitment": "confirmed" }]))
        .await
    {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(error = %err, "epoch info poll failed");
            return None;
        }
    };
    let samples = match client
        .call_method(
            RpcMethod::GetRecentPerformanceSamples,
            json!([PERFORMANCE_SAMPLES]),
        )
        .await
    {
        Ok(samples) => samples,
        Err(err) => {
            tracing::debug!(error = %err, "performance samples unavailable");
            serde_json::Value::Null
        }
    };
    match NetworkSnapshot::from_rpc(&epoch_info, &samples, Utc::now()) {
        Some(snapshot) => {
            let epoch = snapshot.epoch;
            tracing::debug!(
                epoch,
                slot = snapshot.absolute_slot,
                tps = ?snapshot.recent_tps,
                "network snapshot updated"
            );
            state.set_network(snapshot);
            Some(epoch)
        }
        None => {
            tracing::warn!(%epoch_info, "epoch info missing required fields");
            None
        }
    }
}
