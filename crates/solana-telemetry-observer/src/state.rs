// Numan Thabit 2025
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use solana_telemetry_core::Session;

#[derive(Clone)]
pub struct ObserverState {
    latest_slot: Arc<AtomicU64>,
    network: Arc<RwLock<Option<NetworkSnapshot>>>,
    session: Arc<Mutex<Session>>,
}

impl ObserverState {
    pub fn new(session: Arc<Mutex<Session>>) -> Self {
        Self {
            latest_slot: Arc::new(AtomicU64::new(0)),
            network: Arc::new(RwLock::new(None)),
            session,
        }
    }

    /// Record a slot height; returns true when it moved the tip forward.
    pub fn observe_slot(&self, slot: u64) -> bool {
        self.latest_slot.fetch_max(slot, Ordering::Relaxed) < slot
    }

    pub fn latest_slot(&self) -> Option<u64> {
        match self.latest_slot.load(Ordering::Relaxed) {
            0 => None,
            slot => Some(slot),
        }
    }

    pub fn session(&self) -> &Arc<Mutex<Session>> {
        &self.session
    }

    pub fn set_network(&self, snapshot: NetworkSnapshot) {
        self.observe_slot(snapshot.absolute_slot);
        *self.network.write() = Some(snapshot);
    }

    pub fn network(&self) -> Option<NetworkSnapshot> {
        self.network.read().clone()
    }

    pub fn current_epoch(&self) -> Option<u64> {
        self.network.read().as_ref().map(|snapshot| snapshot.epoch)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub epoch: u64,
    pub slot_index: u64,
    pub slots_in_epoch: u64,
    pub absolute_slot: u64,
    pub block_height: u64,
    pub transaction_count: Option<u64>,
    pub epoch_progress: f64,
    pub recent_tps: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

impl NetworkSnapshot {
    /// Combine `getEpochInfo` with `getRecentPerformanceSamples`.
    ///
    /// Returns `None` when the epoch info lacks a required field. Missing or
    /// empty samples leave `recent_tps` unset.
    pub fn from_rpc(epoch_info: &Value, samples: &Value, observed_at: DateTime<Utc>) -> Option<Self> {
        let field = |name: &str| epoch_info.get(name).and_then(Value::as_u64);
        let slot_index = field("slotIndex")?;
        let slots_in_epoch = field("slotsInEpoch")?;
        let epoch_progress = if slots_in_epoch == 0 {
            0.0
        } else {
            slot_index as f64 / slots_in_epoch as f64 * 100.0
        };
        Some(Self {
            epoch: field("epoch")?,
            slot_index,
            slots_in_epoch,
            absolute_slot: field("absoluteSlot")?,
            block_height: field("blockHeight")?,
            transaction_count: field("transactionCount"),
            epoch_progress,
            recent_tps: recent_tps(samples),
            observed_at,
        })
    }
}

fn recent_tps(samples: &Value) -> Option<f64> {
    let (transactions, seconds) = samples
        .as_array()?
        .iter()
        .filter_map(|sample| {
            let transactions = sample.get("numTransactions")?.as_u64()?;
            let seconds = sample.get("samplePeriodSecs")?.as_u64()?;
            Some((transactions, seconds))
        })
        .fold((0u64, 0u64), |(tx, secs), (t, s)| {
            (tx.saturating_add(t), secs.saturating_add(s))
        });
    (seconds > 0).then(|| transactions as f64 / seconds as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use solana_telemetry_core::AccumulatorSettings;

    fn state() -> ObserverState {
        let session = Session::new(AccumulatorSettings::default(), 1_000);
        ObserverState::new(Arc::new(Mutex::new(session)))
    }

    #[test]
    fn slot_height_only_moves_forward() {
        let state = state();
        assert_eq!(state.latest_slot(), None);
        assert!(state.observe_slot(100));
        assert!(!state.observe_slot(90));
        assert!(!state.observe_slot(100));
        assert_eq!(state.latest_slot(), Some(100));
    }

    #[test]
    fn network_snapshot_from_rpc_results() {
        let info = json!({
            "absoluteSlot": 250_000_100u64,
            "blockHeight": 230_000_000u64,
            "epoch": 578,
            "slotIndex": 108_000,
            "slotsInEpoch": 432_000,
            "transactionCount": 300_000_000_000u64
        });
        let samples = json!([
            {"slot": 1, "numTransactions": 6000, "numSlots": 150, "samplePeriodSecs": 60},
            {"slot": 2, "numTransactions": 3000, "numSlots": 150, "samplePeriodSecs": 60}
        ]);
        let snapshot = NetworkSnapshot::from_rpc(&info, &samples, Utc::now()).expect("snapshot");
        assert_eq!(snapshot.epoch, 578);
        assert_eq!(snapshot.epoch_progress, 25.0);
        assert_eq!(snapshot.recent_tps, Some(75.0));

        let state = state();
        state.set_network(snapshot);
        assert_eq!(state.current_epoch(), Some(578));
        assert_eq!(state.latest_slot(), Some(250_000_100));
    }

    #[test]
    fn incomplete_epoch_info_is_rejected() {
        let info = json!({"epoch": 1, "slotIndex": 2});
        assert!(NetworkSnapshot::from_rpc(&info, &json!([]), Utc::now()).is_none());

        let info = json!({
            "absoluteSlot": 10, "blockHeight": 9, "epoch": 0,
            "slotIndex": 10, "slotsInEpoch": 32
        });
        let snapshot = NetworkSnapshot::from_rpc(&info, &json!(null), Utc::now()).expect("snapshot");
        assert!(snapshot.recent_tps.is_none());
        assert!(snapshot.transaction_count.is_none());
    }
}
