// Numan Thabit 2025
//! Session-scoped failure counters with a bounded snapshot series.

mod ring;

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::Serialize;

use crate::normalize::{SlotBlock, UNKNOWN_ERROR_KIND};

pub use ring::SnapshotRing;

/// Cumulative totals captured at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateSnapshot {
    /// Capture time.
    pub time: DateTime<Utc>,
    /// Failed transactions since session start.
    pub failed: u64,
    /// Transactions since session start.
    pub total: u64,
}

/// Tunables for [`FailureAccumulator`].
#[derive(Debug, Clone, Copy)]
pub struct AccumulatorSettings {
    /// Snapshots kept.
    pub capacity: usize,
    /// Minimum spacing between snapshots.
    pub interval: Duration,
    /// Payers listed in a view.
    pub top_payers: usize,
}

impl Default for AccumulatorSettings {
    fn default() -> Self {
        Self {
            capacity: 120,
            interval: Duration::from_secs(1),
            top_payers: 10,
        }
    }
}

/// Failure rate of one program.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramFailureRate {
    /// Program id.
    pub program: String,
    /// Failed invocations.
    pub failures: u64,
    /// All invocations.
    pub total: u64,
    /// `failures / total * 100`.
    pub rate: f64,
}

/// Failure count of one fee payer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayerFailures {
    /// Fee payer address.
    pub payer: String,
    /// Failed transactions paid for.
    pub failures: u64,
}

/// Share of one error kind among all failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorShare {
    /// Decoded error kind.
    pub kind: String,
    /// Occurrences.
    pub count: u64,
    /// Percentage of all counted errors.
    pub percentage: f64,
}

/// Read-only view built on demand from the accumulator.
#[derive(Debug, Clone, Serialize)]
pub struct FailureView {
    /// Session start.
    pub session_start: DateTime<Utc>,
    /// Time of the most recent ingested block.
    pub last_block_at: Option<DateTime<Utc>>,
    /// Blocks ingested.
    pub total_blocks: u64,
    /// Transactions ingested.
    pub total_transactions: u64,
    /// Failed transactions ingested.
    pub total_failed: u64,
    /// Session-wide failure percentage.
    pub failure_rate: f64,
    /// Programs by failure rate, highest first.
    pub programs: Vec<ProgramFailureRate>,
    /// Payers with the most failures.
    pub top_payers: Vec<PayerFailures>,
    /// Error kinds, most frequent first.
    pub errors: Vec<ErrorShare>,
    /// Snapshot series, oldest first.
    pub snapshots: Vec<RateSnapshot>,
}

/// Counters accumulated over the lifetime of one session.
///
/// Ingest is additive and not idempotent: callers decide which blocks are new
/// (see [`SeenSlots`]).
#[derive(Debug)]
pub struct FailureAccumulator {
    settings: AccumulatorSettings,
    per_program_failures: HashMap<String, u64>,
    per_program_totals: HashMap<String, u64>,
    per_payer_failures: HashMap<String, u64>,
    error_type_counts: HashMap<String, u64>,
    snapshots: SnapshotRing<RateSnapshot>,
    last_snapshot_at: Option<DateTime<Utc>>,
    last_block_at: Option<DateTime<Utc>>,
    total_failed: u64,
    total_blocks: u64,
    total_transactions: u64,
    session_start: DateTime<Utc>,
}

impl FailureAccumulator {
    /// Start a session now.
    pub fn new(settings: AccumulatorSettings) -> Self {
        Self::started_at(settings, Utc::now())
    }

    /// Start a session at `session_start`.
    pub fn started_at(settings: AccumulatorSettings, session_start: DateTime<Utc>) -> Self {
        Self {
            snapshots: SnapshotRing::with_capacity(settings.capacity),
            settings,
            per_program_failures: HashMap::new(),
            per_program_totals: HashMap::new(),
            per_payer_failures: HashMap::new(),
            error_type_counts: HashMap::new(),
            last_snapshot_at: None,
            last_block_at: None,
            total_failed: 0,
            total_blocks: 0,
            total_transactions: 0,
            session_start,
        }
    }

    /// Fold one block into the counters.
    pub fn ingest(&mut self, block: &SlotBlock) {
        self.ingest_at(block, Utc::now());
    }

    /// Fold one block into the counters, stamping it with `now`.
    pub fn ingest_at(&mut self, block: &SlotBlock, now: DateTime<Utc>) {
        self.total_blocks += 1;
        self.last_block_at = Some(now);
        for tx in &block.transactions {
            self.total_transactions += 1;
            for program in &tx.programs {
                bump(&mut self.per_program_totals, program);
            }
            if tx.success {
                continue;
            }
            self.total_failed += 1;
            for program in &tx.programs {
                bump(&mut self.per_program_failures, program);
            }
            bump(&mut self.per_payer_failures, &tx.fee_payer);
            let kind = tx
                .error
                .as_ref()
                .map(|err| err.kind())
                .unwrap_or(UNKNOWN_ERROR_KIND);
            bump(&mut self.error_type_counts, kind);
        }
    }

    /// Record a snapshot unless one was taken less than the interval ago.
    pub fn maybe_snapshot(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.last_snapshot_at {
            let elapsed = now.signed_duration_since(last).to_std().unwrap_or_default();
            if elapsed < self.settings.interval {
                return false;
            }
        }
        self.snapshots.push(RateSnapshot {
            time: now,
            failed: self.total_failed,
            total: self.total_transactions,
        });
        self.last_snapshot_at = Some(now);
        true
    }

    /// Transactions ingested so far.
    pub fn total_transactions(&self) -> u64 {
        self.total_transactions
    }

    /// Failed transactions ingested so far.
    pub fn total_failed(&self) -> u64 {
        self.total_failed
    }

    /// Blocks ingested so far.
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Failures counted against `kind`.
    pub fn error_count(&self, kind: &str) -> u64 {
        self.error_type_counts.get(kind).copied().unwrap_or(0)
    }

    /// Build the read view.
    pub fn view(&self) -> FailureView {
        let mut programs: Vec<ProgramFailureRate> = self
            .per_program_totals
            .iter()
            .map(|(program, &total)| {
                let failures = self.per_program_failures.get(program).copied().unwrap_or(0);
                ProgramFailureRate {
                    program: program.clone(),
                    failures,
                    total,
                    rate: percentage(failures, total),
                }
            })
            .collect();
        programs.sort_by(|a, b| {
            b.rate
                .total_cmp(&a.rate)
                .then_with(|| b.total.cmp(&a.total))
                .then_with(|| a.program.cmp(&b.program))
        });

        let mut top_payers: Vec<PayerFailures> = self
            .per_payer_failures
            .iter()
            .map(|(payer, &failures)| PayerFailures {
                payer: payer.clone(),
                failures,
            })
            .collect();
        top_payers.sort_by(|a, b| by_count_then_name(a.failures, b.failures, &a.payer, &b.payer));
        top_payers.truncate(self.settings.top_payers);

        let counted: u64 = self.error_type_counts.values().sum();
        let mut errors: Vec<ErrorShare> = self
            .error_type_counts
            .iter()
            .map(|(kind, &count)| ErrorShare {
                kind: kind.clone(),
                count,
                percentage: percentage(count, counted),
            })
            .collect();
        errors.sort_by(|a, b| by_count_then_name(a.count, b.count, &a.kind, &b.kind));

        FailureView {
            session_start: self.session_start,
            last_block_at: self.last_block_at,
            total_blocks: self.total_blocks,
            total_transactions: self.total_transactions,
            total_failed: self.total_failed,
            failure_rate: percentage(self.total_failed, self.total_transactions),
            programs,
            top_payers,
            errors,
            snapshots: self.snapshots.iter().copied().collect(),
        }
    }
}

fn bump(map: &mut HashMap<String, u64>, key: &str) {
    if let Some(count) = map.get_mut(key) {
        *count += 1;
    } else {
        map.insert(key.to_owned(), 1);
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn by_count_then_name(a: u64, b: u64, a_name: &str, b_name: &str) -> Ordering {
    b.cmp(&a).then_with(|| a_name.cmp(b_name))
}

/// Bounded record of slots already folded into a session.
///
/// Slots further than `horizon` below the highest slot are pruned and reported
/// as seen.
#[derive(Debug, Clone)]
pub struct SeenSlots {
    slots: BTreeSet<u64>,
    horizon: u64,
}

impl SeenSlots {
    /// Track slots within `horizon` of the highest one.
    pub fn new(horizon: u64) -> Self {
        Self {
            slots: BTreeSet::new(),
            horizon,
        }
    }

    fn floor(&self) -> u64 {
        self.slots
            .last()
            .map(|max| max.saturating_sub(self.horizon))
            .unwrap_or(0)
    }

    /// True when `slot` was already recorded or fell behind the horizon.
    pub fn contains(&self, slot: u64) -> bool {
        slot < self.floor() || self.slots.contains(&slot)
    }

    /// Record `slot`; returns false if it was already seen.
    pub fn insert(&mut self, slot: u64) -> bool {
        if self.contains(slot) || !self.slots.insert(slot) {
            return false;
        }
        let floor = self.floor();
        self.slots = self.slots.split_off(&floor);
        true
    }

    /// Number of tracked slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Accumulator plus the slot ledger guarding it against double counting.
#[derive(Debug)]
pub struct Session {
    /// Counters.
    pub accumulator: FailureAccumulator,
    /// Slots already ingested.
    pub seen: SeenSlots,
}

impl Session {
    /// Start a session.
    pub fn new(settings: AccumulatorSettings, horizon: u64) -> Self {
        Self {
            accumulator: FailureAccumulator::new(settings),
            seen: SeenSlots::new(horizon),
        }
    }

    /// Ingest `block` unless its slot was already counted.
    pub fn ingest_new(&mut self, block: &SlotBlock, now: DateTime<Utc>) -> bool {
        if !self.seen.insert(block.slot) {
            return false;
        }
        self.accumulator.ingest_at(block, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{TransactionRecord, TxCategory, TxError};
    use chrono::TimeZone;

    fn tx(payer: &str, programs: &[&str], error: Option<TxError>) -> TransactionRecord {
        TransactionRecord {
            signature: format!("sig-{payer}"),
            success: error.is_none(),
            fee: 5_000,
            compute_units: 100,
            programs: programs.iter().map(|p| p.to_string()).collect(),
            num_signatures: 1,
            fee_payer: payer.to_string(),
            jito_tip: 0,
            sol_movement: 0,
            error,
            category: TxCategory::Other,
        }
    }

    fn block(slot: u64, transactions: Vec<TransactionRecord>) -> SlotBlock {
        SlotBlock {
            slot,
            block_time: None,
            total_fees: transactions.iter().map(|t| t.fee).sum(),
            total_compute_units: 0,
            transactions,
            dropped_transactions: 0,
        }
    }

    fn custom() -> Option<TxError> {
        Some(TxError::Instruction {
            index: 1,
            kind: "Custom".into(),
        })
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid time")
    }

    #[test]
    fn custom_instruction_error_scenario() {
        let failed = TxError::decode(&serde_json::json!({"InstructionError": [1, {"Custom": 42}]}));
        let mut acc = FailureAccumulator::started_at(AccumulatorSettings::default(), at(0));
        acc.ingest_at(
            &block(
                1,
                vec![
                    tx("alice", &["Transfer", "Memo"], None),
                    tx("bob", &["Swap"], None),
                    tx("carol", &["Lend", "Oracle"], Some(failed)),
                ],
            ),
            at(1),
        );

        let view = acc.view();
        assert_eq!(view.total_transactions, 3);
        assert_eq!(view.total_failed, 1);
        assert_eq!(acc.error_count("Custom"), 1);
        assert_eq!(view.errors.len(), 1);
        assert_eq!(view.errors[0].kind, "Custom");
        assert_eq!(view.errors[0].percentage, 100.0);
        assert_eq!(view.top_payers, vec![PayerFailures { payer: "carol".into(), failures: 1 }]);

        let failures: HashMap<&str, u64> = view
            .programs
            .iter()
            .map(|p| (p.program.as_str(), p.failures))
            .collect();
        assert_eq!(failures.len(), 5);
        assert_eq!(failures["Lend"], 1);
        assert_eq!(failures["Oracle"], 1);
        for program in ["Transfer", "Memo", "Swap"] {
            assert_eq!(failures[program], 0, "{program}");
        }
    }

    #[test]
    fn totals_do_not_depend_on_ingest_order() {
        let blocks = vec![
            block(1, vec![tx("a", &["P"], None), tx("b", &["P", "Q"], custom())]),
            block(2, vec![tx("a", &["Q"], Some(TxError::Unknown))]),
            block(3, vec![]),
        ];
        let mut forward = FailureAccumulator::started_at(AccumulatorSettings::default(), at(0));
        let mut backward = FailureAccumulator::started_at(AccumulatorSettings::default(), at(0));
        for b in &blocks {
            forward.ingest_at(b, at(1));
        }
        for b in blocks.iter().rev() {
            backward.ingest_at(b, at(1));
        }
        let (f, b) = (forward.view(), backward.view());
        assert_eq!(f.total_transactions, 3);
        assert_eq!(f.total_failed, 2);
        assert_eq!(f.total_blocks, 3);
        assert_eq!(f.programs, b.programs);
        assert_eq!(f.top_payers, b.top_payers);
        assert_eq!(f.errors, b.errors);
        assert_eq!(forward.error_count(UNKNOWN_ERROR_KIND), 1);
    }

    #[test]
    fn programs_sort_by_rate_then_volume() {
        let mut acc = FailureAccumulator::started_at(AccumulatorSettings::default(), at(0));
        acc.ingest_at(
            &block(
                1,
                vec![
                    tx("x", &["Hot", "Busy"], custom()),
                    tx("y", &["Busy"], None),
                    tx("y", &["Calm"], None),
                    tx("z", &["Busy"], None),
                ],
            ),
            at(1),
        );
        let order: Vec<_> = acc.view().programs.into_iter().map(|p| p.program).collect();
        assert_eq!(order, vec!["Hot", "Busy", "Calm"]);
    }

    #[test]
    fn snapshots_respect_interval_and_capacity() {
        let settings = AccumulatorSettings {
            capacity: 3,
            interval: Duration::from_secs(1),
            top_payers: 5,
        };
        let mut acc = FailureAccumulator::started_at(settings, at(0));
        assert!(acc.maybe_snapshot(at(0)));
        assert!(!acc.maybe_snapshot(at(0)));
        for secs in 1..=5 {
            acc.ingest_at(&block(secs as u64, vec![tx("p", &["P"], None)]), at(secs));
            assert!(acc.maybe_snapshot(at(secs)));
        }
        let snapshots = acc.view().snapshots;
        assert_eq!(snapshots.len(), 3);
        let totals: Vec<_> = snapshots.iter().map(|s| s.total).collect();
        assert_eq!(totals, vec![3, 4, 5]);
        assert_eq!(snapshots[2].time, at(5));
    }

    #[test]
    fn top_payers_are_truncated() {
        let settings = AccumulatorSettings {
            top_payers: 2,
            ..AccumulatorSettings::default()
        };
        let mut acc = FailureAccumulator::started_at(settings, at(0));
        let txs = vec![
            tx("a", &[], custom()),
            tx("b", &[], custom()),
            tx("b", &[], custom()),
            tx("c", &[], custom()),
        ];
        acc.ingest_at(&block(1, txs), at(1));
        let payers: Vec<_> = acc.view().top_payers.into_iter().map(|p| p.payer).collect();
        assert_eq!(payers, vec!["b", "a"]);
    }

    #[test]
    fn seen_slots_reject_duplicates_and_stale_slots() {
        let mut seen = SeenSlots::new(10);
        assert!(seen.insert(100));
        assert!(!seen.insert(100));
        assert!(seen.insert(95));
        assert!(seen.insert(120));
        // 95 and 100 fall below 120 - 10
        assert_eq!(seen.len(), 1);
        assert!(seen.contains(100));
        assert!(!seen.insert(105));
        assert!(seen.insert(115));
    }

    #[test]
    fn session_counts_each_slot_once() {
        let mut session = Session::new(AccumulatorSettings::default(), 64);
        let b = block(7, vec![tx("p", &["P"], custom())]);
        assert!(session.ingest_new(&b, at(1)));
        assert!(!session.ingest_new(&b, at(2)));
        assert_eq!(session.accumulator.total_transactions(), 1);
    }
}
