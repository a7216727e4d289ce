// Numan Thabit 2025
//! TTL cache for per-epoch aggregates with single-flight fetches.
//!
//! Entries expire `ttl` after they were fetched. At capacity the entry fetched
//! longest ago is evicted; reads do not refresh recency. Upstream fetches are
//! bounded by one limit shared across all callers, and concurrent misses on
//! the same epoch share one upstream request.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as InFlightEntry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::TelemetryMetrics;

/// Keys that mark a per-participant row rather than the network aggregate.
const PARTICIPANT_KEYS: [&str; 4] = ["identity", "vote_identity", "vote_account", "validator"];

/// Upstream failure for one epoch. Cloneable so a shared fetch can hand it to
/// every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EpochFetchError {
    /// The request never produced a response.
    #[error("epoch {epoch}: request failed: {message}")]
    Transport {
        /// Requested epoch.
        epoch: u64,
        /// Transport error text.
        message: String,
    },
    /// The service answered with a non-success status.
    #[error("epoch {epoch}: upstream status {status}")]
    Status {
        /// Requested epoch.
        epoch: u64,
        /// HTTP status code.
        status: u16,
    },
    /// The body was not usable JSON.
    #[error("epoch {epoch}: undecodable body: {message}")]
    Decode {
        /// Requested epoch.
        epoch: u64,
        /// Decoder error text.
        message: String,
    },
    /// Only per-participant rows came back.
    #[error("epoch {0}: no network-wide row in response")]
    MissingNetworkRow(u64),
}

/// Source of epoch aggregates.
#[async_trait]
pub trait EpochFetcher: Send + Sync + 'static {
    /// Fetch the network-wide aggregate for `epoch`.
    async fn fetch_epoch(&self, epoch: u64) -> Result<Value, EpochFetchError>;
}

/// Cache tunables.
#[derive(Debug, Clone, Copy)]
pub struct EpochCacheSettings {
    /// Lifetime of an entry after its fetch.
    pub ttl: Duration,
    /// Maximum cached epochs.
    pub capacity: usize,
    /// Maximum concurrent upstream fetches across every caller.
    pub concurrency: usize,
}

impl Default for EpochCacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            capacity: 60,
            concurrency: 10,
        }
    }
}

/// Result of a batch lookup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EpochBatch {
    /// Payload per epoch that resolved; failed epochs are absent.
    pub data: BTreeMap<u64, Value>,
    /// Epochs served from cache.
    pub hits: usize,
    /// Epochs that needed an upstream fetch.
    pub misses: usize,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, EpochFetchError>>>;

struct Entry {
    data: Value,
    fetched_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<u64, Entry>,
    /// Fetch sequence to epoch, oldest first.
    recency: BTreeMap<u64, u64>,
    next_seq: u64,
}

impl CacheState {
    fn fresh(&mut self, epoch: u64, now: Instant, ttl: Duration) -> Option<Value> {
        let entry = self.entries.get(&epoch)?;
        if now.saturating_duration_since(entry.fetched_at) < ttl {
            return Some(entry.data.clone());
        }
        self.remove(epoch);
        None
    }

    fn remove(&mut self, epoch: u64) {
        if let Some(entry) = self.entries.remove(&epoch) {
            self.recency.remove(&entry.seq);
        }
    }

    fn insert(&mut self, epoch: u64, data: Value, now: Instant, capacity: usize) {
        self.remove(epoch);
        while self.entries.len() >= capacity.max(1) {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            debug!(epoch = oldest, "evicted epoch aggregate");
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.recency.insert(seq, epoch);
        self.entries.insert(
            epoch,
            Entry {
                data,
                fetched_at: now,
                seq,
            },
        );
    }
}

struct Inner {
    settings: EpochCacheSettings,
    fetcher: Arc<dyn EpochFetcher>,
    state: Mutex<CacheState>,
    in_flight: DashMap<u64, SharedFetch>,
    permits: Semaphore,
    metrics: TelemetryMetrics,
}

/// Cloneable handle to the shared epoch cache.
#[derive(Clone)]
pub struct EpochCache {
    inner: Arc<Inner>,
}

impl EpochCache {
    /// Build an empty cache over `fetcher`.
    pub fn new(
        settings: EpochCacheSettings,
        fetcher: Arc<dyn EpochFetcher>,
        metrics: TelemetryMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                fetcher,
                state: Mutex::new(CacheState::default()),
                in_flight: DashMap::new(),
                permits: Semaphore::new(settings.concurrency.max(1)),
                metrics,
            }),
        }
    }

    /// Resolve every epoch in `epochs`, fetching misses concurrently.
    pub async fn get(&self, epochs: &BTreeSet<u64>) -> EpochBatch {
        let mut batch = EpochBatch::default();
        let mut missing = Vec::new();
        {
            let now = Instant::now();
            let mut state = self.inner.state.lock();
            for &epoch in epochs {
                match state.fresh(epoch, now, self.inner.settings.ttl) {
                    Some(data) => {
                        batch.data.insert(epoch, data);
                    }
                    None => missing.push(epoch),
                }
            }
        }
        batch.hits = batch.data.len();
        batch.misses = missing.len();
        self.inner
            .metrics
            .record_epoch_lookups(batch.hits as u64, batch.misses as u64);

        let results: Vec<_> = stream::iter(missing)
            .map(|epoch| {
                let cache = self.clone();
                async move { (epoch, cache.fetch_shared(epoch).await) }
            })
            .buffer_unordered(self.inner.settings.concurrency.max(1))
            .collect()
            .await;

        for (epoch, result) in results {
            match result {
                Ok(data) => {
                    batch.data.insert(epoch, data);
                }
                Err(err) => warn!(epoch, error = %err, "epoch aggregate unavailable"),
            }
        }
        batch
    }

    /// Resolve one epoch, surfacing the fetch error.
    pub async fn get_one(&self, epoch: u64) -> Result<Value, EpochFetchError> {
        let cached = self
            .inner
            .state
            .lock()
            .fresh(epoch, Instant::now(), self.inner.settings.ttl);
        if let Some(data) = cached {
            self.inner.metrics.record_epoch_lookups(1, 0);
            return Ok(data);
        }
        self.inner.metrics.record_epoch_lookups(0, 1);
        self.fetch_shared(epoch).await
    }

    /// Warm the `count` epochs preceding `current_epoch` in the background.
    pub fn prewarm(&self, current_epoch: u64, count: u64) -> JoinHandle<()> {
        let cache = self.clone();
        let epochs: BTreeSet<u64> = (current_epoch.saturating_sub(count)..current_epoch).collect();
        tokio::spawn(async move {
            if epochs.is_empty() {
                return;
            }
            let requested = epochs.len();
            let batch = cache.get(&epochs).await;
            info!(
                requested,
                loaded = batch.data.len(),
                hits = batch.hits,
                "epoch cache prewarm finished"
            );
        })
    }

    /// Number of cached epochs, expired ones included until next touched.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fetch_shared(&self, epoch: u64) -> SharedFetch {
        match self.inner.in_flight.entry(epoch) {
            InFlightEntry::Occupied(existing) => existing.get().clone(),
            InFlightEntry::Vacant(slot) => {
                let inner = Arc::clone(&self.inner);
                let fetch = async move {
                    // the semaphore is never closed
                    let permit = inner.permits.acquire().await.ok();
                    let result = inner.fetcher.fetch_epoch(epoch).await;
                    drop(permit);
                    match &result {
                        Ok(data) => {
                            let capacity = inner.settings.capacity;
                            inner
                                .state
                                .lock()
                                .insert(epoch, data.clone(), Instant::now(), capacity);
                        }
                        Err(_) => inner.metrics.inc_epoch_fetch_failure(),
                    }
                    inner.in_flight.remove(&epoch);
                    result
                }
                .boxed()
                .shared();
                slot.insert(fetch.clone());
                fetch
            }
        }
    }
}

/// HTTP source that substitutes `{epoch}` into a URL template.
pub struct HttpEpochSource {
    client: reqwest::Client,
    url_template: String,
}

impl HttpEpochSource {
    /// Build a source with its own client bounded by `timeout`.
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }

    fn url_for(&self, epoch: u64) -> String {
        self.url_template.replace("{epoch}", &epoch.to_string())
    }
}

#[async_trait]
impl EpochFetcher for HttpEpochSource {
    async fn fetch_epoch(&self, epoch: u64) -> Result<Value, EpochFetchError> {
        let response = self
            .client
            .get(self.url_for(epoch))
            .send()
            .await
            .map_err(|err| EpochFetchError::Transport {
                epoch,
                message: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(EpochFetchError::Status {
                epoch,
                status: status.as_u16(),
            });
        }
        let body: Value = response.json().await.map_err(|err| EpochFetchError::Decode {
            epoch,
            message: err.to_string(),
        })?;
        network_row(body, epoch)
    }
}

/// Reduce a response to its network-wide row.
pub fn network_row(body: Value, epoch: u64) -> Result<Value, EpochFetchError> {
    match body {
        Value::Array(rows) => rows
            .into_iter()
            .find(|row| {
                row.as_object()
                    .is_some_and(|map| PARTICIPANT_KEYS.iter().all(|key| !map.contains_key(*key)))
            })
            .ok_or(EpochFetchError::MissingNetworkRow(epoch)),
        Value::Object(_) => Ok(body),
        other => Err(EpochFetchError::Decode {
            epoch,
            message: format!("unexpected payload type: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSource {
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        fail_once: Mutex<HashSet<u64>>,
        delay: Duration,
    }

    impl FakeSource {
        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EpochFetcher for FakeSource {
        async fn fetch_epoch(&self, epoch: u64) -> Result<Value, EpochFetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail_once.lock().remove(&epoch) {
                return Err(EpochFetchError::Status { epoch, status: 502 });
            }
            Ok(json!({"epoch": epoch, "skip_rate": 0.01}))
        }
    }

    fn cache(source: Arc<FakeSource>, settings: EpochCacheSettings) -> EpochCache {
        EpochCache::new(settings, source, TelemetryMetrics::new())
    }

    fn set(epochs: &[u64]) -> BTreeSet<u64> {
        epochs.iter().copied().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entries_are_served_until_ttl_expires() {
        let source = Arc::new(FakeSource::default());
        let cache = cache(source.clone(), EpochCacheSettings::default());

        let first = cache.get(&set(&[500])).await;
        assert_eq!((first.hits, first.misses), (0, 1));
        let second = cache.get(&set(&[500])).await;
        assert_eq!((second.hits, second.misses), (1, 0));
        assert_eq!(second.data[&500]["epoch"], 500);
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(60 * 60 + 1)).await;
        let third = cache.get(&set(&[500])).await;
        assert_eq!(third.misses, 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_absent_and_retried() {
        let source = Arc::new(FakeSource::default());
        source.fail_once.lock().insert(7);
        let cache = cache(source.clone(), EpochCacheSettings::default());

        let batch = cache.get(&set(&[6, 7])).await;
        assert!(batch.data.contains_key(&6));
        assert!(!batch.data.contains_key(&7));
        assert_eq!(cache.len(), 1);

        let retry = cache.get(&set(&[7])).await;
        assert!(retry.data.contains_key(&7));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn least_recently_fetched_entry_is_evicted() {
        let source = Arc::new(FakeSource::default());
        let settings = EpochCacheSettings {
            capacity: 2,
            ..EpochCacheSettings::default()
        };
        let cache = cache(source.clone(), settings);

        cache.get(&set(&[1])).await;
        cache.get(&set(&[2])).await;
        // reading 1 does not refresh its recency
        assert_eq!(cache.get(&set(&[1])).await.hits, 1);
        cache.get(&set(&[3])).await;
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.get(&set(&[2, 3])).await.hits, 2);
        assert_eq!(cache.get(&set(&[1])).await.misses, 1);
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn misses_are_fetched_with_bounded_concurrency() {
        let source = Arc::new(FakeSource::slow(Duration::from_millis(20)));
        let settings = EpochCacheSettings {
            concurrency: 3,
            capacity: 100,
            ..EpochCacheSettings::default()
        };
        let cache = cache(source.clone(), settings);

        let batch = cache.get(&(0..12).collect()).await;
        assert_eq!(batch.data.len(), 12);
        assert_eq!(source.calls(), 12);
        assert!(source.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_limit_is_shared_across_callers() {
        let source = Arc::new(FakeSource::slow(Duration::from_millis(20)));
        let settings = EpochCacheSettings {
            concurrency: 2,
            capacity: 100,
            ..EpochCacheSettings::default()
        };
        let cache = cache(source.clone(), settings);

        let first: BTreeSet<u64> = (0..6).collect();
        let second: BTreeSet<u64> = (10..16).collect();
        let (a, b, c, prewarm) = tokio::join!(
            cache.get(&first),
            cache.get(&second),
            cache.get_one(20),
            cache.prewarm(40, 6)
        );
        assert_eq!(a.data.len(), 6);
        assert_eq!(b.data.len(), 6);
        assert!(c.is_ok());
        prewarm.expect("prewarm task");
        assert_eq!(source.calls(), 19);
        assert!(source.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_fetch() {
        let source = Arc::new(FakeSource::slow(Duration::from_millis(50)));
        let cache = cache(source.clone(), EpochCacheSettings::default());

        let first = set(&[42]);
        let second = set(&[42]);
        let (a, b, c) = tokio::join!(
            cache.get(&first),
            cache.get(&second),
            cache.get_one(42)
        );
        assert!(a.data.contains_key(&42));
        assert!(b.data.contains_key(&42));
        assert!(c.is_ok());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn prewarm_loads_preceding_epochs() {
        let source = Arc::new(FakeSource::default());
        let cache = cache(source.clone(), EpochCacheSettings::default());
        cache.prewarm(600, 5).await.expect("prewarm task");
        assert_eq!(cache.len(), 5);
        let batch = cache.get(&(595..600).collect()).await;
        assert_eq!(batch.hits, 5);
    }

    #[test]
    fn network_row_skips_participant_rows() {
        let body = json!([
            {"identity": "v1", "skip_rate": 0.5},
            {"vote_account": "v2", "skip_rate": 0.2},
            {"epoch": 9, "skip_rate": 0.03}
        ]);
        assert_eq!(network_row(body, 9).expect("row")["skip_rate"], 0.03);
        assert_eq!(
            network_row(json!([{"validator": "x"}]), 9),
            Err(EpochFetchError::MissingNetworkRow(9))
        );
        assert!(network_row(json!({"epoch": 9}), 9).is_ok());
        assert!(network_row(json!(3), 9).is_err());
    }
}
