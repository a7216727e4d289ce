// Numan Thabit 2025
//! Bounded buffer that coalesces per-transaction updates into broadcast batches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::TelemetryMetrics;

/// Default flush cadence.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Lock-free update queue drained into a broadcast channel.
pub struct UpdateBuffer<T> {
    queue: Arc<ArrayQueue<T>>,
    dropped: Arc<AtomicU64>,
    sender: broadcast::Sender<Arc<Vec<T>>>,
    metrics: TelemetryMetrics,
}

impl<T> Clone for UpdateBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            dropped: self.dropped.clone(),
            sender: self.sender.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T> UpdateBuffer<T> {
    /// Buffer up to `queue_depth` updates; subscribers lag after `channel_capacity` batches.
    pub fn new(queue_depth: usize, channel_capacity: usize, metrics: TelemetryMetrics) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            queue: Arc::new(ArrayQueue::new(queue_depth.max(1))),
            dropped: Arc::new(AtomicU64::new(0)),
            sender,
            metrics,
        }
    }

    /// Enqueue an update. Returns false and counts a drop when full.
    pub fn push(&self, item: T) -> bool {
        match self.queue.push(item) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.add_stream_dropped(1);
                false
            }
        }
    }

    /// Publish everything queued as one batch. Empty queues publish nothing.
    pub fn flush(&self) -> usize {
        let mut batch = Vec::with_capacity(self.queue.len());
        while let Some(item) = self.queue.pop() {
            batch.push(item);
        }
        let count = batch.len();
        if count == 0 {
            return 0;
        }
        // no subscribers is not an error; the batch is simply discarded
        let receivers = self.sender.send(Arc::new(batch)).unwrap_or(0);
        self.metrics.inc_stream_batches();
        debug!(count, receivers, "flushed update batch");
        count
    }

    /// Receive future batches.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<T>>> {
        self.sender.subscribe()
    }

    /// Updates dropped since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Updates waiting for the next flush.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Send + Sync + 'static> UpdateBuffer<T> {
    /// Flush every `cadence` until `cancel` fires.
    pub fn spawn_flusher(&self, cadence: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        buffer.flush();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_newest_and_counts() {
        let buffer = UpdateBuffer::new(2, 4, TelemetryMetrics::new());
        assert!(buffer.push(1));
        assert!(buffer.push(2));
        assert!(!buffer.push(3));
        assert_eq!(buffer.dropped(), 1);

        let mut rx = buffer.subscribe();
        assert_eq!(buffer.flush(), 2);
        let batch = rx.try_recv().expect("batch");
        assert_eq!(batch.as_slice(), &[1, 2]);
    }

    #[test]
    fn empty_flush_publishes_nothing() {
        let buffer: UpdateBuffer<u8> = UpdateBuffer::new(4, 4, TelemetryMetrics::new());
        let mut rx = buffer.subscribe();
        assert_eq!(buffer.flush(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn flusher_publishes_on_cadence_and_stops_on_cancel() {
        let buffer = UpdateBuffer::new(16, 4, TelemetryMetrics::new());
        let mut rx = buffer.subscribe();
        let cancel = CancellationToken::new();
        let handle = buffer.spawn_flusher(DEFAULT_FLUSH_INTERVAL, cancel.clone());

        buffer.push("a");
        buffer.push("b");
        let batch = rx.recv().await.expect("batch");
        assert_eq!(batch.len(), 2);

        cancel.cancel();
        handle.await.expect("flusher exits");
    }
}
