//! Background hit logging.
//!
//! Redirects hand their hit to a bounded queue and return immediately; a
//! single worker writes queued hits to the store. When the queue is full
//! the hit is dropped and counted, so a slow store never delays a redirect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{Hit, LinkStore};

/// Queues hits for the worker. Cheap to clone.
#[derive(Clone)]
pub struct HitRecorder {
    tx: mpsc::Sender<Hit>,
    dropped: Arc<AtomicU64>,
}

impl HitRecorder {
    fn channel(capacity: usize) -> (Self, mpsc::Receiver<Hit>) {
        let (tx, rx) = mpsc::channel(capacity);
        let recorder = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (recorder, rx)
    }

    /// Start the worker writing to `store`. `capacity` must be at least 1.
    pub fn spawn(store: Arc<dyn LinkStore>, capacity: usize) -> (Self, HitWorker) {
        let (recorder, rx) = Self::channel(capacity);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_worker(rx, store, shutdown.clone()));
        let worker = HitWorker {
            handle,
            shutdown,
            dropped: recorder.dropped.clone(),
        };
        (recorder, worker)
    }

    /// Queue `hit` without waiting.
    pub fn record(&self, hit: Hit) {
        match self.tx.try_send(hit) {
            Ok(()) => {}
            Err(TrySendError::Full(hit)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(url = %hit.url, dropped_total = dropped, "Hit queue full, dropping hit");
            }
            Err(TrySendError::Closed(hit)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(url = %hit.url, dropped_total = dropped, "Hit queue closed, dropping hit");
            }
        }
    }

    #[cfg(test)]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Handle to the worker task.
pub struct HitWorker {
    handle: JoinHandle<u64>,
    shutdown: CancellationToken,
    dropped: Arc<AtomicU64>,
}

impl HitWorker {
    /// Stop taking new hits and write the queued ones, waiting at most
    /// `timeout`.
    pub async fn finish(self, timeout: Duration) {
        self.shutdown.cancel();
        let outcome = tokio::time::timeout(timeout, self.handle).await;
        let dropped = self.dropped.load(Ordering::Relaxed);
        match outcome {
            Ok(Ok(recorded)) => info!(recorded, dropped, "Hit queue flushed"),
            Ok(Err(e)) => error!(error = %e, "Hit worker failed"),
            Err(_) => warn!(
                timeout_secs = timeout.as_secs(),
                dropped,
                "Hit queue not flushed in time, abandoning queued hits"
            ),
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Hit>,
    store: Arc<dyn LinkStore>,
    shutdown: CancellationToken,
) -> u64 {
    let mut recorded = 0;
    let mut closed = false;

    loop {
        tokio::select! {
            biased;
            hit = rx.recv() => {
                let Some(hit) = hit else { break };
                match store.record_hit(&hit).await {
                    Ok(()) => recorded += 1,
                    Err(e) => error!(url = %hit.url, error = %e, "Failed to record hit"),
                }
            }
            _ = shutdown.cancelled(), if !closed => {
                debug!("Closing hit queue");
                // Buffered hits are still delivered after close.
                rx.close();
                closed = true;
            }
        }
    }

    recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DailyHits, DatabaseError};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        hits: Mutex<Vec<Hit>>,
    }

    #[async_trait]
    impl LinkStore for MemoryStore {
        async fn is_whitelisted(&self, _url: &str) -> Result<bool, DatabaseError> {
            Ok(true)
        }

        async fn add_url(&self, _url: &str) -> Result<(), DatabaseError> {
            Ok(())
        }

        async fn record_hit(&self, hit: &Hit) -> Result<(), DatabaseError> {
            self.hits.lock().await.push(hit.clone());
            Ok(())
        }

        async fn daily_hits(
            &self,
            _url: &str,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<DailyHits>, DatabaseError> {
            Ok(Vec::new())
        }
    }

    fn hit(n: u32) -> Hit {
        Hit {
            url: format!("http://example.com/{n}"),
            at: Utc.with_ymd_and_hms(2013, 2, 1, 12, 0, n).unwrap(),
            referrer: String::new(),
        }
    }

    #[tokio::test]
    async fn test_hits_reach_store_before_finish_returns() {
        let store = Arc::new(MemoryStore::default());
        let (recorder, worker) = HitRecorder::spawn(store.clone(), 16);

        for n in 0..5 {
            recorder.record(hit(n));
        }
        worker.finish(Duration::from_secs(5)).await;

        let hits = store.hits.lock().await;
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0], hit(0));
        assert_eq!(recorder.dropped(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let (recorder, _rx) = HitRecorder::channel(2);

        recorder.record(hit(1));
        recorder.record(hit(2));
        recorder.record(hit(3));
        recorder.record(hit(4));

        assert_eq!(recorder.dropped(), 2);
    }

    #[tokio::test]
    async fn test_record_after_finish_is_dropped() {
        let store = Arc::new(MemoryStore::default());
        let (recorder, worker) = HitRecorder::spawn(store.clone(), 4);
        let reported = Arc::clone(&worker.dropped);
        worker.finish(Duration::from_secs(5)).await;

        recorder.record(hit(1));
        assert_eq!(recorder.dropped(), 1);
        assert_eq!(reported.load(Ordering::Relaxed), 1, "worker reports the same count");
        assert!(store.hits.lock().await.is_empty());
    }
}
