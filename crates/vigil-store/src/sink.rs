//! Fire-and-forget persistence of call records.
//!
//! The sink decouples the call path from storage latency: `submit` is a
//! bounded `try_send` and never blocks or fails the caller. A small worker
//! pool drains the queue, serializes records, and writes them with a bounded
//! exponential-backoff retry. Records that still cannot be written are
//! dropped with an error log; persistence failures must never surface into
//! the call path.

use std::sync::Arc;

use backon::{ExponentialBuilder, Retryable};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use vigil_core::CallRecord;

use crate::store::ObjectStore;

/// Sink tuning knobs.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Bounded queue depth between the call path and the workers.
    pub queue_capacity: usize,

    /// Number of writer tasks.
    pub workers: usize,

    /// Retries after the first failed write attempt.
    pub max_retries: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            workers: 2,
            max_retries: 3,
        }
    }
}

/// Bounded-queue, worker-pool record writer.
pub struct PersistenceSink {
    tx: mpsc::Sender<CallRecord>,
    workers: Vec<JoinHandle<()>>,
}

impl PersistenceSink {
    /// Spawn the worker pool against a store. Must be called inside a tokio
    /// runtime.
    pub fn new(store: Arc<dyn ObjectStore>, config: SinkConfig) -> Self {
        let (tx, rx) = mpsc::channel::<CallRecord>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let store = Arc::clone(&store);
                let config = config.clone();
                tokio::spawn(async move {
                    loop {
                        // Lock only to receive; writes proceed concurrently.
                        let record = rx.lock().await.recv().await;
                        match record {
                            Some(record) => write_record(&*store, &config, record).await,
                            None => break,
                        }
                    }
                    debug!(worker, "persistence worker stopped");
                })
            })
            .collect();

        Self { tx, workers }
    }

    /// Queue a record for persistence. Never blocks; when the queue is full
    /// the record is dropped and the drop is logged.
    pub fn submit(&self, record: CallRecord) {
        if let Err(err) = self.tx.try_send(record) {
            let record = match err {
                mpsc::error::TrySendError::Full(r) => r,
                mpsc::error::TrySendError::Closed(r) => r,
            };
            error!(
                agent = %record.agent, record_id = %record.id,
                "persistence queue full, dropping call record"
            );
        }
    }

    /// Close the queue and wait for the workers to drain it. Intended for
    /// shutdown and tests; the call path never waits on the sink.
    pub async fn close(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn write_record(store: &dyn ObjectStore, config: &SinkConfig, record: CallRecord) {
    let key = record.storage_key();
    let bytes = match serde_json::to_vec(&record) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(record_id = %record.id, error = %err, "cannot serialize call record");
            return;
        }
    };

    let backoff = ExponentialBuilder::default().with_max_times(config.max_retries);
    let put = || {
        let bytes = bytes.clone();
        let key = &key;
        async move { store.put(key, bytes).await }
    };
    match put
        .retry(backoff)
        .notify(|err, after| {
            warn!(key = %key, error = %err, retry_in = ?after, "record write failed, retrying")
        })
        .await
    {
        Ok(()) => debug!(key = %key, "call record persisted"),
        Err(err) => {
            error!(key = %key, error = %err, "dropping call record after retries")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vigil_core::{ExecutionContext, Settings};

    fn record_for(agent: &str) -> CallRecord {
        let ctx = ExecutionContext::new(agent, json!({"q": 1}));
        CallRecord::from_context(&ctx, Some(&json!({"a": 2})), &Settings::default())
    }

    #[tokio::test]
    async fn test_records_land_under_expected_key() {
        let store = Arc::new(MemoryStore::new());
        let sink = PersistenceSink::new(store.clone(), SinkConfig::default());

        let record = record_for("pricing");
        let key = record.storage_key();
        sink.submit(record);
        sink.close().await;

        let stored = store.get(&key).await.unwrap().unwrap();
        let back: CallRecord = serde_json::from_slice(&stored).unwrap();
        assert_eq!(back.agent, "pricing");
    }

    /// Fails the first `failures` put attempts, then succeeds.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
            {
                return Err(StoreError::backend(key, "transient"));
            }
            self.inner.put(key, bytes).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(2),
        });
        let sink = PersistenceSink::new(store.clone(), SinkConfig::default());

        let record = record_for("a");
        let key = record.storage_key();
        sink.submit(record);
        sink.close().await;

        assert!(store.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_persistent_failure_never_surfaces() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(usize::MAX),
        });
        let sink = PersistenceSink::new(
            store.clone(),
            SinkConfig {
                max_retries: 1,
                ..Default::default()
            },
        );

        // Submit and shut down cleanly; the lost record is only logged.
        sink.submit(record_for("a"));
        sink.close().await;
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn test_queue_full_drops_instead_of_blocking() {
        /// Holds every write until released.
        struct StalledStore {
            gate: tokio::sync::Semaphore,
            inner: MemoryStore,
        }

        #[async_trait]
        impl ObjectStore for StalledStore {
            async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
                let _permit = self.gate.acquire().await.map_err(|e| {
                    StoreError::backend(key, e.to_string())
                })?;
                self.inner.put(key, bytes).await
            }
            async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
                self.inner.get(key).await
            }
            async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
                self.inner.list(prefix).await
            }
        }

        let store = Arc::new(StalledStore {
            gate: tokio::sync::Semaphore::new(0),
            inner: MemoryStore::new(),
        });
        let sink = PersistenceSink::new(
            store.clone(),
            SinkConfig {
                queue_capacity: 1,
                workers: 1,
                max_retries: 0,
            },
        );

        // Give the single worker time to take one record off the queue and
        // park on the gate; the queue then holds one more, and the rest drop.
        sink.submit(record_for("a"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        for _ in 0..10 {
            sink.submit(record_for("a"));
        }

        store.gate.add_permits(100);
        sink.close().await;
        assert!(store.inner.len() <= 2);
    }

    #[tokio::test]
    async fn test_multiple_workers_share_queue() {
        let store = Arc::new(MemoryStore::new());
        let sink = PersistenceSink::new(
            store.clone(),
            SinkConfig {
                workers: 4,
                ..Default::default()
            },
        );
        for _ in 0..20 {
            sink.submit(record_for("agent"));
        }
        sink.close().await;
        assert_eq!(store.len(), 20);
    }
}
