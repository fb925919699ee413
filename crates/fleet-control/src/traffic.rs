//! In-memory traffic accumulator
//!
//! Agent reports land in [`TrafficBuffer::record`], which only touches a map
//! under a short lock. A fast timer moves the accumulated deltas into the
//! durable cache tier; a slow timer moves the cache into the system of record.
//! A failed cache write merges the taken deltas back, so an outage costs memory
//! rather than traffic. A failed persist leaves the cache untouched and the
//! next cycle retries the same totals.

use chrono::Utc;
use fleet_db::{StoreError, TrafficCache, TrafficDelta, TrafficSink};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TrafficConfig {
    /// Memory to durable cache
    pub flush_interval: Duration,
    /// Durable cache to system of record
    pub persist_interval: Duration,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            persist_interval: Duration::from_secs(300),
        }
    }
}

pub struct TrafficBuffer {
    config: TrafficConfig,
    pending: Mutex<HashMap<i64, (u64, u64)>>,
    cache: Arc<dyn TrafficCache>,
    sink: Arc<dyn TrafficSink>,
}

impl TrafficBuffer {
    pub fn new(
        config: TrafficConfig,
        cache: Arc<dyn TrafficCache>,
        sink: Arc<dyn TrafficSink>,
    ) -> Self {
        Self {
            config,
            pending: Mutex::new(HashMap::new()),
            cache,
            sink,
        }
    }

    /// Add to a rule's counters; never blocks on I/O
    pub fn record(&self, rule_id: i64, bytes_in: u64, bytes_out: u64) {
        if bytes_in == 0 && bytes_out == 0 {
            return;
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let entry = pending.entry(rule_id).or_default();
        entry.0 = entry.0.saturating_add(bytes_in);
        entry.1 = entry.1.saturating_add(bytes_out);
    }

    /// Deltas not yet written to the cache tier, ordered by rule id
    pub fn pending(&self) -> Vec<TrafficDelta> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut deltas: Vec<_> = pending
            .iter()
            .map(|(id, (i, o))| TrafficDelta::new(*id, *i, *o))
            .collect();
        deltas.sort_by_key(|d| d.rule_id);
        deltas
    }

    /// Move everything accumulated so far into the cache tier
    pub async fn flush_to_cache(&self) -> Result<usize, StoreError> {
        let taken = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        if taken.is_empty() {
            return Ok(0);
        }

        let batch: Vec<TrafficDelta> = taken
            .iter()
            .map(|(id, (i, o))| TrafficDelta::new(*id, *i, *o))
            .collect();

        match self.cache.add(&batch).await {
            Ok(()) => {
                debug!(rules = batch.len(), "Flushed traffic to cache");
                Ok(batch.len())
            }
            Err(e) => {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                for (id, (i, o)) in taken {
                    let entry = pending.entry(id).or_default();
                    entry.0 = entry.0.saturating_add(i);
                    entry.1 = entry.1.saturating_add(o);
                }
                Err(e)
            }
        }
    }

    /// Move the cache tier into the system of record
    pub async fn persist(&self) -> Result<usize, StoreError> {
        let snapshot = self.cache.snapshot().await?;
        if snapshot.is_empty() {
            return Ok(0);
        }

        self.sink.persist_and_commit(&snapshot, Utc::now()).await?;
        info!(rules = snapshot.len(), "Persisted traffic");
        Ok(snapshot.len())
    }

    /// Flush timers; flushes once more to the cache on cancellation
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut flush = tokio::time::interval(self.config.flush_interval);
        let mut persist = tokio::time::interval(self.config.persist_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        persist.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first ticks
        flush.tick().await;
        persist.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = flush.tick() => {
                    if let Err(e) = self.flush_to_cache().await {
                        warn!(error = %e, "Traffic flush failed, keeping deltas for next cycle");
                    }
                }
                _ = persist.tick() => {
                    if let Err(e) = self.persist().await {
                        warn!(error = %e, "Traffic persist failed, retrying next cycle");
                    }
                }
            }
        }

        match self.flush_to_cache().await {
            Ok(flushed) => debug!(rules = flushed, "Final traffic flush done"),
            Err(e) => warn!(error = %e, "Final traffic flush failed, deltas lost"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use fleet_db::StoreResult;
    use sea_orm::DbErr;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FlakyCache {
        down: AtomicBool,
        rows: Mutex<HashMap<i64, (u64, u64)>>,
    }

    #[async_trait]
    impl TrafficCache for FlakyCache {
        async fn add(&self, batch: &[TrafficDelta]) -> StoreResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Database(DbErr::Custom("cache down".into())));
            }
            let mut rows = self.rows.lock().unwrap();
            for d in batch {
                let row = rows.entry(d.rule_id).or_default();
                row.0 += d.bytes_in;
                row.1 += d.bytes_out;
            }
            Ok(())
        }

        async fn snapshot(&self) -> StoreResult<Vec<TrafficDelta>> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .map(|(id, (i, o))| TrafficDelta::new(*id, *i, *o))
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        cache: Arc<FlakyCache>,
        down: AtomicBool,
        totals: Mutex<HashMap<i64, (u64, u64)>>,
    }

    #[async_trait]
    impl TrafficSink for RecordingSink {
        async fn persist_and_commit(&self, snapshot: &[TrafficDelta], _at: DateTime<Utc>) -> StoreResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Database(DbErr::Custom("sink down".into())));
            }
            let mut totals = self.totals.lock().unwrap();
            let mut rows = self.cache.rows.lock().unwrap();
            for d in snapshot {
                let t = totals.entry(d.rule_id).or_default();
                t.0 += d.bytes_in;
                t.1 += d.bytes_out;
                if let Some(row) = rows.get_mut(&d.rule_id) {
                    row.0 -= d.bytes_in;
                    row.1 -= d.bytes_out;
                }
            }
            rows.retain(|_, (i, o)| *i > 0 || *o > 0);
            Ok(())
        }
    }

    fn buffer() -> (TrafficBuffer, Arc<FlakyCache>, Arc<RecordingSink>) {
        let cache = Arc::new(FlakyCache::default());
        let sink = Arc::new(RecordingSink {
            cache: cache.clone(),
            ..Default::default()
        });
        let buffer = TrafficBuffer::new(TrafficConfig::default(), cache.clone(), sink.clone());
        (buffer, cache, sink)
    }

    #[tokio::test]
    async fn test_failed_flush_merges_back() {
        let (buffer, cache, sink) = buffer();

        buffer.record(1, 100, 1000);
        buffer.record(2, 5, 0);
        buffer.record(3, 0, 0);

        cache.down.store(true, Ordering::SeqCst);
        assert!(buffer.flush_to_cache().await.is_err());

        // Reports during the outage add to the retained deltas
        buffer.record(1, 1, 10);
        assert_eq!(
            buffer.pending(),
            vec![TrafficDelta::new(1, 101, 1010), TrafficDelta::new(2, 5, 0)]
        );

        cache.down.store(false, Ordering::SeqCst);
        assert_eq!(buffer.flush_to_cache().await.unwrap(), 2);
        assert!(buffer.pending().is_empty());

        assert_eq!(buffer.persist().await.unwrap(), 2);
        let totals = sink.totals.lock().unwrap().clone();
        assert_eq!(totals.get(&1), Some(&(101, 1010)));
        assert_eq!(totals.get(&2), Some(&(5, 0)));
        assert!(cache.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_persist_counts_once_on_retry() {
        let (buffer, cache, sink) = buffer();
        buffer.record(4, 100, 200);
        buffer.flush_to_cache().await.unwrap();

        sink.down.store(true, Ordering::SeqCst);
        assert!(buffer.persist().await.is_err());
        assert!(sink.totals.lock().unwrap().is_empty());
        assert_eq!(cache.rows.lock().unwrap().get(&4), Some(&(100, 200)));

        sink.down.store(false, Ordering::SeqCst);
        assert_eq!(buffer.persist().await.unwrap(), 1);
        assert_eq!(buffer.persist().await.unwrap(), 0);
        assert_eq!(sink.totals.lock().unwrap().get(&4), Some(&(100, 200)));
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let (buffer, _, _) = buffer();
        assert_eq!(buffer.flush_to_cache().await.unwrap(), 0);
        assert_eq!(buffer.persist().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_on_cancel() {
        let (buffer, cache, _) = buffer();
        let buffer = Arc::new(buffer);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(buffer.clone().run(cancel.clone()));

        buffer.record(7, 3, 4);
        tokio::task::yield_now().await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(cache.rows.lock().unwrap().get(&7), Some(&(3, 4)));
        assert!(buffer.pending().is_empty());
    }
}
