//! Single-reader batch writer.
//!
//! Accumulates up to `batch_size` samples or until `batch_flush_ms` elapses
//! after the first one, persists the batch atomically, then publishes each
//! persisted sample to the dispatcher. Persistence failures are retried with
//! exponential backoff; an exhausted batch goes to the overflow exporter so
//! producers are never blocked by the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use galvan_config::PipelineConfig;
use galvan_model::TelemetryPoint;

use crate::dispatch::Dispatcher;
use crate::pipeline::PipelineShared;
use crate::store::TelemetryStore;

const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_CAP: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 5;

pub(crate) struct BatchWriter {
    shared: Arc<PipelineShared>,
    store: Arc<dyn TelemetryStore>,
    dispatcher: Arc<Dispatcher>,
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl BatchWriter {
    pub fn new(
        shared: Arc<PipelineShared>,
        store: Arc<dyn TelemetryStore>,
        dispatcher: Arc<Dispatcher>,
        config: PipelineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            store,
            dispatcher,
            config,
            cancel,
        }
    }

    pub async fn run(self) {
        debug!(
            batch_size = self.config.batch_size,
            flush_ms = self.config.batch_flush_ms,
            "batch writer started"
        );
        loop {
            let Some(first) = self.next_point().await else {
                break;
            };
            let mut batch = Vec::with_capacity(self.config.batch_size);
            batch.push(first);
            self.fill_batch(&mut batch).await;
            if !self.persist_and_dispatch(batch).await {
                break;
            }
        }
        debug!("batch writer stopped");
    }

    /// Next sample, waiting if the queue is empty. Returns `None` once the
    /// queue is closed and drained, or the task is cancelled (remaining
    /// samples are exported to overflow in that case).
    async fn next_point(&self) -> Option<TelemetryPoint> {
        loop {
            if let Some(point) = self.shared.queue.try_pop() {
                return Some(point);
            }
            if self.shared.queue.is_closed() {
                return None;
            }
            tokio::select! {
                _ = self.shared.queue.wait() => {}
                _ = self.cancel.cancelled() => {
                    self.drain_to_overflow();
                    return None;
                }
            }
        }
    }

    /// Fill until `batch_size` or until `batch_flush_ms` after the first
    /// sample, whichever comes first.
    async fn fill_batch(&self, batch: &mut Vec<TelemetryPoint>) {
        let deadline = Instant::now() + Duration::from_millis(self.config.batch_flush_ms);
        loop {
            while batch.len() < self.config.batch_size {
                match self.shared.queue.try_pop() {
                    Some(point) => batch.push(point),
                    None => break,
                }
            }
            if batch.len() >= self.config.batch_size || self.shared.queue.is_closed() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                _ = self.shared.queue.wait() => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    /// Persist with retry, then publish. Returns `false` when cancelled
    /// mid-retry (the batch has been exported to overflow).
    async fn persist_and_dispatch(&self, batch: Vec<TelemetryPoint>) -> bool {
        let mut attempt = 0u32;
        loop {
            match self.store.append_batch(&batch).await {
                Ok(()) => {
                    for point in &batch {
                        self.dispatcher.publish(point);
                    }
                    return true;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        error!(
                            error = %e,
                            batch = batch.len(),
                            attempts = attempt,
                            "persistence retries exhausted, batch handed to overflow exporter"
                        );
                        self.shared.export_dropped(&batch);
                        return true;
                    }
                    let backoff = RETRY_BASE
                        .saturating_mul(1 << (attempt - 1))
                        .min(RETRY_CAP);
                    warn!(
                        error = %e,
                        transient = e.is_transient(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "batch persistence failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => {
                            self.shared.export_dropped(&batch);
                            self.drain_to_overflow();
                            return false;
                        }
                    }
                }
            }
        }
    }

    /// Hand everything still queued to the overflow exporter. Runs when the
    /// shutdown grace period expires before a clean drain.
    fn drain_to_overflow(&self) {
        let mut leftovers = Vec::new();
        while let Some(point) = self.shared.queue.try_pop() {
            leftovers.push(point);
        }
        if !leftovers.is_empty() {
            warn!(count = leftovers.len(), "unflushed samples exported at shutdown");
            self.shared.export_dropped(&leftovers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SampleSink;
    use crate::error::{CoreError, Result};
    use crate::pipeline::overflow::testing::RecordingExporter;
    use crate::pipeline::TelemetryPipeline;
    use crate::store::{
        AggregateBucket, AggregateFn, RangePage, RangeQuery, TelemetryStore,
    };
    use async_trait::async_trait;
    use galvan_model::{DeviceId, TagId, TelemetryValue};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store fake that can fail a configurable number of times first.
    #[derive(Debug, Default)]
    struct MemoryStore {
        fail_first: AtomicU32,
        batches: Mutex<Vec<Vec<TelemetryPoint>>>,
    }

    #[async_trait]
    impl TelemetryStore for MemoryStore {
        async fn append_batch(&self, points: &[TelemetryPoint]) -> Result<()> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(CoreError::Transient("store unavailable".into()));
            }
            self.batches.lock().unwrap().push(points.to_vec());
            Ok(())
        }

        async fn get_latest(
            &self,
            _device_id: Option<DeviceId>,
            _tag_id: Option<&TagId>,
        ) -> Result<Vec<TelemetryPoint>> {
            Ok(vec![])
        }

        async fn query_range(&self, _query: RangeQuery) -> Result<RangePage> {
            Ok(RangePage {
                points: vec![],
                next_cursor: None,
            })
        }

        async fn aggregate(
            &self,
            _device_id: DeviceId,
            _tag_id: &TagId,
            _start_ms: i64,
            _end_ms: i64,
            _bucket_ms: i64,
            _func: AggregateFn,
        ) -> Result<Vec<AggregateBucket>> {
            Ok(vec![])
        }
    }

    #[derive(Debug, Default)]
    struct OrderSink {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl SampleSink for OrderSink {
        fn name(&self) -> &str {
            "order"
        }

        async fn deliver(&self, point: TelemetryPoint) -> Result<()> {
            self.seen.lock().unwrap().push(point.ts_ms);
            Ok(())
        }
    }

    fn point(device: DeviceId, ts: i64) -> TelemetryPoint {
        TelemetryPoint::new(device, "T1".into(), ts, TelemetryValue::Float64(ts as f64))
    }

    #[tokio::test]
    async fn persists_and_publishes_in_order() {
        let exporter = Arc::new(RecordingExporter::default());
        let config = PipelineConfig {
            capacity: 64,
            batch_size: 8,
            batch_flush_ms: 10,
        };
        let pipeline = TelemetryPipeline::new(config, Arc::clone(&exporter) as _);
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(64, cancel.clone()));
        let sink = Arc::new(OrderSink::default());
        dispatcher.register(Arc::clone(&sink) as Arc<dyn SampleSink>);

        let writer = pipeline.spawn_writer(
            Arc::clone(&store) as Arc<dyn TelemetryStore>,
            Arc::clone(&dispatcher),
            cancel.clone(),
        );

        let device = DeviceId::new();
        for ts in 0..20 {
            pipeline.write(point(device, ts));
        }

        pipeline.close();
        writer.await.unwrap();
        dispatcher.shutdown().await;

        let persisted: Vec<i64> = store
            .batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|p| p.ts_ms)
            .collect();
        assert_eq!(persisted, (0..20).collect::<Vec<_>>());
        assert_eq!(*sink.seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
        assert!(exporter.points.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_failures_are_retried() {
        let exporter = Arc::new(RecordingExporter::default());
        let config = PipelineConfig {
            capacity: 64,
            batch_size: 8,
            batch_flush_ms: 10,
        };
        let pipeline = TelemetryPipeline::new(config, Arc::clone(&exporter) as _);
        let store = Arc::new(MemoryStore {
            fail_first: AtomicU32::new(2),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(64, cancel.clone()));

        let writer = pipeline.spawn_writer(
            Arc::clone(&store) as Arc<dyn TelemetryStore>,
            Arc::clone(&dispatcher),
            cancel.clone(),
        );

        let device = DeviceId::new();
        pipeline.write(point(device, 1));
        pipeline.close();
        writer.await.unwrap();

        assert_eq!(store.batches.lock().unwrap().len(), 1);
        assert!(exporter.points.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_hand_batch_to_overflow() {
        let exporter = Arc::new(RecordingExporter::default());
        let config = PipelineConfig {
            capacity: 64,
            batch_size: 8,
            batch_flush_ms: 10,
        };
        let pipeline = TelemetryPipeline::new(config, Arc::clone(&exporter) as _);
        let store = Arc::new(MemoryStore {
            fail_first: AtomicU32::new(u32::MAX),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(64, cancel.clone()));

        let writer = pipeline.spawn_writer(
            Arc::clone(&store) as Arc<dyn TelemetryStore>,
            Arc::clone(&dispatcher),
            cancel.clone(),
        );

        let device = DeviceId::new();
        pipeline.write(point(device, 1));
        pipeline.write(point(device, 2));
        pipeline.close();
        writer.await.unwrap();

        assert!(store.batches.lock().unwrap().is_empty());
        let dropped: Vec<i64> = exporter.points.lock().unwrap().iter().map(|p| p.ts_ms).collect();
        assert_eq!(dropped, vec![1, 2]);
        assert_eq!(pipeline.overflow_count(), 2);
    }
}
