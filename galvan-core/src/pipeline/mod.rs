//! Bounded ingestion pipeline.
//!
//! Producers (collectors) call [`TelemetryPipeline::write`], which never
//! blocks: when the queue is full the oldest sample is evicted to the
//! overflow exporter. A single batch-writer task drains the queue, persists
//! batches, and publishes persisted samples to the dispatcher.

pub mod batch;
pub mod overflow;
pub(crate) mod queue;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use galvan_config::PipelineConfig;
use galvan_model::TelemetryPoint;

use crate::dispatch::Dispatcher;
use crate::pipeline::batch::BatchWriter;
use crate::pipeline::overflow::OverflowExporter;
use crate::pipeline::queue::{DropOldestQueue, PushOutcome};
use crate::store::TelemetryStore;

/// Result of a pipeline write.
///
/// `Accepted` means the sample is durably en-route: queued for the batch
/// writer or already persisted. `Dropped` means overflow policy discarded it;
/// the sample went to the overflow exporter and the overflow counter moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    Dropped,
}

#[derive(Debug)]
pub(crate) struct PipelineShared {
    pub queue: DropOldestQueue<TelemetryPoint>,
    pub overflow: Arc<dyn OverflowExporter>,
    pub overflow_count: AtomicU64,
}

impl PipelineShared {
    pub fn export_dropped(&self, points: &[TelemetryPoint]) {
        if points.is_empty() {
            return;
        }
        self.overflow.export(points);
        self.overflow_count
            .fetch_add(points.len() as u64, Ordering::Relaxed);
    }
}

/// Handle for producers and the host. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TelemetryPipeline {
    shared: Arc<PipelineShared>,
    config: PipelineConfig,
}

impl TelemetryPipeline {
    pub fn new(config: PipelineConfig, overflow: Arc<dyn OverflowExporter>) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                queue: DropOldestQueue::new(config.capacity),
                overflow,
                overflow_count: AtomicU64::new(0),
            }),
            config,
        }
    }

    /// Accept one sample. Never blocks the producer; queue-full evicts the
    /// oldest queued sample to the overflow exporter.
    pub fn write(&self, point: TelemetryPoint) -> WriteOutcome {
        match self.shared.queue.push(point) {
            PushOutcome::Enqueued { evicted: Some(old) } => {
                self.shared.export_dropped(&[old]);
                WriteOutcome::Accepted
            }
            PushOutcome::Enqueued { evicted: None } => WriteOutcome::Accepted,
            PushOutcome::Closed(point) => {
                self.shared.export_dropped(&[point]);
                WriteOutcome::Dropped
            }
        }
    }

    /// Non-authoritative current queue depth for health reporting.
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.len()
    }

    /// Samples handed to the overflow exporter so far.
    pub fn overflow_count(&self) -> u64 {
        self.shared.overflow_count.load(Ordering::Relaxed)
    }

    /// Close the writer side. Already-queued samples still drain; further
    /// writes are dropped.
    pub fn close(&self) {
        self.shared.queue.close();
    }

    /// Start the single batch-writer task.
    pub fn spawn_writer(
        &self,
        store: Arc<dyn TelemetryStore>,
        dispatcher: Arc<Dispatcher>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let writer = BatchWriter::new(
            Arc::clone(&self.shared),
            store,
            dispatcher,
            self.config.clone(),
            cancel,
        );
        tokio::spawn(writer.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::overflow::testing::RecordingExporter;
    use galvan_model::{DeviceId, TelemetryValue};

    fn point(device: DeviceId, ts: i64) -> TelemetryPoint {
        TelemetryPoint::new(device, "T1".into(), ts, TelemetryValue::Float64(ts as f64))
    }

    /// Capacity 4, no reader running: P1..P10 overflow P1..P6 and retain
    /// P7..P10 in order.
    #[test]
    fn overflow_preserves_recency() {
        let exporter = Arc::new(RecordingExporter::default());
        let config = PipelineConfig {
            capacity: 4,
            batch_size: 500,
            batch_flush_ms: 100,
        };
        let pipeline = TelemetryPipeline::new(config, Arc::clone(&exporter) as _);
        let device = DeviceId::new();

        for ts in 1..=10 {
            assert_eq!(pipeline.write(point(device, ts)), WriteOutcome::Accepted);
        }

        let dropped: Vec<i64> = exporter.points.lock().unwrap().iter().map(|p| p.ts_ms).collect();
        assert_eq!(dropped, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(pipeline.overflow_count(), 6);
        assert_eq!(pipeline.queue_depth(), 4);

        let mut remaining = Vec::new();
        while let Some(p) = pipeline.shared.queue.try_pop() {
            remaining.push(p.ts_ms);
        }
        assert_eq!(remaining, vec![7, 8, 9, 10]);
    }

    #[test]
    fn writes_after_close_are_dropped() {
        let exporter = Arc::new(RecordingExporter::default());
        let pipeline = TelemetryPipeline::new(PipelineConfig::default(), Arc::clone(&exporter) as _);
        let device = DeviceId::new();

        assert_eq!(pipeline.write(point(device, 1)), WriteOutcome::Accepted);
        pipeline.close();
        assert_eq!(pipeline.write(point(device, 2)), WriteOutcome::Dropped);
        assert_eq!(pipeline.overflow_count(), 1);
    }
}
