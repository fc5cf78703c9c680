//! Fan-out of persisted samples to registered sinks.
//!
//! Each sink gets its own bounded forwarding queue and forwarding task so one
//! slow sink can never block another or the pipeline. Overflow on a sink
//! queue drops that sink's oldest sample only.

pub mod broadcast;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use galvan_model::TelemetryPoint;

use crate::error::Result;
use crate::pipeline::queue::{DropOldestQueue, PushOutcome};

/// A consumer attached to the dispatcher.
///
/// `deliver` is called from the sink's own forwarding task, in per-series
/// order. Errors are logged; the sink stays registered.
#[async_trait]
pub trait SampleSink: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    async fn deliver(&self, point: TelemetryPoint) -> Result<()>;
}

#[derive(Debug)]
struct SinkHandle {
    queue: Arc<DropOldestQueue<TelemetryPoint>>,
    task: JoinHandle<()>,
}

/// Broadcast of each persisted sample to all registered sinks.
#[derive(Debug)]
pub struct Dispatcher {
    sinks: DashMap<String, SinkHandle>,
    queue_capacity: usize,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(queue_capacity: usize, cancel: CancellationToken) -> Self {
        Self {
            sinks: DashMap::new(),
            queue_capacity,
            cancel,
        }
    }

    /// Register a sink and start its forwarding task. Idempotent: a sink that
    /// is already registered under the same name is left untouched.
    pub fn register(&self, sink: Arc<dyn SampleSink>) {
        let name = sink.name().to_string();
        if self.sinks.contains_key(&name) {
            debug!(sink = %name, "sink already registered");
            return;
        }

        let queue = Arc::new(DropOldestQueue::new(self.queue_capacity));
        let task = tokio::spawn(forward_loop(
            name.clone(),
            Arc::clone(&queue),
            Arc::clone(&sink),
            self.cancel.child_token(),
        ));
        self.sinks.insert(name.clone(), SinkHandle { queue, task });
        info!(sink = %name, "sink registered");
    }

    /// Unregister a sink. Its queue closes, the forwarding task drains what
    /// is already queued and exits. Idempotent.
    pub fn unregister(&self, name: &str) {
        if let Some((_, handle)) = self.sinks.remove(name) {
            handle.queue.close();
            info!(sink = %name, "sink unregistered");
        }
    }

    /// Fan the point out to every registered sink. Never blocks; a full sink
    /// queue drops that sink's oldest sample.
    pub fn publish(&self, point: &TelemetryPoint) {
        for entry in self.sinks.iter() {
            match entry.value().queue.push(point.clone()) {
                PushOutcome::Enqueued { evicted: Some(_) } => {
                    debug!(sink = %entry.key(), "sink queue full, dropped oldest");
                }
                PushOutcome::Enqueued { evicted: None } => {}
                PushOutcome::Closed(_) => {
                    debug!(sink = %entry.key(), "publish to closed sink queue");
                }
            }
        }
    }

    /// Dropped-sample count for one sink, if registered.
    pub fn dropped_for(&self, name: &str) -> Option<u64> {
        self.sinks.get(name).map(|h| h.queue.dropped())
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|e| e.key().clone()).collect()
    }

    /// Close all sink queues and wait for the forwarding tasks to drain.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.sink_names();
        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            if let Some((_, handle)) = self.sinks.remove(&name) {
                handle.queue.close();
                handles.push(handle.task);
            }
        }
        for task in handles {
            let _ = task.await;
        }
    }
}

async fn forward_loop(
    name: String,
    queue: Arc<DropOldestQueue<TelemetryPoint>>,
    sink: Arc<dyn SampleSink>,
    cancel: CancellationToken,
) {
    loop {
        if let Some(point) = queue.try_pop() {
            if let Err(e) = sink.deliver(point).await {
                // A raising sink handler must not terminate the dispatcher.
                error!(sink = %name, error = %e, "sink delivery failed");
            }
            continue;
        }
        if queue.is_closed() {
            break;
        }
        tokio::select! {
            _ = queue.wait() => {}
            _ = cancel.cancelled() => break,
        }
    }
    debug!(sink = %name, "forwarding task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use galvan_model::{DeviceId, TelemetryValue};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct CollectingSink {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl SampleSink for CollectingSink {
        fn name(&self) -> &str {
            "collecting"
        }

        async fn deliver(&self, point: TelemetryPoint) -> Result<()> {
            self.seen.lock().unwrap().push(point.ts_ms);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FailingSink;

    #[async_trait]
    impl SampleSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _point: TelemetryPoint) -> Result<()> {
            Err(crate::error::CoreError::Internal("sink fault".into()))
        }
    }

    fn point(ts: i64) -> TelemetryPoint {
        TelemetryPoint::new(
            DeviceId::new(),
            "T1".into(),
            ts,
            TelemetryValue::Float64(ts as f64),
        )
    }

    #[tokio::test]
    async fn delivers_in_order_and_survives_faulty_sink() {
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(16, cancel.clone());
        let sink = Arc::new(CollectingSink::default());
        dispatcher.register(Arc::clone(&sink) as Arc<dyn SampleSink>);
        dispatcher.register(Arc::new(FailingSink));

        for ts in 0..5 {
            dispatcher.publish(&point(ts));
        }
        dispatcher.shutdown().await;

        assert_eq!(*sink.seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let dispatcher = Dispatcher::new(16, CancellationToken::new());
        let sink = Arc::new(CollectingSink::default());
        dispatcher.register(Arc::clone(&sink) as Arc<dyn SampleSink>);
        dispatcher.register(Arc::clone(&sink) as Arc<dyn SampleSink>);
        assert_eq!(dispatcher.sink_names().len(), 1);
        dispatcher.unregister("collecting");
        dispatcher.unregister("collecting");
        assert!(dispatcher.sink_names().is_empty());
    }
}
