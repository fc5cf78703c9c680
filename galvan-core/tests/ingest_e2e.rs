//! End-to-end ingest path without a database: a simulated polling collector
//! feeds the pipeline, the batch writer persists into an in-memory store and
//! fans out through the dispatcher to the broadcast hub.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use galvan_config::{CollectorsConfig, PipelineConfig};
use galvan_core::clock::SystemClock;
use galvan_core::collect::polling::PollingCollector;
use galvan_core::collect::sim::SimSessionFactory;
use galvan_core::collect::{Collector, CollectorState, TagSessionFactory};
use galvan_core::dispatch::Dispatcher;
use galvan_core::dispatch::broadcast::{BroadcastEvent, BroadcastHub, BroadcastSink, GroupSelector};
use galvan_core::error::Result;
use galvan_core::pipeline::TelemetryPipeline;
use galvan_core::pipeline::overflow::LogOverflowExporter;
use galvan_core::store::{AggregateBucket, AggregateFn, RangePage, RangeQuery, TelemetryStore};
use galvan_model::prelude::*;

#[derive(Debug, Default)]
struct MemoryStore {
    points: Mutex<Vec<TelemetryPoint>>,
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn append_batch(&self, points: &[TelemetryPoint]) -> Result<()> {
        self.points.lock().unwrap().extend(points.iter().cloned());
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

fn sim_device() -> Device {
    Device {
        id: DeviceId::new(),
        name: "sim-press".into(),
        protocol: Protocol::Simulation,
        host: String::new(),
        port: 0,
        connection_string: None,
        enabled: true,
        metadata: Default::default(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn simulated_collector_flows_to_store_and_broadcast() {
    let clock = Arc::new(SystemClock);
    let device = sim_device();
    let tags = vec![
        Tag::new(device.id, "OVEN_TEMP", ValueType::Float64, "OVEN_TEMP", 20),
        Tag::new(device.id, "BATCH_COUNT", ValueType::Int64, "BATCH_COUNT", 20),
    ];

    let pipeline = TelemetryPipeline::new(
        PipelineConfig {
            capacity: 4_096,
            batch_size: 16,
            batch_flush_ms: 20,
        },
        Arc::new(LogOverflowExporter),
    );
    let store = Arc::new(MemoryStore::default());
    let cancel = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new(4_096, cancel.clone()));
    let hub = Arc::new(BroadcastHub::new(4_096));
    dispatcher.register(Arc::new(BroadcastSink::new(Arc::clone(&hub))));
    let mut subscription = hub.subscribe(GroupSelector::Device(device.id));

    let writer = pipeline.spawn_writer(
        Arc::clone(&store) as Arc<dyn TelemetryStore>,
        Arc::clone(&dispatcher),
        cancel.clone(),
    );

    let factory: Arc<dyn TagSessionFactory> = Arc::new(SimSessionFactory::new(clock.clone()));
    let collector = Arc::new(PollingCollector::new(
        device.clone(),
        tags,
        factory,
        pipeline.clone(),
        clock,
        CollectorsConfig::default(),
    ));

    let mut state_rx = collector.state();
    let task = Arc::clone(&collector).start();

    // Wait until connected, then let it scan for a while.
    tokio::time::timeout(Duration::from_secs(5), async {
        while *state_rx.borrow() != CollectorState::Connected {
            state_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("collector connected");
    tokio::time::sleep(Duration::from_millis(300)).await;

    collector.stop();
    task.await.unwrap();
    assert_eq!(*collector.state().borrow(), CollectorState::Stopped);

    pipeline.close();
    writer.await.unwrap();
    dispatcher.shutdown().await;

    // Persisted, and in per-tag order.
    let points = store.points.lock().unwrap().clone();
    assert!(points.len() >= 4, "expected several scans, got {}", points.len());
    let mut per_tag: HashMap<TagId, Vec<(i64, u64)>> = HashMap::new();
    for p in &points {
        per_tag.entry(p.tag_id.clone()).or_default().push((p.ts_ms, p.seq));
    }
    assert_eq!(per_tag.len(), 2);
    for (tag, series) in &per_tag {
        let mut sorted = series.clone();
        sorted.sort();
        assert_eq!(series, &sorted, "per-tag order broken for {tag}");
    }

    // Broadcast saw the same stream.
    let mut broadcast_count = 0;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(100), subscription.recv()).await
    {
        if matches!(event, BroadcastEvent::Sample(_)) {
            broadcast_count += 1;
        }
    }
    assert!(broadcast_count >= 4, "broadcast saw {broadcast_count} samples");

    let health = collector.health();
    assert!(health.samples_emitted >= 4);
    assert_eq!(pipeline.overflow_count(), 0);
}
