//! Component wiring and lifecycle.
//!
//! Construction is leaves-first: clock and store, then pipeline and
//! dispatcher, then the engines, then collectors and background tasks. Sinks
//! are registered after construction so no component holds a forward
//! reference. Shutdown runs the same graph in reverse, in stages, under one
//! grace period.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use galvan_config::Config;
use galvan_core::collect::supervisor::{CollectorSupervisor, ProtocolCollectorFactory};
use galvan_core::dispatch::Dispatcher;
use galvan_core::dispatch::broadcast::{BroadcastHub, BroadcastSink};
use galvan_core::pipeline::overflow::{
    JsonlOverflowExporter, LogOverflowExporter, OverflowExporter,
};
use galvan_core::store::{
    AlarmStore, CollectionStore, DeviceStore, MaintenanceStore, RevisionStore, TagStore,
    TelemetryStore,
};
use galvan_core::{
    AggregationJob, AlarmEngine, CaptureEngine, Clock, ConfigRevisionWatcher, PgStore,
    SystemClock, TelemetryPipeline,
};

const BROADCAST_CAPACITY: usize = 1_024;

pub struct AppRuntime {
    config: Config,
    pipeline: TelemetryPipeline,
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<CollectorSupervisor>,
    writer_cancel: CancellationToken,
    background_cancel: CancellationToken,
    writer_task: JoinHandle<()>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl AppRuntime {
    /// Construct and start everything. Any error here is fatal startup; the
    /// process must exit non-zero before accepting traffic.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store = Arc::new(
            PgStore::connect(&config.database.url, config.database.max_connections).await?,
        );
        info!("store connected and migrated");

        let overflow: Arc<dyn OverflowExporter> = match &config.overflow.file {
            Some(path) => Arc::new(JsonlOverflowExporter::open(path)?),
            None => Arc::new(LogOverflowExporter),
        };

        let hub = Arc::new(BroadcastHub::new(BROADCAST_CAPACITY));
        let background_cancel = CancellationToken::new();
        let writer_cancel = CancellationToken::new();

        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatcher.sink_queue_capacity,
            background_cancel.child_token(),
        ));
        let pipeline = TelemetryPipeline::new(config.pipeline.clone(), overflow);

        // Engines take their config baseline before the watcher starts so no
        // revision bump can fall between load and watch.
        let baseline_revision = store.get_revision().await?;

        let alarm_engine = Arc::new(AlarmEngine::new(
            Arc::clone(&store) as Arc<dyn AlarmStore>,
            Arc::clone(&store) as Arc<dyn TagStore>,
            Some(Arc::clone(&hub)),
        ));
        alarm_engine.reload_rules().await?;

        let capture_engine = Arc::new(CaptureEngine::new(
            Arc::clone(&store) as Arc<dyn CollectionStore>,
            Arc::clone(&clock),
            Some(Arc::clone(&hub)),
            config.capture.clone(),
        ));
        capture_engine.reload_rules().await?;

        // Post-construction registration breaks the pipeline -> dispatcher ->
        // engine -> store cycle.
        dispatcher.register(Arc::new(BroadcastSink::new(Arc::clone(&hub))));
        dispatcher.register(Arc::clone(&alarm_engine) as _);
        dispatcher.register(Arc::clone(&capture_engine) as _);

        let writer_task = pipeline.spawn_writer(
            Arc::clone(&store) as Arc<dyn TelemetryStore>,
            Arc::clone(&dispatcher),
            writer_cancel.clone(),
        );

        let factory = Arc::new(ProtocolCollectorFactory::new(
            pipeline.clone(),
            Arc::clone(&clock),
            config.collectors.clone(),
        ));
        let supervisor = Arc::new(CollectorSupervisor::new(
            Arc::clone(&store) as Arc<dyn DeviceStore>,
            Arc::clone(&store) as Arc<dyn TagStore>,
            factory,
        ));
        supervisor.reload().await?;

        let mut background_tasks = Vec::new();

        let mut watcher = ConfigRevisionWatcher::new(
            Arc::clone(&store) as Arc<dyn RevisionStore>,
            Duration::from_millis(config.revision.poll_interval_ms),
            baseline_revision,
        );
        watcher
            .register(Arc::clone(&supervisor) as _)
            .register(Arc::clone(&alarm_engine) as _)
            .register(Arc::clone(&capture_engine) as _);
        background_tasks.push(watcher.spawn(background_cancel.child_token()));

        background_tasks
            .push(Arc::clone(&capture_engine).spawn_ticker(background_cancel.child_token()));

        let aggregation = Arc::new(AggregationJob::new(
            Arc::clone(&store) as Arc<dyn MaintenanceStore>,
            Arc::clone(&clock),
            config.aggregation.clone(),
        ));
        let (minute_task, hour_task) = aggregation.spawn(background_cancel.child_token());
        background_tasks.push(minute_task);
        background_tasks.push(hour_task);

        info!("runtime started");
        Ok(Self {
            config,
            pipeline,
            dispatcher,
            supervisor,
            writer_cancel,
            background_cancel,
            writer_task,
            background_tasks,
        })
    }

    /// Staged shutdown: collectors stop producing, the pipeline drains and
    /// flushes its final batch within the grace period, sinks drain, then
    /// background jobs stop. Anything unflushed after the grace period goes
    /// to the overflow exporter.
    pub async fn shutdown(self) {
        let grace = Duration::from_secs(self.config.shutdown.grace_secs);
        info!(grace_secs = self.config.shutdown.grace_secs, "shutting down");

        self.supervisor.shutdown().await;
        self.pipeline.close();

        match tokio::time::timeout(grace, self.writer_task).await {
            Ok(_) => info!("pipeline drained"),
            Err(_) => {
                warn!("grace period expired, forcing writer shutdown");
                self.writer_cancel.cancel();
            }
        }

        self.dispatcher.shutdown().await;

        self.background_cancel.cancel();
        for task in self.background_tasks {
            let _ = task.await;
        }
        info!(
            overflow_total = self.pipeline.overflow_count(),
            "shutdown complete"
        );
    }
}
