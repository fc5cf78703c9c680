//! Collector supervision and hot reload.
//!
//! The supervisor owns every collector task. On a configuration revision
//! change it diffs the active set of (device, tags) against the store: added
//! devices start, removed devices stop, connection-fingerprint changes
//! restart, tag-only changes apply in place.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use galvan_config::CollectorsConfig;
use galvan_model::{Device, DeviceId, Protocol, Tag};

use crate::clock::Clock;
use crate::collect::polling::PollingCollector;
use crate::collect::sim::SimSessionFactory;
use crate::collect::subscription::SubscriptionCollector;
use crate::collect::{
    Collector, CollectorHealth, SubscriptionSessionFactory, TagSessionFactory,
};
use crate::error::{CoreError, Result};
use crate::pipeline::TelemetryPipeline;
use crate::revision::RevisionListener;
use crate::store::{DeviceStore, TagStore};

/// Builds a collector for one device. The default implementation routes by
/// protocol; tests substitute their own.
pub trait CollectorFactory: Send + Sync + std::fmt::Debug {
    fn build(&self, device: &Device, tags: Vec<Tag>) -> Result<Arc<dyn Collector>>;
}

/// Routes devices onto the registered session factories by protocol. The
/// simulation factory is always present; real drivers register themselves at
/// host startup. With `simulation` forced in config, every device runs
/// against the simulator regardless of protocol.
#[derive(Debug)]
pub struct ProtocolCollectorFactory {
    pipeline: TelemetryPipeline,
    clock: Arc<dyn Clock>,
    config: CollectorsConfig,
    polling: HashMap<Protocol, Arc<dyn TagSessionFactory>>,
    subscription: HashMap<Protocol, Arc<dyn SubscriptionSessionFactory>>,
    sim: Arc<SimSessionFactory>,
}

impl ProtocolCollectorFactory {
    pub fn new(
        pipeline: TelemetryPipeline,
        clock: Arc<dyn Clock>,
        config: CollectorsConfig,
    ) -> Self {
        let sim = Arc::new(SimSessionFactory::new(Arc::clone(&clock)));
        Self {
            pipeline,
            clock,
            config,
            polling: HashMap::new(),
            subscription: HashMap::new(),
            sim,
        }
    }

    pub fn register_polling(
        &mut self,
        protocol: Protocol,
        factory: Arc<dyn TagSessionFactory>,
    ) -> &mut Self {
        self.polling.insert(protocol, factory);
        self
    }

    pub fn register_subscription(
        &mut self,
        protocol: Protocol,
        factory: Arc<dyn SubscriptionSessionFactory>,
    ) -> &mut Self {
        self.subscription.insert(protocol, factory);
        self
    }
}

impl CollectorFactory for ProtocolCollectorFactory {
    fn build(&self, device: &Device, tags: Vec<Tag>) -> Result<Arc<dyn Collector>> {
        if self.config.simulation || device.protocol == Protocol::Simulation {
            return Ok(Arc::new(PollingCollector::new(
                device.clone(),
                tags,
                Arc::clone(&self.sim) as Arc<dyn TagSessionFactory>,
                self.pipeline.clone(),
                Arc::clone(&self.clock),
                self.config.clone(),
            )));
        }

        match device.protocol {
            Protocol::LibPlcTag | Protocol::Modbus | Protocol::S7 => {
                let factory = self.polling.get(&device.protocol).ok_or_else(|| {
                    CoreError::Validation(format!(
                        "no polling driver registered for protocol {}",
                        device.protocol
                    ))
                })?;
                Ok(Arc::new(PollingCollector::new(
                    device.clone(),
                    tags,
                    Arc::clone(factory),
                    self.pipeline.clone(),
                    Arc::clone(&self.clock),
                    self.config.clone(),
                )))
            }
            Protocol::OpcUa | Protocol::Mqtt => {
                let factory = self.subscription.get(&device.protocol).ok_or_else(|| {
                    CoreError::Validation(format!(
                        "no subscription driver registered for protocol {}",
                        device.protocol
                    ))
                })?;
                Ok(Arc::new(SubscriptionCollector::new(
                    device.clone(),
                    tags,
                    Arc::clone(factory),
                    self.pipeline.clone(),
                    self.config.clone(),
                )))
            }
            Protocol::Simulation => unreachable!("handled above"),
        }
    }
}

#[derive(Debug)]
struct ActiveCollector {
    collector: Arc<dyn Collector>,
    task: JoinHandle<()>,
    connection_fingerprint: u64,
    tags_fingerprint: u64,
}

fn tags_fingerprint(tags: &[Tag]) -> u64 {
    let mut entries: Vec<_> = tags
        .iter()
        .map(|t| {
            (
                t.id.as_str().to_owned(),
                t.enabled,
                t.scan_interval_ms,
                t.address.clone(),
                t.data_type.as_str(),
            )
        })
        .collect();
    entries.sort();
    let mut hasher = std::hash::DefaultHasher::new();
    entries.hash(&mut hasher);
    hasher.finish()
}

/// Owns every collector lifecycle.
#[derive(Debug)]
pub struct CollectorSupervisor {
    devices: Arc<dyn DeviceStore>,
    tags: Arc<dyn TagStore>,
    factory: Arc<dyn CollectorFactory>,
    active: tokio::sync::Mutex<HashMap<DeviceId, ActiveCollector>>,
}

impl CollectorSupervisor {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        tags: Arc<dyn TagStore>,
        factory: Arc<dyn CollectorFactory>,
    ) -> Self {
        Self {
            devices,
            tags,
            factory,
            active: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Diff the durable configuration against the running set and converge.
    /// Idempotent; safe to call from the revision watcher and at startup.
    pub async fn reload(&self) -> Result<()> {
        let devices = self.devices.list_enabled_devices().await?;
        let mut desired: HashMap<DeviceId, (Device, Vec<Tag>)> = HashMap::new();
        for device in devices {
            let tags = self.tags.list_tags(device.id).await?;
            desired.insert(device.id, (device, tags));
        }

        let mut active = self.active.lock().await;

        let removed: Vec<DeviceId> = active
            .keys()
            .filter(|id| !desired.contains_key(id))
            .copied()
            .collect();
        for id in removed {
            if let Some(entry) = active.remove(&id) {
                info!(device = %id, "stopping collector (device removed or disabled)");
                Self::stop_entry(entry).await;
            }
        }

        for (id, (device, tags)) in desired {
            let connection_fingerprint = device.connection_fingerprint();
            let new_tags_fingerprint = tags_fingerprint(&tags);

            let running = active.get(&id).map(|e| e.connection_fingerprint);
            match running {
                None => {
                    match self.start_collector(&device, tags, connection_fingerprint, new_tags_fingerprint) {
                        Ok(entry) => {
                            active.insert(id, entry);
                        }
                        Err(e) => warn!(device = %id, error = %e, "collector not started"),
                    }
                }
                Some(fingerprint) if fingerprint != connection_fingerprint => {
                    info!(device = %id, "restarting collector (connection change)");
                    if let Some(old) = active.remove(&id) {
                        Self::stop_entry(old).await;
                    }
                    match self.start_collector(&device, tags, connection_fingerprint, new_tags_fingerprint) {
                        Ok(entry) => {
                            active.insert(id, entry);
                        }
                        Err(e) => warn!(device = %id, error = %e, "collector not restarted"),
                    }
                }
                Some(_) => {
                    if let Some(entry) = active.get_mut(&id)
                        && entry.tags_fingerprint != new_tags_fingerprint
                    {
                        info!(device = %id, "applying tag changes in place");
                        entry.collector.apply_tags(tags);
                        entry.tags_fingerprint = new_tags_fingerprint;
                    }
                }
            }
        }

        Ok(())
    }

    fn start_collector(
        &self,
        device: &Device,
        tags: Vec<Tag>,
        connection_fingerprint: u64,
        tags_fingerprint: u64,
    ) -> Result<ActiveCollector> {
        let collector = self.factory.build(device, tags)?;
        info!(device = %device.id, protocol = %device.protocol, "starting collector");
        let task = Arc::clone(&collector).start();
        Ok(ActiveCollector {
            collector,
            task,
            connection_fingerprint,
            tags_fingerprint,
        })
    }

    async fn stop_entry(entry: ActiveCollector) {
        entry.collector.stop();
        if let Err(e) = entry.task.await {
            error!(error = %e, "collector task join failed");
        }
    }

    /// Stop every collector. Collectors drain their in-flight read first.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        for (id, entry) in active.drain() {
            info!(device = %id, "stopping collector");
            Self::stop_entry(entry).await;
        }
    }

    pub async fn health(&self) -> Vec<CollectorHealth> {
        let active = self.active.lock().await;
        active.values().map(|entry| entry.collector.health()).collect()
    }
}

#[async_trait]
impl RevisionListener for CollectorSupervisor {
    fn name(&self) -> &str {
        "collector-supervisor"
    }

    async fn on_changed(&self, _revision: i64) -> Result<()> {
        self.reload().await
    }
}
