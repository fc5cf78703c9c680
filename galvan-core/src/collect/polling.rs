//! Polling acquisition loop (tag-protocol style): read each enabled tag at
//! its own scan interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use galvan_config::CollectorsConfig;
use galvan_model::{Device, DeviceId, Tag, TagId, TelemetryPoint};

use crate::clock::Clock;
use crate::collect::backoff::ReconnectBackoff;
use crate::collect::{Collector, CollectorHealth, CollectorState, TagSession, TagSessionFactory};
use crate::pipeline::TelemetryPipeline;

/// Idle wait when the device has no enabled tags.
const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct PollingCollector {
    device: Device,
    factory: Arc<dyn TagSessionFactory>,
    pipeline: TelemetryPipeline,
    clock: Arc<dyn Clock>,
    config: CollectorsConfig,
    tags_tx: watch::Sender<Arc<Vec<Tag>>>,
    state_tx: watch::Sender<CollectorState>,
    cancel: CancellationToken,
    samples: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl PollingCollector {
    pub fn new(
        device: Device,
        tags: Vec<Tag>,
        factory: Arc<dyn TagSessionFactory>,
        pipeline: TelemetryPipeline,
        clock: Arc<dyn Clock>,
        config: CollectorsConfig,
    ) -> Self {
        let (tags_tx, _) = watch::channel(Arc::new(tags));
        let (state_tx, _) = watch::channel(CollectorState::Disconnected);
        Self {
            device,
            factory,
            pipeline,
            clock,
            config,
            tags_tx,
            state_tx,
            cancel: CancellationToken::new(),
            samples: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn set_state(&self, state: CollectorState) {
        self.state_tx.send_replace(state);
    }

    fn record_error(&self, error: impl ToString) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error.to_string());
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = ReconnectBackoff::new(
            Duration::from_millis(self.config.reconnect_initial_ms),
            Duration::from_millis(self.config.reconnect_max_ms),
        );
        let mut first_attempt = true;

        while !self.cancel.is_cancelled() {
            self.set_state(if first_attempt {
                CollectorState::Connecting
            } else {
                CollectorState::Reconnecting
            });

            match self.factory.connect(&self.device).await {
                Ok(session) => {
                    backoff.reset();
                    first_attempt = false;
                    self.set_state(CollectorState::Connected);
                    info!(device = %self.device.id, "collector connected");
                    if !self.poll_session(session).await {
                        break;
                    }
                    self.set_state(CollectorState::Reconnecting);
                }
                Err(e) => {
                    first_attempt = false;
                    self.record_error(&e);
                    warn!(device = %self.device.id, error = %e, "connect failed");
                }
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        self.set_state(CollectorState::Stopped);
        info!(device = %self.device.id, "collector stopped");
    }

    /// Poll until the session is lost (`true`) or stop is requested
    /// (`false`). The in-flight read always completes before returning.
    async fn poll_session(&self, mut session: Box<dyn TagSession>) -> bool {
        let mut tags_rx = self.tags_tx.subscribe();
        let mut due: HashMap<TagId, i64> = HashMap::new();

        loop {
            if self.cancel.is_cancelled() {
                session.disconnect().await;
                return false;
            }

            let tags = Arc::clone(&*self.tags_tx.borrow());
            due.retain(|id, _| tags.iter().any(|t| &t.id == id && t.enabled));

            let now = self.clock.now_ms();
            let mut next_due = i64::MAX;
            for tag in tags.iter().filter(|t| t.enabled) {
                let tag_due = *due.entry(tag.id.clone()).or_insert(now);
                next_due = next_due.min(tag_due);
            }

            if next_due == i64::MAX {
                // No enabled tags; wait for a config change.
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_WAIT) => {}
                    _ = tags_rx.changed() => {}
                    _ = self.cancel.cancelled() => {}
                }
                continue;
            }

            if next_due > now {
                let wait = Duration::from_millis((next_due - now) as u64);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = tags_rx.changed() => continue,
                    _ = self.cancel.cancelled() => continue,
                }
            }

            let now = self.clock.now_ms();
            for tag in tags.iter().filter(|t| t.enabled) {
                let Some(tag_due) = due.get(&tag.id).copied() else {
                    continue;
                };
                if tag_due > now {
                    continue;
                }
                let interval = self.interval_ms(tag) as i64;
                if now - tag_due > interval {
                    // A missed deadline is logged but never aborts the loop.
                    debug!(
                        device = %self.device.id,
                        tag = %tag.id,
                        late_ms = now - tag_due,
                        "missed scan deadline"
                    );
                }

                match session.read(tag).await {
                    Ok(value) => {
                        let point = TelemetryPoint::new(
                            self.device.id,
                            tag.id.clone(),
                            self.clock.now_ms(),
                            value,
                        );
                        self.pipeline.write(point);
                        self.samples.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.record_error(&e);
                        warn!(device = %self.device.id, tag = %tag.id, error = %e, "read failed, reconnecting");
                        session.disconnect().await;
                        return true;
                    }
                }
                due.insert(tag.id.clone(), self.clock.now_ms() + interval);
            }
        }
    }

    fn interval_ms(&self, tag: &Tag) -> u64 {
        if tag.scan_interval_ms == 0 {
            self.config.default_scan_interval_ms
        } else {
            tag.scan_interval_ms
        }
    }
}

#[async_trait]
impl Collector for PollingCollector {
    fn device_id(&self) -> DeviceId {
        self.device.id
    }

    fn state(&self) -> watch::Receiver<CollectorState> {
        self.state_tx.subscribe()
    }

    fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn apply_tags(&self, tags: Vec<Tag>) {
        self.tags_tx.send_replace(Arc::new(tags));
    }

    fn health(&self) -> CollectorHealth {
        CollectorHealth {
            device_id: self.device.id,
            state: *self.state_tx.borrow(),
            samples_emitted: self.samples.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}
