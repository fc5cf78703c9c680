//! Subscription acquisition loop (OPC UA style): per-tag subscriptions
//! deliver change notifications; session loss tears all subscriptions down
//! and they are recreated after reconnect.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use galvan_config::CollectorsConfig;
use galvan_model::{Device, DeviceId, Tag, TelemetryPoint};

use crate::collect::backoff::ReconnectBackoff;
use crate::collect::{
    Collector, CollectorHealth, CollectorState, SubscriptionSession, SubscriptionSessionFactory,
};
use crate::pipeline::TelemetryPipeline;

#[derive(Debug)]
pub struct SubscriptionCollector {
    device: Device,
    factory: Arc<dyn SubscriptionSessionFactory>,
    pipeline: TelemetryPipeline,
    config: CollectorsConfig,
    tags_tx: watch::Sender<Arc<Vec<Tag>>>,
    state_tx: watch::Sender<CollectorState>,
    cancel: CancellationToken,
    samples: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SubscriptionCollector {
    pub fn new(
        device: Device,
        tags: Vec<Tag>,
        factory: Arc<dyn SubscriptionSessionFactory>,
        pipeline: TelemetryPipeline,
        config: CollectorsConfig,
    ) -> Self {
        let (tags_tx, _) = watch::channel(Arc::new(tags));
        let (state_tx, _) = watch::channel(CollectorState::Disconnected);
        Self {
            device,
            factory,
            pipeline,
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
                    if !self.consume_session(session).await {
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

    /// Consume notifications until the session is lost (`true`) or stop is
    /// requested (`false`).
    async fn consume_session(&self, mut session: Box<dyn SubscriptionSession>) -> bool {
        let mut tags_rx = self.tags_tx.subscribe();

        let tags = Arc::clone(&*self.tags_tx.borrow());
        let enabled: Vec<Tag> = tags.iter().filter(|t| t.enabled).cloned().collect();
        let mut notifications = match session.subscribe(&enabled).await {
            Ok(rx) => rx,
            Err(e) => {
                self.record_error(&e);
                warn!(device = %self.device.id, error = %e, "subscribe failed");
                session.disconnect().await;
                return true;
            }
        };
        self.set_state(CollectorState::Connected);
        info!(device = %self.device.id, subscriptions = enabled.len(), "collector connected");

        loop {
            tokio::select! {
                notification = notifications.recv() => {
                    match notification {
                        Some(n) => {
                            let point = TelemetryPoint::new(
                                self.device.id,
                                n.tag_id,
                                n.ts_ms,
                                n.value,
                            )
                            .with_quality(n.quality);
                            self.pipeline.write(point);
                            self.samples.fetch_add(1, Ordering::Relaxed);
                        }
                        None => {
                            // Channel closed means the session dropped; every
                            // subscription dies with it.
                            self.record_error("subscription channel closed");
                            warn!(device = %self.device.id, "session lost, reconnecting");
                            session.disconnect().await;
                            return true;
                        }
                    }
                }
                _ = tags_rx.changed() => {
                    // Tag changes re-subscribe in place without a reconnect.
                    let tags = Arc::clone(&*self.tags_tx.borrow());
                    let enabled: Vec<Tag> = tags.iter().filter(|t| t.enabled).cloned().collect();
                    match session.subscribe(&enabled).await {
                        Ok(rx) => {
                            notifications = rx;
                            info!(device = %self.device.id, subscriptions = enabled.len(), "resubscribed");
                        }
                        Err(e) => {
                            self.record_error(&e);
                            warn!(device = %self.device.id, error = %e, "resubscribe failed, reconnecting");
                            session.disconnect().await;
                            return true;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    session.disconnect().await;
                    return false;
                }
            }
        }
    }
}

#[async_trait]
impl Collector for SubscriptionCollector {
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
