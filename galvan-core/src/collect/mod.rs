//! Collector framework.
//!
//! A collector owns the acquisition loop for exactly one device and feeds
//! samples into the pipeline. Concrete wire protocols live behind the
//! [`TagSession`] / [`SubscriptionSession`] capabilities so the framework
//! (and its tests) never touch a real device; the simulation sessions in
//! [`sim`] implement the same capabilities with deterministic waveforms.

pub mod backoff;
pub mod polling;
pub mod sim;
pub mod subscription;
pub mod supervisor;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use galvan_model::{Device, DeviceId, Quality, Tag, TagId, TelemetryValue};

use crate::error::Result;

/// Lifecycle states of a collector. `Stopped` is terminal for the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

/// Health report surfaced to the supervisor.
#[derive(Debug, Clone)]
pub struct CollectorHealth {
    pub device_id: DeviceId,
    pub state: CollectorState,
    pub samples_emitted: u64,
    pub last_error: Option<String>,
}

/// Capability set the supervisor sees. Protocol variants live behind it.
#[async_trait]
pub trait Collector: Send + Sync + std::fmt::Debug {
    fn device_id(&self) -> DeviceId;

    /// Watchable lifecycle state.
    fn state(&self) -> watch::Receiver<CollectorState>;

    /// Spawn the acquisition loop.
    fn start(self: std::sync::Arc<Self>) -> JoinHandle<()>;

    /// Request stop. The loop drains any in-flight read and exits; the
    /// instance cannot be restarted.
    fn stop(&self);

    /// Apply a tag-set or scan-interval change in place, without a
    /// reconnect, where the protocol permits.
    fn apply_tags(&self, tags: Vec<Tag>);

    fn health(&self) -> CollectorHealth;
}

/// One change notification from a subscription session.
#[derive(Debug, Clone)]
pub struct TagNotification {
    pub tag_id: TagId,
    pub ts_ms: i64,
    pub value: TelemetryValue,
    pub quality: Quality,
}

/// A connected polling session: read one tag at a time.
#[async_trait]
pub trait TagSession: Send {
    async fn read(&mut self, tag: &Tag) -> Result<TelemetryValue>;
    async fn disconnect(&mut self);
}

/// Opens polling sessions for a protocol.
#[async_trait]
pub trait TagSessionFactory: Send + Sync + std::fmt::Debug {
    async fn connect(&self, device: &Device) -> Result<Box<dyn TagSession>>;
}

/// A connected subscription session: per-tag subscriptions delivering change
/// notifications. Subscriptions die with the session and are recreated by the
/// collector after reconnect.
#[async_trait]
pub trait SubscriptionSession: Send {
    /// Subscribe every enabled tag at its configured sampling interval.
    /// Notifications arrive on the returned channel; the channel closing
    /// signals session loss.
    async fn subscribe(&mut self, tags: &[Tag]) -> Result<mpsc::Receiver<TagNotification>>;
    async fn disconnect(&mut self);
}

/// Opens subscription sessions for a protocol.
#[async_trait]
pub trait SubscriptionSessionFactory: Send + Sync + std::fmt::Debug {
    async fn connect(&self, device: &Device) -> Result<Box<dyn SubscriptionSession>>;
}
