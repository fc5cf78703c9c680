//! In-process live broadcast hub.
//!
//! Fans samples and engine events out to subscribers inside the process (or
//! to whatever transport a host wires up). This keeps the wiring flexible
//! while the delivery mechanism itself stays out of the core.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use galvan_model::{AlarmRecord, CollectionSegment, DeviceId, TelemetryPoint};

use crate::dispatch::SampleSink;
use crate::error::Result;

/// Events observable on the hub.
#[derive(Debug, Clone)]
pub enum BroadcastEvent {
    Sample(TelemetryPoint),
    AlarmCreated(AlarmRecord),
    SegmentCompleted(CollectionSegment),
}

impl BroadcastEvent {
    pub fn device_id(&self) -> DeviceId {
        match self {
            BroadcastEvent::Sample(p) => p.device_id,
            BroadcastEvent::AlarmCreated(a) => a.device_id,
            BroadcastEvent::SegmentCompleted(s) => s.device_id,
        }
    }
}

/// Per-subscriber group filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSelector {
    All,
    Device(DeviceId),
}

impl GroupSelector {
    pub fn matches(&self, event: &BroadcastEvent) -> bool {
        match self {
            GroupSelector::All => true,
            GroupSelector::Device(device_id) => event.device_id() == *device_id,
        }
    }
}

/// Lightweight in-process event hub that fans out samples and engine events
/// to observers. Subscribers that fall behind observe `Lagged` per tokio
/// broadcast semantics rather than slowing producers down.
#[derive(Debug)]
pub struct BroadcastHub {
    sender: broadcast::Sender<BroadcastEvent>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn publish(&self, event: BroadcastEvent) {
        // No subscribers is fine; the hub is fire-and-forget.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self, selector: GroupSelector) -> BroadcastSubscription {
        BroadcastSubscription {
            rx: self.sender.subscribe(),
            selector,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One filtered subscription onto the hub.
#[derive(Debug)]
pub struct BroadcastSubscription {
    rx: broadcast::Receiver<BroadcastEvent>,
    selector: GroupSelector,
}

impl BroadcastSubscription {
    /// Next event matching this subscription's selector.
    pub async fn recv(&mut self) -> std::result::Result<BroadcastEvent, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if self.selector.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// The dispatcher sink that feeds samples onto the hub. The only sink with
/// per-subscriber group filtering, which happens on the subscription side.
#[derive(Debug)]
pub struct BroadcastSink {
    hub: Arc<BroadcastHub>,
}

impl BroadcastSink {
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl SampleSink for BroadcastSink {
    fn name(&self) -> &str {
        "live-broadcast"
    }

    async fn deliver(&self, point: TelemetryPoint) -> Result<()> {
        self.hub.publish(BroadcastEvent::Sample(point));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galvan_model::TelemetryValue;

    fn sample(device_id: DeviceId, ts: i64) -> BroadcastEvent {
        BroadcastEvent::Sample(TelemetryPoint::new(
            device_id,
            "T1".into(),
            ts,
            TelemetryValue::Float64(0.0),
        ))
    }

    #[tokio::test]
    async fn device_selector_filters_other_devices() {
        let hub = BroadcastHub::new(16);
        let wanted = DeviceId::new();
        let other = DeviceId::new();
        let mut sub = hub.subscribe(GroupSelector::Device(wanted));

        hub.publish(sample(other, 1));
        hub.publish(sample(wanted, 2));

        let event = sub.recv().await.unwrap();
        match event {
            BroadcastEvent::Sample(p) => {
                assert_eq!(p.device_id, wanted);
                assert_eq!(p.ts_ms, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_selector_sees_everything() {
        let hub = BroadcastHub::new(16);
        let mut sub = hub.subscribe(GroupSelector::All);
        hub.publish(sample(DeviceId::new(), 1));
        assert!(matches!(sub.recv().await, Ok(BroadcastEvent::Sample(_))));
    }
}
