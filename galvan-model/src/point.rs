use std::sync::atomic::{AtomicU64, Ordering};

use crate::ids::{DeviceId, TagId};
use crate::value::{Quality, TelemetryValue};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Allocate the next process-wide sequence number.
///
/// Timestamps from field devices are only millisecond-granular and can
/// collide; `(ts, seq)` together give every point a total order within a
/// process, which range cursors rely on.
pub fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// One typed reading of one tag at one timestamp.
///
/// `(device_id, tag_id, ts_ms, seq)` uniquely identifies a point. Writes
/// preserve source ordering within a single `(device_id, tag_id)` as observed
/// at the collector.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetryPoint {
    pub device_id: DeviceId,
    pub tag_id: TagId,
    /// Sample timestamp, UTC milliseconds.
    pub ts_ms: i64,
    /// Per-process monotonic tiebreaker for equal timestamps.
    pub seq: u64,
    pub value: TelemetryValue,
    pub quality: Quality,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub unit: Option<String>,
}

impl TelemetryPoint {
    pub fn new(
        device_id: DeviceId,
        tag_id: TagId,
        ts_ms: i64,
        value: TelemetryValue,
    ) -> Self {
        Self {
            device_id,
            tag_id,
            ts_ms,
            seq: next_seq(),
            value,
            quality: Quality::GOOD,
            unit: None,
        }
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Key identifying the series this point belongs to.
    pub fn series_key(&self) -> (DeviceId, TagId) {
        (self.device_id, self.tag_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TelemetryValue;

    #[test]
    fn seq_is_monotonic_within_process() {
        let device = DeviceId::new();
        let a = TelemetryPoint::new(device, "T1".into(), 0, TelemetryValue::Float64(1.0));
        let b = TelemetryPoint::new(device, "T1".into(), 0, TelemetryValue::Float64(2.0));
        assert!(b.seq > a.seq);
    }
}
