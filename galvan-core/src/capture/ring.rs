//! Pre-trigger ring buffers.

use std::collections::{HashMap, VecDeque};

use galvan_model::{TagId, TelemetryPoint};

/// Per-tag circular buffers retaining at least `window_ms` of lookback,
/// bounded by a hard per-tag cap. Seeds the pre-buffer window of a segment
/// when a rule triggers.
#[derive(Debug)]
pub struct PreBuffer {
    buffers: HashMap<TagId, VecDeque<TelemetryPoint>>,
    window_ms: i64,
    cap_per_tag: usize,
}

impl PreBuffer {
    pub fn new(window_ms: i64, cap_per_tag: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            window_ms,
            cap_per_tag: cap_per_tag.max(1),
        }
    }

    pub fn push(&mut self, point: TelemetryPoint) {
        let buffer = self.buffers.entry(point.tag_id.clone()).or_default();
        buffer.push_back(point);
        while buffer.len() > self.cap_per_tag {
            buffer.pop_front();
        }
    }

    /// Drop samples older than the lookback window relative to `now_ms`.
    pub fn prune(&mut self, now_ms: i64) {
        let horizon = now_ms - self.window_ms;
        for buffer in self.buffers.values_mut() {
            while buffer.front().is_some_and(|p| p.ts_ms < horizon) {
                buffer.pop_front();
            }
        }
    }

    /// Samples with `from_ms <= ts < to_ms`, ordered per tag.
    pub fn range(&self, from_ms: i64, to_ms: i64) -> Vec<TelemetryPoint> {
        let mut points: Vec<TelemetryPoint> = self
            .buffers
            .values()
            .flatten()
            .filter(|p| p.ts_ms >= from_ms && p.ts_ms < to_ms)
            .cloned()
            .collect();
        points.sort_by_key(|p| (p.ts_ms, p.seq));
        points
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    pub fn len(&self) -> usize {
        self.buffers.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galvan_model::{DeviceId, TelemetryValue};

    fn point(device: DeviceId, tag: &str, ts: i64) -> TelemetryPoint {
        TelemetryPoint::new(device, tag.into(), ts, TelemetryValue::Float64(ts as f64))
    }

    #[test]
    fn prune_respects_window() {
        let device = DeviceId::new();
        let mut ring = PreBuffer::new(5_000, 100);
        for ts in (0..10_000).step_by(1_000) {
            ring.push(point(device, "T1", ts));
        }
        ring.prune(10_000);
        let remaining = ring.range(0, i64::MAX);
        assert!(remaining.iter().all(|p| p.ts_ms >= 5_000));
        assert_eq!(remaining.len(), 5);
    }

    #[test]
    fn cap_bounds_each_tag() {
        let device = DeviceId::new();
        let mut ring = PreBuffer::new(60_000, 3);
        for ts in 0..10 {
            ring.push(point(device, "T1", ts));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.range(0, i64::MAX).first().unwrap().ts_ms, 7);
    }

    #[test]
    fn range_is_half_open_and_ordered() {
        let device = DeviceId::new();
        let mut ring = PreBuffer::new(60_000, 100);
        ring.push(point(device, "B", 2));
        ring.push(point(device, "A", 1));
        ring.push(point(device, "A", 3));
        let points = ring.range(1, 3);
        let ts: Vec<i64> = points.iter().map(|p| p.ts_ms).collect();
        assert_eq!(ts, vec![1, 2]);
    }
}
