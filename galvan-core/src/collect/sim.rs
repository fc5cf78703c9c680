//! Deterministic simulation sessions.
//!
//! Implements the same session capabilities as the real protocol drivers but
//! generates per-tag waveforms locally, so development setups and integration
//! tests run without any external device. Waveforms are selected by explicit
//! `sim.waveform` tag metadata or tag-name heuristics, and seeded from the
//! tag name so runs are reproducible.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use galvan_model::{Device, Quality, Tag, TagId, TelemetryValue, ValueType};

use crate::clock::Clock;
use crate::collect::{
    SubscriptionSession, SubscriptionSessionFactory, TagNotification, TagSession,
    TagSessionFactory,
};
use crate::error::Result;

/// Waveform shapes the simulator can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Sawtooth,
    RandomWalk,
    Step,
    Counter,
}

impl Waveform {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sine" => Some(Waveform::Sine),
            "sawtooth" => Some(Waveform::Sawtooth),
            "random_walk" => Some(Waveform::RandomWalk),
            "step" => Some(Waveform::Step),
            "counter" => Some(Waveform::Counter),
            _ => None,
        }
    }

    /// Explicit `sim.waveform` metadata wins; otherwise guess from the name.
    pub fn for_tag(tag: &Tag) -> Self {
        if let Some(w) = tag.metadata.get("sim.waveform").and_then(|s| Self::parse(s)) {
            return w;
        }
        let name = tag.name.to_ascii_lowercase();
        if name.contains("count") || name.contains("total") {
            Waveform::Counter
        } else if name.contains("state") || name.contains("mode") || name.contains("valve") {
            Waveform::Step
        } else if name.contains("flow") || name.contains("level") {
            Waveform::Sawtooth
        } else if name.contains("temp")
            || name.contains("current")
            || name.contains("press")
            || name.contains("speed")
            || name.contains("rpm")
        {
            Waveform::Sine
        } else {
            Waveform::RandomWalk
        }
    }
}

fn tag_seed(tag: &Tag) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    tag.name.hash(&mut hasher);
    hasher.finish()
}

/// Per-tag waveform state.
#[derive(Debug)]
struct WaveformGenerator {
    waveform: Waveform,
    phase: f64,
    walk: f64,
    rng: StdRng,
}

impl WaveformGenerator {
    fn for_tag(tag: &Tag) -> Self {
        let seed = tag_seed(tag);
        Self {
            waveform: Waveform::for_tag(tag),
            phase: (seed % 1_000) as f64 / 1_000.0 * std::f64::consts::TAU,
            walk: 50.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn value_at(&mut self, t_ms: i64) -> f64 {
        let t = t_ms as f64 / 1_000.0;
        match self.waveform {
            Waveform::Sine => 50.0 + 30.0 * (std::f64::consts::TAU * t / 10.0 + self.phase).sin(),
            Waveform::Sawtooth => (t % 10.0) / 10.0 * 100.0,
            Waveform::Step => {
                if (t_ms / 5_000) % 2 == 0 {
                    0.0
                } else {
                    100.0
                }
            }
            Waveform::Counter => (t_ms / 1_000) as f64,
            Waveform::RandomWalk => {
                self.walk = (self.walk + self.rng.random_range(-1.0..=1.0)).clamp(0.0, 100.0);
                self.walk
            }
        }
    }
}

/// Coerce the raw waveform value into the tag's declared data type.
fn typed_value(data_type: ValueType, raw: f64) -> TelemetryValue {
    match data_type {
        ValueType::Bool => TelemetryValue::Bool(raw > 50.0),
        ValueType::Int8 => TelemetryValue::Int8(raw as i8),
        ValueType::Int16 => TelemetryValue::Int16(raw as i16),
        ValueType::Int32 => TelemetryValue::Int32(raw as i32),
        ValueType::Int64 => TelemetryValue::Int64(raw as i64),
        ValueType::UInt8 => TelemetryValue::UInt8(raw.max(0.0) as u8),
        ValueType::UInt16 => TelemetryValue::UInt16(raw.max(0.0) as u16),
        ValueType::UInt32 => TelemetryValue::UInt32(raw.max(0.0) as u32),
        ValueType::UInt64 => TelemetryValue::UInt64(raw.max(0.0) as u64),
        ValueType::Float32 => TelemetryValue::Float32(raw as f32),
        ValueType::Float64 => TelemetryValue::Float64(raw),
        ValueType::String => TelemetryValue::String(format!("{raw:.2}")),
        ValueType::ByteArray => TelemetryValue::ByteArray(raw.to_be_bytes().to_vec()),
        ValueType::DateTime => TelemetryValue::DateTime(chrono::Utc::now()),
    }
}

/// Opens simulation sessions for any device.
#[derive(Debug)]
pub struct SimSessionFactory {
    clock: Arc<dyn Clock>,
}

impl SimSessionFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl TagSessionFactory for SimSessionFactory {
    async fn connect(&self, device: &Device) -> Result<Box<dyn TagSession>> {
        debug!(device = %device.id, "simulation polling session opened");
        Ok(Box::new(SimTagSession {
            clock: Arc::clone(&self.clock),
            generators: HashMap::new(),
        }))
    }
}

#[async_trait]
impl SubscriptionSessionFactory for SimSessionFactory {
    async fn connect(&self, device: &Device) -> Result<Box<dyn SubscriptionSession>> {
        debug!(device = %device.id, "simulation subscription session opened");
        Ok(Box::new(SimSubscriptionSession {
            clock: Arc::clone(&self.clock),
            task: None,
        }))
    }
}

struct SimTagSession {
    clock: Arc<dyn Clock>,
    generators: HashMap<TagId, WaveformGenerator>,
}

#[async_trait]
impl TagSession for SimTagSession {
    async fn read(&mut self, tag: &Tag) -> Result<TelemetryValue> {
        let generator = self
            .generators
            .entry(tag.id.clone())
            .or_insert_with(|| WaveformGenerator::for_tag(tag));
        let raw = generator.value_at(self.clock.now_ms());
        Ok(typed_value(tag.data_type, raw))
    }

    async fn disconnect(&mut self) {}
}

struct SimSubscriptionSession {
    clock: Arc<dyn Clock>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl SubscriptionSession for SimSubscriptionSession {
    async fn subscribe(&mut self, tags: &[Tag]) -> Result<mpsc::Receiver<TagNotification>> {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let (tx, rx) = mpsc::channel(1024);
        let clock = Arc::clone(&self.clock);
        let tags: Vec<Tag> = tags.to_vec();
        self.task = Some(tokio::spawn(async move {
            if tags.is_empty() {
                // Keep the channel open so the collector does not treat an
                // empty tag set as a lost session.
                std::future::pending::<()>().await;
            }
            let mut generators: HashMap<TagId, WaveformGenerator> = HashMap::new();
            let mut due: HashMap<TagId, i64> = HashMap::new();
            let now = clock.now_ms();
            for tag in &tags {
                due.insert(tag.id.clone(), now);
            }
            loop {
                let now = clock.now_ms();
                let Some(next_due) = due.values().copied().min() else {
                    return;
                };
                if next_due > now {
                    tokio::time::sleep(Duration::from_millis((next_due - now) as u64)).await;
                }
                let now = clock.now_ms();
                for tag in &tags {
                    let Some(tag_due) = due.get(&tag.id).copied() else {
                        continue;
                    };
                    if tag_due > now {
                        continue;
                    }
                    let generator = generators
                        .entry(tag.id.clone())
                        .or_insert_with(|| WaveformGenerator::for_tag(tag));
                    let notification = TagNotification {
                        tag_id: tag.id.clone(),
                        ts_ms: now,
                        value: typed_value(tag.data_type, generator.value_at(now)),
                        quality: Quality::GOOD,
                    };
                    if tx.send(notification).await.is_err() {
                        return;
                    }
                    due.insert(tag.id.clone(), now + tag.scan_interval_ms.max(100) as i64);
                }
            }
        }));
        Ok(rx)
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galvan_model::DeviceId;

    fn tag(name: &str, data_type: ValueType) -> Tag {
        Tag::new(DeviceId::new(), name, data_type, name, 100)
    }

    #[test]
    fn metadata_overrides_name_heuristics() {
        let mut t = tag("DMP_01_CURRENT", ValueType::Float64);
        assert_eq!(Waveform::for_tag(&t), Waveform::Sine);
        t.metadata
            .insert("sim.waveform".into(), "counter".into());
        assert_eq!(Waveform::for_tag(&t), Waveform::Counter);
    }

    #[test]
    fn waveforms_are_deterministic_per_tag() {
        let t = tag("MIX_RANDOM", ValueType::Float64);
        let mut a = WaveformGenerator::for_tag(&t);
        let mut b = WaveformGenerator::for_tag(&t);
        for ts in (0..10_000).step_by(500) {
            assert_eq!(a.value_at(ts), b.value_at(ts));
        }
    }

    #[test]
    fn counter_waveform_is_monotonic() {
        let t = tag("BATCH_COUNT", ValueType::Int64);
        assert_eq!(Waveform::for_tag(&t), Waveform::Counter);
        let mut g = WaveformGenerator::for_tag(&t);
        assert!(g.value_at(10_000) > g.value_at(2_000));
    }

    #[tokio::test]
    async fn polling_session_types_values_per_tag() {
        let clock = crate::clock::ManualClock::new(7_000);
        let factory = SimSessionFactory::new(clock);
        let device = Device {
            id: DeviceId::new(),
            name: "sim".into(),
            protocol: galvan_model::Protocol::Simulation,
            host: String::new(),
            port: 0,
            connection_string: None,
            enabled: true,
            metadata: Default::default(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let mut session = TagSessionFactory::connect(&factory, &device).await.unwrap();

        let bool_tag = tag("RUN_STATE", ValueType::Bool);
        assert!(matches!(
            session.read(&bool_tag).await.unwrap(),
            TelemetryValue::Bool(_)
        ));

        let float_tag = tag("OVEN_TEMP", ValueType::Float64);
        assert!(matches!(
            session.read(&float_tag).await.unwrap(),
            TelemetryValue::Float64(_)
        ));
    }
}
