//! Per-rule capture state machines.
//!
//! Each enabled collection rule runs Idle -> Collecting -> PostBuffer ->
//! Idle. Idle keeps a pre-trigger ring buffer warm; a start trigger opens an
//! Active segment seeded from the ring; a stop trigger starts the post-buffer
//! window; a wall-clock tick finalizes the segment once the window passes.
//! A capture that outlives the hard ceiling is finalized as Aborted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use galvan_config::CaptureConfig;
use galvan_model::prelude::*;

use crate::capture::condition::ConditionTracker;
use crate::capture::ring::PreBuffer;
use crate::clock::Clock;
use crate::dispatch::SampleSink;
use crate::dispatch::broadcast::{BroadcastEvent, BroadcastHub};
use crate::error::Result;
use crate::revision::RevisionListener;
use crate::store::CollectionStore;

/// Segment samples buffered in memory before a store append.
const FLUSH_THRESHOLD: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Collecting,
    PostBuffer,
}

#[derive(Debug)]
struct ActiveSegment {
    id: SegmentId,
    start_ts_ms: i64,
    /// Wall clock when capture began; drives the abort ceiling.
    entered_ms: i64,
    stop_detected_ts: Option<i64>,
    pending: Vec<TelemetryPoint>,
}

#[derive(Debug)]
struct RuleRuntime {
    rule: CollectionRule,
    fingerprint: u64,
    phase: Phase,
    start_tracker: ConditionTracker,
    stop_tracker: ConditionTracker,
    latest: HashMap<TagId, f64>,
    ring: PreBuffer,
    active: Option<ActiveSegment>,
}

impl RuleRuntime {
    fn new(rule: CollectionRule, ring_cap_total: usize) -> Self {
        let fingerprint = rule.evaluation_fingerprint();
        let window_ms = i64::from(rule.config.pre_buffer_seconds) * 1_000;
        let cap_per_tag = (ring_cap_total / rule.config.tag_ids.len().max(1)).max(1);
        Self {
            start_tracker: ConditionTracker::new(rule.start_condition.clone()),
            stop_tracker: ConditionTracker::new(rule.stop_condition.clone()),
            ring: PreBuffer::new(window_ms, cap_per_tag),
            latest: HashMap::new(),
            phase: Phase::Idle,
            active: None,
            fingerprint,
            rule,
        }
    }

    fn post_window_ms(&self) -> i64 {
        i64::from(self.rule.config.post_buffer_seconds) * 1_000
    }
}

#[derive(Debug)]
pub struct CaptureEngine {
    store: Arc<dyn CollectionStore>,
    clock: Arc<dyn Clock>,
    hub: Option<Arc<BroadcastHub>>,
    config: CaptureConfig,
    runtimes: tokio::sync::Mutex<HashMap<RuleId, RuleRuntime>>,
}

impl CaptureEngine {
    pub fn new(
        store: Arc<dyn CollectionStore>,
        clock: Arc<dyn Clock>,
        hub: Option<Arc<BroadcastHub>>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            store,
            clock,
            hub,
            config,
            runtimes: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Load the enabled rule set. Runtimes survive while the rule's
    /// evaluation fingerprint is unchanged; a changed or removed rule aborts
    /// its in-flight capture.
    pub async fn reload_rules(&self) -> Result<()> {
        let rules = self.store.list_enabled_collection_rules().await?;
        let mut runtimes = self.runtimes.lock().await;

        let keep: HashMap<RuleId, u64> = rules
            .iter()
            .map(|r| (r.id, r.evaluation_fingerprint()))
            .collect();

        let stale: Vec<RuleId> = runtimes
            .iter()
            .filter(|(id, rt)| keep.get(id) != Some(&rt.fingerprint))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(mut rt) = runtimes.remove(&id) {
                if rt.active.is_some() {
                    warn!(rule = %id, "rule changed mid-capture, aborting segment");
                    let now = self.clock.now_ms();
                    if let Err(e) = self.finalize(&mut rt, now, SegmentStatus::Aborted).await {
                        error!(rule = %id, error = %e, "failed to abort segment on reload");
                    }
                }
            }
        }

        for rule in rules {
            runtimes
                .entry(rule.id)
                .or_insert_with(|| RuleRuntime::new(rule, self.config.ring_buffer_cap));
        }

        info!(rules = runtimes.len(), "collection rule set reloaded");
        Ok(())
    }

    pub(crate) async fn handle_sample(&self, point: &TelemetryPoint) {
        let mut runtimes = self.runtimes.lock().await;
        for (id, rt) in runtimes.iter_mut() {
            if rt.rule.device_id != point.device_id {
                continue;
            }
            if let Err(e) = self.process_sample(rt, point).await {
                // A faulty rule never takes the stream down; drop its capture
                // and fall back to Idle.
                error!(rule = %id, error = %e, "capture processing failed, resetting rule");
                rt.active = None;
                rt.phase = Phase::Idle;
                rt.start_tracker.reset();
                rt.stop_tracker.reset();
            }
        }
    }

    async fn process_sample(&self, rt: &mut RuleRuntime, point: &TelemetryPoint) -> Result<()> {
        if let Some(value) = point.value.as_f64() {
            rt.latest.insert(point.tag_id.clone(), value);
        }
        let captured = rt.rule.config.captures(&point.tag_id);
        if captured {
            rt.ring.push(point.clone());
        }

        match rt.phase {
            Phase::Idle => {
                let outcome = rt.start_tracker.evaluate(&rt.latest, point.ts_ms);
                if !outcome.fired {
                    return Ok(());
                }
                let start_ts = outcome.effective_ts;
                let pre_ms = i64::from(rt.rule.config.pre_buffer_seconds) * 1_000;
                let segment = CollectionSegment {
                    id: SegmentId::new(),
                    rule_id: rt.rule.id,
                    device_id: rt.rule.device_id,
                    start_ts_ms: start_ts,
                    end_ts_ms: None,
                    status: SegmentStatus::Active,
                };
                self.store.insert_segment(&segment).await?;
                let triggered_at = chrono::DateTime::from_timestamp_millis(self.clock.now_ms())
                    .unwrap_or_else(chrono::Utc::now);
                self.store.record_trigger(rt.rule.id, triggered_at).await?;
                rt.rule.trigger_count += 1;
                rt.rule.last_trigger_at = Some(triggered_at);

                // Seed with the pre-buffer window up to and including the
                // triggering sample; the ring already holds all of it.
                let pending = rt.ring.range(start_ts - pre_ms, point.ts_ms + 1);
                info!(
                    rule = %rt.rule.id,
                    segment = %segment.id,
                    start_ts,
                    seeded = pending.len(),
                    "capture started"
                );
                rt.active = Some(ActiveSegment {
                    id: segment.id,
                    start_ts_ms: start_ts,
                    entered_ms: self.clock.now_ms(),
                    stop_detected_ts: None,
                    pending,
                });
                rt.stop_tracker.reset();
                rt.phase = Phase::Collecting;
                self.maybe_flush(rt).await?;
            }
            Phase::Collecting => {
                if captured
                    && let Some(active) = rt.active.as_mut()
                {
                    active.pending.push(point.clone());
                }
                let outcome = rt.stop_tracker.evaluate(&rt.latest, point.ts_ms);
                if outcome.fired {
                    let stop_ts = outcome.effective_ts;
                    if let Some(active) = rt.active.as_mut() {
                        active.stop_detected_ts = Some(stop_ts);
                    }
                    debug!(rule = %rt.rule.id, stop_ts, "stop condition met, entering post-buffer");
                    rt.phase = Phase::PostBuffer;
                }
                self.maybe_flush(rt).await?;
            }
            Phase::PostBuffer => {
                if captured
                    && let Some(active) = rt.active.as_mut()
                    && let Some(stop_ts) = active.stop_detected_ts
                    && point.ts_ms <= stop_ts + rt.rule.config.post_buffer_seconds as i64 * 1_000
                {
                    active.pending.push(point.clone());
                }
                self.maybe_flush(rt).await?;
            }
        }
        Ok(())
    }

    /// Wall-clock driven work: ring pruning, post-buffer finalization, and
    /// the abort ceiling. Runs from the ticker task so completion does not
    /// depend on further samples arriving.
    pub async fn tick(&self) {
        let now = self.clock.now_ms();
        let mut runtimes = self.runtimes.lock().await;
        for (id, rt) in runtimes.iter_mut() {
            match rt.phase {
                Phase::Idle => rt.ring.prune(now),
                Phase::Collecting | Phase::PostBuffer => {
                    let ceiling_ms = self.config.max_active_secs as i64 * 1_000;
                    let over_ceiling = rt
                        .active
                        .as_ref()
                        .is_some_and(|a| now - a.entered_ms >= ceiling_ms);
                    if over_ceiling {
                        warn!(rule = %id, "capture exceeded hard ceiling, aborting segment");
                        if let Err(e) = self.finalize(rt, now, SegmentStatus::Aborted).await {
                            error!(rule = %id, error = %e, "failed to abort segment");
                        }
                        continue;
                    }

                    let post_elapsed = rt.active.as_ref().and_then(|a| {
                        a.stop_detected_ts
                            .map(|stop| (stop, now > stop + rt.post_window_ms()))
                    });
                    if let Some((stop_ts, true)) = post_elapsed {
                        let end_ts = stop_ts + rt.post_window_ms();
                        if let Err(e) = self.finalize_completed(rt, end_ts).await {
                            error!(rule = %id, error = %e, "failed to complete segment");
                        }
                    }
                }
            }
        }
    }

    async fn maybe_flush(&self, rt: &mut RuleRuntime) -> Result<()> {
        let Some(active) = rt.active.as_mut() else {
            return Ok(());
        };
        if active.pending.len() >= FLUSH_THRESHOLD {
            let pending = std::mem::take(&mut active.pending);
            self.store.append_segment_samples(active.id, &pending).await?;
        }
        Ok(())
    }

    async fn finalize_completed(&self, rt: &mut RuleRuntime, end_ts: i64) -> Result<()> {
        self.finalize(rt, end_ts, SegmentStatus::Completed).await
    }

    async fn finalize(
        &self,
        rt: &mut RuleRuntime,
        end_ts: i64,
        status: SegmentStatus,
    ) -> Result<()> {
        let Some(mut active) = rt.active.take() else {
            rt.phase = Phase::Idle;
            return Ok(());
        };
        let end_ts = end_ts.max(active.start_ts_ms);
        let pending = std::mem::take(&mut active.pending);
        if !pending.is_empty() {
            self.store.append_segment_samples(active.id, &pending).await?;
        }
        self.store.finalize_segment(active.id, end_ts, status).await?;
        info!(
            rule = %rt.rule.id,
            segment = %active.id,
            start_ts = active.start_ts_ms,
            end_ts,
            status = status.as_str(),
            "segment finalized"
        );

        rt.phase = Phase::Idle;
        rt.start_tracker.reset();
        rt.stop_tracker.reset();

        if let Some(hub) = &self.hub {
            hub.publish(BroadcastEvent::SegmentCompleted(CollectionSegment {
                id: active.id,
                rule_id: rt.rule.id,
                device_id: rt.rule.device_id,
                start_ts_ms: active.start_ts_ms,
                end_ts_ms: Some(end_ts),
                status,
            }));
        }
        Ok(())
    }

    /// Spawn the 1 s wall-clock ticker.
    pub fn spawn_ticker(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(std::time::Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[async_trait]
impl SampleSink for CaptureEngine {
    fn name(&self) -> &str {
        "collection-rules"
    }

    async fn deliver(&self, point: TelemetryPoint) -> Result<()> {
        self.handle_sample(&point).await;
        Ok(())
    }
}

#[async_trait]
impl RevisionListener for CaptureEngine {
    fn name(&self) -> &str {
        "collection-rules"
    }

    async fn on_changed(&self, _revision: i64) -> Result<()> {
        self.reload_rules().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::CoreError;
    use chrono::{DateTime, Utc};
    use galvan_model::{ConditionLogic, ConditionTerm, TagOperator};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct MemoryCollectionStore {
        rules: Mutex<Vec<CollectionRule>>,
        segments: Mutex<HashMap<SegmentId, CollectionSegment>>,
        samples: Mutex<HashMap<SegmentId, Vec<TelemetryPoint>>>,
        triggers: Mutex<Vec<RuleId>>,
    }

    impl MemoryCollectionStore {
        fn segments_vec(&self) -> Vec<CollectionSegment> {
            let mut segments: Vec<_> = self.segments.lock().unwrap().values().cloned().collect();
            segments.sort_by_key(|s| s.start_ts_ms);
            segments
        }

        fn samples_for(&self, id: SegmentId) -> Vec<TelemetryPoint> {
            self.samples.lock().unwrap().get(&id).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl CollectionStore for MemoryCollectionStore {
        async fn create_collection_rule(&self, rule: &CollectionRule) -> Result<()> {
            self.rules.lock().unwrap().push(rule.clone());
            Ok(())
        }

        async fn update_collection_rule(&self, rule: &CollectionRule) -> Result<()> {
            let mut rules = self.rules.lock().unwrap();
            let existing = rules
                .iter_mut()
                .find(|r| r.id == rule.id)
                .ok_or_else(|| CoreError::NotFound("rule".into()))?;
            *existing = rule.clone();
            Ok(())
        }

        async fn delete_collection_rule(&self, id: RuleId) -> Result<()> {
            self.rules.lock().unwrap().retain(|r| r.id != id);
            Ok(())
        }

        async fn list_enabled_collection_rules(&self) -> Result<Vec<CollectionRule>> {
            Ok(self
                .rules
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.enabled)
                .cloned()
                .collect())
        }

        async fn record_trigger(&self, id: RuleId, _at: DateTime<Utc>) -> Result<()> {
            self.triggers.lock().unwrap().push(id);
            Ok(())
        }

        async fn insert_segment(&self, segment: &CollectionSegment) -> Result<()> {
            self.segments.lock().unwrap().insert(segment.id, segment.clone());
            Ok(())
        }

        async fn append_segment_samples(
            &self,
            segment_id: SegmentId,
            points: &[TelemetryPoint],
        ) -> Result<()> {
            self.samples
                .lock()
                .unwrap()
                .entry(segment_id)
                .or_default()
                .extend(points.iter().cloned());
            Ok(())
        }

        async fn finalize_segment(
            &self,
            segment_id: SegmentId,
            end_ts_ms: i64,
            status: SegmentStatus,
        ) -> Result<()> {
            let mut segments = self.segments.lock().unwrap();
            let segment = segments
                .get_mut(&segment_id)
                .ok_or_else(|| CoreError::NotFound("segment".into()))?;
            segment.end_ts_ms = Some(end_ts_ms);
            segment.status = status;
            Ok(())
        }

        async fn get_segment(&self, id: SegmentId) -> Result<Option<CollectionSegment>> {
            Ok(self.segments.lock().unwrap().get(&id).cloned())
        }
    }

    fn tag_term(tag: &str, op: TagOperator, value: f64) -> ConditionTerm {
        ConditionTerm::Tag {
            tag_id: tag.into(),
            operator: op,
            value,
        }
    }

    fn work_event_rule(device: DeviceId) -> CollectionRule {
        CollectionRule {
            id: RuleId::new(),
            device_id: device,
            enabled: true,
            start_condition: RuleCondition {
                logic: ConditionLogic::And,
                terms: vec![
                    tag_term("CD_F[0]", TagOperator::Gt, 5.0),
                    tag_term("DMP_01_CURRENT", TagOperator::Gt, 100.0),
                ],
            },
            stop_condition: RuleCondition {
                logic: ConditionLogic::And,
                terms: vec![
                    tag_term("CD_F[0]", TagOperator::Lt, 2.0),
                    ConditionTerm::Duration { seconds: 3 },
                ],
            },
            config: CollectionConfig {
                tag_ids: vec![
                    "CD_F[0]".into(),
                    "DMP_01_CURRENT".into(),
                    "DMP_02_CURRENT".into(),
                ],
                pre_buffer_seconds: 5,
                post_buffer_seconds: 3,
            },
            trigger_count: 0,
            last_trigger_at: None,
        }
    }

    async fn engine_with_rule(
        rule: CollectionRule,
        clock: Arc<ManualClock>,
        config: CaptureConfig,
    ) -> (Arc<CaptureEngine>, Arc<MemoryCollectionStore>) {
        let store = Arc::new(MemoryCollectionStore::default());
        store.rules.lock().unwrap().push(rule);
        let engine = Arc::new(CaptureEngine::new(
            Arc::clone(&store) as Arc<dyn CollectionStore>,
            clock,
            None,
            config,
        ));
        engine.reload_rules().await.unwrap();
        (engine, store)
    }

    fn point(device: DeviceId, tag: &str, ts_s: i64, value: f64) -> TelemetryPoint {
        TelemetryPoint::new(device, tag.into(), ts_s * 1_000, TelemetryValue::Float64(value))
    }

    /// Full work-event round trip: start at 10 s, stop branch true from 41 s,
    /// confirmed after the 3 s duration, 3 s post-buffer, pre-buffer back to
    /// 5 s. One Completed segment covering [5 s, 44 s] on the three tags.
    #[tokio::test]
    async fn work_event_round_trip() {
        let device = DeviceId::new();
        let clock = ManualClock::new(0);
        let (engine, store) =
            engine_with_rule(work_event_rule(device), Arc::clone(&clock), CaptureConfig::default())
                .await;

        for t in 0..=50i64 {
            clock.set(t * 1_000);
            let (cd, dmp1) = if t < 10 {
                (1.0, 50.0)
            } else if t <= 40 {
                (6.0, 150.0)
            } else {
                (1.0, 150.0)
            };
            engine.handle_sample(&point(device, "CD_F[0]", t, cd)).await;
            engine.handle_sample(&point(device, "DMP_01_CURRENT", t, dmp1)).await;
            engine.handle_sample(&point(device, "DMP_02_CURRENT", t, 20.0)).await;
            // An unrelated tag is never captured.
            engine.handle_sample(&point(device, "AMBIENT_TEMP", t, 21.0)).await;
        }

        clock.set(50_000);
        engine.tick().await;

        let segments = store.segments_vec();
        assert_eq!(segments.len(), 1, "exactly one segment");
        let segment = &segments[0];
        assert_eq!(segment.status, SegmentStatus::Completed);
        assert_eq!(segment.start_ts_ms, 10_000);
        // Stop branch true from 41 s; post-buffer ends 3 s later.
        assert_eq!(segment.end_ts_ms, Some(44_000));

        let samples = store.samples_for(segment.id);
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|p| p.ts_ms >= 5_000 && p.ts_ms <= 44_000));
        assert!(samples.iter().all(|p| p.tag_id.as_str() != "AMBIENT_TEMP"));
        // Every (tag, second) in [5, 44] exactly once for the three tags.
        let mut keys: Vec<(String, i64)> = samples
            .iter()
            .map(|p| (p.tag_id.as_str().to_owned(), p.ts_ms))
            .collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), samples.len(), "no duplicate samples");
        assert_eq!(samples.len(), 3 * 40, "three tags over [5s, 44s]");

        assert_eq!(store.triggers.lock().unwrap().len(), 1);
    }

    /// A capture that never sees its stop condition hits the hard ceiling
    /// and aborts.
    #[tokio::test]
    async fn runaway_capture_is_aborted_at_ceiling() {
        let device = DeviceId::new();
        let clock = ManualClock::new(0);
        let config = CaptureConfig {
            max_active_secs: 60,
            ..Default::default()
        };
        let (engine, store) =
            engine_with_rule(work_event_rule(device), Arc::clone(&clock), config).await;

        clock.set(10_000);
        engine.handle_sample(&point(device, "CD_F[0]", 10, 6.0)).await;
        engine.handle_sample(&point(device, "DMP_01_CURRENT", 10, 150.0)).await;
        assert_eq!(store.segments_vec().len(), 1);

        clock.set(75_000);
        engine.tick().await;

        let segments = store.segments_vec();
        assert_eq!(segments[0].status, SegmentStatus::Aborted);
        let end = segments[0].end_ts_ms.unwrap();
        assert!(end >= segments[0].start_ts_ms);
    }

    /// Changing a rule mid-capture aborts the in-flight segment and rebuilds
    /// the runtime.
    #[tokio::test]
    async fn reload_mid_capture_aborts_segment() {
        let device = DeviceId::new();
        let clock = ManualClock::new(0);
        let (engine, store) =
            engine_with_rule(work_event_rule(device), Arc::clone(&clock), CaptureConfig::default())
                .await;

        clock.set(10_000);
        engine.handle_sample(&point(device, "CD_F[0]", 10, 6.0)).await;
        engine.handle_sample(&point(device, "DMP_01_CURRENT", 10, 150.0)).await;

        {
            let mut rules = store.rules.lock().unwrap();
            rules[0].config.post_buffer_seconds = 30;
        }
        clock.set(11_000);
        engine.reload_rules().await.unwrap();

        let segments = store.segments_vec();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].status, SegmentStatus::Aborted);
    }
}
