//! Threshold + duration alarm engine.
//!
//! Converts the sample stream plus the enabled rule set into `AlarmRecord`
//! events. Per-rule state is keyed by (rule, device, tag); while an alarm it
//! opened is still open, a rule cannot open another one for the same key,
//! regardless of condition oscillation. The engine never closes alarms:
//! closure is an operator action it merely observes, which re-arms the rule.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use galvan_model::prelude::*;

use crate::dispatch::SampleSink;
use crate::dispatch::broadcast::{BroadcastEvent, BroadcastHub};
use crate::error::Result;
use crate::revision::RevisionListener;
use crate::store::{AlarmStore, TagStore};

type StateKey = (RuleId, DeviceId, TagId);

#[derive(Debug, Default, Clone)]
struct RuleState {
    above: bool,
    above_since_ts: Option<i64>,
    open_alarm_id: Option<AlarmId>,
}

#[derive(Debug, Default)]
struct EngineState {
    states: HashMap<StateKey, RuleState>,
    /// Fingerprint per rule at the time its state entries were created.
    fingerprints: HashMap<RuleId, u64>,
    /// Rules disabled in memory after an evaluation fault.
    faulted: HashSet<RuleId>,
}

#[derive(Debug)]
pub struct AlarmEngine {
    store: Arc<dyn AlarmStore>,
    tags: Arc<dyn TagStore>,
    hub: Option<Arc<BroadcastHub>>,
    /// Copy-on-write rule snapshot; readers keep theirs for the current
    /// sample while reload swaps in a new one.
    rules: RwLock<Arc<Vec<AlarmRule>>>,
    /// Enabled-tag filter; `None` until the first reload (samples from
    /// disabled tags are already suppressed at the collector).
    enabled_tags: RwLock<Option<Arc<HashSet<(DeviceId, TagId)>>>>,
    state: Mutex<EngineState>,
}

impl AlarmEngine {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        tags: Arc<dyn TagStore>,
        hub: Option<Arc<BroadcastHub>>,
    ) -> Self {
        Self {
            store,
            tags,
            hub,
            rules: RwLock::new(Arc::new(Vec::new())),
            enabled_tags: RwLock::new(None),
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Load the enabled rule set, retaining evaluator state for rules whose
    /// id and evaluation fingerprint are unchanged.
    pub async fn reload_rules(&self) -> Result<()> {
        let rules = self.store.list_enabled_alarm_rules().await?;
        let tag_filter: HashSet<(DeviceId, TagId)> = self
            .tags
            .list_enabled_tags()
            .await?
            .into_iter()
            .map(|t| (t.device_id, t.id))
            .collect();

        let new_fingerprints: HashMap<RuleId, u64> = rules
            .iter()
            .map(|r| (r.id, r.evaluation_fingerprint()))
            .collect();

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let old_fingerprints = std::mem::take(&mut state.fingerprints);
            state.states.retain(|(rule_id, _, _), _| {
                matches!(
                    (old_fingerprints.get(rule_id), new_fingerprints.get(rule_id)),
                    (Some(old), Some(new)) if old == new
                )
            });
            state.fingerprints = new_fingerprints;
            state.faulted.clear();
        }

        *self.enabled_tags.write().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::new(tag_filter));
        let count = rules.len();
        *self.rules.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(rules);
        info!(rules = count, "alarm rule set reloaded");
        Ok(())
    }

    fn rules_snapshot(&self) -> Arc<Vec<AlarmRule>> {
        Arc::clone(&self.rules.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn tag_enabled(&self, device_id: DeviceId, tag_id: &TagId) -> bool {
        match &*self.enabled_tags.read().unwrap_or_else(|e| e.into_inner()) {
            Some(filter) => filter.contains(&(device_id, tag_id.clone())),
            None => true,
        }
    }

    async fn evaluate_rule(&self, rule: &AlarmRule, point: &TelemetryPoint) -> Result<()> {
        // Non-numeric values never fire a rule.
        let Some(value) = point.value.as_f64() else {
            return Ok(());
        };

        let key: StateKey = (rule.id, point.device_id, point.tag_id.clone());
        let condition = rule.condition.evaluate(value, rule.threshold);

        // Synchronous state update; store reads happen outside the lock.
        let open_candidate = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let entry = state.states.entry(key.clone()).or_default();

            if condition {
                if !entry.above {
                    entry.above = true;
                    entry.above_since_ts = Some(point.ts_ms);
                }
                let held_long_enough = entry
                    .above_since_ts
                    .is_some_and(|since| point.ts_ms - since >= rule.duration_ms as i64);
                if held_long_enough {
                    Some(entry.open_alarm_id)
                } else {
                    None
                }
            } else {
                entry.above = false;
                entry.above_since_ts = None;
                None
            }
        };

        let Some(existing_open) = open_candidate else {
            return Ok(());
        };

        if let Some(open_id) = existing_open {
            // De-duplicate against the alarm this rule already opened; an
            // external close re-arms the rule.
            match self.store.get_alarm(open_id).await? {
                Some(alarm) if alarm.status != AlarmStatus::Closed => return Ok(()),
                _ => {
                    debug!(alarm = %open_id, rule = %rule.id, "open alarm closed externally, re-arming");
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(entry) = state.states.get_mut(&key) {
                        entry.open_alarm_id = None;
                    }
                }
            }
        }

        let record = AlarmRecord {
            id: AlarmId::new(),
            device_id: point.device_id,
            tag_id: Some(point.tag_id.clone()),
            ts_ms: point.ts_ms,
            severity: rule.severity,
            code: rule.id,
            message: rule.render_message(value, point.device_id),
            status: AlarmStatus::Open,
            acked_by: None,
            acked_at: None,
            ack_note: None,
        };
        self.store.insert_alarm(&record).await?;

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let entry = state.states.entry(key).or_default();
            entry.open_alarm_id = Some(record.id);
        }

        warn!(
            alarm = %record.id,
            rule = %rule.id,
            device = %record.device_id,
            tag = %point.tag_id,
            severity = record.severity,
            value,
            "alarm opened"
        );
        if let Some(hub) = &self.hub {
            hub.publish(BroadcastEvent::AlarmCreated(record));
        }
        Ok(())
    }

    pub(crate) async fn handle_sample(&self, point: &TelemetryPoint) {
        if !self.tag_enabled(point.device_id, &point.tag_id) {
            return;
        }

        let rules = self.rules_snapshot();
        for rule in rules.iter() {
            if rule.tag_id != point.tag_id {
                continue;
            }
            if let Some(device_id) = rule.device_id
                && device_id != point.device_id
            {
                continue;
            }
            {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.faulted.contains(&rule.id) {
                    continue;
                }
            }
            if let Err(e) = self.evaluate_rule(rule, point).await {
                // A faulty rule is disabled in memory; the stream goes on.
                error!(rule = %rule.id, error = %e, "rule evaluation failed, disabling rule until next reload");
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.faulted.insert(rule.id);
            }
        }
    }

}

#[async_trait]
impl SampleSink for AlarmEngine {
    fn name(&self) -> &str {
        "alarm-engine"
    }

    async fn deliver(&self, point: TelemetryPoint) -> Result<()> {
        self.handle_sample(&point).await;
        Ok(())
    }
}

#[async_trait]
impl RevisionListener for AlarmEngine {
    fn name(&self) -> &str {
        "alarm-engine"
    }

    async fn on_changed(&self, _revision: i64) -> Result<()> {
        self.reload_rules().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use chrono::Utc;

    #[derive(Debug, Default)]
    struct MemoryAlarmStore {
        rules: Mutex<Vec<AlarmRule>>,
        alarms: Mutex<HashMap<AlarmId, AlarmRecord>>,
        created: Mutex<Vec<AlarmId>>,
    }

    impl MemoryAlarmStore {
        fn created_count(&self) -> usize {
            self.created.lock().unwrap().len()
        }

        fn last_created(&self) -> Option<AlarmRecord> {
            let created = self.created.lock().unwrap();
            let id = created.last()?;
            self.alarms.lock().unwrap().get(id).cloned()
        }

        fn set_rules(&self, rules: Vec<AlarmRule>) {
            *self.rules.lock().unwrap() = rules;
        }

        fn close(&self, id: AlarmId) {
            let mut alarms = self.alarms.lock().unwrap();
            alarms.get_mut(&id).unwrap().status = AlarmStatus::Closed;
        }
    }

    #[async_trait]
    impl AlarmStore for MemoryAlarmStore {
        async fn create_alarm_rule(&self, rule: &AlarmRule) -> Result<()> {
            self.rules.lock().unwrap().push(rule.clone());
            Ok(())
        }

        async fn update_alarm_rule(&self, rule: &AlarmRule) -> Result<()> {
            let mut rules = self.rules.lock().unwrap();
            let existing = rules
                .iter_mut()
                .find(|r| r.id == rule.id)
                .ok_or_else(|| CoreError::NotFound("rule".into()))?;
            *existing = rule.clone();
            Ok(())
        }

        async fn delete_alarm_rule(&self, id: RuleId) -> Result<()> {
            self.rules.lock().unwrap().retain(|r| r.id != id);
            Ok(())
        }

        async fn list_enabled_alarm_rules(&self) -> Result<Vec<AlarmRule>> {
            Ok(self
                .rules
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.enabled)
                .cloned()
                .collect())
        }

        async fn insert_alarm(&self, alarm: &AlarmRecord) -> Result<()> {
            self.alarms.lock().unwrap().insert(alarm.id, alarm.clone());
            self.created.lock().unwrap().push(alarm.id);
            Ok(())
        }

        async fn get_alarm(&self, id: AlarmId) -> Result<Option<AlarmRecord>> {
            Ok(self.alarms.lock().unwrap().get(&id).cloned())
        }

        async fn list_open_alarms(
            &self,
            _device_id: Option<DeviceId>,
        ) -> Result<Vec<AlarmRecord>> {
            Ok(self
                .alarms
                .lock()
                .unwrap()
                .values()
                .filter(|a| a.status == AlarmStatus::Open)
                .cloned()
                .collect())
        }

        async fn acknowledge_alarm(
            &self,
            _id: AlarmId,
            _acked_by: &str,
            _note: Option<&str>,
        ) -> Result<AlarmRecord> {
            unimplemented!("not exercised by engine tests")
        }

        async fn close_alarm(&self, _id: AlarmId) -> Result<AlarmRecord> {
            unimplemented!("not exercised by engine tests")
        }
    }

    #[derive(Debug)]
    struct StaticTagStore {
        tags: Vec<Tag>,
    }

    #[async_trait]
    impl TagStore for StaticTagStore {
        async fn upsert_tag(&self, _tag: &Tag) -> Result<()> {
            Ok(())
        }

        async fn delete_tag(&self, _device_id: DeviceId, _id: &TagId) -> Result<()> {
            Ok(())
        }

        async fn list_tags(&self, device_id: DeviceId) -> Result<Vec<Tag>> {
            Ok(self
                .tags
                .iter()
                .filter(|t| t.device_id == device_id)
                .cloned()
                .collect())
        }

        async fn list_enabled_tags(&self) -> Result<Vec<Tag>> {
            Ok(self.tags.iter().filter(|t| t.enabled).cloned().collect())
        }
    }

    fn rule_gt(tag: &str, threshold: f64, duration_ms: u64) -> AlarmRule {
        AlarmRule {
            id: RuleId::new(),
            tag_id: tag.into(),
            device_id: None,
            condition: AlarmCondition::Gt,
            threshold,
            duration_ms,
            severity: 2,
            message_template: "{tagId} exceeded {threshold}: {value}".into(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn point(device: DeviceId, tag: &str, ts: i64, value: f64) -> TelemetryPoint {
        TelemetryPoint::new(device, tag.into(), ts, TelemetryValue::Float64(value))
    }

    async fn engine_with(
        rules: Vec<AlarmRule>,
        device: DeviceId,
        tag: &str,
    ) -> (AlarmEngine, Arc<MemoryAlarmStore>) {
        let store = Arc::new(MemoryAlarmStore::default());
        store.set_rules(rules);
        let tags = Arc::new(StaticTagStore {
            tags: vec![Tag::new(device, tag, ValueType::Float64, tag, 1_000)],
        });
        let engine = AlarmEngine::new(
            Arc::clone(&store) as Arc<dyn AlarmStore>,
            tags as Arc<dyn TagStore>,
            None,
        );
        engine.reload_rules().await.unwrap();
        (engine, store)
    }

    /// Threshold gt 80 with 5 s duration: the alarm opens at the first sample
    /// where the uninterrupted excursion has lasted at least the duration.
    #[tokio::test]
    async fn duration_gated_alarm_opens_once_at_the_right_sample() {
        let device = DeviceId::new();
        let (engine, store) = engine_with(vec![rule_gt("T1", 80.0, 5_000)], device, "T1").await;

        for (ts, value) in [
            (0i64, 70.0),
            (1_000, 85.0),
            (3_000, 90.0),
            (5_500, 75.0),
            (6_000, 82.0),
            (6_500, 83.0),
        ] {
            engine.handle_sample(&point(device, "T1", ts, value)).await;
            assert_eq!(store.created_count(), 0, "no alarm before ts=12000");
        }

        engine.handle_sample(&point(device, "T1", 12_000, 84.0)).await;
        assert_eq!(store.created_count(), 1);
        let alarm = store.last_created().unwrap();
        assert_eq!(alarm.ts_ms, 12_000);
        assert_eq!(alarm.status, AlarmStatus::Open);
        assert_eq!(alarm.severity, 2);
        assert_eq!(alarm.message, "T1 exceeded 80: 84");
    }

    /// While the alarm it opened stays open, a rule never opens another one,
    /// no matter how the condition oscillates.
    #[tokio::test]
    async fn open_alarm_deduplicates_oscillation() {
        let device = DeviceId::new();
        let (engine, store) = engine_with(vec![rule_gt("T1", 80.0, 0)], device, "T1").await;

        engine.handle_sample(&point(device, "T1", 0, 85.0)).await;
        assert_eq!(store.created_count(), 1);

        // Alternating 85/75 for 60 s without operator action.
        let mut ts = 1_000;
        while ts <= 60_000 {
            let value = if (ts / 1_000) % 2 == 0 { 85.0 } else { 75.0 };
            engine.handle_sample(&point(device, "T1", ts, value)).await;
            ts += 1_000;
        }

        assert_eq!(store.created_count(), 1);
    }

    /// Reload with a changed threshold resets state; a close re-arms.
    #[tokio::test]
    async fn threshold_reload_and_external_close_rearm() {
        let device = DeviceId::new();
        let mut rule = rule_gt("T1", 80.0, 0);
        let (engine, store) = engine_with(vec![rule.clone()], device, "T1").await;

        engine.handle_sample(&point(device, "T1", 0, 85.0)).await;
        assert_eq!(store.created_count(), 1);
        let first = store.last_created().unwrap();

        // Operator raises the threshold; the watcher fires a reload.
        rule.threshold = 100.0;
        store.set_rules(vec![rule.clone()]);
        engine.reload_rules().await.unwrap();

        engine.handle_sample(&point(device, "T1", 1_000, 90.0)).await;
        assert_eq!(store.created_count(), 1, "90 is below the new threshold");
        assert_eq!(
            store.get_alarm(first.id).await.unwrap().unwrap().status,
            AlarmStatus::Open
        );

        store.close(first.id);
        engine.handle_sample(&point(device, "T1", 2_000, 110.0)).await;
        assert_eq!(store.created_count(), 2, "closed alarm re-arms the rule");
    }

    /// Non-numeric values and disabled tags never fire.
    #[tokio::test]
    async fn non_numeric_and_disabled_tags_are_ignored() {
        let device = DeviceId::new();
        let rule = rule_gt("T1", 80.0, 0);
        let store = Arc::new(MemoryAlarmStore::default());
        store.set_rules(vec![rule]);
        let mut tag = Tag::new(device, "T1", ValueType::Float64, "T1", 1_000);
        tag.enabled = false;
        let tags = Arc::new(StaticTagStore { tags: vec![tag] });
        let engine = AlarmEngine::new(
            Arc::clone(&store) as Arc<dyn AlarmStore>,
            tags as Arc<dyn TagStore>,
            None,
        );
        engine.reload_rules().await.unwrap();

        engine.handle_sample(&point(device, "T1", 0, 95.0)).await;
        assert_eq!(store.created_count(), 0, "disabled tag must not fire");

        let mut text_point =
            TelemetryPoint::new(device, "T1".into(), 0, TelemetryValue::String("95".into()));
        text_point.quality = Quality::GOOD;
        engine.handle_sample(&text_point).await;
        assert_eq!(store.created_count(), 0);
    }
}
