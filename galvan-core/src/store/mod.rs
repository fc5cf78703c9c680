//! Persistence ports.
//!
//! Components depend on these capability traits rather than on a concrete
//! database so engines can run against in-memory fakes in tests and the
//! Postgres implementation stays swappable.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use galvan_model::prelude::*;

use crate::error::Result;

/// Cursor over a range query, encoding `(ts, seq)` of the last returned row.
/// Iteration is strictly forward in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeCursor {
    pub ts_ms: i64,
    pub seq: i64,
}

/// Parameters of a raw-sample range query.
#[derive(Debug, Clone, Default)]
pub struct RangeQuery {
    pub device_id: Option<DeviceId>,
    pub tag_id: Option<TagId>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub limit: i64,
    pub cursor: Option<RangeCursor>,
}

/// One page of range-query results.
#[derive(Debug, Clone)]
pub struct RangePage {
    pub points: Vec<TelemetryPoint>,
    pub next_cursor: Option<RangeCursor>,
}

/// Aggregation function over a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

impl AggregateFn {
    pub fn as_sql(&self) -> &'static str {
        match self {
            AggregateFn::Avg => "AVG",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
            AggregateFn::Sum => "SUM",
            AggregateFn::Count => "COUNT",
        }
    }
}

/// One aggregation bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateBucket {
    pub bucket_start_ms: i64,
    pub value: f64,
}

/// Append and query raw telemetry.
#[async_trait]
pub trait TelemetryStore: Send + Sync + std::fmt::Debug {
    /// Atomically persist a batch and refresh the latest-value table.
    async fn append_batch(&self, points: &[TelemetryPoint]) -> Result<()>;

    /// Latest value per tag, served from the latest-value table rather than a
    /// raw scan.
    async fn get_latest(
        &self,
        device_id: Option<DeviceId>,
        tag_id: Option<&TagId>,
    ) -> Result<Vec<TelemetryPoint>>;

    async fn query_range(&self, query: RangeQuery) -> Result<RangePage>;

    async fn aggregate(
        &self,
        device_id: DeviceId,
        tag_id: &TagId,
        start_ms: i64,
        end_ms: i64,
        bucket_ms: i64,
        func: AggregateFn,
    ) -> Result<Vec<AggregateBucket>>;
}

/// Device configuration CRUD. Every mutation increments the config revision.
#[async_trait]
pub trait DeviceStore: Send + Sync + std::fmt::Debug {
    async fn create_device(&self, device: &Device) -> Result<()>;
    async fn update_device(&self, device: &Device) -> Result<()>;
    /// Cascades to the device's tags; refused while a collection rule still
    /// references the device.
    async fn delete_device(&self, id: DeviceId) -> Result<()>;
    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>>;
    async fn list_devices(&self) -> Result<Vec<Device>>;
    async fn list_enabled_devices(&self) -> Result<Vec<Device>>;
}

/// Tag configuration CRUD. Every mutation increments the config revision.
#[async_trait]
pub trait TagStore: Send + Sync + std::fmt::Debug {
    async fn upsert_tag(&self, tag: &Tag) -> Result<()>;
    async fn delete_tag(&self, device_id: DeviceId, id: &TagId) -> Result<()>;
    async fn list_tags(&self, device_id: DeviceId) -> Result<Vec<Tag>>;
    async fn list_enabled_tags(&self) -> Result<Vec<Tag>>;
}

/// Alarm rules and alarm records.
#[async_trait]
pub trait AlarmStore: Send + Sync + std::fmt::Debug {
    async fn create_alarm_rule(&self, rule: &AlarmRule) -> Result<()>;
    async fn update_alarm_rule(&self, rule: &AlarmRule) -> Result<()>;
    async fn delete_alarm_rule(&self, id: RuleId) -> Result<()>;
    async fn list_enabled_alarm_rules(&self) -> Result<Vec<AlarmRule>>;

    async fn insert_alarm(&self, alarm: &AlarmRecord) -> Result<()>;
    async fn get_alarm(&self, id: AlarmId) -> Result<Option<AlarmRecord>>;
    async fn list_open_alarms(&self, device_id: Option<DeviceId>) -> Result<Vec<AlarmRecord>>;

    /// Open -> Acknowledged. Refused with a logic-violation error on a closed
    /// alarm; no state changes.
    async fn acknowledge_alarm(
        &self,
        id: AlarmId,
        acked_by: &str,
        note: Option<&str>,
    ) -> Result<AlarmRecord>;

    /// Open/Acknowledged -> Closed.
    async fn close_alarm(&self, id: AlarmId) -> Result<AlarmRecord>;
}

/// Collection rules, segments, and their sample sets.
#[async_trait]
pub trait CollectionStore: Send + Sync + std::fmt::Debug {
    /// Validates the condition shape and device reference before writing.
    async fn create_collection_rule(&self, rule: &CollectionRule) -> Result<()>;
    async fn update_collection_rule(&self, rule: &CollectionRule) -> Result<()>;
    async fn delete_collection_rule(&self, id: RuleId) -> Result<()>;
    async fn list_enabled_collection_rules(&self) -> Result<Vec<CollectionRule>>;
    async fn record_trigger(&self, id: RuleId, at: DateTime<Utc>) -> Result<()>;

    async fn insert_segment(&self, segment: &CollectionSegment) -> Result<()>;
    async fn append_segment_samples(
        &self,
        segment_id: SegmentId,
        points: &[TelemetryPoint],
    ) -> Result<()>;
    /// Closes the sample set; the segment is immutable afterwards.
    async fn finalize_segment(
        &self,
        segment_id: SegmentId,
        end_ts_ms: i64,
        status: SegmentStatus,
    ) -> Result<()>;
    async fn get_segment(&self, id: SegmentId) -> Result<Option<CollectionSegment>>;
}

/// Per-device opaque baselines.
#[async_trait]
pub trait BaselineStore: Send + Sync + std::fmt::Debug {
    async fn put_baseline(&self, baseline: &Baseline) -> Result<()>;
    async fn get_baseline(
        &self,
        device_id: DeviceId,
        baseline_type: &str,
    ) -> Result<Option<Baseline>>;
}

/// The monotonic configuration revision counter.
#[async_trait]
pub trait RevisionStore: Send + Sync + std::fmt::Debug {
    async fn get_revision(&self) -> Result<i64>;
    /// Called by every write path that changes devices, tags, or rules.
    async fn increment_revision(&self) -> Result<i64>;
}

/// Aggregation roll-ups, watermarks, and guarded retention.
#[async_trait]
pub trait MaintenanceStore: Send + Sync + std::fmt::Debug {
    async fn get_watermark(&self, table: &str) -> Result<i64>;
    async fn set_watermark(&self, table: &str, ts_ms: i64) -> Result<()>;

    /// Roll raw samples with `ts > watermark` into minute buckets up to
    /// `horizon_ms` (exclusive). Returns the new watermark.
    async fn run_minute_rollup(&self, horizon_ms: i64) -> Result<i64>;
    /// Roll minute buckets with `bucket > watermark` into hour buckets up to
    /// `horizon_ms` (exclusive). Returns the new watermark.
    async fn run_hour_rollup(&self, horizon_ms: i64) -> Result<i64>;

    /// Delete raw samples older than `cutoff_ms`, never deleting above the
    /// minute watermark. Returns deleted row count.
    async fn delete_telemetry_before(&self, cutoff_ms: i64) -> Result<u64>;
    /// Delete minute buckets older than `cutoff_ms`, never deleting above the
    /// hour watermark. Returns deleted row count.
    async fn delete_minute_before(&self, cutoff_ms: i64) -> Result<u64>;
}

/// Watermark table names used by the aggregation jobs.
pub mod watermark {
    pub const TELEMETRY_1M: &str = "telemetry_1m";
    pub const TELEMETRY_1H: &str = "telemetry_1h";
}
