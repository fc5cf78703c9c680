//! Shared data models for the Galvan telemetry platform.
//!
//! This crate holds the entities that cross crate boundaries: typed ids, the
//! tagged telemetry value, sample points, device and tag configuration, alarm
//! rules and records, collection rules with their condition AST, segments,
//! and baselines. It is persistence- and transport-agnostic; serde support is
//! behind the `serde` feature (on by default).

pub mod alarm;
#[cfg(feature = "serde")]
pub mod baseline;
pub mod collection;
pub mod device;
pub mod error;
pub mod ids;
pub mod point;
pub mod tag;
pub mod value;

pub mod prelude;

pub use alarm::{AlarmCondition, AlarmRecord, AlarmRule, AlarmStatus};
#[cfg(feature = "serde")]
pub use baseline::Baseline;
pub use collection::{
    CollectionConfig, CollectionRule, CollectionSegment, ConditionLogic, ConditionTerm,
    RuleCondition, SegmentStatus, TagOperator,
};
pub use device::{Device, Protocol};
pub use error::{ModelError, Result};
pub use ids::{AlarmId, DeviceId, RuleId, SegmentId, TagId};
pub use point::{TelemetryPoint, next_seq};
pub use tag::Tag;
pub use value::{Quality, TelemetryValue, ValueType};
