//! Convenience re-exports for downstream crates.

pub use crate::alarm::{AlarmCondition, AlarmRecord, AlarmRule, AlarmStatus};
#[cfg(feature = "serde")]
pub use crate::baseline::Baseline;
pub use crate::collection::{
    CollectionConfig, CollectionRule, CollectionSegment, ConditionLogic, ConditionTerm,
    RuleCondition, SegmentStatus, TagOperator,
};
pub use crate::device::{Device, Protocol};
pub use crate::error::ModelError;
pub use crate::ids::{AlarmId, DeviceId, RuleId, SegmentId, TagId};
pub use crate::point::TelemetryPoint;
pub use crate::tag::Tag;
pub use crate::value::{Quality, TelemetryValue, ValueType};
