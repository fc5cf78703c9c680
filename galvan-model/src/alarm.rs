use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};

use crate::ids::{AlarmId, DeviceId, RuleId, TagId};

/// Threshold comparison an alarm rule applies to the coerced float value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AlarmCondition {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
}

impl AlarmCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmCondition::Gt => "gt",
            AlarmCondition::Gte => "gte",
            AlarmCondition::Lt => "lt",
            AlarmCondition::Lte => "lte",
            AlarmCondition::Eq => "eq",
            AlarmCondition::Ne => "ne",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gt" => Some(AlarmCondition::Gt),
            "gte" => Some(AlarmCondition::Gte),
            "lt" => Some(AlarmCondition::Lt),
            "lte" => Some(AlarmCondition::Lte),
            "eq" => Some(AlarmCondition::Eq),
            "ne" => Some(AlarmCondition::Ne),
            _ => None,
        }
    }

    /// Absolute tolerance applied to eq/ne so float readings do not flap on
    /// representation noise.
    pub const EQ_TOLERANCE: f64 = 1e-4;

    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            AlarmCondition::Gt => value > threshold,
            AlarmCondition::Gte => value >= threshold,
            AlarmCondition::Lt => value < threshold,
            AlarmCondition::Lte => value <= threshold,
            AlarmCondition::Eq => (value - threshold).abs() <= Self::EQ_TOLERANCE,
            AlarmCondition::Ne => (value - threshold).abs() > Self::EQ_TOLERANCE,
        }
    }
}

impl std::fmt::Display for AlarmCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold + duration alarm rule over one tag.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AlarmRule {
    pub id: RuleId,
    pub tag_id: TagId,
    /// Restrict the rule to one device; `None` matches the tag on any device.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub device_id: Option<DeviceId>,
    pub condition: AlarmCondition,
    pub threshold: f64,
    /// The condition must hold continuously this long before an alarm opens.
    pub duration_ms: u64,
    /// 1 (low) ..= 4 (critical).
    pub severity: i16,
    pub message_template: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlarmRule {
    /// Hash over the fields that change evaluation outcomes.
    ///
    /// Evaluator state survives a hot reload only while this fingerprint is
    /// unchanged; edits to threshold, condition, duration, or selection reset
    /// the rule's state machine.
    pub fn evaluation_fingerprint(&self) -> u64 {
        let mut hasher = std::hash::DefaultHasher::new();
        self.tag_id.hash(&mut hasher);
        self.device_id.hash(&mut hasher);
        self.condition.hash(&mut hasher);
        self.threshold.to_bits().hash(&mut hasher);
        self.duration_ms.hash(&mut hasher);
        hasher.finish()
    }

    /// Substitute `{value}`, `{threshold}`, `{tagId}`, `{deviceId}` in the
    /// rule's message template.
    pub fn render_message(&self, value: f64, device_id: DeviceId) -> String {
        self.message_template
            .replace("{value}", &value.to_string())
            .replace("{threshold}", &self.threshold.to_string())
            .replace("{tagId}", self.tag_id.as_str())
            .replace("{deviceId}", &device_id.to_string())
    }

    pub fn validate(&self) -> Result<(), crate::error::ModelError> {
        if !(1..=4).contains(&self.severity) {
            return Err(crate::error::ModelError::InvalidRule(format!(
                "severity must be 1..=4, got {}",
                self.severity
            )));
        }
        if !self.threshold.is_finite() {
            return Err(crate::error::ModelError::InvalidRule(
                "threshold must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Alarm lifecycle status. Transitions are Open -> Acknowledged -> Closed or
/// Open -> Closed; a closed alarm cannot be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AlarmStatus {
    Open = 0,
    Acknowledged = 1,
    Closed = 2,
}

impl AlarmStatus {
    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(AlarmStatus::Open),
            1 => Some(AlarmStatus::Acknowledged),
            2 => Some(AlarmStatus::Closed),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    pub fn can_acknowledge(&self) -> bool {
        matches!(self, AlarmStatus::Open)
    }

    pub fn can_close(&self) -> bool {
        matches!(self, AlarmStatus::Open | AlarmStatus::Acknowledged)
    }
}

/// One emitted alarm event. At most one open record exists per
/// (rule, device, tag) at any time.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AlarmRecord {
    pub id: AlarmId,
    pub device_id: DeviceId,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub tag_id: Option<TagId>,
    /// Timestamp of the sample that opened the alarm, UTC milliseconds.
    pub ts_ms: i64,
    pub severity: i16,
    /// The originating rule id.
    pub code: RuleId,
    pub message: String,
    pub status: AlarmStatus,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub acked_by: Option<String>,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub acked_at: Option<DateTime<Utc>>,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub ack_note: Option<String>,
}
