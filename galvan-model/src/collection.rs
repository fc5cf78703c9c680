use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};

use crate::error::ModelError;
use crate::ids::{DeviceId, RuleId, SegmentId, TagId};

/// How the terms of a compound condition combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum ConditionLogic {
    And,
    Or,
}

/// Comparison operator inside a `tag` condition term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TagOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
}

impl TagOperator {
    /// Absolute tolerance for eq/ne on float readings.
    pub const EQ_TOLERANCE: f64 = 1e-4;

    pub fn evaluate(&self, value: f64, operand: f64) -> bool {
        match self {
            TagOperator::Gt => value > operand,
            TagOperator::Gte => value >= operand,
            TagOperator::Lt => value < operand,
            TagOperator::Lte => value <= operand,
            TagOperator::Eq => (value - operand).abs() <= Self::EQ_TOLERANCE,
            TagOperator::Ne => (value - operand).abs() > Self::EQ_TOLERANCE,
        }
    }
}

/// One term of a start/stop condition.
///
/// Stored as JSON in the rule row; parsed into this AST at load time and
/// validated at the config write boundary.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum ConditionTerm {
    /// Compare the latest known value of `tag_id` against `value`.
    Tag {
        tag_id: TagId,
        operator: TagOperator,
        value: f64,
    },
    /// True iff the tag terms of the same condition have been continuously
    /// true for at least `seconds`. Only valid under `AND`.
    Duration { seconds: u32 },
}

impl Hash for ConditionTerm {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ConditionTerm::Tag {
                tag_id,
                operator,
                value,
            } => {
                0u8.hash(state);
                tag_id.hash(state);
                operator.hash(state);
                value.to_bits().hash(state);
            }
            ConditionTerm::Duration { seconds } => {
                1u8.hash(state);
                seconds.hash(state);
            }
        }
    }
}

/// Compound start/stop condition of a collection rule.
#[derive(Debug, Clone, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RuleCondition {
    pub logic: ConditionLogic,
    pub terms: Vec<ConditionTerm>,
}

impl RuleCondition {
    /// Validate the condition shape at the config write boundary so invalid
    /// conditions never reach the engine.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.terms.is_empty() {
            return Err(ModelError::InvalidCondition(
                "condition has no terms".to_string(),
            ));
        }
        let duration_terms = self
            .terms
            .iter()
            .filter(|t| matches!(t, ConditionTerm::Duration { .. }))
            .count();
        let tag_terms = self.terms.len() - duration_terms;
        if duration_terms > 0 {
            if self.logic != ConditionLogic::And {
                return Err(ModelError::InvalidCondition(
                    "a duration term must be combined under AND".to_string(),
                ));
            }
            if tag_terms == 0 {
                return Err(ModelError::InvalidCondition(
                    "a bare duration condition is invalid; combine it with a tag term"
                        .to_string(),
                ));
            }
            if duration_terms > 1 {
                return Err(ModelError::InvalidCondition(
                    "at most one duration term per condition".to_string(),
                ));
            }
        }
        for term in &self.terms {
            if let ConditionTerm::Tag { value, .. } = term
                && !value.is_finite()
            {
                return Err(ModelError::InvalidCondition(
                    "tag term operand must be finite".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The duration requirement in seconds, if the condition carries one.
    pub fn duration_seconds(&self) -> Option<u32> {
        self.terms.iter().find_map(|t| match t {
            ConditionTerm::Duration { seconds } => Some(*seconds),
            _ => None,
        })
    }

    /// Tag ids this condition reads.
    pub fn referenced_tags(&self) -> impl Iterator<Item = &TagId> {
        self.terms.iter().filter_map(|t| match t {
            ConditionTerm::Tag { tag_id, .. } => Some(tag_id),
            _ => None,
        })
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> Result<serde_json::Value, ModelError> {
        Ok(serde_json::to_value(self)?)
    }

    #[cfg(feature = "serde")]
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ModelError> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Which tags a triggered rule captures, and how far the capture window
/// extends around the trigger.
#[derive(Debug, Clone, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CollectionConfig {
    pub tag_ids: Vec<TagId>,
    pub pre_buffer_seconds: u32,
    pub post_buffer_seconds: u32,
}

impl CollectionConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.tag_ids.is_empty() {
            return Err(ModelError::InvalidRule(
                "collection config selects no tags".to_string(),
            ));
        }
        Ok(())
    }

    pub fn captures(&self, tag_id: &TagId) -> bool {
        self.tag_ids.iter().any(|t| t == tag_id)
    }
}

/// Detects when a work event begins and ends on a device and captures a
/// bounded segment of samples around it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CollectionRule {
    pub id: RuleId,
    pub device_id: DeviceId,
    pub enabled: bool,
    pub start_condition: RuleCondition,
    pub stop_condition: RuleCondition,
    pub config: CollectionConfig,
    pub trigger_count: i64,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub last_trigger_at: Option<DateTime<Utc>>,
}

impl CollectionRule {
    pub fn validate(&self) -> Result<(), ModelError> {
        self.start_condition.validate()?;
        self.stop_condition.validate()?;
        self.config.validate()
    }

    /// Hash over the fields that change trigger behavior; state machines are
    /// reset across reload when this changes.
    pub fn evaluation_fingerprint(&self) -> u64 {
        let mut hasher = std::hash::DefaultHasher::new();
        self.device_id.hash(&mut hasher);
        self.start_condition.hash(&mut hasher);
        self.stop_condition.hash(&mut hasher);
        self.config.hash(&mut hasher);
        hasher.finish()
    }
}

/// Lifecycle of a captured segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SegmentStatus {
    Active,
    Completed,
    Aborted,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Active => "active",
            SegmentStatus::Completed => "completed",
            SegmentStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SegmentStatus::Active),
            "completed" => Some(SegmentStatus::Completed),
            "aborted" => Some(SegmentStatus::Aborted),
            _ => None,
        }
    }
}

/// A bounded time-window capture produced by a collection rule.
///
/// `start_ts_ms <= end_ts_ms`; the sample set is restricted to the rule's
/// configured tags and immutable once the segment completes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CollectionSegment {
    pub id: SegmentId,
    pub rule_id: RuleId,
    pub device_id: DeviceId,
    pub start_ts_ms: i64,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub end_ts_ms: Option<i64>,
    pub status: SegmentStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_term(tag: &str, op: TagOperator, value: f64) -> ConditionTerm {
        ConditionTerm::Tag {
            tag_id: tag.into(),
            operator: op,
            value,
        }
    }

    #[test]
    fn bare_duration_condition_is_rejected() {
        let cond = RuleCondition {
            logic: ConditionLogic::And,
            terms: vec![ConditionTerm::Duration { seconds: 3 }],
        };
        assert!(cond.validate().is_err());
    }

    #[test]
    fn duration_under_or_is_rejected() {
        let cond = RuleCondition {
            logic: ConditionLogic::Or,
            terms: vec![
                tag_term("CD_F[0]", TagOperator::Lt, 2.0),
                ConditionTerm::Duration { seconds: 3 },
            ],
        };
        assert!(cond.validate().is_err());
    }

    #[test]
    fn duration_with_tag_term_under_and_is_valid() {
        let cond = RuleCondition {
            logic: ConditionLogic::And,
            terms: vec![
                tag_term("CD_F[0]", TagOperator::Lt, 2.0),
                ConditionTerm::Duration { seconds: 3 },
            ],
        };
        assert!(cond.validate().is_ok());
        assert_eq!(cond.duration_seconds(), Some(3));
    }

    #[test]
    fn empty_condition_is_rejected() {
        let cond = RuleCondition {
            logic: ConditionLogic::And,
            terms: vec![],
        };
        assert!(cond.validate().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn condition_json_round_trip() {
        let cond = RuleCondition {
            logic: ConditionLogic::And,
            terms: vec![
                tag_term("DMP_01_CURRENT", TagOperator::Gt, 100.0),
                ConditionTerm::Duration { seconds: 5 },
            ],
        };
        let json = cond.to_json().unwrap();
        let parsed = RuleCondition::from_json(&json).unwrap();
        assert_eq!(cond, parsed);
    }
}
