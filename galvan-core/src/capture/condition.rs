//! Start/stop condition evaluation over latest tag values.

use std::collections::HashMap;

use galvan_model::{ConditionLogic, ConditionTerm, RuleCondition, TagId};

/// Outcome of one evaluation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionOutcome {
    pub fired: bool,
    /// When the condition effectively became true. For a condition carrying a
    /// duration term this is the start of the continuously-true window (the
    /// moment the event actually began), not the sample that confirmed it.
    pub effective_ts: i64,
}

/// Tracks one compound condition across samples, including the
/// continuously-true window a `duration` term requires.
#[derive(Debug, Clone)]
pub struct ConditionTracker {
    condition: RuleCondition,
    tag_true_since: Option<i64>,
}

impl ConditionTracker {
    pub fn new(condition: RuleCondition) -> Self {
        Self {
            condition,
            tag_true_since: None,
        }
    }

    /// Evaluate against the latest known values at `now_ms`.
    ///
    /// An unknown tag value makes its term false.
    pub fn evaluate(&mut self, latest: &HashMap<TagId, f64>, now_ms: i64) -> ConditionOutcome {
        let tags_ok = eval_tag_terms(&self.condition, latest);

        if tags_ok {
            if self.tag_true_since.is_none() {
                self.tag_true_since = Some(now_ms);
            }
        } else {
            self.tag_true_since = None;
        }

        match self.condition.duration_seconds() {
            None => ConditionOutcome {
                fired: tags_ok,
                effective_ts: now_ms,
            },
            Some(seconds) => {
                let since = self.tag_true_since.unwrap_or(now_ms);
                let fired = tags_ok && now_ms - since >= i64::from(seconds) * 1_000;
                ConditionOutcome {
                    fired,
                    effective_ts: since,
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.tag_true_since = None;
    }
}

fn eval_tag_terms(condition: &RuleCondition, latest: &HashMap<TagId, f64>) -> bool {
    let mut results = condition.terms.iter().filter_map(|term| match term {
        ConditionTerm::Tag {
            tag_id,
            operator,
            value,
        } => Some(
            latest
                .get(tag_id)
                .map(|current| operator.evaluate(*current, *value))
                .unwrap_or(false),
        ),
        ConditionTerm::Duration { .. } => None,
    });

    match condition.logic {
        ConditionLogic::And => results.all(|r| r),
        ConditionLogic::Or => results.any(|r| r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galvan_model::TagOperator;

    fn tag_term(tag: &str, op: TagOperator, value: f64) -> ConditionTerm {
        ConditionTerm::Tag {
            tag_id: tag.into(),
            operator: op,
            value,
        }
    }

    fn latest(pairs: &[(&str, f64)]) -> HashMap<TagId, f64> {
        pairs.iter().map(|(t, v)| (TagId::from(*t), *v)).collect()
    }

    #[test]
    fn and_requires_all_terms() {
        let mut tracker = ConditionTracker::new(RuleCondition {
            logic: ConditionLogic::And,
            terms: vec![
                tag_term("A", TagOperator::Gt, 5.0),
                tag_term("B", TagOperator::Gt, 100.0),
            ],
        });

        assert!(!tracker.evaluate(&latest(&[("A", 6.0)]), 0).fired);
        assert!(!tracker.evaluate(&latest(&[("A", 6.0), ("B", 50.0)]), 1).fired);
        assert!(tracker.evaluate(&latest(&[("A", 6.0), ("B", 150.0)]), 2).fired);
    }

    #[test]
    fn or_requires_any_term() {
        let mut tracker = ConditionTracker::new(RuleCondition {
            logic: ConditionLogic::Or,
            terms: vec![
                tag_term("A", TagOperator::Lt, 1.0),
                tag_term("B", TagOperator::Gt, 10.0),
            ],
        });
        assert!(tracker.evaluate(&latest(&[("A", 5.0), ("B", 20.0)]), 0).fired);
        assert!(!tracker.evaluate(&latest(&[("A", 5.0), ("B", 5.0)]), 1).fired);
    }

    #[test]
    fn duration_term_backdates_to_window_start() {
        let mut tracker = ConditionTracker::new(RuleCondition {
            logic: ConditionLogic::And,
            terms: vec![
                tag_term("CD", TagOperator::Lt, 2.0),
                ConditionTerm::Duration { seconds: 3 },
            ],
        });

        // Branch becomes true at t=40 000; confirmed 3 s later.
        assert!(!tracker.evaluate(&latest(&[("CD", 1.0)]), 40_000).fired);
        assert!(!tracker.evaluate(&latest(&[("CD", 1.0)]), 42_000).fired);
        let outcome = tracker.evaluate(&latest(&[("CD", 1.0)]), 43_000);
        assert!(outcome.fired);
        assert_eq!(outcome.effective_ts, 40_000);
    }

    #[test]
    fn duration_window_resets_when_branch_flaps() {
        let mut tracker = ConditionTracker::new(RuleCondition {
            logic: ConditionLogic::And,
            terms: vec![
                tag_term("CD", TagOperator::Lt, 2.0),
                ConditionTerm::Duration { seconds: 3 },
            ],
        });

        assert!(!tracker.evaluate(&latest(&[("CD", 1.0)]), 0).fired);
        assert!(!tracker.evaluate(&latest(&[("CD", 5.0)]), 2_000).fired);
        assert!(!tracker.evaluate(&latest(&[("CD", 1.0)]), 2_500).fired);
        // Only 2.5 s since the window restarted.
        assert!(!tracker.evaluate(&latest(&[("CD", 1.0)]), 5_000).fired);
        assert!(tracker.evaluate(&latest(&[("CD", 1.0)]), 5_500).fired);
    }

    #[test]
    fn unknown_tag_value_is_false() {
        let mut tracker = ConditionTracker::new(RuleCondition {
            logic: ConditionLogic::And,
            terms: vec![tag_term("MISSING", TagOperator::Gt, 0.0)],
        });
        assert!(!tracker.evaluate(&HashMap::new(), 0).fired);
    }
}
