//! Evaluation decisions and the exhaustion override.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::WorkItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Publish,
    Retry,
    Escalate,
    Replan,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Decision::Publish => "publish",
            Decision::Retry => "retry",
            Decision::Escalate => "escalate",
            Decision::Replan => "replan",
        })
    }
}

/// Facts about an item's history that turn a retry into an escalation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExhaustionSignals {
    pub retry_count: u32,
    pub max_retries: u32,
    pub retries_exhausted: bool,
    /// Signatures seen at least `max_same_error_retries` times.
    pub repeated_error_signatures: Vec<String>,
}

impl ExhaustionSignals {
    pub fn for_item(item: &WorkItem, repeated_error_signatures: Vec<String>) -> Self {
        Self {
            retry_count: item.retry_count,
            max_retries: item.max_retries,
            retries_exhausted: item.retries_exhausted(),
            repeated_error_signatures,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.retries_exhausted || !self.repeated_error_signatures.is_empty()
    }
}

/// Recommendation from run outcome and verification alone.
pub fn recommend_decision(
    run_succeeded: bool,
    verification_passed: bool,
    signals: &ExhaustionSignals,
) -> Decision {
    if run_succeeded && verification_passed {
        return Decision::Publish;
    }
    resolve_decision(Decision::Retry, signals)
}

/// Apply exhaustion to an evaluator's decision. Only `retry` is overridden.
pub fn resolve_decision(decision: Decision, signals: &ExhaustionSignals) -> Decision {
    match decision {
        Decision::Retry if signals.is_exhausted() => Decision::Escalate,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::work_item;

    #[test]
    fn success_with_passing_verification_publishes() {
        let signals = ExhaustionSignals::default();
        assert_eq!(recommend_decision(true, true, &signals), Decision::Publish);
        assert_eq!(recommend_decision(true, false, &signals), Decision::Retry);
        assert_eq!(recommend_decision(false, false, &signals), Decision::Retry);
    }

    #[test]
    fn exhausted_retries_escalate() {
        let mut item = work_item("a", "g");
        item.retry_count = 3;
        let signals = ExhaustionSignals::for_item(&item, Vec::new());
        assert!(signals.retries_exhausted);
        assert_eq!(recommend_decision(false, false, &signals), Decision::Escalate);
    }

    #[test]
    fn repeated_signature_escalates_before_retries_run_out() {
        let item = work_item("a", "g");
        let signals = ExhaustionSignals::for_item(&item, vec!["timeout <n>".to_string()]);
        assert!(!signals.retries_exhausted);
        assert_eq!(resolve_decision(Decision::Retry, &signals), Decision::Escalate);
    }

    #[test]
    fn exhaustion_never_overrides_other_decisions() {
        let signals = ExhaustionSignals {
            retries_exhausted: true,
            ..ExhaustionSignals::default()
        };
        assert_eq!(resolve_decision(Decision::Publish, &signals), Decision::Publish);
        assert_eq!(resolve_decision(Decision::Replan, &signals), Decision::Replan);
    }
}
