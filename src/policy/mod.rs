// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The update-policy evaluator.
//!
//! A policy is a pure function over a snapshotted state; a composite
//! policy consults member rules in a fixed order and returns the first
//! non-`Continue` result. Every state value a rule consults is recorded,
//! and the asynchronous evaluator re-runs a deferred policy when any
//! consulted value changes.

pub mod can_be_applied;
pub mod can_start;
pub mod check_allowed;
pub mod context;

pub use context::{
    ConnectionType, DevicePolicy, EvaluationContext, PolicyState, StateStore, Variable,
    WeeklyInterval, WeeklyTime,
};

use tracing::debug;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EvalStatus {
    /// This rule has no opinion; ask the next one.
    Continue,
    Succeeded,
    /// Deferred; re-evaluate when an observed input changes.
    AskMeAgainLater,
    Failed,
}

/// One member rule of a composite policy.
pub trait PolicyRule<D> {
    fn name(&self) -> &'static str;
    fn evaluate(&self, ec: &EvaluationContext, data: &mut D) -> EvalStatus;
}

/// Consults rules in order; the first non-`Continue` wins. All-`Continue`
/// yields `Succeeded`.
pub fn evaluate_chain<D>(
    rules: &[&dyn PolicyRule<D>],
    ec: &EvaluationContext,
    data: &mut D,
) -> EvalStatus {
    for rule in rules {
        let status = rule.evaluate(ec, data);
        if status != EvalStatus::Continue {
            debug!(rule = rule.name(), ?status, "policy decided");
            return status;
        }
    }
    EvalStatus::Succeeded
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, EvalStatus);

    impl PolicyRule<Vec<&'static str>> for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        fn evaluate(&self, _ec: &EvaluationContext, data: &mut Vec<&'static str>) -> EvalStatus {
            data.push(self.0);
            self.1
        }
    }

    #[test]
    fn test_first_non_continue_wins() {
        let ec = EvaluationContext::new(PolicyState::default());
        let mut consulted = Vec::new();
        let status = evaluate_chain(
            &[
                &Fixed("a", EvalStatus::Continue),
                &Fixed("b", EvalStatus::AskMeAgainLater),
                &Fixed("c", EvalStatus::Succeeded),
            ],
            &ec,
            &mut consulted,
        );
        assert_eq!(status, EvalStatus::AskMeAgainLater);
        assert_eq!(consulted, vec!["a", "b"]);
    }

    #[test]
    fn test_all_continue_defaults_to_succeeded() {
        let ec = EvaluationContext::new(PolicyState::default());
        let mut consulted = Vec::new();
        let status = evaluate_chain(
            &[&Fixed("a", EvalStatus::Continue), &Fixed("b", EvalStatus::Continue)],
            &ec,
            &mut consulted,
        );
        assert_eq!(status, EvalStatus::Succeeded);
    }
}
