// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The `update_can_be_applied` composite policy: may a fetched update be
//! applied to the device?

use super::context::{EvaluationContext, WeeklyTime};
use super::{evaluate_chain, EvalStatus, PolicyRule};
use crate::error::ErrorCode;
use crate::version::Version;
use tracing::info;

/// The plan-derived inputs and the resulting error code.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateCanBeAppliedData {
    pub is_interactive: bool,
    pub is_rollback: bool,
    pub source_version: Version,
    pub target_version: Version,
    /// `Success` when the update may proceed; a policy code otherwise.
    pub error_code: ErrorCode,
}

impl UpdateCanBeAppliedData {
    pub fn new(
        is_interactive: bool,
        is_rollback: bool,
        source_version: Version,
        target_version: Version,
    ) -> Self {
        UpdateCanBeAppliedData {
            is_interactive,
            is_rollback,
            source_version,
            target_version,
            error_code: ErrorCode::Success,
        }
    }
}

/// An interactive update bypasses time restrictions and minimum-version
/// checks.
struct InteractiveOverridePolicy;

impl PolicyRule<UpdateCanBeAppliedData> for InteractiveOverridePolicy {
    fn name(&self) -> &'static str {
        "interactive-override"
    }

    fn evaluate(&self, _ec: &EvaluationContext, data: &mut UpdateCanBeAppliedData) -> EvalStatus {
        if data.is_interactive {
            data.error_code = ErrorCode::Success;
            return EvalStatus::Succeeded;
        }
        EvalStatus::Continue
    }
}

/// A rollback is only applied when device policy explicitly allows it.
struct EnterpriseRollbackPolicy;

impl PolicyRule<UpdateCanBeAppliedData> for EnterpriseRollbackPolicy {
    fn name(&self) -> &'static str {
        "enterprise-rollback"
    }

    fn evaluate(&self, ec: &EvaluationContext, data: &mut UpdateCanBeAppliedData) -> EvalStatus {
        if !data.is_rollback {
            return EvalStatus::Continue;
        }
        let allowed = ec
            .device_policy()
            .map(|p| p.rollback_allowed)
            .unwrap_or(false);
        if allowed {
            info!("rollback permitted by device policy");
            data.error_code = ErrorCode::Success;
            EvalStatus::Succeeded
        } else {
            data.error_code = ErrorCode::RollbackNotPossible;
            EvalStatus::Failed
        }
    }
}

/// Rejects updates landing below the managed minimum version.
struct MinimumVersionPolicy;

impl PolicyRule<UpdateCanBeAppliedData> for MinimumVersionPolicy {
    fn name(&self) -> &'static str {
        "minimum-version"
    }

    fn evaluate(&self, ec: &EvaluationContext, data: &mut UpdateCanBeAppliedData) -> EvalStatus {
        let Some(minimum) = ec.device_policy().and_then(|p| p.device_minimum_version.clone())
        else {
            return EvalStatus::Continue;
        };
        if data.target_version < minimum {
            info!(
                target = %data.target_version, minimum = %minimum,
                "update below device minimum version"
            );
            data.error_code = ErrorCode::OmahaUpdateIgnoredPerPolicy;
            return EvalStatus::Succeeded;
        }
        EvalStatus::Continue
    }
}

/// Defers application inside configured weekly blackout intervals.
struct TimeRestrictionsPolicy;

impl PolicyRule<UpdateCanBeAppliedData> for TimeRestrictionsPolicy {
    fn name(&self) -> &'static str {
        "time-restrictions"
    }

    fn evaluate(&self, ec: &EvaluationContext, data: &mut UpdateCanBeAppliedData) -> EvalStatus {
        let Some(policy) = ec.device_policy() else {
            return EvalStatus::Continue;
        };
        if policy.disallowed_intervals.is_empty() {
            return EvalStatus::Continue;
        }
        let now = WeeklyTime::from_system_time(ec.wall_clock());
        if policy.disallowed_intervals.iter().any(|i| i.contains(now)) {
            info!("inside a disallowed time interval; deferring apply");
            data.error_code = ErrorCode::OmahaUpdateIgnoredPerPolicy;
            return EvalStatus::Succeeded;
        }
        EvalStatus::Continue
    }
}

/// The canonical ordered chain. On `Succeeded`, `data.error_code` tells
/// the attempter whether to proceed (`Success`) or ignore the update.
pub fn update_can_be_applied(
    ec: &EvaluationContext,
    data: &mut UpdateCanBeAppliedData,
) -> EvalStatus {
    let status = evaluate_chain(
        &[
            &InteractiveOverridePolicy,
            &EnterpriseRollbackPolicy,
            &MinimumVersionPolicy,
            &TimeRestrictionsPolicy,
        ],
        ec,
        data,
    );
    if status == EvalStatus::Succeeded && data.error_code == ErrorCode::Success {
        info!("allowing update to be applied");
    }
    status
}
