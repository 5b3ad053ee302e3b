// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The `update_check_allowed` composite policy: may a check for updates
//! happen right now?

use super::context::EvaluationContext;
use super::{evaluate_chain, EvalStatus, PolicyRule};
use crate::unless::Unless as _;
use crate::version::Version;
use tracing::info;

/// Outputs of `update_check_allowed`, consumed by the attempter when the
/// status is `Succeeded`.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateCheckParams {
    pub updates_enabled: bool,
    pub target_channel: Option<String>,
    pub target_version_prefix: Option<Version>,
    pub rollback_allowed: bool,
    pub rollback_allowed_milestones: i32,
    pub interactive: bool,
}

impl Default for UpdateCheckParams {
    fn default() -> Self {
        UpdateCheckParams {
            updates_enabled: true,
            target_channel: None,
            target_version_prefix: None,
            rollback_allowed: false,
            rollback_allowed_milestones: -1,
            interactive: false,
        }
    }
}

/// If running from recovery media, always check: the whole point of
/// recovery is to get a working image installed.
struct RecoveryPolicy;

impl PolicyRule<UpdateCheckParams> for RecoveryPolicy {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn evaluate(&self, ec: &EvaluationContext, data: &mut UpdateCheckParams) -> EvalStatus {
        if ec.running_from_recovery() {
            data.updates_enabled = true;
            return EvalStatus::Succeeded;
        }
        EvalStatus::Continue
    }
}

/// Checks are deferred while the platform is resuming from hibernation.
struct HibernateResumePolicy;

impl PolicyRule<UpdateCheckParams> for HibernateResumePolicy {
    fn name(&self) -> &'static str {
        "hibernate-resume"
    }

    fn evaluate(&self, ec: &EvaluationContext, _data: &mut UpdateCheckParams) -> EvalStatus {
        if ec.resuming_from_hibernate() {
            return EvalStatus::AskMeAgainLater;
        }
        EvalStatus::Continue
    }
}

/// A/B updates need two slots.
struct EnoughSlotsPolicy;

impl PolicyRule<UpdateCheckParams> for EnoughSlotsPolicy {
    fn name(&self) -> &'static str {
        "enough-slots"
    }

    fn evaluate(&self, ec: &EvaluationContext, data: &mut UpdateCheckParams) -> EvalStatus {
        if ec.num_slots() < 2 {
            data.updates_enabled = false;
            return EvalStatus::Succeeded;
        }
        EvalStatus::Continue
    }
}

/// Enterprise device policy: may disable updates outright, pin a kiosk
/// version, or set channel/version/rollback parameters for the check.
struct EnterpriseDevicePolicy;

impl PolicyRule<UpdateCheckParams> for EnterpriseDevicePolicy {
    fn name(&self) -> &'static str {
        "enterprise-device-policy"
    }

    fn evaluate(&self, ec: &EvaluationContext, data: &mut UpdateCheckParams) -> EvalStatus {
        let Some(policy) = ec.device_policy() else {
            return EvalStatus::Continue;
        };
        if policy.update_disabled && policy.kiosk_required_version.is_none() {
            info!("updates disabled by device policy");
            data.updates_enabled = false;
            return EvalStatus::Succeeded;
        }
        data.target_channel = policy.target_channel.clone();
        // A kiosk-pinned version wins over the plain prefix.
        data.target_version_prefix = policy
            .target_version_prefix
            .clone()
            .unless(policy.kiosk_required_version.clone().map(Some));
        data.rollback_allowed = policy.rollback_allowed;
        data.rollback_allowed_milestones = policy.rollback_allowed_milestones;
        EvalStatus::Continue
    }
}

/// A pending forced check: an interactive one is allowed immediately; a
/// forced periodic one only marks the request non-interactive and lets
/// the remaining rules (OOBE in particular) have their say.
struct InteractiveUpdatePolicy;

impl PolicyRule<UpdateCheckParams> for InteractiveUpdatePolicy {
    fn name(&self) -> &'static str {
        "interactive-update"
    }

    fn evaluate(&self, ec: &EvaluationContext, data: &mut UpdateCheckParams) -> EvalStatus {
        match ec.forced_update_pending() {
            Some(true) => {
                data.interactive = true;
                EvalStatus::Succeeded
            }
            Some(false) => {
                data.interactive = false;
                EvalStatus::Continue
            }
            None => EvalStatus::Continue,
        }
    }
}

/// Unofficial builds don't check periodically unless a test interval is
/// configured.
struct OfficialBuildPolicy;

impl PolicyRule<UpdateCheckParams> for OfficialBuildPolicy {
    fn name(&self) -> &'static str {
        "official-build"
    }

    fn evaluate(&self, ec: &EvaluationContext, _data: &mut UpdateCheckParams) -> EvalStatus {
        if !ec.is_official_build() && ec.unofficial_check_interval().is_none() {
            return EvalStatus::AskMeAgainLater;
        }
        EvalStatus::Continue
    }
}

/// Updates wait for the out-of-box experience to finish.
struct OobePolicy;

impl PolicyRule<UpdateCheckParams> for OobePolicy {
    fn name(&self) -> &'static str {
        "oobe"
    }

    fn evaluate(&self, ec: &EvaluationContext, _data: &mut UpdateCheckParams) -> EvalStatus {
        if ec.oobe_enabled() && !ec.oobe_complete() {
            return EvalStatus::AskMeAgainLater;
        }
        EvalStatus::Continue
    }
}

/// Consumer opt-out of automatic updates defers periodic checks.
/// Interactive requests were already allowed through above.
struct ConsumerAutoUpdatePolicy;

impl PolicyRule<UpdateCheckParams> for ConsumerAutoUpdatePolicy {
    fn name(&self) -> &'static str {
        "consumer-auto-update"
    }

    fn evaluate(&self, ec: &EvaluationContext, _data: &mut UpdateCheckParams) -> EvalStatus {
        if ec.consumer_auto_update_disabled() {
            return EvalStatus::AskMeAgainLater;
        }
        EvalStatus::Continue
    }
}

/// Paces periodic checks to the configured interval. A forced check
/// skips the pacing.
struct NextUpdateCheckTimePolicy;

impl PolicyRule<UpdateCheckParams> for NextUpdateCheckTimePolicy {
    fn name(&self) -> &'static str {
        "next-update-check-time"
    }

    fn evaluate(&self, ec: &EvaluationContext, _data: &mut UpdateCheckParams) -> EvalStatus {
        if ec.forced_update_pending().is_some() {
            return EvalStatus::Continue;
        }
        let Some(last) = ec.last_check_time() else {
            return EvalStatus::Continue;
        };
        let interval = ec
            .check_interval()
            .unless(ec.unofficial_check_interval().filter(|_| !ec.is_official_build()));
        if ec.wall_clock() < last + interval {
            return EvalStatus::AskMeAgainLater;
        }
        EvalStatus::Continue
    }
}

/// The canonical ordered chain.
pub fn update_check_allowed(ec: &EvaluationContext, data: &mut UpdateCheckParams) -> EvalStatus {
    let status = evaluate_chain(
        &[
            &RecoveryPolicy,
            &HibernateResumePolicy,
            &EnoughSlotsPolicy,
            &EnterpriseDevicePolicy,
            &InteractiveUpdatePolicy,
            &OfficialBuildPolicy,
            &OobePolicy,
            &ConsumerAutoUpdatePolicy,
            &NextUpdateCheckTimePolicy,
        ],
        ec,
        data,
    );
    if status == EvalStatus::Succeeded && data.updates_enabled {
        info!("allowing update check");
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::context::{DevicePolicy, PolicyState};
    use std::time::Duration;

    fn evaluate(state: PolicyState) -> (EvalStatus, UpdateCheckParams) {
        let ec = EvaluationContext::new(state);
        let mut data = UpdateCheckParams::default();
        let status = update_check_allowed(&ec, &mut data);
        (status, data)
    }

    #[test]
    fn test_default_state_allows_check() {
        let (status, params) = evaluate(PolicyState::default());
        assert_eq!(status, EvalStatus::Succeeded);
        assert!(params.updates_enabled);
        assert!(!params.interactive);
    }

    #[test]
    fn test_recovery_short_circuits() {
        let state = PolicyState {
            running_from_recovery: true,
            // Would otherwise defer on OOBE.
            oobe_enabled: true,
            oobe_complete: false,
            ..Default::default()
        };
        let (status, params) = evaluate(state);
        assert_eq!(status, EvalStatus::Succeeded);
        assert!(params.updates_enabled);
    }

    #[test]
    fn test_single_slot_disables_updates() {
        let state = PolicyState {
            num_slots: 1,
            ..Default::default()
        };
        let (status, params) = evaluate(state);
        assert_eq!(status, EvalStatus::Succeeded);
        assert!(!params.updates_enabled);
    }

    #[test]
    fn test_enterprise_disable_wins() {
        let state = PolicyState {
            device_policy: Some(DevicePolicy {
                update_disabled: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let (status, params) = evaluate(state);
        assert_eq!(status, EvalStatus::Succeeded);
        assert!(!params.updates_enabled);
    }

    #[test]
    fn test_kiosk_pin_overrides_disable_and_prefix() {
        let state = PolicyState {
            device_policy: Some(DevicePolicy {
                update_disabled: true,
                target_version_prefix: Some("90".parse().unwrap()),
                kiosk_required_version: Some("88.1".parse().unwrap()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let (status, params) = evaluate(state);
        assert_eq!(status, EvalStatus::Succeeded);
        assert!(params.updates_enabled);
        assert_eq!(params.target_version_prefix, Some("88.1".parse().unwrap()));
    }

    #[test]
    fn test_interactive_request_bypasses_pacing() {
        let now = PolicyState::default().wall_clock;
        let state = PolicyState {
            forced_update_pending: Some(true),
            last_check_time: Some(now - Duration::from_secs(1)),
            ..Default::default()
        };
        let (status, params) = evaluate(state);
        assert_eq!(status, EvalStatus::Succeeded);
        assert!(params.interactive);
    }

    #[test]
    fn test_forced_periodic_defers_for_oobe() {
        let state = PolicyState {
            forced_update_pending: Some(false),
            oobe_enabled: true,
            oobe_complete: false,
            ..Default::default()
        };
        let (status, _) = evaluate(state.clone());
        assert_eq!(status, EvalStatus::AskMeAgainLater);

        let (status, params) = evaluate(PolicyState {
            oobe_complete: true,
            ..state
        });
        assert_eq!(status, EvalStatus::Succeeded);
        assert!(params.updates_enabled);
        assert!(!params.interactive);
    }

    #[test]
    fn test_unofficial_build_defers_periodic_checks() {
        let state = PolicyState {
            is_official_build: false,
            ..Default::default()
        };
        assert_eq!(evaluate(state.clone()).0, EvalStatus::AskMeAgainLater);

        // A configured test interval lifts the deferral.
        let (status, _) = evaluate(PolicyState {
            unofficial_check_interval: Some(Duration::from_secs(60)),
            ..state
        });
        assert_eq!(status, EvalStatus::Succeeded);
    }

    #[test]
    fn test_consumer_auto_update_defers_periodic_but_not_interactive() {
        let state = PolicyState {
            consumer_auto_update_disabled: true,
            ..Default::default()
        };
        assert_eq!(evaluate(state.clone()).0, EvalStatus::AskMeAgainLater);

        let (status, params) = evaluate(PolicyState {
            forced_update_pending: Some(true),
            ..state
        });
        assert_eq!(status, EvalStatus::Succeeded);
        assert!(params.interactive);
    }

    #[test]
    fn test_periodic_pacing() {
        let now = PolicyState::default().wall_clock;
        let state = PolicyState {
            last_check_time: Some(now - Duration::from_secs(100)),
            check_interval: Duration::from_secs(900),
            ..Default::default()
        };
        assert_eq!(evaluate(state.clone()).0, EvalStatus::AskMeAgainLater);

        let (status, _) = evaluate(PolicyState {
            last_check_time: Some(now - Duration::from_secs(901)),
            ..state
        });
        assert_eq!(status, EvalStatus::Succeeded);
    }

    #[test]
    fn test_determinism_for_fixed_snapshot() {
        let state = PolicyState {
            device_policy: Some(DevicePolicy {
                target_channel: Some("beta".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let first = evaluate(state.clone());
        for _ in 0..5 {
            assert_eq!(evaluate(state.clone()), first);
        }
    }
}
