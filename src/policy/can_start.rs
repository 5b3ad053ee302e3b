// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The `update_can_start` composite policy: scattering, failure backoff,
//! download-URL selection, and peer-to-peer permission.

use super::context::EvaluationContext;
use super::EvalStatus;
use crate::error::ErrorCode;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Backoff doubles per failure, capped here.
const MAX_BACKOFF: Duration = Duration::from_secs(16 * 24 * 3600);
const BACKOFF_UNIT: Duration = Duration::from_secs(24 * 3600);

/// Bounds for the scattering check-count threshold.
const CHECK_THRESHOLD_MIN: u64 = 2;
const CHECK_THRESHOLD_MAX: u64 = 8;

/// One recorded download failure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DownloadError {
    pub url_index: usize,
    pub code: ErrorCode,
    pub when: SystemTime,
}

/// The attempt-scoped state the attempter maintains between evaluations.
#[derive(Clone, Debug)]
pub struct UpdateState {
    pub interactive: bool,
    pub is_delta: bool,
    pub num_urls: usize,
    /// When this update first became available, for scattering.
    pub first_seen: SystemTime,
    pub num_checks: u64,

    pub download_errors: Vec<DownloadError>,
    /// Per-URL error limit from the update-check response.
    pub download_errors_max: u64,
    /// Errors at or before this instant have already been accounted.
    pub failures_last_updated: Option<SystemTime>,
    pub num_failures: u64,
    pub backoff_expiry: Option<SystemTime>,
    pub is_backoff_disabled: bool,
    pub last_download_url_index: usize,
    pub last_download_url_num_errors: u64,

    /// Persisted scattering values from a previous evaluation; zero means
    /// none chosen yet.
    pub scatter_wait_period: Duration,
    pub scatter_check_threshold: u64,
    /// Server-imposed maximum wait.
    pub scatter_wait_max: Duration,
    /// Stable per-attempt seed for deriving scattering values.
    pub scatter_seed: u64,

    pub p2p_enabled_by_updater: bool,
    pub p2p_num_attempts: u64,
    pub p2p_first_attempt: Option<SystemTime>,
}

impl UpdateState {
    pub fn new(num_urls: usize, first_seen: SystemTime) -> Self {
        UpdateState {
            interactive: false,
            is_delta: false,
            num_urls,
            first_seen,
            num_checks: 1,
            download_errors: Vec::new(),
            download_errors_max: 10,
            failures_last_updated: None,
            num_failures: 0,
            backoff_expiry: None,
            is_backoff_disabled: false,
            last_download_url_index: 0,
            last_download_url_num_errors: 0,
            scatter_wait_period: Duration::ZERO,
            scatter_check_threshold: 0,
            scatter_wait_max: Duration::from_secs(7 * 24 * 3600),
            scatter_seed: 0,
            p2p_enabled_by_updater: false,
            p2p_num_attempts: 0,
            p2p_first_attempt: None,
        }
    }
}

/// Outputs: either the parameters of an allowed start, or the deferral
/// values the attempter persists.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateDownloadParams {
    pub update_can_start: bool,
    pub backoff_expiry: Option<SystemTime>,
    pub do_increment_failures: bool,
    pub scatter_wait_period: Duration,
    pub scatter_check_threshold: u64,
    /// `None` when no usable URL exists.
    pub download_url_index: Option<usize>,
    pub download_url_num_errors: u64,
    pub p2p_downloading_allowed: bool,
    pub p2p_sharing_allowed: bool,
}

fn backoff_duration(num_failures: u64) -> Duration {
    let doublings = num_failures.saturating_sub(1).min(10);
    (BACKOFF_UNIT * 2u32.saturating_pow(doublings as u32)).min(MAX_BACKOFF)
}

/// Scattering decision: a wait period in `[0, scatter_factor]` (clamped
/// to the server maximum) derived from the persisted seed, plus a check
/// threshold. Suppressed for interactive updates and during OOBE.
fn evaluate_scattering(
    ec: &EvaluationContext,
    state: &UpdateState,
    result: &mut UpdateDownloadParams,
) -> EvalStatus {
    if state.interactive {
        return EvalStatus::Continue;
    }
    if ec.oobe_enabled() && !ec.oobe_complete() {
        return EvalStatus::Continue;
    }
    let factor = ec
        .device_policy()
        .map(|p| p.scatter_factor)
        .unwrap_or(Duration::ZERO);
    if factor.is_zero() {
        return EvalStatus::Continue;
    }

    // Reuse previously chosen values so re-evaluation is stable.
    let wait_period = if state.scatter_wait_period > Duration::ZERO {
        state.scatter_wait_period
    } else {
        Duration::from_secs(state.scatter_seed % (factor.as_secs() + 1))
    }
    .min(state.scatter_wait_max);
    let check_threshold = if state.scatter_check_threshold > 0 {
        state.scatter_check_threshold
    } else {
        CHECK_THRESHOLD_MIN + state.scatter_seed % (CHECK_THRESHOLD_MAX - CHECK_THRESHOLD_MIN + 1)
    };

    result.scatter_wait_period = wait_period;
    result.scatter_check_threshold = check_threshold;

    let wait_satisfied = ec.wall_clock() >= state.first_seen + wait_period;
    let threshold_satisfied = state.num_checks >= check_threshold;
    if wait_satisfied || threshold_satisfied {
        debug!("scattering satisfied");
        return EvalStatus::Continue;
    }
    info!(?wait_period, check_threshold, "scattering in effect; deferring");
    EvalStatus::AskMeAgainLater
}

/// Backoff bookkeeping and download-URL selection, in one pass over the
/// failure history.
fn evaluate_backoff_and_url(
    ec: &EvaluationContext,
    state: &UpdateState,
    result: &mut UpdateDownloadParams,
) -> EvalStatus {
    if state.num_urls == 0 {
        result.download_url_index = None;
        return EvalStatus::Failed;
    }

    let mut url_index = state.last_download_url_index % state.num_urls;
    let mut url_errors = state.last_download_url_num_errors;
    let mut new_failures = 0u64;

    for error in &state.download_errors {
        if let Some(last) = state.failures_last_updated {
            if error.when <= last {
                continue;
            }
        }
        if error.url_index != url_index {
            continue;
        }
        if error.code.is_hard_payload_error() {
            // Hard errors burn the URL immediately.
            url_index = (url_index + 1) % state.num_urls;
            url_errors = 0;
            new_failures += 1;
        } else {
            url_errors += 1;
            if url_errors > state.download_errors_max {
                url_index = (url_index + 1) % state.num_urls;
                url_errors = 0;
                new_failures += 1;
            }
        }
    }

    result.download_url_index = Some(url_index);
    result.download_url_num_errors = url_errors;
    result.do_increment_failures = new_failures > 0;

    let backoff_applicable = !state.is_backoff_disabled
        && !state.interactive
        && !state.is_delta
        && ec.is_official_build();
    let expiry = if backoff_applicable {
        if new_failures > 0 {
            Some(ec.wall_clock() + backoff_duration(state.num_failures + new_failures))
        } else {
            state.backoff_expiry
        }
    } else {
        None
    };

    if let Some(expiry) = expiry {
        if ec.wall_clock() < expiry {
            result.backoff_expiry = Some(expiry);
            info!(?expiry, "download backoff in effect; deferring");
            return EvalStatus::AskMeAgainLater;
        }
    }
    result.backoff_expiry = None;
    EvalStatus::Continue
}

/// P2P permission: device policy (or the updater's own override when the
/// device is unmanaged), capped by attempt count and age.
fn evaluate_p2p(
    ec: &EvaluationContext,
    state: &UpdateState,
    result: &mut UpdateDownloadParams,
) {
    let enabled = match ec.device_policy().and_then(|p| p.p2p_enabled) {
        Some(enabled) => enabled,
        None => state.p2p_enabled_by_updater,
    };
    let mut downloading = enabled;
    if downloading && state.p2p_num_attempts >= ec.max_p2p_attempts() as u64 {
        debug!("p2p attempt count exhausted");
        downloading = false;
    }
    if downloading {
        if let Some(first) = state.p2p_first_attempt {
            if ec.wall_clock() > first + ec.max_p2p_attempts_period() {
                debug!("p2p attempt window exhausted");
                downloading = false;
            }
        }
    }
    result.p2p_downloading_allowed = downloading;
    result.p2p_sharing_allowed = enabled;
}

/// The composite: scattering, then backoff/URL, then P2P.
pub fn update_can_start(
    ec: &EvaluationContext,
    state: &UpdateState,
    result: &mut UpdateDownloadParams,
) -> EvalStatus {
    result.update_can_start = false;

    match evaluate_scattering(ec, state, result) {
        EvalStatus::Continue => {}
        status => return status,
    }
    match evaluate_backoff_and_url(ec, state, result) {
        EvalStatus::Continue => {}
        status => return status,
    }
    evaluate_p2p(ec, state, result);

    result.update_can_start = true;
    EvalStatus::Succeeded
}
