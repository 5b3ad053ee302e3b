// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The top-level update attempter.
//!
//! Owns the install plan, gates each phase on the policy evaluator,
//! drives the action pipeline, publishes ordered status events to
//! observers, and keeps the cross-reboot bookkeeping (previous version,
//! reboot counter, system-updated marker) that turns into metrics.

use crate::action::{ActionControl, ActionPipeline, PipelineEvent};
use crate::actions::{
    CheckRequest, DownloadAction, DownloadProgress, FilesystemVerifierAction, FinalizeAction,
    UpdateCheckAction, UpdateChecker,
};
use crate::boot_control::BootControl;
use crate::config::EngineConfig;
use crate::crypto::TrustedKeys;
use crate::error::ErrorCode;
use crate::http::HttpFetcher;
use crate::install_plan::InstallPlan;
use crate::metrics::{DownloadSource, Metrics, MetricsReporter};
use crate::payload::writer::PartitionProvider;
use crate::policy::can_be_applied::{update_can_be_applied, UpdateCanBeAppliedData};
use crate::policy::can_start::{
    update_can_start, DownloadError, UpdateDownloadParams, UpdateState,
};
use crate::policy::check_allowed::{update_check_allowed, UpdateCheckParams};
use crate::policy::context::PolicyEvaluator;
use crate::policy::{EvalStatus, StateStore, Variable};
use crate::prefs::{clear_on_explicit_reset, keys, PersistedCounter, Prefs};
use crate::time::TimeSource;
use crate::version::Version;
use futures::channel::mpsc;
use futures::StreamExt as _;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    CheckingForUpdate,
    UpdateAvailable,
    Downloading,
    Verifying,
    Finalizing,
    UpdatedNeedReboot,
    ReportingError,
    DisabledForEnterprise,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "idle",
            State::CheckingForUpdate => "checking-for-update",
            State::UpdateAvailable => "update-available",
            State::Downloading => "downloading",
            State::Verifying => "verifying",
            State::Finalizing => "finalizing",
            State::UpdatedNeedReboot => "updated-need-reboot",
            State::ReportingError => "reporting-error",
            State::DisabledForEnterprise => "disabled-for-enterprise",
        };
        write!(f, "{name}")
    }
}

/// Events emitted to status observers, in strict transition order.
#[derive(Clone, Debug, PartialEq)]
pub enum AttempterEvent {
    StateChange(State),
    Progress(DownloadProgress),
    ErrorReported(ErrorCode),
}

pub struct UpdateAttempter {
    config: EngineConfig,
    prefs: Rc<RefCell<dyn Prefs>>,
    boot: Rc<RefCell<dyn BootControl>>,
    provider: Rc<RefCell<dyn PartitionProvider>>,
    checker: Rc<RefCell<dyn UpdateChecker>>,
    fetcher_factory: Box<dyn Fn() -> Box<dyn HttpFetcher>>,
    trusted_keys: TrustedKeys,
    time_source: Box<dyn TimeSource>,
    metrics: Box<dyn MetricsReporter>,
    policy_store: StateStore,
    events: mpsc::UnboundedSender<AttempterEvent>,
    current_version: Version,
    boot_id: String,
    device_fingerprint: String,
    channel: String,

    state: State,
    plan: Rc<RefCell<Option<InstallPlan>>>,
    control: Option<ActionControl>,
    update_state: Option<UpdateState>,
    attempt_start: Option<SystemTime>,
}

/// Builder collecting the attempter's explicit dependencies; tests
/// substitute fakes for each (clock, prefs, boot control, fetcher).
#[derive(Default)]
pub struct UpdateAttempterBuilder {
    config: Option<EngineConfig>,
    prefs: Option<Rc<RefCell<dyn Prefs>>>,
    boot: Option<Rc<RefCell<dyn BootControl>>>,
    provider: Option<Rc<RefCell<dyn PartitionProvider>>>,
    checker: Option<Rc<RefCell<dyn UpdateChecker>>>,
    fetcher_factory: Option<Box<dyn Fn() -> Box<dyn HttpFetcher>>>,
    trusted_keys: Option<TrustedKeys>,
    time_source: Option<Box<dyn TimeSource>>,
    metrics: Option<Box<dyn MetricsReporter>>,
    policy_store: Option<StateStore>,
    events: Option<mpsc::UnboundedSender<AttempterEvent>>,
    current_version: Option<Version>,
    boot_id: Option<String>,
    device_fingerprint: Option<String>,
    channel: Option<String>,
}

macro_rules! builder_setters {
    ($($field:ident: $ty:ty),* $(,)?) => {
        $(pub fn $field(mut self, value: $ty) -> Self {
            self.$field = Some(value);
            self
        })*
    };
}

impl UpdateAttempterBuilder {
    builder_setters! {
        config: EngineConfig,
        prefs: Rc<RefCell<dyn Prefs>>,
        boot: Rc<RefCell<dyn BootControl>>,
        provider: Rc<RefCell<dyn PartitionProvider>>,
        checker: Rc<RefCell<dyn UpdateChecker>>,
        fetcher_factory: Box<dyn Fn() -> Box<dyn HttpFetcher>>,
        trusted_keys: TrustedKeys,
        time_source: Box<dyn TimeSource>,
        metrics: Box<dyn MetricsReporter>,
        policy_store: StateStore,
        events: mpsc::UnboundedSender<AttempterEvent>,
        current_version: Version,
        boot_id: String,
        device_fingerprint: String,
        channel: String,
    }

    pub fn build(self) -> Result<UpdateAttempter, &'static str> {
        Ok(UpdateAttempter {
            config: self.config.unwrap_or_default().sanitize(),
            prefs: self.prefs.ok_or("prefs required")?,
            boot: self.boot.ok_or("boot control required")?,
            provider: self.provider.ok_or("partition provider required")?,
            checker: self.checker.ok_or("update checker required")?,
            fetcher_factory: self.fetcher_factory.ok_or("fetcher factory required")?,
            trusted_keys: self.trusted_keys.ok_or("trusted keys required")?,
            time_source: self.time_source.ok_or("time source required")?,
            metrics: self.metrics.ok_or("metrics reporter required")?,
            policy_store: self.policy_store.ok_or("policy store required")?,
            events: self.events.ok_or("event sender required")?,
            current_version: self.current_version.ok_or("current version required")?,
            boot_id: self.boot_id.ok_or("boot id required")?,
            device_fingerprint: self.device_fingerprint.unwrap_or_default(),
            channel: self.channel.unwrap_or_else(|| "stable".to_string()),
            state: State::Idle,
            plan: Rc::default(),
            control: None,
            update_state: None,
            attempt_start: None,
        })
    }
}

impl UpdateAttempter {
    pub fn builder() -> UpdateAttempterBuilder {
        UpdateAttempterBuilder::default()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn policy_store(&self) -> StateStore {
        self.policy_store.clone()
    }

    pub fn install_plan(&self) -> Option<InstallPlan> {
        self.plan.borrow().clone()
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            info!(from = %self.state, to = %state, "state transition");
            self.state = state;
            let _ = self
                .events
                .unbounded_send(AttempterEvent::StateChange(state));
        }
    }

    fn now_wall(&self) -> SystemTime {
        self.time_source.now_in_walltime()
    }

    fn pin_wall_clock(&self) {
        let now = self.now_wall();
        self.policy_store
            .set(Variable::WallClock, |s| s.wall_clock = now);
    }

    fn evaluator(&self) -> PolicyEvaluator {
        PolicyEvaluator::new(
            self.policy_store.clone(),
            self.config.evaluation_timeout(),
            self.config.expiration_timeout(),
        )
    }

    /// Cross-reboot bookkeeping, run once per process start.
    ///
    /// A changed build version means the previous attempt succeeded and
    /// the device booted into it: report the attempt metrics and clear
    /// the per-attempt records. An unchanged version with an update still
    /// pending means the device rebooted without picking up the new slot.
    pub fn on_startup(&mut self) {
        let current = self.current_version.to_string();
        let previous = self.prefs.borrow().get_string(keys::PREVIOUS_VERSION);
        match previous {
            Some(previous) if previous != current => {
                info!(from = %previous, to = %current, "booted into a new build");
                self.report_post_reboot_metrics();
                let mut prefs = self.prefs.borrow_mut();
                let _ = crate::prefs::clear_per_attempt(&mut *prefs);
                for key in [
                    keys::NUM_REBOOTS,
                    keys::SYSTEM_UPDATED_MARKER,
                    keys::UPDATE_TIMESTAMP_START,
                    keys::ROLLBACK_HAPPENED,
                ] {
                    let _ = prefs.remove(key);
                }
                let _ = prefs.set_string(keys::PREVIOUS_VERSION, &current);
            }
            Some(_) => {
                let pending = self.prefs.borrow().exists(keys::SYSTEM_UPDATED_MARKER);
                if pending {
                    let mut reboots =
                        PersistedCounter::load(&*self.prefs.borrow(), keys::NUM_REBOOTS);
                    let _ = reboots.increment(&mut *self.prefs.borrow_mut());
                }
            }
            None => {
                let _ = self
                    .prefs
                    .borrow_mut()
                    .set_string(keys::PREVIOUS_VERSION, &current);
            }
        }
        let _ = self
            .prefs
            .borrow_mut()
            .set_string(keys::BOOT_ID, &self.boot_id);
    }

    fn report_post_reboot_metrics(&mut self) {
        let prefs = self.prefs.borrow();
        if let Some(marker) = prefs.get_int(keys::SYSTEM_UPDATED_MARKER) {
            let completed = SystemTime::UNIX_EPOCH + Duration::from_secs(marker.max(0) as u64);
            if let Ok(elapsed) = self.now_wall().duration_since(completed) {
                let _ = self.metrics.report_metrics(Metrics::TimeToReboot(elapsed));
            }
        }
        if let Some(attempts) = prefs.get_int(keys::PAYLOAD_ATTEMPT_NUMBER) {
            let _ = self
                .metrics
                .report_metrics(Metrics::PayloadAttemptCount(attempts));
        }
        if let Some(reboots) = prefs.get_int(keys::NUM_REBOOTS) {
            let _ = self.metrics.report_metrics(Metrics::RebootCount(reboots));
        }
        if let Some(abnormal) = prefs.get_int(keys::ABNORMAL_TERMINATION_COUNT) {
            let _ = self
                .metrics
                .report_metrics(Metrics::AbnormallyTerminatedAttempts(abnormal));
        }
    }

    /// One full tick: gate the check on policy, run it, and if an update
    /// is available and allowed, drive the whole attempt.
    ///
    /// `forced` marks a user-requested check: `Some(true)` interactive,
    /// `Some(false)` forced periodic.
    pub async fn check_for_update(&mut self, forced: Option<bool>) -> State {
        // A deferred attempt (scattering, backoff) waits in
        // UpdateAvailable; a later tick retries the start gate without
        // re-checking.
        if self.state == State::UpdateAvailable && self.plan.borrow().is_some() {
            self.pin_wall_clock();
            self.try_start_attempt().await;
            return self.state;
        }
        if self.state != State::Idle && self.state != State::DisabledForEnterprise {
            warn!(state = %self.state, "check requested while busy; ignoring");
            return self.state;
        }
        self.policy_store
            .set(Variable::ForcedUpdatePending, |s| {
                s.forced_update_pending = forced
            });
        self.pin_wall_clock();

        let mut params = UpdateCheckParams::default();
        let (status, _) = self
            .evaluator()
            .evaluate_once(update_check_allowed, &mut params);
        match status {
            EvalStatus::Succeeded => {}
            EvalStatus::AskMeAgainLater => {
                info!("update check deferred by policy");
                return self.state;
            }
            EvalStatus::Continue | EvalStatus::Failed => {
                self.report_error(ErrorCode::OmahaUpdateIgnoredPerPolicy);
                return self.state;
            }
        }
        if !params.updates_enabled {
            let managed = self.policy_store.snapshot().device_policy.is_some();
            if managed {
                self.set_state(State::DisabledForEnterprise);
            } else {
                info!("updates not possible on this device");
            }
            return self.state;
        }

        self.set_state(State::CheckingForUpdate);
        let code = self.run_check(&params).await;
        let now = self.now_wall();
        self.policy_store
            .set(Variable::LastCheckTime, |s| s.last_check_time = Some(now));
        self.policy_store
            .set(Variable::ForcedUpdatePending, |s| {
                s.forced_update_pending = None
            });
        if !code.is_success() {
            self.report_error(code);
            return self.state;
        }

        let has_plan = self.plan.borrow().is_some();
        if !has_plan {
            self.set_state(State::Idle);
            return self.state;
        }
        if let Some(plan) = self.plan.borrow_mut().as_mut() {
            plan.is_interactive = params.interactive;
        }
        self.set_state(State::UpdateAvailable);
        self.try_start_attempt().await;
        self.state
    }

    async fn try_start_attempt(&mut self) {
        match self.gate_apply_and_start() {
            Ok(url_index) => self.run_attempt(url_index).await,
            Err(None) => {
                // Deferred; stay in UpdateAvailable for a later tick.
            }
            Err(Some(code)) => self.report_error(code),
        }
    }

    async fn run_check(&mut self, params: &UpdateCheckParams) -> ErrorCode {
        let request = CheckRequest {
            device_fingerprint: self.device_fingerprint.clone(),
            current_version: self.current_version.clone(),
            channel: params
                .target_channel
                .clone()
                .unwrap_or_else(|| self.channel.clone()),
            market_segment: "consumer".to_string(),
            interactive: params.interactive,
        };
        let mut action = UpdateCheckAction::new(self.checker.clone(), request, self.plan.clone());
        use crate::action::Action as _;
        action.perform(ActionControl::new()).await
    }

    /// Gates `update_can_be_applied` and `update_can_start`. Returns the
    /// URL index to download from, `Err(None)` for a deferral, or
    /// `Err(Some(code))` for a terminal policy decision.
    fn gate_apply_and_start(&mut self) -> Result<usize, Option<ErrorCode>> {
        let plan = self.plan.borrow().clone().expect("plan gated");
        self.pin_wall_clock();

        let payload = plan.payloads.first();
        let mut apply_data = UpdateCanBeAppliedData::new(
            plan.is_interactive,
            plan.is_rollback,
            payload
                .and_then(|p| p.source_version.clone())
                .unwrap_or_else(|| self.current_version.clone()),
            payload
                .map(|p| p.target_version.clone())
                .unwrap_or_default(),
        );
        let (status, _) = self
            .evaluator()
            .evaluate_once(update_can_be_applied, &mut apply_data);
        match status {
            EvalStatus::Succeeded if apply_data.error_code == ErrorCode::Success => {}
            EvalStatus::AskMeAgainLater => return Err(None),
            _ => return Err(Some(apply_data.error_code)),
        }

        let update_state = self.ensure_update_state(&plan);
        let mut download = UpdateDownloadParams::default();
        let (status, _) = self
            .evaluator()
            .evaluate_once(|ec, d| update_can_start(ec, &update_state, d), &mut download);
        self.persist_can_start_outputs(&download);
        match status {
            EvalStatus::Succeeded => {
                let index = download.download_url_index.ok_or(Some(
                    ErrorCode::DownloadTransferError,
                ))?;
                if let Some(us) = self.update_state.as_mut() {
                    us.last_download_url_index = index;
                    us.last_download_url_num_errors = download.download_url_num_errors;
                    us.failures_last_updated = Some(self.time_source.now_in_walltime());
                    if download.do_increment_failures {
                        us.num_failures += 1;
                    }
                }
                Ok(index)
            }
            EvalStatus::AskMeAgainLater => {
                if let Some(us) = self.update_state.as_mut() {
                    us.backoff_expiry = download.backoff_expiry;
                    us.scatter_wait_period = download.scatter_wait_period;
                    us.scatter_check_threshold = download.scatter_check_threshold;
                    us.failures_last_updated = Some(self.time_source.now_in_walltime());
                    if download.do_increment_failures {
                        us.num_failures += 1;
                    }
                }
                Err(None)
            }
            _ => Err(Some(ErrorCode::DownloadTransferError)),
        }
    }

    fn ensure_update_state(&mut self, plan: &InstallPlan) -> UpdateState {
        let num_urls = plan.payloads.first().map(|p| p.urls.len()).unwrap_or(0);
        if self.update_state.is_none() {
            let mut state = UpdateState::new(num_urls, self.now_wall());
            state.is_delta = plan.is_delta();
            state.scatter_seed = stable_seed(&self.boot_id);
            state.backoff_expiry = self
                .prefs
                .borrow()
                .get_int(keys::BACKOFF_EXPIRY)
                .filter(|v| *v >= 0)
                .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64));
            self.update_state = Some(state);
        }
        let state = self.update_state.as_mut().unwrap();
        state.interactive = plan.is_interactive;
        state.num_checks += 1;
        state.clone()
    }

    fn persist_can_start_outputs(&self, download: &UpdateDownloadParams) {
        let mut prefs = self.prefs.borrow_mut();
        match download.backoff_expiry {
            Some(expiry) => {
                let secs = expiry
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO)
                    .as_secs();
                let _ = prefs.set_int(keys::BACKOFF_EXPIRY, secs as i64);
            }
            None => {
                let _ = prefs.remove(keys::BACKOFF_EXPIRY);
            }
        }
        if download.scatter_wait_period > Duration::ZERO {
            let _ = prefs.set_int(
                keys::SCATTER_WAIT_PERIOD,
                download.scatter_wait_period.as_secs() as i64,
            );
        }
        if download.scatter_check_threshold > 0 {
            let _ = prefs.set_int(
                keys::SCATTER_CHECK_THRESHOLD,
                download.scatter_check_threshold as i64,
            );
        }
        let _ = prefs.set_int(
            keys::NUM_URL_FAILURES,
            download.download_url_num_errors as i64,
        );
    }

    async fn run_attempt(&mut self, url_index: usize) {
        {
            let mut attempts =
                PersistedCounter::load(&*self.prefs.borrow(), keys::PAYLOAD_ATTEMPT_NUMBER);
            let _ = attempts.increment(&mut *self.prefs.borrow_mut());
            let start_secs = self
                .now_wall()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs() as i64;
            let mut prefs = self.prefs.borrow_mut();
            if !prefs.exists(keys::UPDATE_TIMESTAMP_START) {
                let _ = prefs.set_int(keys::UPDATE_TIMESTAMP_START, start_secs);
            }
        }
        self.attempt_start = Some(self.now_wall());

        let (progress_tx, progress_rx) = mpsc::unbounded();
        let fetcher = (self.fetcher_factory)();
        let pipeline = ActionPipeline::new(vec![
            Box::new(DownloadAction::new(
                self.prefs.clone(),
                self.boot.clone(),
                self.provider.clone(),
                self.trusted_keys.clone(),
                fetcher,
                self.plan.clone(),
                url_index,
                Some(progress_tx),
            )),
            Box::new(FilesystemVerifierAction::new(
                self.prefs.clone(),
                self.provider.clone(),
                self.plan.clone(),
            )),
            Box::new(FinalizeAction::new(
                self.prefs.clone(),
                self.boot.clone(),
                self.plan.clone(),
                Some(self.boot_id.clone()),
            )),
        ]);
        self.control = Some(pipeline.control());
        let (pipe_tx, pipe_rx) = mpsc::unbounded();
        let run = pipeline.run(pipe_tx);

        let events = self.events.clone();
        let pump = pump_events(pipe_rx, progress_rx, events);
        let (code, observed_states) = futures::join!(run, pump);
        for state in observed_states {
            // Mirror the pumped transitions into our own state field.
            self.state = state;
        }
        self.control = None;

        if code.is_success() {
            self.finish_successful_attempt(url_index);
        } else {
            self.record_failed_attempt(url_index, code);
            self.report_error(code);
        }
    }

    fn finish_successful_attempt(&mut self, _url_index: usize) {
        let now = self.now_wall();
        if let Some(start) = self.attempt_start.take() {
            if let Ok(elapsed) = now.duration_since(start) {
                let _ = self.metrics.report_metrics(Metrics::TimeToDownload(elapsed));
            }
        }
        let bytes = self
            .prefs
            .borrow()
            .get_int(keys::CURRENT_BYTES_DOWNLOADED)
            .filter(|v| *v >= 0)
            .unwrap_or(0);
        let _ = self.metrics.report_metrics(Metrics::BytesDownloaded {
            source: DownloadSource::HttpsServer,
            bytes: bytes as u64,
        });
        let _ = self
            .metrics
            .report_metrics(Metrics::AttemptResult(ErrorCode::Success));

        let marker_secs = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as i64;
        {
            let mut prefs = self.prefs.borrow_mut();
            let _ = prefs.set_int(keys::SYSTEM_UPDATED_MARKER, marker_secs);
            // Per-attempt failure state is done with; the attempt counter
            // and reboot bookkeeping survive until the new build boots.
            for key in [
                keys::CURRENT_BYTES_DOWNLOADED,
                keys::BACKOFF_EXPIRY,
                keys::NUM_URL_FAILURES,
                keys::SCATTER_WAIT_PERIOD,
                keys::SCATTER_CHECK_THRESHOLD,
            ] {
                let _ = prefs.remove(key);
            }
        }
        self.update_state = None;
        self.set_state(State::UpdatedNeedReboot);
    }

    fn record_failed_attempt(&mut self, url_index: usize, code: ErrorCode) {
        let when = self.now_wall();
        if let Some(us) = self.update_state.as_mut() {
            us.download_errors.push(DownloadError {
                url_index,
                code,
                when,
            });
        }
    }

    fn report_error(&mut self, code: ErrorCode) {
        error!(code = %code, "attempt failed");
        let _ = self.metrics.report_metrics(Metrics::AttemptResult(code));
        self.set_state(State::ReportingError);
        let _ = self
            .events
            .unbounded_send(AttempterEvent::ErrorReported(code));
        self.set_state(State::Idle);
    }

    /// Prompt cancel of the in-flight attempt. The progress cursor stays
    /// valid; a later attempt resumes from it unless `reset_status` is
    /// also called.
    pub fn cancel(&mut self) {
        if let Some(control) = &self.control {
            info!("canceling current attempt");
            control.cancel(ErrorCode::UserCanceled);
        }
    }

    pub fn suspend(&mut self) {
        if let Some(control) = &self.control {
            control.suspend();
        }
    }

    pub fn resume(&mut self) {
        if let Some(control) = &self.control {
            control.resume();
        }
    }

    /// Explicit reset: clears backoff, scattering, and the progress
    /// cursor, and returns to `Idle`.
    pub fn reset_status(&mut self) {
        let _ = clear_on_explicit_reset(&mut *self.prefs.borrow_mut());
        self.update_state = None;
        *self.plan.borrow_mut() = None;
        self.set_state(State::Idle);
    }

    /// Marks the current boot successful via the HAL. Failures are
    /// reported but not fatal.
    pub async fn mark_boot_successful(&mut self) {
        let result = {
            let mut boot = self.boot.borrow_mut();
            let fut = boot.mark_boot_successful();
            fut.await
        };
        if let Err(e) = result {
            warn!("mark_boot_successful failed: {e:#}");
        }
    }
}

/// Forwards pipeline and progress events to observers, mapping action
/// starts onto attempter states. Returns the states observed, in order.
async fn pump_events(
    pipe_rx: mpsc::UnboundedReceiver<PipelineEvent>,
    progress_rx: mpsc::UnboundedReceiver<DownloadProgress>,
    events: mpsc::UnboundedSender<AttempterEvent>,
) -> Vec<State> {
    let mut observed = Vec::new();
    let mut pipe_rx = pipe_rx.fuse();
    let mut progress_rx = progress_rx.fuse();
    loop {
        futures::select! {
            event = pipe_rx.next() => {
                if let Some(PipelineEvent::ActionStarted { name }) = event {
                    let state = match name {
                        "download" => Some(State::Downloading),
                        "filesystem-verifier" => Some(State::Verifying),
                        "finalize" => Some(State::Finalizing),
                        _ => None,
                    };
                    if let Some(state) = state {
                        observed.push(state);
                        let _ = events.unbounded_send(AttempterEvent::StateChange(state));
                    }
                }
            }
            progress = progress_rx.next() => {
                if let Some(progress) = progress {
                    let _ = events.unbounded_send(AttempterEvent::Progress(progress));
                }
            }
            complete => break,
        }
    }
    observed
}

/// Deterministic seed from the boot id, for scattering.
fn stable_seed(boot_id: &str) -> u64 {
    let mut seed = 0xcbf2_9ce4_8422_2325u64;
    for byte in boot_id.bytes() {
        seed ^= byte as u64;
        seed = seed.wrapping_mul(0x0000_0100_0000_01b3);
    }
    seed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::check::FakeUpdateChecker;
    use crate::boot_control::{FakeBootControl, Slot};
    use crate::crypto::test_support::make_trusted_keys;
    use crate::http::MockHttpFetcher;
    use crate::install_plan::PayloadType;
    use crate::metrics::MockMetricsReporter;
    use crate::payload::parser::ProgressCursor;
    use crate::payload::test_util::{PayloadBuilder, TestPartition};
    use crate::payload::writer::MemPartitionProvider;
    use crate::policy::context::PolicyState;
    use crate::prefs::MemPrefs;
    use crate::time::MockTimeSource;
    use futures::executor::block_on;

    const BS: u64 = 4096;

    fn image(seed: u8, blocks: u64) -> Vec<u8> {
        (0..blocks * BS).map(|i| (i as u8).wrapping_mul(17).wrapping_add(seed)).collect()
    }

    struct Harness {
        attempter: UpdateAttempter,
        events: mpsc::UnboundedReceiver<AttempterEvent>,
        prefs: Rc<RefCell<MemPrefs>>,
        boot: Rc<RefCell<FakeBootControl>>,
        raw_provider: MemPartitionProvider,
        fetcher: MockHttpFetcher,
        metrics: MockMetricsReporter,
        payload_bytes: Vec<u8>,
        new_image: Vec<u8>,
    }

    fn harness(no_update: bool) -> Harness {
        let src = image(1, 4);
        let dst = image(2, 4);
        let mut provider = MemPartitionProvider::new();
        provider.insert("rootfs", Slot::A, src.clone());
        provider.insert("rootfs", Slot::B, vec![]);

        let (payload_bytes, payload_info) = PayloadBuilder::new()
            .partition(TestPartition::delta("rootfs", &src, &dst))
            .build(PayloadType::Delta);

        let plan = (!no_update).then(|| {
            InstallPlan::builder()
                .payloads(vec![payload_info])
                .source_slot(Slot::A)
                .target_slot(Slot::B)
                .build()
                .unwrap()
        });

        let mut checker = FakeUpdateChecker::new();
        checker.responses.push_back(Ok(plan));

        let prefs: Rc<RefCell<MemPrefs>> = Rc::new(RefCell::new(MemPrefs::new()));
        let boot = Rc::new(RefCell::new(FakeBootControl::new(2, Slot::A)));
        let fetcher = MockHttpFetcher::new();
        let metrics = MockMetricsReporter::new();
        let (events_tx, events_rx) = mpsc::unbounded();

        let fetcher_for_factory = fetcher.clone();
        let attempter = UpdateAttempter::builder()
            .config(EngineConfig::default())
            .prefs(prefs.clone() as Rc<RefCell<dyn Prefs>>)
            .boot(boot.clone() as Rc<RefCell<dyn BootControl>>)
            .provider(Rc::new(RefCell::new(provider.clone())) as Rc<RefCell<dyn PartitionProvider>>)
            .checker(Rc::new(RefCell::new(checker)) as Rc<RefCell<dyn UpdateChecker>>)
            .fetcher_factory(Box::new(move || {
                Box::new(fetcher_for_factory.clone()) as Box<dyn HttpFetcher>
            }) as Box<dyn Fn() -> Box<dyn HttpFetcher>>)
            .trusted_keys(make_trusted_keys())
            .time_source(Box::new(MockTimeSource::new_from_now()) as Box<dyn TimeSource>)
            .metrics(Box::new(metrics.clone()) as Box<dyn MetricsReporter>)
            .policy_store(StateStore::new(PolicyState::default()))
            .events(events_tx)
            .current_version("1.0.0".parse::<Version>().unwrap())
            .boot_id("boot-1".to_string())
            .device_fingerprint("fingerprint".to_string())
            .channel("stable".to_string())
            .build()
            .unwrap();

        Harness {
            attempter,
            events: events_rx,
            prefs,
            boot,
            raw_provider: provider,
            fetcher,
            metrics,
            payload_bytes,
            new_image: dst,
        }
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<AttempterEvent>) -> Vec<AttempterEvent> {
        let mut out = Vec::new();
        while let Ok(Some(event)) = rx.try_next() {
            out.push(event);
        }
        out
    }

    fn state_sequence(events: &[AttempterEvent]) -> Vec<State> {
        events
            .iter()
            .filter_map(|e| match e {
                AttempterEvent::StateChange(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_happy_delta_end_to_end() {
        let mut h = harness(false);
        h.fetcher.push_success(&h.payload_bytes, 8);

        let final_state = block_on(h.attempter.check_for_update(Some(true)));
        assert_eq!(final_state, State::UpdatedNeedReboot);
        assert_eq!(h.boot.borrow().active_slot(), Slot::B);
        assert_eq!(
            h.raw_provider.image("rootfs", Slot::B).unwrap().content(),
            h.new_image
        );
        // Cursor retired with the attempt.
        assert!(ProgressCursor::load(&*h.prefs.borrow()).is_none());

        let events = drain_events(&mut h.events);
        assert_eq!(
            state_sequence(&events),
            vec![
                State::CheckingForUpdate,
                State::UpdateAvailable,
                State::Downloading,
                State::Verifying,
                State::Finalizing,
                State::UpdatedNeedReboot,
            ]
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, AttempterEvent::Progress(_))));
        assert!(h
            .metrics
            .reported()
            .iter()
            .any(|m| matches!(m, Metrics::AttemptResult(ErrorCode::Success))));
    }

    #[test]
    fn test_no_update_returns_to_idle() {
        let mut h = harness(true);
        let final_state = block_on(h.attempter.check_for_update(Some(true)));
        assert_eq!(final_state, State::Idle);
        let events = drain_events(&mut h.events);
        assert_eq!(
            state_sequence(&events),
            vec![State::CheckingForUpdate, State::Idle]
        );
    }

    #[test]
    fn test_transfer_failure_reports_and_records() {
        let mut h = harness(false);
        h.fetcher
            .push_transfer(vec![crate::http::FetchEvent::Complete { successful: false }]);
        let final_state = block_on(h.attempter.check_for_update(Some(true)));
        assert_eq!(final_state, State::Idle);

        let events = drain_events(&mut h.events);
        assert!(events.contains(&AttempterEvent::ErrorReported(
            ErrorCode::DownloadTransferError
        )));
        // The failure entered the policy failure history.
        let us = h.attempter.update_state.as_ref().unwrap();
        assert_eq!(us.download_errors.len(), 1);
        assert_eq!(us.download_errors[0].code, ErrorCode::DownloadTransferError);
    }

    #[test]
    fn test_policy_deferral_stays_idle() {
        let mut h = harness(false);
        h.attempter
            .policy_store()
            .set(Variable::ConsumerAutoUpdateDisabled, |s| {
                s.consumer_auto_update_disabled = true
            });
        let final_state = block_on(h.attempter.check_for_update(None));
        assert_eq!(final_state, State::Idle);
        assert!(drain_events(&mut h.events).is_empty());
    }

    #[test]
    fn test_enterprise_disabled_state() {
        let mut h = harness(false);
        h.attempter.policy_store().set(Variable::DevicePolicy, |s| {
            s.device_policy = Some(crate::policy::DevicePolicy {
                update_disabled: true,
                ..Default::default()
            })
        });
        let final_state = block_on(h.attempter.check_for_update(None));
        assert_eq!(final_state, State::DisabledForEnterprise);
    }

    #[test]
    fn test_startup_after_version_change_reports_and_clears() {
        let mut h = harness(false);
        {
            let mut prefs = h.prefs.borrow_mut();
            prefs.set_string(keys::PREVIOUS_VERSION, "0.9.0").unwrap();
            prefs.set_int(keys::PAYLOAD_ATTEMPT_NUMBER, 3).unwrap();
            prefs.set_int(keys::NUM_REBOOTS, 2).unwrap();
            prefs.set_int(keys::SYSTEM_UPDATED_MARKER, 1_700_000_000).unwrap();
            prefs.set_int(keys::RESUME_OFFSET, 1234).unwrap();
        }
        h.attempter.on_startup();

        let reported = h.metrics.reported();
        assert!(reported
            .iter()
            .any(|m| matches!(m, Metrics::PayloadAttemptCount(3))));
        assert!(reported.iter().any(|m| matches!(m, Metrics::RebootCount(2))));
        assert!(reported.iter().any(|m| matches!(m, Metrics::TimeToReboot(_))));

        let prefs = h.prefs.borrow();
        assert_eq!(prefs.get_string(keys::PREVIOUS_VERSION).as_deref(), Some("1.0.0"));
        assert!(!prefs.exists(keys::PAYLOAD_ATTEMPT_NUMBER));
        assert!(!prefs.exists(keys::NUM_REBOOTS));
        assert!(!prefs.exists(keys::RESUME_OFFSET));
        assert!(!prefs.exists(keys::SYSTEM_UPDATED_MARKER));
    }

    #[test]
    fn test_startup_same_version_counts_reboot_only_when_pending() {
        let mut h = harness(false);
        {
            let mut prefs = h.prefs.borrow_mut();
            prefs.set_string(keys::PREVIOUS_VERSION, "1.0.0").unwrap();
        }
        h.attempter.on_startup();
        assert_eq!(h.prefs.borrow().get_int(keys::NUM_REBOOTS), None);

        h.prefs
            .borrow_mut()
            .set_int(keys::SYSTEM_UPDATED_MARKER, 1_700_000_000)
            .unwrap();
        h.attempter.on_startup();
        h.attempter.on_startup();
        assert_eq!(h.prefs.borrow().get_int(keys::NUM_REBOOTS), Some(2));
    }

    #[test]
    fn test_reset_status_clears_deferral_state() {
        let mut h = harness(false);
        {
            let mut prefs = h.prefs.borrow_mut();
            prefs.set_int(keys::BACKOFF_EXPIRY, 99).unwrap();
            prefs.set_int(keys::RESUME_OFFSET, 77).unwrap();
        }
        h.attempter.reset_status();
        assert_eq!(h.attempter.state(), State::Idle);
        assert!(!h.prefs.borrow().exists(keys::BACKOFF_EXPIRY));
        assert!(!h.prefs.borrow().exists(keys::RESUME_OFFSET));
    }

    #[test]
    fn test_stable_seed_is_deterministic() {
        assert_eq!(stable_seed("boot-1"), stable_seed("boot-1"));
        assert_ne!(stable_seed("boot-1"), stable_seed("boot-2"));
    }
}
