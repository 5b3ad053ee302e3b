// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Policy inputs: the snapshotted state, the read-recording evaluation
//! context, and the live store whose changes trigger re-evaluation.

use crate::time::Timer;
use crate::version::Version;
use futures::task::Waker;
use futures::FutureExt as _;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, SystemTime};
use tracing::warn;

use super::EvalStatus;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionType {
    Ethernet,
    Wifi,
    Cellular,
    Unknown,
}

/// Minute-resolution point in a UTC week, Sunday 00:00 = zero.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct WeeklyTime {
    /// 0 = Sunday .. 6 = Saturday.
    pub day_of_week: u8,
    pub minutes: u32,
}

impl WeeklyTime {
    const MINUTES_PER_WEEK: u32 = 7 * 24 * 60;

    pub fn new(day_of_week: u8, hour: u32, minute: u32) -> Self {
        WeeklyTime {
            day_of_week,
            minutes: hour * 60 + minute,
        }
    }

    fn week_minutes(&self) -> u32 {
        self.day_of_week as u32 * 24 * 60 + self.minutes
    }

    /// The UTC weekly position of a wall-clock instant. The Unix epoch
    /// fell on a Thursday.
    pub fn from_system_time(t: SystemTime) -> Self {
        let secs = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let days = secs / 86_400;
        let day_of_week = ((days + 4) % 7) as u8;
        let minutes = ((secs % 86_400) / 60) as u32;
        WeeklyTime {
            day_of_week,
            minutes,
        }
    }
}

/// A weekly interval, possibly wrapping the week boundary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WeeklyInterval {
    pub start: WeeklyTime,
    pub end: WeeklyTime,
}

impl WeeklyInterval {
    pub fn contains(&self, t: WeeklyTime) -> bool {
        let (start, end, t) = (
            self.start.week_minutes(),
            self.end.week_minutes(),
            t.week_minutes(),
        );
        if start <= end {
            (start..end).contains(&t)
        } else {
            // Wraps past Saturday night.
            t >= start || t < end % WeeklyTime::MINUTES_PER_WEEK
        }
    }
}

/// Enterprise device policy, as delivered by the management plane.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DevicePolicy {
    pub update_disabled: bool,
    pub target_channel: Option<String>,
    pub target_version_prefix: Option<Version>,
    pub rollback_allowed: bool,
    pub rollback_allowed_milestones: i32,
    pub scatter_factor: Duration,
    pub allowed_connection_types: Option<Vec<ConnectionType>>,
    pub disallowed_intervals: Vec<WeeklyInterval>,
    pub device_minimum_version: Option<Version>,
    pub kiosk_required_version: Option<Version>,
    pub p2p_enabled: Option<bool>,
}

/// Identity of each policy input; the context records which ones an
/// evaluation consulted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Variable {
    RunningFromRecovery,
    ResumingFromHibernate,
    NumSlots,
    DevicePolicy,
    ForcedUpdatePending,
    IsOfficialBuild,
    OobeEnabled,
    OobeComplete,
    ConsumerAutoUpdateDisabled,
    LastCheckTime,
    WallClock,
    ConnectionType,
    CheckInterval,
    P2pLimits,
}

/// A time-pinned snapshot of every policy input.
#[derive(Clone, Debug)]
pub struct PolicyState {
    pub running_from_recovery: bool,
    pub resuming_from_hibernate: bool,
    pub num_slots: u32,
    pub device_policy: Option<DevicePolicy>,
    /// `Some(interactive)` when a forced check is pending.
    pub forced_update_pending: Option<bool>,
    pub is_official_build: bool,
    pub oobe_enabled: bool,
    pub oobe_complete: bool,
    pub consumer_auto_update_disabled: bool,
    pub last_check_time: Option<SystemTime>,
    pub wall_clock: SystemTime,
    pub connection: ConnectionType,
    pub check_interval: Duration,
    /// Test-only interval allowing periodic checks on unofficial builds.
    pub unofficial_check_interval: Option<Duration>,
    pub max_p2p_attempts: u32,
    pub max_p2p_attempts_period: Duration,
}

impl Default for PolicyState {
    fn default() -> Self {
        PolicyState {
            running_from_recovery: false,
            resuming_from_hibernate: false,
            num_slots: 2,
            device_policy: None,
            forced_update_pending: None,
            is_official_build: true,
            oobe_enabled: false,
            oobe_complete: true,
            consumer_auto_update_disabled: false,
            last_check_time: None,
            wall_clock: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            connection: ConnectionType::Ethernet,
            check_interval: Duration::from_secs(900),
            unofficial_check_interval: None,
            max_p2p_attempts: 10,
            max_p2p_attempts_period: Duration::from_secs(5 * 24 * 3600),
        }
    }
}

/// Read-recording view over one snapshot. Rules must go through these
/// getters; the recorded set is what re-evaluation watches.
pub struct EvaluationContext {
    state: PolicyState,
    reads: RefCell<HashSet<Variable>>,
}

impl EvaluationContext {
    pub fn new(state: PolicyState) -> Self {
        EvaluationContext {
            state,
            reads: RefCell::new(HashSet::new()),
        }
    }

    pub fn reads(&self) -> HashSet<Variable> {
        self.reads.borrow().clone()
    }

    fn record<T>(&self, var: Variable, value: T) -> T {
        self.reads.borrow_mut().insert(var);
        value
    }

    pub fn running_from_recovery(&self) -> bool {
        self.record(Variable::RunningFromRecovery, self.state.running_from_recovery)
    }

    pub fn resuming_from_hibernate(&self) -> bool {
        self.record(Variable::ResumingFromHibernate, self.state.resuming_from_hibernate)
    }

    pub fn num_slots(&self) -> u32 {
        self.record(Variable::NumSlots, self.state.num_slots)
    }

    pub fn device_policy(&self) -> Option<&DevicePolicy> {
        self.reads.borrow_mut().insert(Variable::DevicePolicy);
        self.state.device_policy.as_ref()
    }

    pub fn forced_update_pending(&self) -> Option<bool> {
        self.record(Variable::ForcedUpdatePending, self.state.forced_update_pending)
    }

    pub fn is_official_build(&self) -> bool {
        self.record(Variable::IsOfficialBuild, self.state.is_official_build)
    }

    pub fn oobe_enabled(&self) -> bool {
        self.record(Variable::OobeEnabled, self.state.oobe_enabled)
    }

    pub fn oobe_complete(&self) -> bool {
        self.record(Variable::OobeComplete, self.state.oobe_complete)
    }

    pub fn consumer_auto_update_disabled(&self) -> bool {
        self.record(
            Variable::ConsumerAutoUpdateDisabled,
            self.state.consumer_auto_update_disabled,
        )
    }

    pub fn last_check_time(&self) -> Option<SystemTime> {
        self.record(Variable::LastCheckTime, self.state.last_check_time)
    }

    pub fn wall_clock(&self) -> SystemTime {
        self.record(Variable::WallClock, self.state.wall_clock)
    }

    pub fn connection(&self) -> ConnectionType {
        self.record(Variable::ConnectionType, self.state.connection)
    }

    pub fn check_interval(&self) -> Duration {
        self.record(Variable::CheckInterval, self.state.check_interval)
    }

    pub fn unofficial_check_interval(&self) -> Option<Duration> {
        self.record(Variable::CheckInterval, self.state.unofficial_check_interval)
    }

    pub fn max_p2p_attempts(&self) -> u32 {
        self.record(Variable::P2pLimits, self.state.max_p2p_attempts)
    }

    pub fn max_p2p_attempts_period(&self) -> Duration {
        self.record(Variable::P2pLimits, self.state.max_p2p_attempts_period)
    }
}

/// The live, observable policy-input store. Setters name the variable
/// they change; watchers of that variable are woken.
#[derive(Clone)]
pub struct StateStore {
    inner: Rc<RefCell<StoreInner>>,
}

struct StoreInner {
    state: PolicyState,
    versions: HashMap<Variable, u64>,
    wakers: Vec<Waker>,
}

impl StateStore {
    pub fn new(state: PolicyState) -> Self {
        StateStore {
            inner: Rc::new(RefCell::new(StoreInner {
                state,
                versions: HashMap::new(),
                wakers: Vec::new(),
            })),
        }
    }

    pub fn snapshot(&self) -> PolicyState {
        self.inner.borrow().state.clone()
    }

    /// Mutates the named variable and wakes anything watching it.
    pub fn set(&self, var: Variable, mutate: impl FnOnce(&mut PolicyState)) {
        let mut inner = self.inner.borrow_mut();
        mutate(&mut inner.state);
        *inner.versions.entry(var).or_insert(0) += 1;
        for waker in inner.wakers.drain(..) {
            waker.wake();
        }
    }

    fn versions_of(&self, vars: &HashSet<Variable>) -> HashMap<Variable, u64> {
        let inner = self.inner.borrow();
        vars.iter()
            .map(|v| (*v, inner.versions.get(v).copied().unwrap_or(0)))
            .collect()
    }

    /// Resolves when any of `vars` is set. Spurious wakeups from other
    /// variables are filtered by version comparison, so unrelated changes
    /// never complete this future.
    pub async fn wait_for_change(&self, vars: HashSet<Variable>) {
        let seen = self.versions_of(&vars);
        futures::future::poll_fn(move |cx| {
            let mut inner = self.inner.borrow_mut();
            let changed = seen
                .iter()
                .any(|(var, version)| inner.versions.get(var).copied().unwrap_or(0) != *version);
            if changed {
                std::task::Poll::Ready(())
            } else {
                inner.wakers.push(cx.waker().clone());
                std::task::Poll::Pending
            }
        })
        .await
    }
}

/// Drives a policy to a decision: evaluates against a fresh snapshot,
/// and while the result is `AskMeAgainLater`, waits for an observed
/// variable to change. A deferred evaluation older than the expiration
/// timeout is dropped, returning the deferral to the caller.
pub struct PolicyEvaluator {
    store: StateStore,
    evaluation_timeout: Duration,
    expiration_timeout: Duration,
}

impl PolicyEvaluator {
    pub fn new(store: StateStore, evaluation_timeout: Duration, expiration_timeout: Duration) -> Self {
        PolicyEvaluator {
            store,
            evaluation_timeout,
            expiration_timeout,
        }
    }

    /// One synchronous evaluation against the current snapshot.
    pub fn evaluate_once<D>(
        &self,
        policy: impl Fn(&EvaluationContext, &mut D) -> EvalStatus,
        data: &mut D,
    ) -> (EvalStatus, HashSet<Variable>) {
        let ec = EvaluationContext::new(self.store.snapshot());
        let started = std::time::Instant::now();
        let status = policy(&ec, data);
        if started.elapsed() > self.evaluation_timeout {
            warn!(elapsed = ?started.elapsed(), "policy evaluation exceeded its budget");
        }
        (status, ec.reads())
    }

    /// Async evaluation with re-evaluation on observed-variable changes.
    pub async fn evaluate<D>(
        &self,
        timer: &mut dyn Timer,
        policy: impl Fn(&EvaluationContext, &mut D) -> EvalStatus,
        data: &mut D,
    ) -> EvalStatus {
        let mut expiration = timer.wait_for(self.expiration_timeout).fuse();
        loop {
            let (status, reads) = self.evaluate_once(&policy, data);
            if status != EvalStatus::AskMeAgainLater {
                return status;
            }
            let mut changed = self.store.wait_for_change(reads).boxed_local().fuse();
            futures::select_biased! {
                _ = changed => continue,
                _ = expiration => return status,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt as _;

    #[test]
    fn test_context_records_reads() {
        let ec = EvaluationContext::new(PolicyState::default());
        let _ = ec.oobe_complete();
        let _ = ec.num_slots();
        let reads = ec.reads();
        assert!(reads.contains(&Variable::OobeComplete));
        assert!(reads.contains(&Variable::NumSlots));
        assert!(!reads.contains(&Variable::WallClock));
    }

    #[test]
    fn test_wait_for_change_triggers_on_watched_variable() {
        let store = StateStore::new(PolicyState::default());
        let mut vars = HashSet::new();
        vars.insert(Variable::OobeComplete);

        futures::executor::block_on(async {
            let wait = store.wait_for_change(vars);
            futures::pin_mut!(wait);
            store.set(Variable::OobeComplete, |s| s.oobe_complete = true);
            wait.await;
        });
    }

    #[test]
    fn test_wait_for_change_ignores_unwatched_variable() {
        use futures::FutureExt as _;
        let store = StateStore::new(PolicyState::default());
        let mut vars = HashSet::new();
        vars.insert(Variable::OobeComplete);

        futures::executor::block_on(async {
            let mut wait = store.wait_for_change(vars).boxed_local().fuse();
            store.set(Variable::NumSlots, |s| s.num_slots = 1);
            futures::select_biased! {
                _ = wait => panic!("unwatched change resolved the wait"),
                default => {}
            }
        });
    }

    /// Timer whose waits never fire, so only variable changes can end a
    /// deferral.
    struct NeverTimer;

    impl Timer for NeverTimer {
        fn wait_until(
            &mut self,
            _time: crate::time::PartialComplexTime,
        ) -> futures::future::BoxFuture<'static, ()> {
            futures::future::pending().boxed()
        }

        fn wait_for(&mut self, _duration: Duration) -> futures::future::BoxFuture<'static, ()> {
            futures::future::pending().boxed()
        }
    }

    #[test]
    fn test_deferred_evaluation_reruns_when_observed_variable_changes() {
        use crate::policy::check_allowed::{update_check_allowed, UpdateCheckParams};

        let store = StateStore::new(PolicyState {
            oobe_enabled: true,
            oobe_complete: false,
            forced_update_pending: Some(false),
            ..Default::default()
        });
        let evaluator = PolicyEvaluator::new(
            store.clone(),
            Duration::from_secs(5),
            Duration::from_secs(300),
        );

        let mut data = UpdateCheckParams::default();
        let status = futures::executor::block_on(async {
            let mut timer = NeverTimer;
            let eval = evaluator.evaluate(&mut timer, update_check_allowed, &mut data);
            // The evaluation defers on OOBE; completing OOBE re-runs it.
            let (status, ()) = futures::join!(eval, async {
                store.set(Variable::OobeComplete, |s| s.oobe_complete = true);
            });
            status
        });
        assert_eq!(status, crate::policy::EvalStatus::Succeeded);
        assert!(data.updates_enabled);
        assert!(!data.interactive);
    }

    #[test]
    fn test_deferred_evaluation_expires() {
        use crate::policy::check_allowed::{update_check_allowed, UpdateCheckParams};
        use crate::time::MockTimer;

        let store = StateStore::new(PolicyState {
            oobe_enabled: true,
            oobe_complete: false,
            ..Default::default()
        });
        let evaluator = PolicyEvaluator::new(
            store.clone(),
            Duration::from_secs(5),
            Duration::from_secs(300),
        );

        let mut data = UpdateCheckParams::default();
        // The mock timer fires immediately, standing in for an elapsed
        // expiration timeout; the deferral is returned as-is.
        let mut timer = MockTimer::new();
        let status = futures::executor::block_on(evaluator.evaluate(
            &mut timer,
            update_check_allowed,
            &mut data,
        ));
        assert_eq!(status, crate::policy::EvalStatus::AskMeAgainLater);
    }

    #[test]
    fn test_weekly_interval_containment() {
        // Tuesday 09:00 to Tuesday 17:00.
        let interval = WeeklyInterval {
            start: WeeklyTime::new(2, 9, 0),
            end: WeeklyTime::new(2, 17, 0),
        };
        assert!(interval.contains(WeeklyTime::new(2, 12, 0)));
        assert!(!interval.contains(WeeklyTime::new(2, 17, 0)));
        assert!(!interval.contains(WeeklyTime::new(3, 12, 0)));

        // Saturday 22:00 wrapping to Sunday 06:00.
        let wrap = WeeklyInterval {
            start: WeeklyTime::new(6, 22, 0),
            end: WeeklyTime::new(0, 6, 0),
        };
        assert!(wrap.contains(WeeklyTime::new(6, 23, 30)));
        assert!(wrap.contains(WeeklyTime::new(0, 3, 0)));
        assert!(!wrap.contains(WeeklyTime::new(0, 6, 0)));
        assert!(!wrap.contains(WeeklyTime::new(3, 0, 0)));
    }

    #[test]
    fn test_weekly_time_from_epoch() {
        // The epoch was Thursday 00:00 UTC.
        let t = WeeklyTime::from_system_time(SystemTime::UNIX_EPOCH);
        assert_eq!(t, WeeklyTime::new(4, 0, 0));
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(3 * 86_400 + 3_600);
        assert_eq!(WeeklyTime::from_system_time(later), WeeklyTime::new(0, 1, 0));
    }
}
