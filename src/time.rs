// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Wall and monotonic time, kept as an explicit pair.
//!
//! Scheduling decisions (next check, backoff expiry) need wall time so they
//! survive reboots, while in-process waits need monotonic time so a clock
//! step cannot stall or storm the engine. `ComplexTime` carries both;
//! `PartialComplexTime` is the "whichever bound you have" form used by
//! timers.

use futures::future::BoxFuture;
use futures::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ComplexTime {
    pub wall: SystemTime,
    pub mono: Instant,
}

impl ComplexTime {
    pub fn wall_duration_since(&self, earlier: ComplexTime) -> Option<Duration> {
        self.wall.duration_since(earlier.wall).ok()
    }

    /// Advance both components by the same amount.
    pub fn checked_add(&self, dur: Duration) -> Option<ComplexTime> {
        Some(ComplexTime {
            wall: self.wall.checked_add(dur)?,
            mono: self.mono.checked_add(dur)?,
        })
    }
}

impl std::ops::Add<Duration> for ComplexTime {
    type Output = ComplexTime;

    fn add(self, dur: Duration) -> ComplexTime {
        ComplexTime {
            wall: self.wall + dur,
            mono: self.mono + dur,
        }
    }
}

/// One or both of the time bounds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartialComplexTime {
    Wall(SystemTime),
    Monotonic(Instant),
    Complex(ComplexTime),
}

impl From<SystemTime> for PartialComplexTime {
    fn from(t: SystemTime) -> Self {
        PartialComplexTime::Wall(t)
    }
}

impl From<Instant> for PartialComplexTime {
    fn from(t: Instant) -> Self {
        PartialComplexTime::Monotonic(t)
    }
}

impl From<ComplexTime> for PartialComplexTime {
    fn from(t: ComplexTime) -> Self {
        PartialComplexTime::Complex(t)
    }
}

pub trait TimeSource {
    fn now_in_walltime(&self) -> SystemTime;
    fn now_in_monotonic(&self) -> Instant;

    fn now(&self) -> ComplexTime {
        ComplexTime {
            wall: self.now_in_walltime(),
            mono: self.now_in_monotonic(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StandardTimeSource;

impl TimeSource for StandardTimeSource {
    fn now_in_walltime(&self) -> SystemTime {
        SystemTime::now()
    }

    fn now_in_monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// A shared, settable time source for tests. Clones observe the same time.
#[derive(Clone, Debug)]
pub struct MockTimeSource {
    time: Rc<RefCell<ComplexTime>>,
}

impl MockTimeSource {
    pub fn new_from_now() -> Self {
        MockTimeSource {
            time: Rc::new(RefCell::new(ComplexTime {
                wall: SystemTime::now(),
                mono: Instant::now(),
            })),
        }
    }

    pub fn advance(&self, dur: Duration) {
        let mut t = self.time.borrow_mut();
        *t = *t + dur;
    }

    pub fn set_wall(&self, wall: SystemTime) {
        self.time.borrow_mut().wall = wall;
    }
}

impl TimeSource for MockTimeSource {
    fn now_in_walltime(&self) -> SystemTime {
        self.time.borrow().wall
    }

    fn now_in_monotonic(&self) -> Instant {
        self.time.borrow().mono
    }
}

pub trait Timer {
    /// Wait until at least one of the given time bounds has been reached.
    fn wait_until(&mut self, time: PartialComplexTime) -> BoxFuture<'static, ()>;

    /// Wait for the given duration from now.
    fn wait_for(&mut self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Timer backed by the embedder's tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardTimer;

impl StandardTimer {
    fn duration_until_system_time(system: SystemTime) -> Duration {
        system
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    fn duration_until_instant(instant: Instant) -> Duration {
        instant
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO)
    }
}

impl Timer for StandardTimer {
    fn wait_until(&mut self, time: PartialComplexTime) -> BoxFuture<'static, ()> {
        let duration = match time {
            PartialComplexTime::Wall(w) => Self::duration_until_system_time(w),
            PartialComplexTime::Monotonic(m) => Self::duration_until_instant(m),
            PartialComplexTime::Complex(c) => core::cmp::min(
                Self::duration_until_system_time(c.wall),
                Self::duration_until_instant(c.mono),
            ),
        };
        tokio::time::sleep(duration).boxed()
    }

    fn wait_for(&mut self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

/// Records every requested wait and completes it immediately, letting tests
/// single-step the attempter's schedule.
#[derive(Clone, Debug, Default)]
pub struct MockTimer {
    requested: Rc<RefCell<Vec<RequestedWait>>>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RequestedWait {
    Until(PartialComplexTime),
    For(Duration),
}

impl MockTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested_waits(&self) -> Vec<RequestedWait> {
        self.requested.borrow().clone()
    }
}

impl Timer for MockTimer {
    fn wait_until(&mut self, time: PartialComplexTime) -> BoxFuture<'static, ()> {
        self.requested.borrow_mut().push(RequestedWait::Until(time));
        future::ready(()).boxed()
    }

    fn wait_for(&mut self, duration: Duration) -> BoxFuture<'static, ()> {
        self.requested.borrow_mut().push(RequestedWait::For(duration));
        future::ready(()).boxed()
    }
}
