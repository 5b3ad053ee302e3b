// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Metrics the attempter records at attempt boundaries. The embedder
//! supplies the reporter; the engine never talks to a telemetry backend
//! directly.

use crate::error::ErrorCode;
use anyhow::Error;
use std::time::Duration;
use tracing::info;

/// Where payload bytes came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DownloadSource {
    HttpsServer,
    HttpPeer,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Metrics {
    /// Wall time from attempt start to the last payload byte.
    TimeToDownload(Duration),
    /// Wall time from "updated, needs reboot" to the first boot of the
    /// new image.
    TimeToReboot(Duration),
    BytesDownloaded {
        source: DownloadSource,
        bytes: u64,
    },
    /// Reboots the device needed before the update booted.
    RebootCount(i64),
    /// Payload attempts across reboots until success.
    PayloadAttemptCount(i64),
    AbnormallyTerminatedAttempts(i64),
    /// Terminal code of a finished attempt.
    AttemptResult(ErrorCode),
}

pub trait MetricsReporter {
    fn report_metrics(&mut self, metrics: Metrics) -> Result<(), Error>;
}

/// A stub implementation of MetricsReporter which only logs metrics.
#[derive(Clone, Debug, Default)]
pub struct StubMetricsReporter;

impl MetricsReporter for StubMetricsReporter {
    fn report_metrics(&mut self, metrics: Metrics) -> Result<(), Error> {
        info!("Received request to report metrics: {:?}", metrics);
        Ok(())
    }
}

/// Records everything it is given, for assertions in tests.
#[derive(Clone, Debug, Default)]
pub struct MockMetricsReporter {
    pub metrics: std::rc::Rc<std::cell::RefCell<Vec<Metrics>>>,
}

impl MockMetricsReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reported(&self) -> Vec<Metrics> {
        self.metrics.borrow().clone()
    }
}

impl MetricsReporter for MockMetricsReporter {
    fn report_metrics(&mut self, metrics: Metrics) -> Result<(), Error> {
        self.metrics.borrow_mut().push(metrics);
        Ok(())
    }
}
