// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The update-check action: asks the external update-check collaborator
//! for an install plan. The wire protocol is the collaborator's business;
//! the engine only consumes the parsed plan.

use crate::action::{Action, ActionControl};
use crate::error::ErrorCode;
use crate::install_plan::InstallPlan;
use crate::version::Version;
use futures::future::LocalBoxFuture;
use futures::FutureExt as _;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{info, warn};

/// What the check request carries to the server-side collaborator.
#[derive(Clone, Debug)]
pub struct CheckRequest {
    pub device_fingerprint: String,
    pub current_version: Version,
    pub channel: String,
    pub market_segment: String,
    pub interactive: bool,
}

pub trait UpdateChecker {
    /// `Ok(None)` means "no update available".
    fn check(
        &mut self,
        request: &CheckRequest,
    ) -> LocalBoxFuture<'_, Result<Option<InstallPlan>, anyhow::Error>>;
}

pub struct UpdateCheckAction {
    checker: Rc<RefCell<dyn UpdateChecker>>,
    request: CheckRequest,
    /// Where the resulting plan is published for the rest of the pipeline.
    plan_out: Rc<RefCell<Option<InstallPlan>>>,
}

impl UpdateCheckAction {
    pub fn new(
        checker: Rc<RefCell<dyn UpdateChecker>>,
        request: CheckRequest,
        plan_out: Rc<RefCell<Option<InstallPlan>>>,
    ) -> Self {
        UpdateCheckAction {
            checker,
            request,
            plan_out,
        }
    }
}

impl Action for UpdateCheckAction {
    fn name(&self) -> &'static str {
        "update-check"
    }

    fn perform(&mut self, control: ActionControl) -> LocalBoxFuture<'_, ErrorCode> {
        async move {
            if let Err(code) = control.checkpoint().await {
                return code;
            }
            let result = self.checker.borrow_mut().check(&self.request).await;
            match result {
                Ok(Some(plan)) => {
                    info!(plan = %plan.id(), "update check returned an install plan");
                    *self.plan_out.borrow_mut() = Some(plan);
                    ErrorCode::Success
                }
                Ok(None) => {
                    info!("update check: no update available");
                    *self.plan_out.borrow_mut() = None;
                    ErrorCode::Success
                }
                Err(e) => {
                    warn!("update check failed: {e:#}");
                    ErrorCode::DownloadTransferError
                }
            }
        }
        .boxed_local()
    }
}

/// Scripted checker for tests.
pub struct FakeUpdateChecker {
    pub responses: std::collections::VecDeque<Result<Option<InstallPlan>, String>>,
    pub requests_seen: Vec<CheckRequest>,
}

impl FakeUpdateChecker {
    pub fn new() -> Self {
        FakeUpdateChecker {
            responses: Default::default(),
            requests_seen: Vec::new(),
        }
    }
}

impl Default for FakeUpdateChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateChecker for FakeUpdateChecker {
    fn check(
        &mut self,
        request: &CheckRequest,
    ) -> LocalBoxFuture<'_, Result<Option<InstallPlan>, anyhow::Error>> {
        self.requests_seen.push(request.clone());
        let response = self
            .responses
            .pop_front()
            .unwrap_or(Ok(None))
            .map_err(anyhow::Error::msg);
        futures::future::ready(response).boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_control::Slot;
    use futures::executor::block_on;

    fn request() -> CheckRequest {
        CheckRequest {
            device_fingerprint: "test-device".to_string(),
            current_version: "1.0".parse().unwrap(),
            channel: "stable".to_string(),
            market_segment: "consumer".to_string(),
            interactive: false,
        }
    }

    fn plan() -> InstallPlan {
        InstallPlan::builder()
            .payloads(vec![])
            .source_slot(Slot::A)
            .target_slot(Slot::B)
            .build()
            .unwrap()
    }

    fn run(action: &mut UpdateCheckAction) -> ErrorCode {
        block_on(action.perform(ActionControl::new()))
    }

    #[test]
    fn test_plan_is_published() {
        let mut checker = FakeUpdateChecker::new();
        checker.responses.push_back(Ok(Some(plan())));
        let out = Rc::new(RefCell::new(None));
        let mut action =
            UpdateCheckAction::new(Rc::new(RefCell::new(checker)), request(), out.clone());
        assert_eq!(run(&mut action), ErrorCode::Success);
        assert!(out.borrow().is_some());
    }

    #[test]
    fn test_no_update_leaves_plan_empty() {
        let mut checker = FakeUpdateChecker::new();
        checker.responses.push_back(Ok(None));
        let out = Rc::new(RefCell::new(Some(plan())));
        let mut action =
            UpdateCheckAction::new(Rc::new(RefCell::new(checker)), request(), out.clone());
        assert_eq!(run(&mut action), ErrorCode::Success);
        assert!(out.borrow().is_none());
    }

    #[test]
    fn test_check_failure_reports_transfer_error() {
        let mut checker = FakeUpdateChecker::new();
        checker.responses.push_back(Err("server unreachable".to_string()));
        let out = Rc::new(RefCell::new(None));
        let mut action =
            UpdateCheckAction::new(Rc::new(RefCell::new(checker)), request(), out.clone());
        assert_eq!(run(&mut action), ErrorCode::DownloadTransferError);
        assert!(out.borrow().is_none());
    }
}
