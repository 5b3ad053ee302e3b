// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Finalization: flip the bootloader pointer to the updated slot, record
//! the markers the next boot needs, and retire the progress cursor.

use crate::action::{Action, ActionControl};
use crate::boot_control::BootControl;
use crate::error::ErrorCode;
use crate::install_plan::InstallPlan;
use crate::payload::parser::ProgressCursor;
use crate::prefs::{keys, Prefs};
use futures::future::LocalBoxFuture;
use futures::FutureExt as _;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{error, info};

pub struct FinalizeAction {
    prefs: Rc<RefCell<dyn Prefs>>,
    boot: Rc<RefCell<dyn BootControl>>,
    plan: Rc<RefCell<Option<InstallPlan>>>,
    /// Recorded so the next boot can tell whether the reboot actually
    /// happened on this boot session.
    boot_id: Option<String>,
}

impl FinalizeAction {
    pub fn new(
        prefs: Rc<RefCell<dyn Prefs>>,
        boot: Rc<RefCell<dyn BootControl>>,
        plan: Rc<RefCell<Option<InstallPlan>>>,
        boot_id: Option<String>,
    ) -> Self {
        FinalizeAction {
            prefs,
            boot,
            plan,
            boot_id,
        }
    }

    fn run(&mut self) -> Result<(), ErrorCode> {
        let plan = self
            .plan
            .borrow()
            .clone()
            .ok_or(ErrorCode::PostinstallRunnerError)?;

        {
            let mut prefs = self.prefs.borrow_mut();
            if plan.powerwash {
                prefs
                    .set_bool(keys::POWERWASH_MARKER, true)
                    .map_err(|_| ErrorCode::PostinstallRunnerError)?;
            }
            if plan.is_rollback {
                prefs
                    .set_bool(keys::ROLLBACK_HAPPENED, true)
                    .map_err(|_| ErrorCode::PostinstallRunnerError)?;
            }
        }

        self.boot
            .borrow_mut()
            .set_active_slot(plan.target_slot)
            .map_err(|e| {
                error!("failed to activate slot {}: {e}", plan.target_slot);
                ErrorCode::BootControlError
            })?;
        info!(slot = %plan.target_slot, "active slot switched; reboot pending");

        let mut prefs = self.prefs.borrow_mut();
        if let Some(boot_id) = &self.boot_id {
            let _ = prefs.set_string(keys::UPDATE_COMPLETED_ON_BOOT_ID, boot_id);
        }
        // The attempt is complete: the cursor's lifecycle ends here.
        ProgressCursor::clear(&mut *prefs);
        Ok(())
    }
}

impl Action for FinalizeAction {
    fn name(&self) -> &'static str {
        "finalize"
    }

    fn perform(&mut self, control: ActionControl) -> LocalBoxFuture<'_, ErrorCode> {
        async move {
            if let Err(code) = control.checkpoint().await {
                return code;
            }
            match self.run() {
                Ok(()) => ErrorCode::Success,
                Err(code) => code,
            }
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_control::{FakeBootControl, Slot};
    use crate::prefs::MemPrefs;
    use futures::executor::block_on;

    fn plan(powerwash: bool, rollback: bool) -> InstallPlan {
        InstallPlan::builder()
            .payloads(vec![])
            .source_slot(Slot::A)
            .target_slot(Slot::B)
            .powerwash(powerwash)
            .is_rollback(rollback)
            .build()
            .unwrap()
    }

    fn run_finalize(
        plan: InstallPlan,
        boot: Rc<RefCell<FakeBootControl>>,
        prefs: Rc<RefCell<MemPrefs>>,
    ) -> ErrorCode {
        let mut action = FinalizeAction::new(
            prefs,
            boot,
            Rc::new(RefCell::new(Some(plan))),
            Some("boot-1".to_string()),
        );
        block_on(action.perform(ActionControl::new()))
    }

    #[test]
    fn test_flips_active_slot_and_clears_cursor() {
        let prefs = Rc::new(RefCell::new(MemPrefs::new()));
        prefs.borrow_mut().set_int(keys::RESUME_OFFSET, 42).unwrap();
        let boot = Rc::new(RefCell::new(FakeBootControl::new(2, Slot::A)));

        let code = run_finalize(plan(false, false), boot.clone(), prefs.clone());
        assert_eq!(code, ErrorCode::Success);
        assert_eq!(boot.borrow().active_slot(), Slot::B);
        assert!(!prefs.borrow().exists(keys::RESUME_OFFSET));
        assert_eq!(
            prefs.borrow().get_string(keys::UPDATE_COMPLETED_ON_BOOT_ID).as_deref(),
            Some("boot-1")
        );
        assert!(!prefs.borrow().exists(keys::POWERWASH_MARKER));
    }

    #[test]
    fn test_powerwash_and_rollback_markers() {
        let prefs = Rc::new(RefCell::new(MemPrefs::new()));
        let boot = Rc::new(RefCell::new(FakeBootControl::new(2, Slot::A)));
        let code = run_finalize(plan(true, true), boot, prefs.clone());
        assert_eq!(code, ErrorCode::Success);
        assert_eq!(prefs.borrow().get_bool(keys::POWERWASH_MARKER), Some(true));
        assert_eq!(prefs.borrow().get_bool(keys::ROLLBACK_HAPPENED), Some(true));
    }

    #[test]
    fn test_unbootable_target_reports_boot_control_error() {
        let prefs = Rc::new(RefCell::new(MemPrefs::new()));
        let boot = Rc::new(RefCell::new(FakeBootControl::new(2, Slot::A)));
        boot.borrow_mut().mark_unbootable(Slot::B).unwrap();
        let code = run_finalize(plan(false, false), boot.clone(), prefs);
        assert_eq!(code, ErrorCode::BootControlError);
        assert_eq!(boot.borrow().active_slot(), Slot::A);
    }
}
