// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Post-download filesystem verification: re-reads every updated
//! partition from the target slot and checks it against the manifest
//! hashes, independently of the checks the writer already performed.

use crate::action::{Action, ActionControl};
use crate::error::ErrorCode;
use crate::hash::RestartableHasher;
use crate::install_plan::InstallPlan;
use crate::payload::manifest::Manifest;
use crate::payload::parser::PayloadHeader;
use crate::payload::writer::PartitionProvider;
use crate::prefs::{keys, Prefs};
use futures::future::LocalBoxFuture;
use futures::FutureExt as _;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{error, info};

pub struct FilesystemVerifierAction {
    prefs: Rc<RefCell<dyn Prefs>>,
    provider: Rc<RefCell<dyn PartitionProvider>>,
    plan: Rc<RefCell<Option<InstallPlan>>>,
}

impl FilesystemVerifierAction {
    pub fn new(
        prefs: Rc<RefCell<dyn Prefs>>,
        provider: Rc<RefCell<dyn PartitionProvider>>,
        plan: Rc<RefCell<Option<InstallPlan>>>,
    ) -> Self {
        FilesystemVerifierAction {
            prefs,
            provider,
            plan,
        }
    }

    async fn run(&mut self, control: ActionControl) -> Result<(), ErrorCode> {
        let plan = self
            .plan
            .borrow()
            .clone()
            .ok_or(ErrorCode::FilesystemVerifierError)?;
        let metadata = self
            .prefs
            .borrow()
            .get_blob(keys::CACHED_MANIFEST)
            .ok_or(ErrorCode::FilesystemVerifierError)?;
        let manifest: Manifest = serde_json::from_slice(&metadata[PayloadHeader::LEN.min(metadata.len())..])
            .map_err(|_| ErrorCode::FilesystemVerifierError)?;

        for partition in &manifest.partitions {
            control.checkpoint().await?;
            let mut io = self
                .provider
                .borrow_mut()
                .open_partition(&partition.name, plan.target_slot, false)
                .map_err(|_| ErrorCode::FilesystemVerifierError)?;

            let mut hasher = RestartableHasher::new();
            let mut offset = 0u64;
            let mut remaining = partition.new_size;
            let mut buf = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let take = buf.len().min(remaining as usize);
                io.read_at(offset, &mut buf[..take])
                    .map_err(|_| ErrorCode::FilesystemVerifierError)?;
                hasher.update(&buf[..take]);
                offset += take as u64;
                remaining -= take as u64;
            }
            if hasher.finalize() != partition.new_hash {
                error!(
                    partition = %partition.name,
                    "updated partition failed post-download verification"
                );
                return Err(ErrorCode::FilesystemVerifierError);
            }
            info!(partition = %partition.name, "filesystem verified");
        }
        Ok(())
    }
}

impl Action for FilesystemVerifierAction {
    fn name(&self) -> &'static str {
        "filesystem-verifier"
    }

    fn perform(&mut self, control: ActionControl) -> LocalBoxFuture<'_, ErrorCode> {
        async move {
            match self.run(control).await {
                Ok(()) => ErrorCode::Success,
                Err(code) => code,
            }
        }
        .boxed_local()
    }
}
