// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The download action: streams each payload from its URL into the
//! payload consumer, which applies it to the inactive slot as bytes
//! arrive. Resumes from the durable cursor, reports byte progress, and
//! honors suspend/cancel between fetch windows.

use crate::action::{Action, ActionControl};
use crate::boot_control::BootControl;
use crate::crypto::TrustedKeys;
use crate::error::ErrorCode;
use crate::http::{FetchEvent, HttpFetcher};
use crate::install_plan::InstallPlan;
use crate::payload::parser::{PayloadProcessor, ProgressCursor};
use crate::payload::writer::PartitionProvider;
use crate::prefs::{keys, Prefs};
use futures::channel::mpsc;
use futures::future::LocalBoxFuture;
use futures::{FutureExt as _, StreamExt as _};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes since the previous report.
    pub bytes_progressed: u64,
    /// Bytes of the current payload consumed so far (including resumed
    /// ones).
    pub bytes_received: u64,
    pub bytes_total: u64,
}

pub struct DownloadAction {
    prefs: Rc<RefCell<dyn Prefs>>,
    boot: Rc<RefCell<dyn BootControl>>,
    provider: Rc<RefCell<dyn PartitionProvider>>,
    trusted_keys: TrustedKeys,
    fetcher: Box<dyn HttpFetcher>,
    plan: Rc<RefCell<Option<InstallPlan>>>,
    /// URL rotation position, chosen by the `update_can_start` policy.
    url_index: usize,
    progress: Option<mpsc::UnboundedSender<DownloadProgress>>,
}

impl DownloadAction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prefs: Rc<RefCell<dyn Prefs>>,
        boot: Rc<RefCell<dyn BootControl>>,
        provider: Rc<RefCell<dyn PartitionProvider>>,
        trusted_keys: TrustedKeys,
        fetcher: Box<dyn HttpFetcher>,
        plan: Rc<RefCell<Option<InstallPlan>>>,
        url_index: usize,
        progress: Option<mpsc::UnboundedSender<DownloadProgress>>,
    ) -> Self {
        DownloadAction {
            prefs,
            boot,
            provider,
            trusted_keys,
            fetcher,
            plan,
            url_index,
            progress,
        }
    }

    pub fn http_response_code(&self) -> Option<u16> {
        self.fetcher.http_response_code()
    }

    fn account_bytes(&self, len: u64) {
        let mut prefs = self.prefs.borrow_mut();
        for key in [keys::CURRENT_BYTES_DOWNLOADED, keys::TOTAL_BYTES_DOWNLOADED] {
            let so_far = prefs.get_int(key).filter(|v| *v >= 0).unwrap_or(0);
            let _ = prefs.set_int(key, so_far + len as i64);
        }
    }

    fn report_progress(&self, progressed: u64, received: u64, total: u64) {
        if let Some(tx) = &self.progress {
            let _ = tx.unbounded_send(DownloadProgress {
                bytes_progressed: progressed,
                bytes_received: received,
                bytes_total: total,
            });
        }
    }

    async fn run(&mut self, control: ActionControl) -> Result<(), ErrorCode> {
        let plan = self
            .plan
            .borrow()
            .clone()
            .ok_or(ErrorCode::DownloadStateInitializationError)?;

        // A delta payload can only be applied when the booted slot is the
        // slot the payload was generated against. Checked before any byte
        // is written.
        let current = self.boot.borrow().current_slot();
        if plan.is_delta() && plan.source_slot != current {
            warn!(
                declared = %plan.source_slot,
                booted = %current,
                "delta payload does not match the booted slot"
            );
            return Err(ErrorCode::PayloadMismatchedType);
        }

        let resume_payload = ProgressCursor::load(&*self.prefs.borrow())
            .map(|c| c.payload_index)
            .unwrap_or(0)
            .min(plan.payloads.len());

        for (index, payload) in plan.payloads.iter().enumerate().skip(resume_payload) {
            let (mut processor, offset) = self.open_processor(&plan, index)?;
            let url = payload
                .urls
                .get(self.url_index % payload.urls.len().max(1))
                .ok_or(ErrorCode::DownloadTransferError)?
                .clone();
            info!(
                url = %url, offset, payload = index,
                "starting payload transfer"
            );

            let mut stream =
                self.fetcher
                    .begin_transfer(url, offset, Some(payload.size - offset));
            let mut completed = false;
            while let Some(event) = stream.next().await {
                match event {
                    FetchEvent::Data(bytes) => {
                        if let Err(code) = processor.write_bytes(&bytes) {
                            self.fetcher.terminate();
                            return Err(code);
                        }
                        self.account_bytes(bytes.len() as u64);
                        self.report_progress(
                            bytes.len() as u64,
                            processor.bytes_consumed(),
                            payload.size,
                        );
                    }
                    FetchEvent::SeekTo(position) => {
                        // The consumer cannot rewind its hash; any offset
                        // other than the current one invalidates resume.
                        if position != processor.bytes_consumed() {
                            self.fetcher.terminate();
                            return Err(ErrorCode::ResumeOffsetMismatch);
                        }
                    }
                    FetchEvent::Complete { successful: true } => {
                        completed = true;
                        break;
                    }
                    FetchEvent::Complete { successful: false } => {
                        return Err(ErrorCode::DownloadTransferError);
                    }
                    FetchEvent::Terminated => {
                        return Err(control.cancel_code().unwrap_or(ErrorCode::UserCanceled));
                    }
                }

                if control.is_suspended() {
                    self.fetcher.pause();
                    match control.checkpoint().await {
                        Ok(()) => self.fetcher.resume(),
                        Err(code) => {
                            self.fetcher.terminate();
                            return Err(code);
                        }
                    }
                } else if let Some(code) = control.cancel_code() {
                    self.fetcher.terminate();
                    return Err(code);
                }
            }
            if !completed {
                return Err(ErrorCode::DownloadTransferError);
            }
            processor.finish()?;
            if let Some(plan) = self.plan.borrow_mut().as_mut() {
                plan.record_payload_result(ErrorCode::Success);
            }
            info!(payload = index, "payload applied and verified");
        }
        Ok(())
    }

    /// Builds a consumer for payload `index`, resuming from the durable
    /// cursor when it points into this payload. A cursor that fails
    /// validation is discarded and the payload restarts from byte zero.
    fn open_processor(
        &self,
        plan: &InstallPlan,
        index: usize,
    ) -> Result<(PayloadProcessor, u64), ErrorCode> {
        let payload = plan.payloads[index].clone();
        let has_cursor = ProgressCursor::load(&*self.prefs.borrow())
            .map(|c| c.payload_index == index)
            .unwrap_or(false);
        if has_cursor {
            match PayloadProcessor::resume(
                self.prefs.clone(),
                self.trusted_keys.clone(),
                self.provider.clone(),
                payload.clone(),
                index,
                plan.source_slot,
                plan.target_slot,
                plan.is_interactive,
            ) {
                Ok(resumed) => return Ok(resumed),
                Err(code) => {
                    warn!(code = %code, "persisted cursor rejected; restarting payload");
                    ProgressCursor::clear(&mut *self.prefs.borrow_mut());
                }
            }
        }
        Ok((
            PayloadProcessor::new(
                self.prefs.clone(),
                self.trusted_keys.clone(),
                self.provider.clone(),
                payload,
                index,
                plan.source_slot,
                plan.target_slot,
                plan.is_interactive,
            ),
            0,
        ))
    }
}

impl Action for DownloadAction {
    fn name(&self) -> &'static str {
        "download"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_control::{FakeBootControl, Slot};
    use crate::crypto::test_support::make_trusted_keys;
    use crate::http::MockHttpFetcher;
    use crate::install_plan::{PayloadInfo, PayloadType};
    use crate::payload::test_util::{PayloadBuilder, TestPartition};
    use crate::payload::writer::MemPartitionProvider;
    use crate::prefs::MemPrefs;
    use futures::executor::block_on;

    const BS: u64 = 4096;

    fn image(seed: u8, blocks: u64) -> Vec<u8> {
        (0..blocks * BS).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
    }

    struct Harness {
        prefs: Rc<RefCell<MemPrefs>>,
        boot: Rc<RefCell<FakeBootControl>>,
        provider: Rc<RefCell<MemPartitionProvider>>,
        raw_provider: MemPartitionProvider,
        fetcher: MockHttpFetcher,
        plan: Rc<RefCell<Option<InstallPlan>>>,
        payload_bytes: Vec<u8>,
        new_image: Vec<u8>,
    }

    fn harness(current_slot: Slot) -> Harness {
        let src = image(1, 4);
        let dst = image(2, 4);
        let mut provider = MemPartitionProvider::new();
        provider.insert("rootfs", Slot::A, src.clone());
        provider.insert("rootfs", Slot::B, vec![]);

        let (payload_bytes, payload_info) = PayloadBuilder::new()
            .partition(TestPartition::delta("rootfs", &src, &dst))
            .build(PayloadType::Delta);

        let plan = InstallPlan::builder()
            .payloads(vec![payload_info])
            .source_slot(Slot::A)
            .target_slot(Slot::B)
            .build()
            .unwrap();

        Harness {
            prefs: Rc::new(RefCell::new(MemPrefs::new())),
            boot: Rc::new(RefCell::new(FakeBootControl::new(2, current_slot))),
            provider: Rc::new(RefCell::new(provider.clone())),
            raw_provider: provider,
            fetcher: MockHttpFetcher::new(),
            plan: Rc::new(RefCell::new(Some(plan))),
            payload_bytes,
            new_image: dst,
        }
    }

    fn action(h: &Harness) -> DownloadAction {
        DownloadAction::new(
            h.prefs.clone(),
            h.boot.clone(),
            h.provider.clone(),
            make_trusted_keys(),
            Box::new(h.fetcher.clone()),
            h.plan.clone(),
            0,
            None,
        )
    }

    #[test]
    fn test_happy_path_applies_payload() {
        let h = harness(Slot::A);
        h.fetcher.push_success(&h.payload_bytes, 7);
        let mut action = action(&h);
        let code = block_on(action.perform(ActionControl::new()));
        assert_eq!(code, ErrorCode::Success);
        assert_eq!(
            h.raw_provider.image("rootfs", Slot::B).unwrap().content(),
            h.new_image
        );
        assert_eq!(
            h.plan.borrow().as_ref().unwrap().payload_results,
            vec![ErrorCode::Success]
        );
    }

    #[test]
    fn test_wrong_booted_slot_rejected_before_any_write() {
        let h = harness(Slot::B);
        h.fetcher.push_success(&h.payload_bytes, 1);
        let mut action = action(&h);
        let code = block_on(action.perform(ActionControl::new()));
        assert_eq!(code, ErrorCode::PayloadMismatchedType);
        assert!(h
            .raw_provider
            .image("rootfs", Slot::B)
            .unwrap()
            .content()
            .is_empty());
        // The fetch never started.
        assert!(h.fetcher.requests().is_empty());
    }

    #[test]
    fn test_severed_stream_resumes_at_cursor_offset() {
        let h = harness(Slot::A);

        // First transfer dies partway through the data section.
        let cut = h.payload_bytes.len() * 2 / 3;
        h.fetcher.push_transfer(vec![
            FetchEvent::Data(h.payload_bytes[..cut].to_vec()),
            FetchEvent::Complete { successful: false },
        ]);
        let mut first = action(&h);
        assert_eq!(
            block_on(first.perform(ActionControl::new())),
            ErrorCode::DownloadTransferError
        );

        let cursor =
            ProgressCursor::load(&*h.prefs.borrow()).expect("cursor persisted mid-download");
        assert!(cursor.byte_offset > 0);
        assert!(cursor.operation_index > 0);

        // Second attempt must reopen at exactly the cursor offset and only
        // need the remaining bytes.
        h.fetcher
            .push_success(&h.payload_bytes[cursor.byte_offset as usize..], 3);
        let mut second = action(&h);
        assert_eq!(
            block_on(second.perform(ActionControl::new())),
            ErrorCode::Success
        );
        let requests = h.fetcher.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].1, cursor.byte_offset);
        assert_eq!(
            h.raw_provider.image("rootfs", Slot::B).unwrap().content(),
            h.new_image
        );
    }

    #[test]
    fn test_transfer_failure_maps_to_transport_error() {
        let h = harness(Slot::A);
        h.fetcher
            .push_transfer(vec![FetchEvent::Complete { successful: false }]);
        let mut action = action(&h);
        assert_eq!(
            block_on(action.perform(ActionControl::new())),
            ErrorCode::DownloadTransferError
        );
    }

    #[test]
    fn test_cancel_publishes_user_cancelled_and_keeps_cursor() {
        let h = harness(Slot::A);
        // Data then a Terminated event, as the fetcher reports after
        // terminate() is called on it.
        h.fetcher.push_transfer(vec![
            FetchEvent::Data(h.payload_bytes[..h.payload_bytes.len() / 2].to_vec()),
            FetchEvent::Terminated,
        ]);
        let mut action = action(&h);
        let control = ActionControl::new();
        control.cancel(ErrorCode::UserCanceled);
        let code = block_on(action.perform(control));
        assert_eq!(code, ErrorCode::UserCanceled);
        // Cursor survives cancellation: a later attempt may resume.
        assert!(ProgressCursor::load(&*h.prefs.borrow()).is_some());
    }

    #[test]
    fn test_byte_accounting_accumulates() {
        let h = harness(Slot::A);
        h.fetcher.push_success(&h.payload_bytes, 5);
        let mut action = action(&h);
        block_on(action.perform(ActionControl::new()));
        assert_eq!(
            h.prefs.borrow().get_int(keys::TOTAL_BYTES_DOWNLOADED),
            Some(h.payload_bytes.len() as i64)
        );
        assert_eq!(
            h.prefs.borrow().get_int(keys::CURRENT_BYTES_DOWNLOADED),
            Some(h.payload_bytes.len() as i64)
        );
    }

    #[test]
    fn test_progress_reports_are_monotone() {
        let h = harness(Slot::A);
        h.fetcher.push_success(&h.payload_bytes, 9);
        let (tx, mut rx) = mpsc::unbounded();
        let mut action = DownloadAction::new(
            h.prefs.clone(),
            h.boot.clone(),
            h.provider.clone(),
            make_trusted_keys(),
            Box::new(h.fetcher.clone()),
            h.plan.clone(),
            0,
            Some(tx),
        );
        block_on(action.perform(ActionControl::new()));

        let mut last = 0u64;
        let mut reports = 0;
        while let Ok(Some(p)) = rx.try_next() {
            assert!(p.bytes_received >= last);
            assert_eq!(p.bytes_total, h.payload_bytes.len() as u64);
            last = p.bytes_received;
            reports += 1;
        }
        assert!(reports > 1);
        assert_eq!(last, h.payload_bytes.len() as u64);
    }
}
