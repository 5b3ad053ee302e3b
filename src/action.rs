// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The ordered action pipeline.
//!
//! Actions run sequentially on the single-threaded loop; each completes
//! by returning a terminal [`ErrorCode`]. `Success` advances to the next
//! action, anything else aborts the pipeline and reports upward. Suspend,
//! resume, and cancel arrive through a shared [`ActionControl`] handle;
//! actions honor them at their checkpoints (between HTTP ranges, between
//! operations, between partitions).

use crate::error::ErrorCode;
use futures::channel::mpsc;
use futures::future::LocalBoxFuture;
use futures::task::Waker;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{info, warn};

/// Cooperative control shared between the pipeline and the running
/// action. Cloning yields a handle to the same state.
#[derive(Clone, Debug, Default)]
pub struct ActionControl {
    inner: Rc<RefCell<ControlState>>,
}

#[derive(Debug, Default)]
struct ControlState {
    suspended: bool,
    cancel: Option<ErrorCode>,
    waker: Option<Waker>,
}

impl ActionControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self) {
        self.inner.borrow_mut().suspended = true;
    }

    pub fn resume(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.suspended = false;
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    /// Prompt cancellation with the given terminal code.
    pub fn cancel(&self, code: ErrorCode) {
        let mut inner = self.inner.borrow_mut();
        inner.cancel = Some(code);
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.borrow().suspended
    }

    pub fn cancel_code(&self) -> Option<ErrorCode> {
        self.inner.borrow().cancel
    }

    /// An action's yield point: waits while suspended, and surfaces a
    /// pending cancellation as `Err`.
    pub async fn checkpoint(&self) -> Result<(), ErrorCode> {
        futures::future::poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            if let Some(code) = inner.cancel {
                return std::task::Poll::Ready(Err(code));
            }
            if !inner.suspended {
                return std::task::Poll::Ready(Ok(()));
            }
            inner.waker = Some(cx.waker().clone());
            std::task::Poll::Pending
        })
        .await
    }
}

pub trait Action {
    fn name(&self) -> &'static str;

    /// Runs to completion, returning the action's single terminal code.
    fn perform(&mut self, control: ActionControl) -> LocalBoxFuture<'_, ErrorCode>;
}

/// Status notifications, delivered strictly in action order: no event for
/// action *k+1* precedes the completion event of action *k*.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineEvent {
    ActionStarted { name: &'static str },
    ActionCompleted { name: &'static str, code: ErrorCode },
}

pub struct ActionPipeline {
    actions: Vec<Box<dyn Action>>,
    control: ActionControl,
}

impl ActionPipeline {
    pub fn new(actions: Vec<Box<dyn Action>>) -> Self {
        ActionPipeline {
            actions,
            control: ActionControl::new(),
        }
    }

    pub fn control(&self) -> ActionControl {
        self.control.clone()
    }

    /// Drives every action in order. Returns the first non-`Success`
    /// code, or `Success` when the whole sequence completes.
    pub async fn run(mut self, events: mpsc::UnboundedSender<PipelineEvent>) -> ErrorCode {
        for mut action in self.actions.drain(..) {
            // A cancel between actions clears the rest of the queue.
            if let Some(code) = self.control.cancel_code() {
                warn!(code = %code, "pipeline canceled between actions");
                return code;
            }
            let name = action.name();
            let _ = events.unbounded_send(PipelineEvent::ActionStarted { name });
            let code = action.perform(self.control.clone()).await;
            let _ = events.unbounded_send(PipelineEvent::ActionCompleted { name, code });
            if !code.is_success() {
                info!(action = name, code = %code, "pipeline aborted");
                return code;
            }
        }
        ErrorCode::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{FutureExt as _, StreamExt as _};

    /// Completes with a fixed code after honoring one checkpoint.
    struct StaticAction {
        name: &'static str,
        code: ErrorCode,
    }

    impl Action for StaticAction {
        fn name(&self) -> &'static str {
            self.name
        }

        fn perform(&mut self, control: ActionControl) -> LocalBoxFuture<'_, ErrorCode> {
            let code = self.code;
            async move {
                match control.checkpoint().await {
                    Ok(()) => code,
                    Err(cancel) => cancel,
                }
            }
            .boxed_local()
        }
    }

    fn collect_events(rx: &mut mpsc::UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Ok(Some(event)) = rx.try_next() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_actions_run_in_order() {
        let pipeline = ActionPipeline::new(vec![
            Box::new(StaticAction {
                name: "first",
                code: ErrorCode::Success,
            }),
            Box::new(StaticAction {
                name: "second",
                code: ErrorCode::Success,
            }),
        ]);
        let (tx, mut rx) = mpsc::unbounded();
        let code = futures::executor::block_on(pipeline.run(tx));
        assert_eq!(code, ErrorCode::Success);
        assert_eq!(
            collect_events(&mut rx),
            vec![
                PipelineEvent::ActionStarted { name: "first" },
                PipelineEvent::ActionCompleted {
                    name: "first",
                    code: ErrorCode::Success
                },
                PipelineEvent::ActionStarted { name: "second" },
                PipelineEvent::ActionCompleted {
                    name: "second",
                    code: ErrorCode::Success
                },
            ]
        );
    }

    #[test]
    fn test_failure_aborts_remaining_actions() {
        let pipeline = ActionPipeline::new(vec![
            Box::new(StaticAction {
                name: "first",
                code: ErrorCode::DownloadTransferError,
            }),
            Box::new(StaticAction {
                name: "never-runs",
                code: ErrorCode::Success,
            }),
        ]);
        let (tx, mut rx) = mpsc::unbounded();
        let code = futures::executor::block_on(pipeline.run(tx));
        assert_eq!(code, ErrorCode::DownloadTransferError);
        let events = collect_events(&mut rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, PipelineEvent::ActionStarted { name: "never-runs" })));
    }

    #[test]
    fn test_cancel_before_start_publishes_code() {
        let pipeline = ActionPipeline::new(vec![Box::new(StaticAction {
            name: "first",
            code: ErrorCode::Success,
        })]);
        pipeline.control().cancel(ErrorCode::UserCanceled);
        let (tx, _rx) = mpsc::unbounded();
        let code = futures::executor::block_on(pipeline.run(tx));
        assert_eq!(code, ErrorCode::UserCanceled);
    }

    #[test]
    fn test_cancel_interrupts_running_action() {
        let pipeline = ActionPipeline::new(vec![Box::new(StaticAction {
            name: "first",
            code: ErrorCode::Success,
        })]);
        let control = pipeline.control();
        let (tx, _rx) = mpsc::unbounded();

        futures::executor::block_on(async move {
            control.suspend();
            let mut run = pipeline.run(tx).boxed_local().fuse();
            futures::select_biased! {
                _ = run => panic!("completed while suspended"),
                default => {}
            }
            // Cancel while the action is parked at its checkpoint.
            control.cancel(ErrorCode::UserCanceled);
            assert_eq!(run.await, ErrorCode::UserCanceled);
        });
    }

    #[test]
    fn test_suspend_resume_roundtrip() {
        let pipeline = ActionPipeline::new(vec![Box::new(StaticAction {
            name: "first",
            code: ErrorCode::Success,
        })]);
        let control = pipeline.control();
        let (tx, _rx) = mpsc::unbounded();

        futures::executor::block_on(async move {
            control.suspend();
            let mut run = pipeline.run(tx).boxed_local().fuse();
            futures::select_biased! {
                _ = run => panic!("completed while suspended"),
                default => {}
            }
            control.resume();
            assert_eq!(run.await, ErrorCode::Success);
        });
    }
}
