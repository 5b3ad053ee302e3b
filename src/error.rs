// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The closed set of terminal codes an action can publish, and the
//! attempter-level classification of each failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every action completes by publishing exactly one of these codes.
/// `Success` advances the pipeline; anything else aborts it.
#[derive(Clone, Copy, Debug, Error, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[error("success")]
    Success,

    // Policy outcomes.
    #[error("update ignored per policy")]
    OmahaUpdateIgnoredPerPolicy,
    #[error("update applied but target slot is not active")]
    UpdatedButNotActive,
    #[error("canceled by user request")]
    UserCanceled,

    // Download transport.
    #[error("transfer failed")]
    DownloadTransferError,
    #[error("write of downloaded bytes failed")]
    DownloadWriteError,

    // Payload verification.
    #[error("payload hash mismatch")]
    PayloadHashMismatchError,
    #[error("payload size mismatch")]
    PayloadSizeMismatchError,
    #[error("payload metadata signature did not verify")]
    PayloadMetadataSignatureError,
    #[error("no bundled key could verify the payload")]
    PayloadPubKeyVerificationError,

    // Payload parsing.
    #[error("payload header invalid")]
    PayloadHeaderInvalid,
    #[error("metadata size invalid or over cap")]
    DownloadInvalidMetadataSize,
    #[error("manifest failed to parse")]
    DownloadManifestParseError,
    #[error("payload type does not match the booted slot")]
    PayloadMismatchedType,
    #[error("source partition state failed its hash check")]
    DownloadStateInitializationError,
    #[error("resume offset disagrees with persisted cursor")]
    ResumeOffsetMismatch,

    // Partition writer.
    #[error("install operation failed to execute")]
    DownloadOperationExecutionError,
    #[error("new rootfs failed verification")]
    NewRootfsVerificationError,
    #[error("new kernel failed verification")]
    NewKernelVerificationError,
    #[error("filesystem verification failed")]
    FilesystemVerifierError,

    // Finalization and external collaborators.
    #[error("postinstall step failed")]
    PostinstallRunnerError,
    #[error("rollback not permitted by policy")]
    RollbackNotPossible,
    #[error("boot control call failed")]
    BootControlError,
}

/// How the attempter reacts to a non-`Success` terminal code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureDisposition {
    /// Transport trouble; retry the same URL after backoff.
    RetryWithBackoff,
    /// The artifact behind this URL is suspect; advance to the next URL
    /// without exhausting per-URL retries.
    RetryNextUrl,
    /// Retrying cannot help without a new install plan.
    Fatal,
    /// An external collaborator refused; report and retry at the next
    /// scheduled check.
    ExternalCause,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    /// Hard payload errors make the current URL unusable immediately.
    pub fn is_hard_payload_error(self) -> bool {
        matches!(
            self.classify(),
            Some(FailureDisposition::RetryNextUrl) | Some(FailureDisposition::Fatal)
        )
    }

    /// Attempter-level classification. `None` for `Success`.
    pub fn classify(self) -> Option<FailureDisposition> {
        use ErrorCode::*;
        use FailureDisposition::*;
        match self {
            Success => None,

            DownloadTransferError | DownloadWriteError => Some(RetryWithBackoff),

            PayloadHashMismatchError
            | PayloadSizeMismatchError
            | PayloadHeaderInvalid
            | DownloadManifestParseError
            | ResumeOffsetMismatch
            | DownloadOperationExecutionError
            | NewRootfsVerificationError
            | NewKernelVerificationError
            | FilesystemVerifierError => Some(RetryNextUrl),

            PayloadMetadataSignatureError
            | PayloadPubKeyVerificationError
            | DownloadInvalidMetadataSize
            | PayloadMismatchedType
            | DownloadStateInitializationError
            | RollbackNotPossible => Some(Fatal),

            OmahaUpdateIgnoredPerPolicy
            | UpdatedButNotActive
            | UserCanceled
            | PostinstallRunnerError
            | BootControlError => Some(ExternalCause),
        }
    }
}
