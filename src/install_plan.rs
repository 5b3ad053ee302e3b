// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The install plan: everything one update attempt needs, produced by the
//! external update-check collaborator and owned by the attempter. Immutable
//! apart from appending per-payload results as the attempt proceeds.

use crate::boot_control::Slot;
use crate::error::ErrorCode;
use crate::hash::Digest;
use crate::version::Version;
use derive_builder::Builder;
use url::Url;

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PayloadType {
    Full,
    Delta,
    MinorDelta,
}

impl PayloadType {
    pub fn is_delta(self) -> bool {
        matches!(self, PayloadType::Delta | PayloadType::MinorDelta)
    }
}

/// One downloadable payload within the plan.
#[derive(Clone, Debug, PartialEq)]
pub struct PayloadInfo {
    /// Candidate URLs, tried in order (with wraparound) per policy.
    pub urls: Vec<Url>,
    pub size: u64,
    /// Expected hash over the entire payload, byte 0 to end.
    pub hash: Digest,
    /// Expected size of header + manifest, bytes.
    pub metadata_size: u64,
    /// Expected detached signature over the metadata.
    pub metadata_signature: Vec<u8>,
    pub source_version: Option<Version>,
    pub target_version: Version,
    pub payload_type: PayloadType,
}

/// Source/target slot assignment for one partition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionSlots {
    pub name: String,
    /// `None` for full payloads, which never read the source slot.
    pub source_slot: Option<Slot>,
    pub target_slot: Slot,
}

#[derive(Builder, Clone, Debug, PartialEq)]
#[builder(pattern = "owned", setter(into))]
pub struct InstallPlan {
    pub payloads: Vec<PayloadInfo>,
    /// The slot delta payloads read from; must be the booted slot.
    pub source_slot: Slot,
    pub target_slot: Slot,
    #[builder(default)]
    pub is_interactive: bool,
    /// Wipe user data after the reboot into the new slot.
    #[builder(default)]
    pub powerwash: bool,
    /// The target version is older than the source; only valid when policy
    /// allows rollback.
    #[builder(default)]
    pub is_rollback: bool,
    #[builder(default)]
    pub partitions: Vec<PartitionSlots>,
    /// Terminal code of each completed payload, appended during the
    /// attempt.
    #[builder(default)]
    pub payload_results: Vec<ErrorCode>,
}

impl InstallPlan {
    pub fn builder() -> InstallPlanBuilder {
        InstallPlanBuilder::default()
    }

    /// Stable identifier for logs and dedup: target version and slot.
    pub fn id(&self) -> String {
        let version = self
            .payloads
            .first()
            .map(|p| p.target_version.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!("{version}/slot-{}", self.target_slot)
    }

    pub fn is_delta(&self) -> bool {
        self.payloads.iter().any(|p| p.payload_type.is_delta())
    }

    pub fn record_payload_result(&mut self, code: ErrorCode) {
        self.payload_results.push(code);
    }
}
