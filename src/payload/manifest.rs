// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The payload manifest schema and its validation rules.
//!
//! A payload is: fixed envelope header, manifest, detached metadata
//! signature, then the packed operation data section. The manifest lists
//! every partition update and, per partition, the ordered operations whose
//! destination extents must tile the new image exactly.

use crate::hash::Digest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope magic at byte 0.
pub const MAGIC: &[u8; 4] = b"ABUP";
/// Current envelope version. Version 2 added the metadata-signature size
/// field to the header.
pub const VERSION: u64 = 2;
/// Oldest envelope version this engine still accepts.
pub const MIN_VERSION: u64 = 2;
/// Manifests above this size are rejected before allocation.
pub const MAX_MANIFEST_SIZE: u64 = 16 * 1024 * 1024;
/// Metadata signatures above this size are rejected.
pub const MAX_METADATA_SIGNATURE_SIZE: u32 = 64 * 1024;

/// A contiguous block range within a partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

impl Extent {
    pub fn new(start_block: u64, num_blocks: u64) -> Self {
        Extent {
            start_block,
            num_blocks,
        }
    }

    /// One past the last block. Saturates on overflow; extents whose end
    /// does not fit in u64 are rejected by [`Manifest::validate`] before
    /// any consumer trusts them.
    pub fn end_block(&self) -> u64 {
        self.start_block.saturating_add(self.num_blocks)
    }

    fn end_block_checked(&self) -> Option<u64> {
        self.start_block.checked_add(self.num_blocks)
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start_block < other.end_block() && other.start_block < self.end_block()
    }
}

/// Total blocks across a list of extents. Saturates on overflow.
pub fn total_blocks(extents: &[Extent]) -> u64 {
    extents
        .iter()
        .fold(0u64, |sum, e| sum.saturating_add(e.num_blocks))
}

/// One atomic unit of partition modification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InstallOperation {
    /// Write literal payload bytes.
    Replace {
        dst_extents: Vec<Extent>,
        data_offset: u64,
        data_length: u64,
        #[serde(with = "hex_digest")]
        data_hash: Digest,
    },
    /// Write payload bytes after bzip2 decompression.
    ReplaceBz {
        dst_extents: Vec<Extent>,
        data_offset: u64,
        data_length: u64,
        #[serde(with = "hex_digest")]
        data_hash: Digest,
    },
    /// Write payload bytes after xz decompression.
    ReplaceXz {
        dst_extents: Vec<Extent>,
        data_offset: u64,
        data_length: u64,
        #[serde(with = "hex_digest")]
        data_hash: Digest,
    },
    /// Legacy copy from source extents; may lack a source hash.
    Move {
        src_extents: Vec<Extent>,
        #[serde(default, with = "hex_digest_opt")]
        src_hash: Option<Digest>,
        dst_extents: Vec<Extent>,
    },
    /// Copy source-slot extents to destination extents.
    SourceCopy {
        src_extents: Vec<Extent>,
        #[serde(with = "hex_digest")]
        src_hash: Digest,
        dst_extents: Vec<Extent>,
    },
    /// Binary patch applied against the source read.
    Bsdiff {
        src_extents: Vec<Extent>,
        #[serde(with = "hex_digest")]
        src_hash: Digest,
        dst_extents: Vec<Extent>,
        data_offset: u64,
        data_length: u64,
        #[serde(with = "hex_digest")]
        data_hash: Digest,
    },
    SourceBsdiff {
        src_extents: Vec<Extent>,
        #[serde(with = "hex_digest")]
        src_hash: Digest,
        dst_extents: Vec<Extent>,
        data_offset: u64,
        data_length: u64,
        #[serde(with = "hex_digest")]
        data_hash: Digest,
    },
    /// Deflate-aware binary patch.
    Puffdiff {
        src_extents: Vec<Extent>,
        #[serde(with = "hex_digest")]
        src_hash: Digest,
        dst_extents: Vec<Extent>,
        data_offset: u64,
        data_length: u64,
        #[serde(with = "hex_digest")]
        data_hash: Digest,
    },
    /// Destination blocks become zero.
    Zero { dst_extents: Vec<Extent> },
    /// Destination blocks are dont-care to the image but still hash as
    /// zero; applied identically to `Zero`.
    Discard { dst_extents: Vec<Extent> },
}

impl InstallOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            InstallOperation::Replace { .. } => "replace",
            InstallOperation::ReplaceBz { .. } => "replace_bz",
            InstallOperation::ReplaceXz { .. } => "replace_xz",
            InstallOperation::Move { .. } => "move",
            InstallOperation::SourceCopy { .. } => "source_copy",
            InstallOperation::Bsdiff { .. } => "bsdiff",
            InstallOperation::SourceBsdiff { .. } => "source_bsdiff",
            InstallOperation::Puffdiff { .. } => "puffdiff",
            InstallOperation::Zero { .. } => "zero",
            InstallOperation::Discard { .. } => "discard",
        }
    }

    pub fn dst_extents(&self) -> &[Extent] {
        match self {
            InstallOperation::Replace { dst_extents, .. }
            | InstallOperation::ReplaceBz { dst_extents, .. }
            | InstallOperation::ReplaceXz { dst_extents, .. }
            | InstallOperation::Move { dst_extents, .. }
            | InstallOperation::SourceCopy { dst_extents, .. }
            | InstallOperation::Bsdiff { dst_extents, .. }
            | InstallOperation::SourceBsdiff { dst_extents, .. }
            | InstallOperation::Puffdiff { dst_extents, .. }
            | InstallOperation::Zero { dst_extents }
            | InstallOperation::Discard { dst_extents } => dst_extents,
        }
    }

    pub fn src_extents(&self) -> Option<&[Extent]> {
        match self {
            InstallOperation::Move { src_extents, .. }
            | InstallOperation::SourceCopy { src_extents, .. }
            | InstallOperation::Bsdiff { src_extents, .. }
            | InstallOperation::SourceBsdiff { src_extents, .. }
            | InstallOperation::Puffdiff { src_extents, .. } => Some(src_extents),
            _ => None,
        }
    }

    pub fn src_hash(&self) -> Option<&Digest> {
        match self {
            InstallOperation::Move { src_hash, .. } => src_hash.as_ref(),
            InstallOperation::SourceCopy { src_hash, .. }
            | InstallOperation::Bsdiff { src_hash, .. }
            | InstallOperation::SourceBsdiff { src_hash, .. }
            | InstallOperation::Puffdiff { src_hash, .. } => Some(src_hash),
            _ => None,
        }
    }

    /// Byte range of this operation's blob within the data section.
    pub fn data_range(&self) -> Option<(u64, u64)> {
        match self {
            InstallOperation::Replace {
                data_offset,
                data_length,
                ..
            }
            | InstallOperation::ReplaceBz {
                data_offset,
                data_length,
                ..
            }
            | InstallOperation::ReplaceXz {
                data_offset,
                data_length,
                ..
            }
            | InstallOperation::Bsdiff {
                data_offset,
                data_length,
                ..
            }
            | InstallOperation::SourceBsdiff {
                data_offset,
                data_length,
                ..
            }
            | InstallOperation::Puffdiff {
                data_offset,
                data_length,
                ..
            } => Some((*data_offset, *data_length)),
            _ => None,
        }
    }

    pub fn data_hash(&self) -> Option<&Digest> {
        match self {
            InstallOperation::Replace { data_hash, .. }
            | InstallOperation::ReplaceBz { data_hash, .. }
            | InstallOperation::ReplaceXz { data_hash, .. }
            | InstallOperation::Bsdiff { data_hash, .. }
            | InstallOperation::SourceBsdiff { data_hash, .. }
            | InstallOperation::Puffdiff { data_hash, .. } => Some(data_hash),
            _ => None,
        }
    }

    pub fn reads_source(&self) -> bool {
        self.src_extents().is_some()
    }
}

/// One partition's update within the manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionUpdate {
    pub name: String,
    /// Expected hash of the source partition for delta payloads, over the
    /// `old_size` prefix.
    #[serde(default, with = "hex_digest_opt")]
    pub old_hash: Option<Digest>,
    #[serde(default)]
    pub old_size: Option<u64>,
    #[serde(with = "hex_digest")]
    pub new_hash: Digest,
    /// Size of the new image in bytes; the final hash covers exactly this
    /// prefix of the destination.
    pub new_size: u64,
    pub operations: Vec<InstallOperation>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub block_size: u32,
    pub minor_version: u32,
    pub partitions: Vec<PartitionUpdate>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("block size {0} is not a positive power of two")]
    BadBlockSize(u32),
    #[error("manifest has no partitions")]
    NoPartitions,
    #[error("partition {0:?}: operation has an empty extent")]
    EmptyExtent(String),
    #[error("partition {0:?}: destination extents overlap")]
    ExtentOverlap(String),
    #[error("partition {0:?}: destination extents leave gaps")]
    ExtentGap(String),
    #[error("partition {0:?}: extents exceed the new image size")]
    ExtentOutOfRange(String),
    #[error("partition {0:?}: operation data offsets regress or overlap")]
    DataOffsetRegression(String),
    #[error("partition {0:?}: extent end does not fit in 64 bits")]
    ExtentOverflow(String),
    #[error("partition {0:?}: operation data range does not fit in 64 bits")]
    DataRangeOverflow(String),
}

impl Manifest {
    /// Structural validation: the destination extents of each partition's
    /// operations must tile `[0, ceil(new_size / block_size))` exactly,
    /// and data blobs must be packed in operation order.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(ManifestError::BadBlockSize(self.block_size));
        }
        if self.partitions.is_empty() {
            return Err(ManifestError::NoPartitions);
        }

        let mut next_data_offset = 0u64;
        for partition in &self.partitions {
            let blocks_needed = partition.new_size.div_ceil(self.block_size as u64);

            let mut covered: Vec<Extent> = Vec::new();
            for op in &partition.operations {
                // Extent fields come straight off the wire; reject anything
                // whose arithmetic would wrap before it reaches a consumer.
                for extent in op.dst_extents().iter().chain(
                    op.src_extents().into_iter().flatten(),
                ) {
                    if extent.num_blocks == 0 {
                        return Err(ManifestError::EmptyExtent(partition.name.clone()));
                    }
                    if extent.end_block_checked().is_none() {
                        return Err(ManifestError::ExtentOverflow(partition.name.clone()));
                    }
                }
                covered.extend_from_slice(op.dst_extents());

                if let Some((offset, length)) = op.data_range() {
                    if offset < next_data_offset {
                        return Err(ManifestError::DataOffsetRegression(partition.name.clone()));
                    }
                    next_data_offset = offset.checked_add(length).ok_or_else(|| {
                        ManifestError::DataRangeOverflow(partition.name.clone())
                    })?;
                }
            }

            covered.sort_by_key(|e| e.start_block);
            let mut expected_start = 0u64;
            for extent in &covered {
                if extent.start_block < expected_start {
                    return Err(ManifestError::ExtentOverlap(partition.name.clone()));
                }
                if extent.start_block > expected_start {
                    return Err(ManifestError::ExtentGap(partition.name.clone()));
                }
                expected_start = extent.end_block();
            }
            if expected_start > blocks_needed {
                return Err(ManifestError::ExtentOutOfRange(partition.name.clone()));
            }
            if expected_start < blocks_needed {
                return Err(ManifestError::ExtentGap(partition.name.clone()));
            }
        }
        Ok(())
    }

    /// Total bytes of the packed data section. Saturates on overflow;
    /// `validate` rejects manifests whose ranges overflow.
    pub fn data_section_size(&self) -> u64 {
        self.partitions
            .iter()
            .flat_map(|p| p.operations.iter())
            .filter_map(|op| op.data_range())
            .map(|(offset, length)| offset.saturating_add(length))
            .max()
            .unwrap_or(0)
    }
}

pub(crate) mod hex_digest {
    use crate::hash::{Digest, DIGEST_LEN};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(digest: &Digest, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(digest))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Digest, D::Error> {
        let s = String::deserialize(de)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let digest: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("digest must be 32 bytes"))?;
        Ok(digest)
    }
}

pub(crate) mod hex_digest_opt {
    use crate::hash::{Digest, DIGEST_LEN};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(digest: &Option<Digest>, ser: S) -> Result<S::Ok, S::Error> {
        match digest {
            Some(d) => ser.serialize_some(&hex::encode(d)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Digest>, D::Error> {
        let s: Option<String> = Option::deserialize(de)?;
        match s {
            None => Ok(None),
            Some(s) => {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                let digest: [u8; DIGEST_LEN] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("digest must be 32 bytes"))?;
                Ok(Some(digest))
            }
        }
    }
}
