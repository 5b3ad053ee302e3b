// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The partition writer: applies manifest operations to the destination
//! slot.
//!
//! Ordering contract: for any operation that reads source extents, the
//! source hash is checked before the first byte is written to that
//! operation's destination extents. Writes for one operation either
//! complete fully or (on error/crash) touch nothing the durable cursor
//! claims is done.

use crate::boot_control::Slot;
use crate::error::ErrorCode;
use crate::hash::{sha256, RestartableHasher};
use crate::payload::manifest::{total_blocks, Extent, InstallOperation, PartitionUpdate};
use crate::payload::patch;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::rc::Rc;
use tracing::{error, warn};

/// Positioned IO on one partition image.
pub trait PartitionIo {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()>;
    fn sync(&mut self) -> std::io::Result<()>;
}

/// Opens partition images by name and slot.
pub trait PartitionProvider {
    fn open_partition(
        &mut self,
        name: &str,
        slot: Slot,
        writable: bool,
    ) -> anyhow::Result<Box<dyn PartitionIo>>;
}

pub struct FilePartitionIo {
    file: fs::File,
}

impl FilePartitionIo {
    pub fn open(path: &std::path::Path, writable: bool) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        Ok(FilePartitionIo { file })
    }
}

impl PartitionIo for FilePartitionIo {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data()
    }
}

/// In-memory partition image, shared so tests can inspect the result.
/// Reads past the stored length return zeros, matching a sparse device.
#[derive(Clone, Debug, Default)]
pub struct MemPartitionIo {
    data: Rc<RefCell<Vec<u8>>>,
}

impl MemPartitionIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(content: Vec<u8>) -> Self {
        MemPartitionIo {
            data: Rc::new(RefCell::new(content)),
        }
    }

    pub fn content(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }
}

impl PartitionIo for MemPartitionIo {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let data = self.data.borrow();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = data.get(offset as usize + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut stored = self.data.borrow_mut();
        let end = offset as usize + data.len();
        if stored.len() < end {
            stored.resize(end, 0);
        }
        stored[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Provider over in-memory images, for tests and dry runs.
#[derive(Clone, Debug, Default)]
pub struct MemPartitionProvider {
    images: HashMap<(String, u32), MemPartitionIo>,
}

impl MemPartitionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, slot: Slot, content: Vec<u8>) -> MemPartitionIo {
        let io = MemPartitionIo::with_content(content);
        self.images.insert((name.to_string(), slot.0), io.clone());
        io
    }

    pub fn image(&self, name: &str, slot: Slot) -> Option<MemPartitionIo> {
        self.images.get(&(name.to_string(), slot.0)).cloned()
    }
}

impl PartitionProvider for MemPartitionProvider {
    fn open_partition(
        &mut self,
        name: &str,
        slot: Slot,
        _writable: bool,
    ) -> anyhow::Result<Box<dyn PartitionIo>> {
        let io = self
            .images
            .entry((name.to_string(), slot.0))
            .or_default()
            .clone();
        Ok(Box::new(io))
    }
}

/// Provider resolving partition images through the boot HAL's
/// name-and-slot to device-path mapping.
pub struct DevicePartitionProvider<B> {
    boot: Rc<RefCell<B>>,
}

impl<B> DevicePartitionProvider<B> {
    pub fn new(boot: Rc<RefCell<B>>) -> Self {
        DevicePartitionProvider { boot }
    }
}

impl<B: crate::boot_control::BootControl> PartitionProvider for DevicePartitionProvider<B> {
    fn open_partition(
        &mut self,
        name: &str,
        slot: Slot,
        writable: bool,
    ) -> anyhow::Result<Box<dyn PartitionIo>> {
        let path = self.boot.borrow().partition_path(name, slot)?;
        Ok(Box::new(FilePartitionIo::open(&path, writable)?))
    }
}

/// Applies one partition's operations in manifest order.
pub struct PartitionWriter {
    partition: PartitionUpdate,
    block_size: u64,
    source: Option<Box<dyn PartitionIo>>,
    target: Box<dyn PartitionIo>,
    /// Source and target are the same device; overlapping copies are
    /// rejected rather than silently misapplied.
    same_device: bool,
    /// Periodic updates sync after every operation so a crash cannot lose
    /// writes the cursor already claims.
    durable: bool,
    source_checked: bool,
}

impl PartitionWriter {
    pub fn new(
        partition: PartitionUpdate,
        block_size: u64,
        source: Option<Box<dyn PartitionIo>>,
        target: Box<dyn PartitionIo>,
        same_device: bool,
        durable: bool,
    ) -> Self {
        PartitionWriter {
            partition,
            block_size,
            source,
            target,
            same_device,
            durable,
            source_checked: false,
        }
    }

    pub fn partition_name(&self) -> &str {
        &self.partition.name
    }

    pub fn operation_count(&self) -> usize {
        self.partition.operations.len()
    }

    pub fn operation(&self, index: usize) -> Option<&InstallOperation> {
        self.partition.operations.get(index)
    }

    fn blocks_needed(&self) -> u64 {
        self.partition.new_size.div_ceil(self.block_size)
    }

    /// Checks the whole source image against the manifest's old hash once,
    /// before the first operation touches the target.
    fn check_source_image(&mut self) -> Result<(), ErrorCode> {
        if self.source_checked {
            return Ok(());
        }
        self.source_checked = true;
        let (Some(old_hash), Some(old_size)) = (self.partition.old_hash, self.partition.old_size)
        else {
            return Ok(());
        };
        let Some(source) = self.source.as_mut() else {
            return Ok(());
        };
        let mut bytes = vec![0u8; old_size as usize];
        source
            .read_at(0, &mut bytes)
            .map_err(|_| ErrorCode::DownloadStateInitializationError)?;
        if sha256(&bytes) != old_hash {
            error!(
                partition = %self.partition.name,
                "source image hash mismatch; refusing to apply delta"
            );
            return Err(ErrorCode::DownloadStateInitializationError);
        }
        Ok(())
    }

    /// Applies one operation. `data` is the operation's blob from the
    /// payload data section (empty for data-less operations).
    pub fn apply_operation(
        &mut self,
        op_index: usize,
        data: &[u8],
    ) -> Result<(), ErrorCode> {
        let op = self
            .partition
            .operations
            .get(op_index)
            .ok_or(ErrorCode::DownloadOperationExecutionError)?
            .clone();

        // Destination bounds come first; nothing below may write outside
        // the new image.
        let blocks_needed = self.blocks_needed();
        if op
            .dst_extents()
            .iter()
            .any(|e| e.end_block() > blocks_needed)
        {
            return Err(ErrorCode::DownloadOperationExecutionError);
        }

        if let Some(expected) = op.data_hash() {
            if sha256(data) != *expected {
                warn!(
                    partition = %self.partition.name,
                    op = op.kind(),
                    "operation data hash mismatch"
                );
                return Err(ErrorCode::DownloadOperationExecutionError);
            }
        }

        // Source reads and their hash check precede any destination write.
        let src_bytes = if let Some(src_extents) = op.src_extents() {
            if self.same_device
                && src_extents
                    .iter()
                    .any(|s| op.dst_extents().iter().any(|d| s.overlaps(d)))
            {
                return Err(ErrorCode::DownloadOperationExecutionError);
            }
            self.check_source_image()?;
            let source = self
                .source
                .as_mut()
                .ok_or(ErrorCode::DownloadStateInitializationError)?;
            let bytes = read_extents(source.as_mut(), src_extents, self.block_size)
                .map_err(|_| ErrorCode::DownloadStateInitializationError)?;
            if let Some(expected) = op.src_hash() {
                if sha256(&bytes) != *expected {
                    error!(
                        partition = %self.partition.name,
                        op = op.kind(),
                        "source extent hash mismatch"
                    );
                    return Err(ErrorCode::DownloadStateInitializationError);
                }
            }
            Some(bytes)
        } else {
            None
        };

        let dst_len = self.clamped_len(op.dst_extents());
        let out: Vec<u8> = match &op {
            InstallOperation::Replace { .. } => data.to_vec(),
            InstallOperation::ReplaceBz { .. } => {
                patch::bunzip(data).map_err(|_| ErrorCode::DownloadOperationExecutionError)?
            }
            InstallOperation::ReplaceXz { .. } => {
                patch::unxz(data).map_err(|_| ErrorCode::DownloadOperationExecutionError)?
            }
            InstallOperation::Move { .. } | InstallOperation::SourceCopy { .. } => {
                let mut bytes = src_bytes.expect("source ops read source");
                bytes.truncate(dst_len as usize);
                bytes
            }
            InstallOperation::Bsdiff { .. } | InstallOperation::SourceBsdiff { .. } => {
                patch::bspatch(&src_bytes.expect("source ops read source"), data)
                    .map_err(|_| ErrorCode::DownloadOperationExecutionError)?
            }
            InstallOperation::Puffdiff { .. } => {
                patch::apply_puffdiff(&src_bytes.expect("source ops read source"), data)
                    .map_err(|_| ErrorCode::DownloadOperationExecutionError)?
            }
            InstallOperation::Zero { .. } | InstallOperation::Discard { .. } => {
                vec![0u8; dst_len as usize]
            }
        };

        if out.len() as u64 != dst_len {
            warn!(
                partition = %self.partition.name,
                op = op.kind(),
                expected = dst_len,
                actual = out.len(),
                "operation output length mismatch"
            );
            return Err(ErrorCode::DownloadOperationExecutionError);
        }

        self.write_clamped(op.dst_extents(), &out)
            .map_err(|_| ErrorCode::DownloadWriteError)?;
        if self.durable {
            self.target
                .sync()
                .map_err(|_| ErrorCode::DownloadWriteError)?;
        }
        Ok(())
    }

    /// Byte length of the extents, with the portion past `new_size`
    /// excluded (only the final block can be partial). Saturating block
    /// arithmetic: oversized extents were already rejected by the bounds
    /// check, and saturation keeps even hostile values clamp-safe.
    fn clamped_len(&self, extents: &[Extent]) -> u64 {
        let mut len = 0u64;
        for extent in extents {
            let start = extent.start_block.saturating_mul(self.block_size);
            let end = extent.end_block().saturating_mul(self.block_size);
            len = len.saturating_add(end.min(self.partition.new_size).saturating_sub(start));
        }
        len
    }

    fn write_clamped(&mut self, extents: &[Extent], mut bytes: &[u8]) -> std::io::Result<()> {
        for extent in extents {
            let start = extent.start_block.saturating_mul(self.block_size);
            let end = extent
                .end_block()
                .saturating_mul(self.block_size)
                .min(self.partition.new_size);
            let take = (end.saturating_sub(start)) as usize;
            let (chunk, rest) = bytes.split_at(take);
            self.target.write_at(start, chunk)?;
            bytes = rest;
        }
        Ok(())
    }

    /// Hashes the destination's new-size prefix and compares it to the
    /// manifest's expected hash. Partition-typed error on mismatch.
    pub fn verify(&mut self) -> Result<(), ErrorCode> {
        let mut hasher = RestartableHasher::new();
        let mut remaining = self.partition.new_size;
        let mut offset = 0u64;
        let mut buf = vec![0u8; (64 * 1024).min(self.partition.new_size.max(1)) as usize];
        while remaining > 0 {
            let take = buf.len().min(remaining as usize);
            self.target
                .read_at(offset, &mut buf[..take])
                .map_err(|_| self.verification_error())?;
            hasher.update(&buf[..take]);
            offset += take as u64;
            remaining -= take as u64;
        }
        if hasher.finalize() != self.partition.new_hash {
            error!(
                partition = %self.partition.name,
                "new image failed verification"
            );
            return Err(self.verification_error());
        }
        Ok(())
    }

    fn verification_error(&self) -> ErrorCode {
        if self.partition.name == "kernel" {
            ErrorCode::NewKernelVerificationError
        } else {
            ErrorCode::NewRootfsVerificationError
        }
    }
}

/// Reads full blocks for each extent, concatenated.
pub fn read_extents(
    io: &mut dyn PartitionIo,
    extents: &[Extent],
    block_size: u64,
) -> std::io::Result<Vec<u8>> {
    let total = total_blocks(extents)
        .checked_mul(block_size)
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let mut out = vec![0u8; total as usize];
    let mut cursor = 0usize;
    for extent in extents {
        let len = (extent.num_blocks.saturating_mul(block_size)) as usize;
        io.read_at(
            extent.start_block.saturating_mul(block_size),
            &mut out[cursor..cursor + len],
        )?;
        cursor += len;
    }
    Ok(out)
}
