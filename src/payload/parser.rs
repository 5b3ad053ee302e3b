// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! The streaming payload consumer.
//!
//! Bytes arrive in arbitrary windows from the fetcher and drive a phase
//! machine: fixed header, manifest, metadata signature, then operation
//! data routed to the partition writer. A running hash covers every
//! payload byte from byte 0. After each completed operation the progress
//! cursor (payload index, operation index, byte offset, hasher context)
//! is persisted, so `resume` can reconstruct the consumer and continue
//! from the exact byte the previous process stopped at, without replaying
//! the header, manifest, or signature phases.

use crate::boot_control::Slot;
use crate::crypto::TrustedKeys;
use crate::error::ErrorCode;
use crate::hash::{Digest, HasherContext, RestartableHasher};
use crate::install_plan::PayloadInfo;
use crate::payload::manifest::{
    Manifest, MAGIC, MAX_MANIFEST_SIZE, MAX_METADATA_SIGNATURE_SIZE, MIN_VERSION, VERSION,
};
use crate::payload::writer::{PartitionProvider, PartitionWriter};
use crate::prefs::{keys, Prefs};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Fixed envelope header: magic, version, manifest size, metadata
/// signature size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest_size: u64,
    pub metadata_signature_size: u32,
}

impl PayloadHeader {
    pub const LEN: usize = 24;

    pub fn parse(bytes: &[u8]) -> Result<Self, ErrorCode> {
        if bytes.len() < Self::LEN || &bytes[..4] != MAGIC {
            return Err(ErrorCode::PayloadHeaderInvalid);
        }
        let version = BigEndian::read_u64(&bytes[4..12]);
        if !(MIN_VERSION..=VERSION).contains(&version) {
            return Err(ErrorCode::PayloadHeaderInvalid);
        }
        let manifest_size = BigEndian::read_u64(&bytes[12..20]);
        if manifest_size == 0 || manifest_size > MAX_MANIFEST_SIZE {
            return Err(ErrorCode::PayloadHeaderInvalid);
        }
        let metadata_signature_size = BigEndian::read_u32(&bytes[20..24]);
        if metadata_signature_size > MAX_METADATA_SIGNATURE_SIZE {
            return Err(ErrorCode::DownloadInvalidMetadataSize);
        }
        Ok(PayloadHeader {
            version,
            manifest_size,
            metadata_signature_size,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(MAGIC);
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, self.version);
        out.extend_from_slice(&buf);
        BigEndian::write_u64(&mut buf, self.manifest_size);
        out.extend_from_slice(&buf);
        let mut buf4 = [0u8; 4];
        BigEndian::write_u32(&mut buf4, self.metadata_signature_size);
        out.extend_from_slice(&buf4);
        out
    }

    pub fn metadata_size(&self) -> u64 {
        Self::LEN as u64 + self.manifest_size
    }
}

/// The durable progress cursor. Persisted only at operation boundaries,
/// so the data it describes is always a prefix of fully-applied
/// operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressCursor {
    pub payload_index: usize,
    /// Global (across partitions) index of the next operation to apply.
    pub operation_index: usize,
    /// Payload byte offset the stream must resume from; equals the number
    /// of bytes hashed into `hasher`.
    pub byte_offset: u64,
    pub hasher: HasherContext,
}

impl ProgressCursor {
    pub fn save(&self, prefs: &mut dyn Prefs) -> Result<(), ErrorCode> {
        let hasher_blob =
            serde_json::to_vec(&self.hasher).map_err(|_| ErrorCode::DownloadWriteError)?;
        prefs
            .set_int(keys::UPDATE_STATE_PAYLOAD_INDEX, self.payload_index as i64)
            .and_then(|_| {
                prefs.set_int(keys::UPDATE_STATE_NEXT_OPERATION, self.operation_index as i64)
            })
            .and_then(|_| prefs.set_int(keys::RESUME_OFFSET, self.byte_offset as i64))
            .and_then(|_| prefs.set_blob(keys::UPDATE_STATE_HASHER_CONTEXT, &hasher_blob))
            .map_err(|_| ErrorCode::DownloadWriteError)
    }

    pub fn load(prefs: &dyn Prefs) -> Option<ProgressCursor> {
        let payload_index = prefs.get_int(keys::UPDATE_STATE_PAYLOAD_INDEX)?;
        let operation_index = prefs.get_int(keys::UPDATE_STATE_NEXT_OPERATION)?;
        let byte_offset = prefs.get_int(keys::RESUME_OFFSET)?;
        let hasher_blob = prefs.get_blob(keys::UPDATE_STATE_HASHER_CONTEXT)?;
        let hasher = serde_json::from_slice(&hasher_blob).ok()?;
        Some(ProgressCursor {
            payload_index: payload_index.try_into().ok()?,
            operation_index: operation_index.try_into().ok()?,
            byte_offset: byte_offset.try_into().ok()?,
            hasher,
        })
    }

    pub fn clear(prefs: &mut dyn Prefs) {
        for key in [
            keys::UPDATE_STATE_PAYLOAD_INDEX,
            keys::UPDATE_STATE_NEXT_OPERATION,
            keys::RESUME_OFFSET,
            keys::UPDATE_STATE_HASHER_CONTEXT,
            keys::CACHED_MANIFEST,
            keys::MANIFEST_METADATA_SIZE,
            keys::CURRENT_RESPONSE_SIGNATURE,
        ] {
            let _ = prefs.remove(key);
        }
    }
}

#[derive(Debug)]
enum Phase {
    Header,
    Manifest,
    Signature,
    Data,
    Done,
}

/// Position of one operation in the flattened manifest order.
#[derive(Clone, Copy, Debug)]
struct FlatOp {
    partition: usize,
    op_in_partition: usize,
    /// Absolute payload byte range of this op's blob, if it has one.
    data: Option<(u64, u64)>,
}

pub struct PayloadProcessor {
    prefs: Rc<RefCell<dyn Prefs>>,
    trusted_keys: TrustedKeys,
    provider: Rc<RefCell<dyn PartitionProvider>>,
    payload: PayloadInfo,
    payload_index: usize,
    source_slot: Slot,
    target_slot: Slot,
    durable_writes: bool,

    phase: Phase,
    hasher: RestartableHasher,
    buffer: Vec<u8>,
    header: Option<PayloadHeader>,
    metadata: Vec<u8>,
    manifest: Option<Manifest>,
    flat_ops: Vec<FlatOp>,
    next_op: usize,
    data_start: u64,
    writer: Option<PartitionWriter>,
    writer_partition: usize,
}

impl PayloadProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prefs: Rc<RefCell<dyn Prefs>>,
        trusted_keys: TrustedKeys,
        provider: Rc<RefCell<dyn PartitionProvider>>,
        payload: PayloadInfo,
        payload_index: usize,
        source_slot: Slot,
        target_slot: Slot,
        interactive: bool,
    ) -> Self {
        PayloadProcessor {
            prefs,
            trusted_keys,
            provider,
            payload,
            payload_index,
            source_slot,
            target_slot,
            // Interactive updates may trade durability for speed; periodic
            // ones must survive a crash at any point.
            durable_writes: !interactive,
            phase: Phase::Header,
            hasher: RestartableHasher::new(),
            buffer: Vec::new(),
            header: None,
            metadata: Vec::new(),
            manifest: None,
            flat_ops: Vec::new(),
            next_op: 0,
            data_start: 0,
            writer: None,
            writer_partition: usize::MAX,
        }
    }

    /// Reconstructs a consumer from the persisted cursor, skipping the
    /// header, manifest, and signature phases. The cached manifest is
    /// re-verified against the bundled keys before being trusted. Returns
    /// the consumer and the payload byte offset the fetch must resume at.
    #[allow(clippy::too_many_arguments)]
    pub fn resume(
        prefs: Rc<RefCell<dyn Prefs>>,
        trusted_keys: TrustedKeys,
        provider: Rc<RefCell<dyn PartitionProvider>>,
        payload: PayloadInfo,
        payload_index: usize,
        source_slot: Slot,
        target_slot: Slot,
        interactive: bool,
    ) -> Result<(Self, u64), ErrorCode> {
        let (cursor, metadata, signature) = {
            let p = prefs.borrow();
            let cursor = ProgressCursor::load(&*p).ok_or(ErrorCode::ResumeOffsetMismatch)?;
            let metadata = p
                .get_blob(keys::CACHED_MANIFEST)
                .ok_or(ErrorCode::ResumeOffsetMismatch)?;
            let signature = p
                .get_blob(keys::CURRENT_RESPONSE_SIGNATURE)
                .ok_or(ErrorCode::ResumeOffsetMismatch)?;
            let stored_size = p.get_int(keys::MANIFEST_METADATA_SIZE).unwrap_or(-1);
            if stored_size != metadata.len() as i64 {
                return Err(ErrorCode::ResumeOffsetMismatch);
            }
            (cursor, metadata, signature)
        };

        if cursor.payload_index != payload_index || cursor.byte_offset > payload.size {
            return Err(ErrorCode::ResumeOffsetMismatch);
        }

        // Never trust cached metadata that no longer verifies.
        trusted_keys.verify_metadata(&metadata, &signature)?;

        let header = PayloadHeader::parse(&metadata)?;
        if header.metadata_size() != metadata.len() as u64 {
            return Err(ErrorCode::ResumeOffsetMismatch);
        }
        let manifest: Manifest = serde_json::from_slice(&metadata[PayloadHeader::LEN..])
            .map_err(|_| ErrorCode::DownloadManifestParseError)?;
        manifest
            .validate()
            .map_err(|_| ErrorCode::DownloadManifestParseError)?;

        let hasher =
            RestartableHasher::from_context(cursor.hasher.clone()).map_err(|_| {
                ErrorCode::ResumeOffsetMismatch
            })?;
        if hasher.bytes_hashed() != cursor.byte_offset {
            return Err(ErrorCode::ResumeOffsetMismatch);
        }

        let mut processor = PayloadProcessor::new(
            prefs,
            trusted_keys,
            provider,
            payload,
            payload_index,
            source_slot,
            target_slot,
            interactive,
        );
        processor.hasher = hasher;
        processor.header = Some(header);
        processor.metadata = metadata;
        processor.data_start =
            header.metadata_size() + header.metadata_signature_size as u64;
        processor.install_manifest(manifest)?;
        if cursor.operation_index > processor.flat_ops.len() {
            return Err(ErrorCode::ResumeOffsetMismatch);
        }
        processor.next_op = cursor.operation_index;
        processor.phase = if processor.next_op == processor.flat_ops.len() {
            Phase::Done
        } else {
            Phase::Data
        };

        info!(
            offset = cursor.byte_offset,
            operation = cursor.operation_index,
            "resuming payload consumption from persisted cursor"
        );
        Ok((processor, cursor.byte_offset))
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.hasher.bytes_hashed()
    }

    pub fn operations_applied(&self) -> usize {
        self.next_op
    }

    fn install_manifest(&mut self, manifest: Manifest) -> Result<(), ErrorCode> {
        let mut flat = Vec::new();
        for (pi, partition) in manifest.partitions.iter().enumerate() {
            for (oi, op) in partition.operations.iter().enumerate() {
                flat.push(FlatOp {
                    partition: pi,
                    op_in_partition: oi,
                    // Ranges were overflow-checked by manifest validation;
                    // saturate rather than trust them with raw addition.
                    data: op
                        .data_range()
                        .map(|(off, len)| (self.data_start.saturating_add(off), len)),
                });
            }
        }
        self.flat_ops = flat;
        self.manifest = Some(manifest);
        Ok(())
    }

    fn ensure_writer(&mut self, partition_index: usize) -> Result<(), ErrorCode> {
        if self.writer_partition == partition_index {
            return Ok(());
        }
        let manifest = self.manifest.as_ref().expect("manifest installed");
        let partition = manifest.partitions[partition_index].clone();
        let block_size = manifest.block_size as u64;

        let mut provider = self.provider.borrow_mut();
        let source = if self.payload.payload_type.is_delta() {
            Some(
                provider
                    .open_partition(&partition.name, self.source_slot, false)
                    .map_err(|_| ErrorCode::DownloadStateInitializationError)?,
            )
        } else {
            None
        };
        let target = provider
            .open_partition(&partition.name, self.target_slot, true)
            .map_err(|_| ErrorCode::DownloadWriteError)?;
        drop(provider);

        self.writer = Some(PartitionWriter::new(
            partition,
            block_size,
            source,
            target,
            self.source_slot == self.target_slot,
            self.durable_writes,
        ));
        self.writer_partition = partition_index;
        Ok(())
    }

    /// Consumes a window of payload bytes. Every byte is hashed exactly
    /// once; completed operations persist the cursor before any byte of
    /// the next operation is accepted.
    pub fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<(), ErrorCode> {
        while !bytes.is_empty() {
            match self.phase {
                Phase::Header => {
                    bytes = self.fill_buffer(bytes, PayloadHeader::LEN as u64);
                    if self.buffer.len() == PayloadHeader::LEN {
                        self.enter_manifest_phase()?;
                    }
                }
                Phase::Manifest => {
                    let manifest_size = self.header.expect("header parsed").manifest_size;
                    bytes = self.fill_buffer(bytes, manifest_size);
                    if self.buffer.len() as u64 == manifest_size {
                        self.enter_signature_phase();
                    }
                }
                Phase::Signature => {
                    let sig_size = self.header.expect("header parsed").metadata_signature_size;
                    bytes = self.fill_buffer(bytes, sig_size as u64);
                    if self.buffer.len() as u64 == sig_size as u64 {
                        self.verify_metadata_and_start_data()?;
                    }
                }
                Phase::Data => {
                    bytes = self.consume_data(bytes)?;
                }
                Phase::Done => {
                    // Trailing bytes past the data section are not part of
                    // any operation.
                    warn!("payload bytes after final operation");
                    return Err(ErrorCode::PayloadSizeMismatchError);
                }
            }
        }
        Ok(())
    }

    /// Moves up to `target_len - buffer.len()` bytes into the phase
    /// buffer, hashing them, and returns the remainder.
    fn fill_buffer<'a>(&mut self, bytes: &'a [u8], target_len: u64) -> &'a [u8] {
        let want = (target_len as usize).saturating_sub(self.buffer.len());
        let take = want.min(bytes.len());
        let (chunk, rest) = bytes.split_at(take);
        self.hasher.update(chunk);
        self.buffer.extend_from_slice(chunk);
        rest
    }

    fn enter_manifest_phase(&mut self) -> Result<(), ErrorCode> {
        let header = PayloadHeader::parse(&self.buffer)?;
        if header.metadata_size() != self.payload.metadata_size {
            warn!(
                declared = header.metadata_size(),
                expected = self.payload.metadata_size,
                "metadata size disagrees with the install plan"
            );
            return Err(ErrorCode::DownloadInvalidMetadataSize);
        }
        self.metadata = self.buffer.clone();
        self.header = Some(header);
        self.buffer.clear();
        self.phase = Phase::Manifest;
        Ok(())
    }

    fn enter_signature_phase(&mut self) {
        self.metadata.extend_from_slice(&self.buffer);
        self.buffer.clear();
        self.phase = Phase::Signature;
    }

    fn verify_metadata_and_start_data(&mut self) -> Result<(), ErrorCode> {
        let header = self.header.expect("header parsed");
        if header.metadata_signature_size == 0 {
            return Err(ErrorCode::PayloadPubKeyVerificationError);
        }
        let signature = std::mem::take(&mut self.buffer);

        // The plan's expected signature, when present, must match the one
        // the payload actually carries.
        if !self.payload.metadata_signature.is_empty()
            && self.payload.metadata_signature != signature
        {
            return Err(ErrorCode::PayloadMetadataSignatureError);
        }
        self.trusted_keys.verify_metadata(&self.metadata, &signature)?;

        let manifest: Manifest = serde_json::from_slice(&self.metadata[PayloadHeader::LEN..])
            .map_err(|_| ErrorCode::DownloadManifestParseError)?;
        manifest
            .validate()
            .map_err(|_| ErrorCode::DownloadManifestParseError)?;

        self.data_start = header.metadata_size() + header.metadata_signature_size as u64;
        self.install_manifest(manifest)?;
        debug!(
            operations = self.flat_ops.len(),
            data_start = self.data_start,
            "metadata verified; consuming operation data"
        );

        // Cache the verified metadata so resume can skip these phases.
        {
            let mut prefs = self.prefs.borrow_mut();
            prefs
                .set_blob(keys::CACHED_MANIFEST, &self.metadata)
                .and_then(|_| {
                    prefs.set_int(keys::MANIFEST_METADATA_SIZE, self.metadata.len() as i64)
                })
                .and_then(|_| prefs.set_blob(keys::CURRENT_RESPONSE_SIGNATURE, &signature))
                .map_err(|_| ErrorCode::DownloadWriteError)?;
        }

        self.phase = Phase::Data;
        self.apply_ready_ops()?;
        self.persist_cursor()?;
        Ok(())
    }

    /// Applies every pending operation that needs no payload data (source
    /// copies, zeros), verifying partitions as they complete.
    fn apply_ready_ops(&mut self) -> Result<(), ErrorCode> {
        while let Some(flat) = self.flat_ops.get(self.next_op).copied() {
            if flat.data.is_some() {
                break;
            }
            self.apply_op(flat, &[])?;
        }
        if self.next_op == self.flat_ops.len() {
            self.phase = Phase::Done;
        }
        Ok(())
    }

    fn apply_op(&mut self, flat: FlatOp, data: &[u8]) -> Result<(), ErrorCode> {
        self.ensure_writer(flat.partition)?;
        let writer = self.writer.as_mut().expect("writer opened");
        writer.apply_operation(flat.op_in_partition, data)?;
        self.next_op += 1;

        // Last operation of the partition: check the full image now.
        let last_in_partition = writer.operation_count() == flat.op_in_partition + 1;
        if last_in_partition {
            writer.verify()?;
            info!(partition = writer.partition_name(), "partition verified");
        }
        Ok(())
    }

    fn persist_cursor(&mut self) -> Result<(), ErrorCode> {
        let cursor = ProgressCursor {
            payload_index: self.payload_index,
            operation_index: self.next_op,
            byte_offset: self.hasher.bytes_hashed(),
            hasher: self.hasher.context(),
        };
        cursor.save(&mut *self.prefs.borrow_mut())
    }

    fn consume_data<'a>(&mut self, bytes: &'a [u8]) -> Result<&'a [u8], ErrorCode> {
        let flat = self.flat_ops[self.next_op];
        let (data_offset, data_length) = flat.data.expect("data ops reach here");
        let consumed = self.hasher.bytes_hashed();

        // Skip (but hash) padding between the previous blob and this one.
        if consumed < data_offset {
            let gap = (data_offset - consumed).min(bytes.len() as u64) as usize;
            let (skip, rest) = bytes.split_at(gap);
            self.hasher.update(skip);
            return Ok(rest);
        }

        let into_op = consumed - data_offset;
        debug_assert_eq!(into_op, self.buffer.len() as u64);
        let want = (data_length - into_op).min(bytes.len() as u64) as usize;
        let (chunk, rest) = bytes.split_at(want);
        self.hasher.update(chunk);
        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() as u64 == data_length {
            let data = std::mem::take(&mut self.buffer);
            self.apply_op(flat, &data)?;
            self.apply_ready_ops()?;
            self.persist_cursor()?;
            if self.next_op == self.flat_ops.len() {
                self.phase = Phase::Done;
            }
        }
        Ok(rest)
    }

    /// End-of-stream: checks total size and the running payload hash.
    pub fn finish(&mut self) -> Result<(), ErrorCode> {
        if !matches!(self.phase, Phase::Done) {
            return Err(ErrorCode::PayloadSizeMismatchError);
        }
        if self.bytes_consumed() != self.payload.size {
            warn!(
                consumed = self.bytes_consumed(),
                expected = self.payload.size,
                "payload size mismatch at end of stream"
            );
            return Err(ErrorCode::PayloadSizeMismatchError);
        }
        let digest: Digest = self.hasher.clone().finalize();
        if digest != self.payload.hash {
            warn!("payload hash mismatch at end of stream");
            return Err(ErrorCode::PayloadHashMismatchError);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_support::make_trusted_keys;
    use crate::hash::sha256;
    use crate::install_plan::PayloadType;
    use crate::payload::test_util::{PayloadBuilder, TestPartition};
    use crate::payload::writer::MemPartitionProvider;
    use crate::prefs::MemPrefs;

    const BS: u64 = 4096;

    fn image(seed: u8, blocks: u64) -> Vec<u8> {
        (0..blocks * BS).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    struct Fixture {
        prefs: Rc<RefCell<MemPrefs>>,
        provider: MemPartitionProvider,
        payload: PayloadInfo,
        bytes: Vec<u8>,
    }

    fn delta_fixture() -> Fixture {
        let src = image(1, 4);
        let dst = image(2, 4);
        let mut provider = MemPartitionProvider::new();
        provider.insert("rootfs", Slot::A, src.clone());
        provider.insert("rootfs", Slot::B, vec![]);

        let builder = PayloadBuilder::new().partition(TestPartition::delta("rootfs", &src, &dst));
        let (bytes, payload) = builder.build(PayloadType::Delta);
        Fixture {
            prefs: Rc::new(RefCell::new(MemPrefs::new())),
            provider,
            payload,
            bytes,
        }
    }

    fn processor(fixture: &Fixture) -> PayloadProcessor {
        PayloadProcessor::new(
            fixture.prefs.clone(),
            make_trusted_keys(),
            Rc::new(RefCell::new(fixture.provider.clone())),
            fixture.payload.clone(),
            0,
            Slot::A,
            Slot::B,
            false,
        )
    }

    #[test]
    fn test_single_shot_consumption() {
        let fixture = delta_fixture();
        let mut processor = processor(&fixture);
        processor.write_bytes(&fixture.bytes).unwrap();
        processor.finish().unwrap();

        let written = fixture.provider.image("rootfs", Slot::B).unwrap().content();
        assert_eq!(sha256(&written), sha256(&image(2, 4)));
    }

    #[test]
    fn test_byte_at_a_time_consumption() {
        let fixture = delta_fixture();
        let mut processor = processor(&fixture);
        for byte in &fixture.bytes {
            processor.write_bytes(std::slice::from_ref(byte)).unwrap();
        }
        processor.finish().unwrap();
        assert_eq!(
            fixture.provider.image("rootfs", Slot::B).unwrap().content(),
            image(2, 4)
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let fixture = delta_fixture();
        let mut processor = processor(&fixture);
        let mut bytes = fixture.bytes.clone();
        bytes[0] = b'X';
        assert_eq!(
            processor.write_bytes(&bytes),
            Err(ErrorCode::PayloadHeaderInvalid)
        );
    }

    #[test]
    fn test_tampered_manifest_fails_signature_before_any_write() {
        let fixture = delta_fixture();
        let mut processor = processor(&fixture);
        let mut bytes = fixture.bytes.clone();
        // Flip a byte inside the manifest region.
        bytes[PayloadHeader::LEN + 4] ^= 0x01;
        assert_eq!(
            processor.write_bytes(&bytes),
            Err(ErrorCode::PayloadMetadataSignatureError)
        );
        // No bytes reached the destination slot and the cursor never
        // advanced.
        assert!(fixture.provider.image("rootfs", Slot::B).unwrap().content().is_empty());
        assert!(ProgressCursor::load(&*fixture.prefs.borrow()).is_none());
    }

    #[test]
    fn test_truncated_stream_fails_finish() {
        let fixture = delta_fixture();
        let mut processor = processor(&fixture);
        processor
            .write_bytes(&fixture.bytes[..fixture.bytes.len() - 10])
            .unwrap();
        assert_eq!(processor.finish(), Err(ErrorCode::PayloadSizeMismatchError));
    }

    #[test]
    fn test_resume_mid_stream_matches_full_run() {
        let fixture = delta_fixture();

        // Feed roughly half, then drop the processor ("crash").
        let cut = fixture.bytes.len() / 2;
        {
            let mut processor = processor(&fixture);
            processor.write_bytes(&fixture.bytes[..cut]).unwrap();
        }

        let cursor = ProgressCursor::load(&*fixture.prefs.borrow()).expect("cursor persisted");
        assert!(cursor.byte_offset > 0);
        assert!(cursor.byte_offset <= cut as u64);

        let (mut resumed, offset) = PayloadProcessor::resume(
            fixture.prefs.clone(),
            make_trusted_keys(),
            Rc::new(RefCell::new(fixture.provider.clone())),
            fixture.payload.clone(),
            0,
            Slot::A,
            Slot::B,
            false,
        )
        .unwrap();
        assert_eq!(offset, cursor.byte_offset);

        resumed.write_bytes(&fixture.bytes[offset as usize..]).unwrap();
        resumed.finish().unwrap();
        assert_eq!(
            fixture.provider.image("rootfs", Slot::B).unwrap().content(),
            image(2, 4)
        );
    }

    #[test]
    fn test_cursor_monotonic_across_interruptions() {
        let fixture = delta_fixture();
        let mut last_offset = 0u64;
        let mut fed = 0usize;
        // Interrupt after every 1000 bytes and resume each time.
        while fed < fixture.bytes.len() {
            let (mut proc_, offset) = if fed == 0 {
                (processor(&fixture), 0)
            } else {
                let (p, o) = PayloadProcessor::resume(
                    fixture.prefs.clone(),
                    make_trusted_keys(),
                    Rc::new(RefCell::new(fixture.provider.clone())),
                    fixture.payload.clone(),
                    0,
                    Slot::A,
                    Slot::B,
                    false,
                )
                .unwrap();
                (p, o as usize)
            };
            assert!(offset as u64 >= last_offset, "cursor regressed");
            let end = (offset + 1000).min(fixture.bytes.len());
            proc_.write_bytes(&fixture.bytes[offset..end]).unwrap();
            fed = end;
            last_offset = ProgressCursor::load(&*fixture.prefs.borrow())
                .map(|c| c.byte_offset)
                .unwrap_or(last_offset);
        }
    }

    #[test]
    fn test_resume_with_corrupt_hasher_context_rejected() {
        let fixture = delta_fixture();
        {
            let mut processor = processor(&fixture);
            processor.write_bytes(&fixture.bytes[..fixture.bytes.len() / 2]).unwrap();
        }
        fixture
            .prefs
            .borrow_mut()
            .set_int(keys::RESUME_OFFSET, 3)
            .unwrap();
        let result = PayloadProcessor::resume(
            fixture.prefs.clone(),
            make_trusted_keys(),
            Rc::new(RefCell::new(fixture.provider.clone())),
            fixture.payload.clone(),
            0,
            Slot::A,
            Slot::B,
            false,
        );
        assert!(matches!(result, Err(ErrorCode::ResumeOffsetMismatch)));
    }

    #[test]
    fn test_header_roundtrip() {
        let header = PayloadHeader {
            version: VERSION,
            manifest_size: 1234,
            metadata_signature_size: 72,
        };
        assert_eq!(PayloadHeader::parse(&header.to_bytes()), Ok(header));
    }

    #[test]
    fn test_header_caps() {
        let header = PayloadHeader {
            version: VERSION,
            manifest_size: MAX_MANIFEST_SIZE + 1,
            metadata_signature_size: 0,
        };
        assert_eq!(
            PayloadHeader::parse(&header.to_bytes()),
            Err(ErrorCode::PayloadHeaderInvalid)
        );
        let header = PayloadHeader {
            version: VERSION,
            manifest_size: 10,
            metadata_signature_size: MAX_METADATA_SIGNATURE_SIZE + 1,
        };
        assert_eq!(
            PayloadHeader::parse(&header.to_bytes()),
            Err(ErrorCode::DownloadInvalidMetadataSize)
        );
    }
}
