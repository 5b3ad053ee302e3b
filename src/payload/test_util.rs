// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Builders for complete, signed test payloads.

use crate::crypto::test_support;
use crate::hash::sha256;
use crate::install_plan::{PayloadInfo, PayloadType};
use crate::payload::manifest::{
    Extent, InstallOperation, Manifest, PartitionUpdate, VERSION,
};
use crate::payload::parser::PayloadHeader;
use url::Url;

pub const TEST_BLOCK_SIZE: u64 = 4096;

/// One partition's before/after images. Operations are generated
/// per-block: a source-based binary patch where a source block exists,
/// a literal replace otherwise.
pub struct TestPartition {
    name: String,
    old: Option<Vec<u8>>,
    new: Vec<u8>,
}

impl TestPartition {
    pub fn full(name: &str, new: &[u8]) -> Self {
        TestPartition {
            name: name.to_string(),
            old: None,
            new: new.to_vec(),
        }
    }

    pub fn delta(name: &str, old: &[u8], new: &[u8]) -> Self {
        TestPartition {
            name: name.to_string(),
            old: Some(old.to_vec()),
            new: new.to_vec(),
        }
    }
}

#[derive(Default)]
pub struct PayloadBuilder {
    partitions: Vec<TestPartition>,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(mut self, partition: TestPartition) -> Self {
        self.partitions.push(partition);
        self
    }

    /// Produces the full signed payload bytes and the matching
    /// `PayloadInfo` an install plan would carry for it.
    pub fn build(self, payload_type: PayloadType) -> (Vec<u8>, PayloadInfo) {
        let mut data_section: Vec<u8> = Vec::new();
        let mut partitions = Vec::new();

        for tp in &self.partitions {
            let blocks = (tp.new.len() as u64).div_ceil(TEST_BLOCK_SIZE);
            let mut operations = Vec::new();
            for block in 0..blocks {
                let start = (block * TEST_BLOCK_SIZE) as usize;
                let end = (start + TEST_BLOCK_SIZE as usize).min(tp.new.len());
                let new_block = &tp.new[start..end];
                let dst_extents = vec![Extent::new(block, 1)];

                let old_block = tp.old.as_ref().and_then(|old| {
                    (end <= old.len()).then(|| &old[start..end])
                });
                let op = match old_block {
                    Some(old_block) => {
                        let mut blob = Vec::new();
                        bsdiff::diff(old_block, new_block, &mut blob).expect("diff");
                        let op = InstallOperation::SourceBsdiff {
                            src_extents: vec![Extent::new(block, 1)],
                            src_hash: sha256(old_block),
                            dst_extents,
                            data_offset: data_section.len() as u64,
                            data_length: blob.len() as u64,
                            data_hash: sha256(&blob),
                        };
                        data_section.extend_from_slice(&blob);
                        op
                    }
                    None => {
                        let op = InstallOperation::Replace {
                            dst_extents,
                            data_offset: data_section.len() as u64,
                            data_length: new_block.len() as u64,
                            data_hash: sha256(new_block),
                        };
                        data_section.extend_from_slice(new_block);
                        op
                    }
                };
                operations.push(op);
            }

            partitions.push(PartitionUpdate {
                name: tp.name.clone(),
                old_hash: tp.old.as_deref().map(sha256),
                old_size: tp.old.as_ref().map(|o| o.len() as u64),
                new_hash: sha256(&tp.new),
                new_size: tp.new.len() as u64,
                operations,
            });
        }

        let manifest = Manifest {
            block_size: TEST_BLOCK_SIZE as u32,
            minor_version: 1,
            partitions,
        };
        manifest.validate().expect("generated manifest is valid");
        let manifest_bytes = serde_json::to_vec(&manifest).expect("manifest serializes");

        let header = PayloadHeader {
            version: VERSION,
            manifest_size: manifest_bytes.len() as u64,
            metadata_signature_size: test_support::SIGNATURE_LEN,
        };

        let mut metadata = header.to_bytes();
        metadata.extend_from_slice(&manifest_bytes);
        let signature = test_support::sign(&metadata);
        assert_eq!(signature.len() as u32, header.metadata_signature_size);

        let mut payload = metadata.clone();
        payload.extend_from_slice(&signature);
        payload.extend_from_slice(&data_section);

        let info = PayloadInfo {
            urls: vec![Url::parse("https://updates.example.com/payload.bin").unwrap()],
            size: payload.len() as u64,
            hash: sha256(&payload),
            metadata_size: metadata.len() as u64,
            metadata_signature: signature,
            source_version: Some("1.0.0".parse().unwrap()),
            target_version: "2.0.0".parse().unwrap(),
            payload_type,
        };
        (payload, info)
    }
}
