// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Byte-in/byte-out transforms used by install operations: block
//! decompressors and binary-patch application.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::io::Read as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed patch: {0}")]
    Malformed(&'static str),
    #[error("deflate range out of bounds or out of order")]
    BadDeflateRange,
}

pub fn bunzip(data: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut out = Vec::new();
    bzip2::read::BzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

pub fn unxz(data: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut out = Vec::new();
    xz2::read::XzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Applies a bsdiff patch to `old`, producing the new bytes.
pub fn bspatch(old: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut new = Vec::new();
    bsdiff::patch(old, &mut &patch[..], &mut new)?;
    Ok(new)
}

/// A raw-deflate stream location within the source read.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

/// The deflate-aware patch blob: the source's deflate streams are inflated
/// ("puffed") before the inner bsdiff patch is applied, so the patch works
/// against stable uncompressed bytes instead of encoder-dependent ones.
///
/// Framing: 4-byte big-endian header length, serde_json header listing the
/// source deflate ranges, then the inner bsdiff patch.
#[derive(Clone, Debug, PartialEq)]
pub struct PuffPatch {
    pub src_deflates: Vec<ByteRange>,
    pub patch: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct PuffHeader {
    src_deflates: Vec<ByteRange>,
}

impl PuffPatch {
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = serde_json::to_vec(&PuffHeader {
            src_deflates: self.src_deflates.clone(),
        })
        .expect("header serializes");
        let mut out = vec![0u8; 4];
        BigEndian::write_u32(&mut out[..4], header.len() as u32);
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.patch);
        out
    }

    pub fn from_bytes(blob: &[u8]) -> Result<Self, PatchError> {
        if blob.len() < 4 {
            return Err(PatchError::Malformed("short puff patch"));
        }
        let header_len = BigEndian::read_u32(&blob[..4]) as usize;
        let rest = &blob[4..];
        if rest.len() < header_len {
            return Err(PatchError::Malformed("truncated puff header"));
        }
        let header: PuffHeader = serde_json::from_slice(&rest[..header_len])
            .map_err(|_| PatchError::Malformed("bad puff header"))?;
        Ok(PuffPatch {
            src_deflates: header.src_deflates,
            patch: rest[header_len..].to_vec(),
        })
    }
}

/// Inflates the listed deflate ranges in place, leaving bytes between them
/// untouched. Ranges must be sorted, non-overlapping, and in bounds.
pub fn puff(data: &[u8], deflates: &[ByteRange]) -> Result<Vec<u8>, PatchError> {
    let mut out = Vec::with_capacity(data.len());
    let mut cursor = 0u64;
    for range in deflates {
        if range.offset < cursor || range.offset + range.length > data.len() as u64 {
            return Err(PatchError::BadDeflateRange);
        }
        out.extend_from_slice(&data[cursor as usize..range.offset as usize]);
        let compressed = &data[range.offset as usize..(range.offset + range.length) as usize];
        let mut inflated = Vec::new();
        flate2::read::DeflateDecoder::new(compressed).read_to_end(&mut inflated)?;
        out.extend_from_slice(&inflated);
        cursor = range.offset + range.length;
    }
    out.extend_from_slice(&data[cursor as usize..]);
    Ok(out)
}

/// Applies a deflate-aware patch: puff the source, then bsdiff-patch the
/// puffed bytes into the destination image.
pub fn apply_puffdiff(src: &[u8], blob: &[u8]) -> Result<Vec<u8>, PatchError> {
    let puff_patch = PuffPatch::from_bytes(blob)?;
    let puffed = puff(src, &puff_patch.src_deflates)?;
    bspatch(&puffed, &puff_patch.patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_bunzip_roundtrip() {
        let plain = b"compressible compressible compressible".repeat(10);
        let mut compressed = Vec::new();
        bzip2::read::BzEncoder::new(&plain[..], bzip2::Compression::default())
            .read_to_end(&mut compressed)
            .unwrap();
        assert_eq!(bunzip(&compressed).unwrap(), plain);
    }

    #[test]
    fn test_unxz_roundtrip() {
        let plain = b"another stretch of compressible bytes".repeat(10);
        let mut compressed = Vec::new();
        xz2::read::XzEncoder::new(&plain[..], 6)
            .read_to_end(&mut compressed)
            .unwrap();
        assert_eq!(unxz(&compressed).unwrap(), plain);
    }

    #[test]
    fn test_bunzip_rejects_garbage() {
        assert!(bunzip(b"definitely not bzip2").is_err());
    }

    #[test]
    fn test_bspatch_roundtrip() {
        let old = b"the quick brown fox jumps over the lazy dog".to_vec();
        let new = b"the quick brown fox leaps over the lazy cat".to_vec();
        let mut patch = Vec::new();
        bsdiff::diff(&old, &new, &mut patch).unwrap();
        assert_eq!(bspatch(&old, &patch).unwrap(), new);
    }

    #[test]
    fn test_puff_inflates_marked_ranges() {
        let inner = b"repetitive repetitive repetitive".to_vec();
        let compressed = deflate(&inner);
        let mut data = b"head".to_vec();
        let range = ByteRange {
            offset: 4,
            length: compressed.len() as u64,
        };
        data.extend_from_slice(&compressed);
        data.extend_from_slice(b"tail");

        let puffed = puff(&data, &[range]).unwrap();
        let mut expected = b"head".to_vec();
        expected.extend_from_slice(&inner);
        expected.extend_from_slice(b"tail");
        assert_eq!(puffed, expected);
    }

    #[test]
    fn test_puff_rejects_out_of_order_ranges() {
        let data = vec![0u8; 16];
        let ranges = [
            ByteRange { offset: 8, length: 4 },
            ByteRange { offset: 0, length: 4 },
        ];
        assert!(matches!(
            puff(&data, &ranges),
            Err(PatchError::BadDeflateRange)
        ));
    }

    #[test]
    fn test_apply_puffdiff_end_to_end() {
        // Old image embeds a deflate stream; the new image differs both in
        // the raw bytes and inside the compressed region.
        let old_inner = b"inner content version one, quite repetitive".to_vec();
        let compressed = deflate(&old_inner);
        let mut old = b"prefix-".to_vec();
        let src_deflates = vec![ByteRange {
            offset: old.len() as u64,
            length: compressed.len() as u64,
        }];
        old.extend_from_slice(&compressed);
        old.extend_from_slice(b"-suffix");

        let new = b"prefix-inner content version two-suffix".to_vec();

        let puffed_old = puff(&old, &src_deflates).unwrap();
        let mut inner_patch = Vec::new();
        bsdiff::diff(&puffed_old, &new, &mut inner_patch).unwrap();
        let blob = PuffPatch {
            src_deflates,
            patch: inner_patch,
        }
        .to_bytes();

        assert_eq!(apply_puffdiff(&old, &blob).unwrap(), new);
    }

    #[test]
    fn test_puff_patch_framing_roundtrip() {
        let patch = PuffPatch {
            src_deflates: vec![ByteRange { offset: 3, length: 9 }],
            patch: vec![1, 2, 3, 4],
        };
        assert_eq!(PuffPatch::from_bytes(&patch.to_bytes()).unwrap(), patch);
        assert!(PuffPatch::from_bytes(&[0, 0]).is_err());
    }
}
