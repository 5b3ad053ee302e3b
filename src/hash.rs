// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Payload hashing.
//!
//! One-shot digests go through `sha2`. The running payload hash is special:
//! its mid-stream context must be persisted with the progress cursor and
//! restored after a process restart, which `sha2` does not expose. The
//! [`RestartableHasher`] below is a SHA-256 whose full state (chaining
//! words, pending block, total length) round-trips through serde; its
//! output is property-tested against `sha2`.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

pub const DIGEST_LEN: usize = 32;
const BLOCK_LEN: usize = 64;

pub type Digest = [u8; DIGEST_LEN];

/// One-shot SHA-256.
pub fn sha256(data: &[u8]) -> Digest {
    Sha256::digest(data).into()
}

/// Streaming SHA-256 with a serializable context.
#[derive(Clone, Debug)]
pub struct RestartableHasher {
    state: [u32; 8],
    block: [u8; BLOCK_LEN],
    total_len: u64,
}

/// The persisted form of a mid-stream hasher. `pending` holds only the
/// bytes of the last partial block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HasherContext {
    state: [u32; 8],
    total_len: u64,
    #[serde(with = "hex_bytes")]
    pending: Vec<u8>,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ContextError {
    #[error("pending length {pending} inconsistent with total length {total}")]
    Inconsistent { pending: usize, total: u64 },
}

impl Default for RestartableHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartableHasher {
    pub fn new() -> Self {
        RestartableHasher {
            state: INITIAL_STATE,
            block: [0; BLOCK_LEN],
            total_len: 0,
        }
    }

    /// Total bytes hashed so far. The progress cursor cross-checks this
    /// against the resume offset.
    pub fn bytes_hashed(&self) -> u64 {
        self.total_len
    }

    pub fn update(&mut self, mut data: &[u8]) {
        let filled = (self.total_len % BLOCK_LEN as u64) as usize;
        self.total_len += data.len() as u64;

        if filled + data.len() < BLOCK_LEN {
            self.block[filled..filled + data.len()].copy_from_slice(data);
            return;
        }

        if filled > 0 {
            let (head, rest) = data.split_at(BLOCK_LEN - filled);
            self.block[filled..].copy_from_slice(head);
            let block = self.block;
            compress(&mut self.state, &block);
            data = rest;
        }

        let mut chunks = data.chunks_exact(BLOCK_LEN);
        for chunk in &mut chunks {
            compress(&mut self.state, chunk.try_into().unwrap());
        }
        let tail = chunks.remainder();
        self.block[..tail.len()].copy_from_slice(tail);
    }

    pub fn finalize(mut self) -> Digest {
        let filled = (self.total_len % BLOCK_LEN as u64) as usize;
        let bit_len = self.total_len * 8;

        self.block[filled] = 0x80;
        for byte in &mut self.block[filled + 1..] {
            *byte = 0;
        }
        if filled >= BLOCK_LEN - 8 {
            let block = self.block;
            compress(&mut self.state, &block);
            self.block = [0; BLOCK_LEN];
        }
        BigEndian::write_u64(&mut self.block[BLOCK_LEN - 8..], bit_len);
        let block = self.block;
        compress(&mut self.state, &block);

        let mut out = [0u8; DIGEST_LEN];
        for (i, word) in self.state.iter().enumerate() {
            BigEndian::write_u32(&mut out[4 * i..4 * i + 4], *word);
        }
        out
    }

    pub fn context(&self) -> HasherContext {
        let filled = (self.total_len % BLOCK_LEN as u64) as usize;
        HasherContext {
            state: self.state,
            total_len: self.total_len,
            pending: self.block[..filled].to_vec(),
        }
    }

    pub fn from_context(ctx: HasherContext) -> Result<Self, ContextError> {
        let filled = (ctx.total_len % BLOCK_LEN as u64) as usize;
        if ctx.pending.len() != filled {
            return Err(ContextError::Inconsistent {
                pending: ctx.pending.len(),
                total: ctx.total_len,
            });
        }
        let mut block = [0u8; BLOCK_LEN];
        block[..filled].copy_from_slice(&ctx.pending);
        Ok(RestartableHasher {
            state: ctx.state,
            block,
            total_len: ctx.total_len,
        })
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

const INITIAL_STATE: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab,
    0x5be0cd19,
];

#[rustfmt::skip]
const ROUND_CONSTANTS: [u32; 64] = [
    0x428a2f98, 0x71374491, 0xb5c0fbcf, 0xe9b5dba5, 0x3956c25b, 0x59f111f1, 0x923f82a4,
    0xab1c5ed5, 0xd807aa98, 0x12835b01, 0x243185be, 0x550c7dc3, 0x72be5d74, 0x80deb1fe,
    0x9bdc06a7, 0xc19bf174, 0xe49b69c1, 0xefbe4786, 0x0fc19dc6, 0x240ca1cc, 0x2de92c6f,
    0x4a7484aa, 0x5cb0a9dc, 0x76f988da, 0x983e5152, 0xa831c66d, 0xb00327c8, 0xbf597fc7,
    0xc6e00bf3, 0xd5a79147, 0x06ca6351, 0x14292967, 0x27b70a85, 0x2e1b2138, 0x4d2c6dfc,
    0x53380d13, 0x650a7354, 0x766a0abb, 0x81c2c92e, 0x92722c85, 0xa2bfe8a1, 0xa81a664b,
    0xc24b8b70, 0xc76c51a3, 0xd192e819, 0xd6990624, 0xf40e3585, 0x106aa070, 0x19a4c116,
    0x1e376c08, 0x2748774c, 0x34b0bcb5, 0x391c0cb3, 0x4ed8aa4a, 0x5b9cca4f, 0x682e6ff3,
    0x748f82ee, 0x78a5636f, 0x84c87814, 0x8cc70208, 0x90befffa, 0xa4506ceb, 0xbef9a3f7,
    0xc67178f2,
];

fn compress(state: &mut [u32; 8], block: &[u8; BLOCK_LEN]) {
    let mut w = [0u32; 64];
    for (i, word) in w.iter_mut().take(16).enumerate() {
        *word = BigEndian::read_u32(&block[4 * i..4 * i + 4]);
    }
    for i in 16..64 {
        let s0 = w[i - 15].rotate_right(7) ^ w[i - 15].rotate_right(18) ^ (w[i - 15] >> 3);
        let s1 = w[i - 2].rotate_right(17) ^ w[i - 2].rotate_right(19) ^ (w[i - 2] >> 10);
        w[i] = w[i - 16]
            .wrapping_add(s0)
            .wrapping_add(w[i - 7])
            .wrapping_add(s1);
    }

    let [mut a, mut b, mut c, mut d, mut e, mut f, mut g, mut h] = *state;
    for i in 0..64 {
        let s1 = e.rotate_right(6) ^ e.rotate_right(11) ^ e.rotate_right(25);
        let ch = (e & f) ^ (!e & g);
        let t1 = h
            .wrapping_add(s1)
            .wrapping_add(ch)
            .wrapping_add(ROUND_CONSTANTS[i])
            .wrapping_add(w[i]);
        let s0 = a.rotate_right(2) ^ a.rotate_right(13) ^ a.rotate_right(22);
        let maj = (a & b) ^ (a & c) ^ (b & c);
        let t2 = s0.wrapping_add(maj);

        h = g;
        g = f;
        f = e;
        e = d.wrapping_add(t1);
        d = c;
        c = b;
        b = a;
        a = t1.wrapping_add(t2);
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
    state[4] = state[4].wrapping_add(e);
    state[5] = state[5].wrapping_add(f);
    state[6] = state[6].wrapping_add(g);
    state[7] = state[7].wrapping_add(h);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_input_matches_sha2() {
        assert_eq!(RestartableHasher::new().finalize(), sha256(&[]));
    }

    #[test]
    fn test_padding_boundaries_match_sha2() {
        // 55, 56 and 64 bytes straddle the length-field padding cases.
        for len in [1usize, 55, 56, 63, 64, 65, 127, 128, 1000] {
            let data = vec![0xabu8; len];
            let mut hasher = RestartableHasher::new();
            hasher.update(&data);
            assert_eq!(hasher.finalize(), sha256(&data), "len={len}");
        }
    }

    #[test]
    fn test_context_roundtrip_mid_stream() {
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let mut hasher = RestartableHasher::new();
        hasher.update(&data[..301]);

        let blob = serde_json::to_vec(&hasher.context()).unwrap();
        let ctx: HasherContext = serde_json::from_slice(&blob).unwrap();
        let mut restored = RestartableHasher::from_context(ctx).unwrap();
        assert_eq!(restored.bytes_hashed(), 301);

        restored.update(&data[301..]);
        assert_eq!(restored.finalize(), sha256(&data));
    }

    #[test]
    fn test_context_rejects_inconsistent_pending() {
        let mut hasher = RestartableHasher::new();
        hasher.update(b"hello");
        let mut ctx = hasher.context();
        ctx.pending.pop();
        assert!(RestartableHasher::from_context(ctx).is_err());
    }

    proptest! {
        #[test]
        fn test_arbitrary_splits_match_sha2(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            split in 0usize..2048,
        ) {
            let split = split.min(data.len());
            let mut hasher = RestartableHasher::new();
            hasher.update(&data[..split]);
            let restored = RestartableHasher::from_context(hasher.context()).unwrap();
            let mut hasher = restored;
            hasher.update(&data[split..]);
            prop_assert_eq!(hasher.finalize(), sha256(&data));
        }
    }
}
