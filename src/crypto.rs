// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Detached-signature verification of payload metadata.
//!
//! The metadata (envelope header + manifest bytes) is signed with ECDSA
//! P-256; the device bundles the latest verifying key plus any historical
//! keys still trusted for payloads signed before a rotation. Verification
//! must succeed before any byte reaches the destination slot.

use crate::error::ErrorCode;
use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};

pub type PublicKeyId = u64;

#[derive(Clone, Debug)]
pub struct KeyAndId {
    pub id: PublicKeyId,
    pub key: VerifyingKey,
}

/// The bundled certificate set: one current key and zero or more
/// still-trusted historical keys.
#[derive(Clone, Debug)]
pub struct TrustedKeys {
    pub latest: KeyAndId,
    pub historical: Vec<KeyAndId>,
}

impl TrustedKeys {
    pub fn find(&self, id: PublicKeyId) -> Option<&VerifyingKey> {
        if self.latest.id == id {
            return Some(&self.latest.key);
        }
        self.historical
            .iter()
            .find(|pair| pair.id == id)
            .map(|pair| &pair.key)
    }

    fn all(&self) -> impl Iterator<Item = &VerifyingKey> {
        std::iter::once(&self.latest.key).chain(self.historical.iter().map(|p| &p.key))
    }

    /// Verifies a detached signature (fixed-width r||s encoding) over the
    /// metadata bytes. Tries the latest key first, then historical keys.
    pub fn verify_metadata(&self, metadata: &[u8], signature_bytes: &[u8]) -> Result<(), ErrorCode> {
        let signature = Signature::from_slice(signature_bytes)
            .map_err(|_| ErrorCode::PayloadMetadataSignatureError)?;
        if self.all().any(|key| key.verify(metadata, &signature).is_ok()) {
            Ok(())
        } else {
            Err(ErrorCode::PayloadMetadataSignatureError)
        }
    }
}

pub mod test_support {
    //! Deterministic keys for tests; a device never holds a signing key.

    use super::*;
    use p256::ecdsa::signature::Signer as _;
    use p256::ecdsa::SigningKey;

    pub const TEST_KEY_ID: PublicKeyId = 42;

    pub fn make_signing_key() -> SigningKey {
        // Any nonzero scalar below the curve order works as a fixed key.
        let scalar = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c,
            0x1d, 0x1e, 0x1f, 0x20,
        ];
        SigningKey::from_slice(&scalar).expect("fixed scalar is a valid key")
    }

    pub fn make_trusted_keys() -> TrustedKeys {
        TrustedKeys {
            latest: KeyAndId {
                id: TEST_KEY_ID,
                key: VerifyingKey::from(&make_signing_key()),
            },
            historical: vec![],
        }
    }

    /// Fixed-width (64-byte) r||s signature over the metadata.
    pub fn sign(metadata: &[u8]) -> Vec<u8> {
        let signature: Signature = make_signing_key().sign(metadata);
        signature.to_bytes().to_vec()
    }

    pub const SIGNATURE_LEN: u32 = 64;
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_good_signature_verifies() {
        let keys = make_trusted_keys();
        let metadata = b"header and manifest bytes";
        let sig = sign(metadata);
        assert_eq!(keys.verify_metadata(metadata, &sig), Ok(()));
    }

    #[test]
    fn test_tampered_metadata_fails() {
        let keys = make_trusted_keys();
        let sig = sign(b"original metadata");
        assert_eq!(
            keys.verify_metadata(b"tampered metadata", &sig),
            Err(ErrorCode::PayloadMetadataSignatureError)
        );
    }

    #[test]
    fn test_garbage_signature_fails() {
        let keys = make_trusted_keys();
        assert_eq!(
            keys.verify_metadata(b"metadata", b"wrong length"),
            Err(ErrorCode::PayloadMetadataSignatureError)
        );
        assert_eq!(
            keys.verify_metadata(b"metadata", &[0u8; 64]),
            Err(ErrorCode::PayloadMetadataSignatureError)
        );
    }

    #[test]
    fn test_signature_has_fixed_width() {
        assert_eq!(sign(b"a").len() as u32, SIGNATURE_LEN);
        assert_eq!(sign(b"some longer metadata input").len() as u32, SIGNATURE_LEN);
    }

    #[test]
    fn test_historical_key_still_verifies() {
        let signing = make_signing_key();
        let keys = TrustedKeys {
            latest: KeyAndId {
                id: 100,
                // A different key is current now.
                key: VerifyingKey::from(
                    &p256::ecdsa::SigningKey::from_slice(&[0x7f; 32]).unwrap(),
                ),
            },
            historical: vec![KeyAndId {
                id: TEST_KEY_ID,
                key: VerifyingKey::from(&signing),
            }],
        };
        let metadata = b"signed under the old key";
        assert_eq!(keys.verify_metadata(metadata, &sign(metadata)), Ok(()));
        assert!(keys.find(TEST_KEY_ID).is_some());
        assert!(keys.find(7).is_none());
    }
}
