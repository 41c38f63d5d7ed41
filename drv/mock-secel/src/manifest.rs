// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Update manifest layout.
//!
//! A manifest binds the update payload to a target object: it names the
//! trust anchor that vouches for it, the object to replace, a version for
//! replay protection, and the payload digest, all under one signature.
//! Offsets are fixed; the workflow layer reads only the algorithm byte and
//! the anchor address, the element consumes the rest.

use drv_secel_api::ObjectId;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256};

pub const MANIFEST_SIZE: usize = 114;

/// Signature algorithm byte.
pub const ALG_OFFSET: usize = 4;
/// ECDSA P-256 with SHA-256.
pub const ALG_ES256: u8 = 0x26;

/// Trust-anchor object id, big-endian.
pub const ANCHOR_OFFSET: usize = 8;
/// Target object id, big-endian.
pub const TARGET_OFFSET: usize = 10;
/// Payload version, big-endian.
pub const VERSION_OFFSET: usize = 12;
/// Payload total length, big-endian u32.
pub const LENGTH_OFFSET: usize = 14;
/// SHA-256 of the concatenated payload fragments.
pub const DIGEST_OFFSET: usize = 18;
/// Raw `r || s` signature over bytes `0..SIGNATURE_OFFSET`.
pub const SIGNATURE_OFFSET: usize = 50;

pub const SIGNED_LEN: usize = SIGNATURE_OFFSET;

/// Read the trust-anchor address out of a manifest. The caller has already
/// checked the manifest is at least 10 bytes.
pub fn anchor_object(manifest: &[u8]) -> ObjectId {
    ObjectId::from_be_bytes([
        manifest[ANCHOR_OFFSET],
        manifest[ANCHOR_OFFSET + 1],
    ])
}

/// Assemble and sign a manifest. Test-support: in production manifests
/// arrive from the platform, already signed.
pub fn build(
    anchor: ObjectId,
    target: ObjectId,
    version: u16,
    payload: &[u8],
    signer: &SigningKey,
) -> Vec<u8> {
    let mut m = vec![0u8; MANIFEST_SIZE];
    m[0] = 0x84;
    m[ALG_OFFSET] = ALG_ES256;
    m[ANCHOR_OFFSET..ANCHOR_OFFSET + 2]
        .copy_from_slice(&anchor.to_be_bytes());
    m[TARGET_OFFSET..TARGET_OFFSET + 2]
        .copy_from_slice(&target.to_be_bytes());
    m[VERSION_OFFSET..VERSION_OFFSET + 2]
        .copy_from_slice(&version.to_be_bytes());
    m[LENGTH_OFFSET..LENGTH_OFFSET + 4]
        .copy_from_slice(&(payload.len() as u32).to_be_bytes());

    let digest: [u8; 32] = Sha256::digest(payload).into();
    m[DIGEST_OFFSET..DIGEST_OFFSET + 32].copy_from_slice(&digest);

    let signed_digest: [u8; 32] = Sha256::digest(&m[..SIGNED_LEN]).into();
    // Manifest signing cannot fail for a valid key; surface misuse loudly
    // in test support rather than threading an error.
    let sig: Signature = signer
        .sign_prehash(&signed_digest)
        .expect("manifest signing");
    m[SIGNATURE_OFFSET..].copy_from_slice(sig.to_bytes().as_slice());

    m
}
