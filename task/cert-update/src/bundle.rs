// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Update bundle wire format: a JSON object carrying the signing
//! certificate, the signed manifest, and one to three Base64 payload
//! fragments. The bundle is allocated when the subscriber hands the body
//! over and dropped when the workflow finishes with it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use drv_secel_api::{ObjectId, SlotCategory, SlotId};
use serde::Deserialize;

pub const MIN_FRAGMENTS: u8 = 1;
pub const MAX_FRAGMENTS: u8 = 3;

/// The manifest must at least reach the target-address field.
pub const MIN_MANIFEST_LEN: usize = 10;

/// Offset of the big-endian trust-anchor object id inside the manifest.
const MANIFEST_ANCHOR_OFFSET: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BundleError {
    Json,
    Base64,
    /// `fragment_count` outside 1..=3.
    FragmentCount,
    /// `fragment_N` missing for an N below `fragment_count`.
    MissingFragment,
    EmptyFragment,
    ManifestTooShort,
    /// The manifest's anchor address is not a trust-anchor slot.
    BadAnchor,
}

#[derive(Deserialize)]
struct BundleWire {
    signing_certificate: String,
    manifest: String,
    fragment_count: u8,
    #[serde(default)]
    fragment_0: Option<String>,
    #[serde(default)]
    fragment_1: Option<String>,
    #[serde(default)]
    fragment_2: Option<String>,
}

/// A decoded bundle: fragments already concatenated in declared order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateBundle {
    pub signing_cert: Vec<u8>,
    pub manifest: Vec<u8>,
    pub fragments: Vec<u8>,
    pub fragment_count: u8,
}

impl UpdateBundle {
    pub fn parse(json: &[u8]) -> Result<Self, BundleError> {
        let wire: BundleWire =
            serde_json::from_slice(json).map_err(|_| BundleError::Json)?;

        if !(MIN_FRAGMENTS..=MAX_FRAGMENTS).contains(&wire.fragment_count) {
            return Err(BundleError::FragmentCount);
        }

        let signing_cert = STANDARD
            .decode(&wire.signing_certificate)
            .map_err(|_| BundleError::Base64)?;
        let manifest = STANDARD
            .decode(&wire.manifest)
            .map_err(|_| BundleError::Base64)?;
        if manifest.len() < MIN_MANIFEST_LEN {
            return Err(BundleError::ManifestTooShort);
        }

        let slots = [wire.fragment_0, wire.fragment_1, wire.fragment_2];
        let mut fragments = Vec::new();
        for encoded in slots.iter().take(wire.fragment_count as usize) {
            let encoded =
                encoded.as_ref().ok_or(BundleError::MissingFragment)?;
            let decoded = STANDARD
                .decode(encoded)
                .map_err(|_| BundleError::Base64)?;
            if decoded.is_empty() {
                return Err(BundleError::EmptyFragment);
            }
            fragments.extend_from_slice(&decoded);
        }

        Ok(UpdateBundle {
            signing_cert,
            manifest,
            fragments,
            fragment_count: wire.fragment_count,
        })
    }

    /// The trust-anchor slot this bundle stages, named by the manifest.
    pub fn anchor_slot(&self) -> Result<SlotId, BundleError> {
        let oid = ObjectId::from_be_bytes([
            self.manifest[MANIFEST_ANCHOR_OFFSET],
            self.manifest[MANIFEST_ANCHOR_OFFSET + 1],
        ]);
        let slot =
            SlotId::from_object(oid).ok_or(BundleError::BadAnchor)?;
        if slot.info().category != SlotCategory::TrustAnchor {
            return Err(BundleError::BadAnchor);
        }
        Ok(slot)
    }
}
