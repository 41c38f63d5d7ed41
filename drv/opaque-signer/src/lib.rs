// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Opaque-key signing driver for the TLS stack.
//!
//! The TLS layer computes its CertificateVerify signature through a
//! driver that sees only a numeric key handle; the private key is a slot
//! in the secure element and never appears in memory. "Generating" a key
//! through this driver attaches an existing slot to a handle; actual
//! keypair generation belongs to the renewal workflow.
//!
//! The handle table is fixed-size and interior-mutable with one writer
//! (certificate selection) and many readers (sign callbacks). A rebind is
//! visible to the next `sign_hash`; a signature already in flight keeps
//! the binding it read at entry.

use drv_secel_api::{SeBus, SlotCategory, SlotId};
use drv_secel_server::{Seal, SealError};
use lib_certstore::{strip_identity_header, x509};
use ringbuf::{ringbuf, ringbuf_entry};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

/// Concurrent TLS identities the driver can serve.
pub const MAX_TLS_IDENTITIES: usize = 4;

const UNBOUND: u8 = 0xff;

/// Externally-chosen key handle, the identifier the TLS stack registers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KeyId(pub u32);

/// Signature algorithms a TLS stack may request. Only ECDSA(SHA-256) on
/// P-256 is ever accepted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignAlg {
    EcdsaSha256,
    EcdsaSha384,
    EcdsaSha512,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignerError {
    /// All handle-table entries are occupied.
    NoSpace,
    /// Handle already allocated.
    Exists,
    /// No such handle.
    BadHandle,
    /// Handle exists but no slot is attached.
    NotBound,
    /// Only key-category slots can back a handle.
    BadSlot,
    /// The driver signs ECDSA(SHA-256)/P-256 and nothing else.
    BadAlgorithm,
    /// `sign_hash` requires exactly a 32-byte digest.
    BadDigestLength,
    /// The paired certificate slot held nothing usable for public-key
    /// export.
    NoPublicKey,
    Seal(SealError),
}

impl From<SealError> for SignerError {
    fn from(e: SealError) -> Self {
        SignerError::Seal(e)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Allocate(u32),
    Destroy(u32),
    Bind(u32, SlotId),
    Sign(SlotId),
    Reject(SignerError),
}

ringbuf!(Trace, 16, Trace::None);

struct Entry {
    used: AtomicBool,
    key: AtomicU32,
    /// Index into `SlotId::ALL`, or `UNBOUND`.
    binding: AtomicU8,
}

impl Entry {
    const fn new() -> Self {
        Entry {
            used: AtomicBool::new(false),
            key: AtomicU32::new(0),
            binding: AtomicU8::new(UNBOUND),
        }
    }
}

fn slot_index(slot: SlotId) -> u8 {
    // SlotId::ALL is small; position doubles as a compact encoding.
    SlotId::ALL
        .iter()
        .position(|s| *s == slot)
        .map(|i| i as u8)
        .unwrap_or(UNBOUND)
}

fn slot_from_index(index: u8) -> Option<SlotId> {
    SlotId::ALL.get(index as usize).copied()
}

/// The handle table. One writer (selection) and many readers (signing)
/// share it; all fields are atomics with release/acquire pairing on the
/// binding.
pub struct SlotTable {
    entries: [Entry; MAX_TLS_IDENTITIES],
}

impl SlotTable {
    pub const fn new() -> Self {
        SlotTable {
            entries: [
                Entry::new(),
                Entry::new(),
                Entry::new(),
                Entry::new(),
            ],
        }
    }

    fn find(&self, key: KeyId) -> Option<&Entry> {
        self.entries.iter().find(|e| {
            e.used.load(Ordering::Acquire)
                && e.key.load(Ordering::Relaxed) == key.0
        })
    }

    /// Claim a table entry for a new handle.
    pub fn allocate(&self, key: KeyId) -> Result<(), SignerError> {
        if self.find(key).is_some() {
            return Err(SignerError::Exists);
        }
        for e in &self.entries {
            if e.used
                .compare_exchange(
                    false,
                    true,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                e.key.store(key.0, Ordering::Relaxed);
                e.binding.store(UNBOUND, Ordering::Release);
                ringbuf_entry!(Trace::Allocate(key.0));
                return Ok(());
            }
        }
        ringbuf_entry!(Trace::Reject(SignerError::NoSpace));
        Err(SignerError::NoSpace)
    }

    /// Release a handle. The TLS-layer key object is gone; the slot and
    /// its key are untouched.
    pub fn destroy(&self, key: KeyId) -> Result<(), SignerError> {
        let e = self.find(key).ok_or(SignerError::BadHandle)?;
        e.binding.store(UNBOUND, Ordering::Release);
        e.used.store(false, Ordering::Release);
        ringbuf_entry!(Trace::Destroy(key.0));
        Ok(())
    }

    /// Attach a key slot to a handle. In the PSA shape this is the
    /// driver's "generate": no key material is produced here.
    pub fn generate_key(
        &self,
        key: KeyId,
        slot: SlotId,
    ) -> Result<(), SignerError> {
        self.bind(key, slot)
    }

    /// Swap the slot behind an existing handle, without destroying the
    /// TLS-layer key object. Visible to the next `sign_hash`.
    pub fn rebind(&self, key: KeyId, slot: SlotId) -> Result<(), SignerError> {
        self.bind(key, slot)
    }

    fn bind(&self, key: KeyId, slot: SlotId) -> Result<(), SignerError> {
        match slot.info().category {
            SlotCategory::FactoryKey | SlotCategory::DeviceKey => (),
            _ => return Err(SignerError::BadSlot),
        }
        let e = self.find(key).ok_or(SignerError::BadHandle)?;
        e.binding.store(slot_index(slot), Ordering::Release);
        ringbuf_entry!(Trace::Bind(key.0, slot));
        Ok(())
    }

    /// The slot currently bound to a handle.
    pub fn binding(&self, key: KeyId) -> Result<SlotId, SignerError> {
        let e = self.find(key).ok_or(SignerError::BadHandle)?;
        slot_from_index(e.binding.load(Ordering::Acquire))
            .ok_or(SignerError::NotBound)
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The driver face the TLS stack calls: table plus element access.
pub struct OpaqueSigner<'a, B: SeBus> {
    seal: &'a Seal<B>,
    table: &'a SlotTable,
}

impl<'a, B: SeBus> OpaqueSigner<'a, B> {
    pub fn new(seal: &'a Seal<B>, table: &'a SlotTable) -> Self {
        OpaqueSigner { seal, table }
    }

    /// Sign a 32-byte digest with the slot behind `key`, returning raw
    /// `r || s`.
    pub fn sign_hash(
        &self,
        key: KeyId,
        alg: SignAlg,
        digest: &[u8],
    ) -> Result<[u8; 64], SignerError> {
        if alg != SignAlg::EcdsaSha256 {
            ringbuf_entry!(Trace::Reject(SignerError::BadAlgorithm));
            return Err(SignerError::BadAlgorithm);
        }
        let digest: &[u8; 32] = digest
            .try_into()
            .map_err(|_| SignerError::BadDigestLength)?;

        // One acquire read; a concurrent rebind affects the next
        // signature, not this one.
        let slot = self.table.binding(key)?;
        ringbuf_entry!(Trace::Sign(slot));

        let mut guard = self.seal.lock();
        Ok(guard.sign_hash(slot, digest)?)
    }

    /// Export the public half of the key behind `key`, read from the
    /// paired certificate slot.
    pub fn export_public(
        &self,
        key: KeyId,
    ) -> Result<[u8; 65], SignerError> {
        let slot = self.table.binding(key)?;
        let cert_slot = slot.paired().ok_or(SignerError::NoPublicKey)?;

        let mut guard = self.seal.lock();
        let stored = guard.read_data_vec(cert_slot)?;
        drop(guard);

        let der = strip_identity_header(&stored);
        let point = x509::public_key_point(der)
            .map_err(|_| SignerError::NoPublicKey)?;
        Ok(*point)
    }
}
