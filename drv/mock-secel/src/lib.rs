// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated secure element.
//!
//! Implements the bus contract over an in-memory slot store with real
//! ECDSA-P256 crypto, so everything above it (access layer, lifecycle
//! machinery, update workflow) can run honestly on the host. The simulation
//! covers the behaviors that shaped the real designs: access conditions,
//! per-object lifecycle state, the protected-update protocol, one-request-
//! at-a-time busy signalling, and the NVM commit lag where a read issued
//! too soon after a write observes the previous contents.
//!
//! Keys are derived deterministically; nothing here is secret, but private
//! scalars still never cross the bus, same as the real part.

pub mod certgen;
pub mod manifest;

use certgen::CertParams;
use drv_secel_api::{
    AccessCondition, BusRequest, Completion, Lcso, MetadataPatch, ObjectId,
    ObjectType, RawStatus, SeBus, SeCommand, SlotCategory, SlotId,
    SlotMetadata,
};
use lib_certstore::der::DerWriter;
use lib_certstore::time::UtcTime;
use lib_certstore::{strip_identity_header, x509};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

/// Simulation knobs.
#[derive(Clone, Debug)]
pub struct MockOptions {
    /// Complete requests from a spawned thread instead of inline, after
    /// `completion_delay_ms`.
    pub deferred: bool,
    pub completion_delay_ms: u64,
    /// After every data write, this many subsequent observations of the
    /// slot (reads, or the update engine fetching a staged anchor) see the
    /// prior contents. Models the NVM commit lag.
    pub nvm_stale_reads: u32,
    /// Lifecycle state given to mutable slots at construction. `Creation`
    /// behaves like an engineering sample; `Operational` like a production
    /// part with locked metadata.
    pub initial_lcso: Lcso,
}

impl Default for MockOptions {
    fn default() -> Self {
        MockOptions {
            deferred: false,
            completion_delay_ms: 0,
            nvm_stale_reads: 0,
            initial_lcso: Lcso::Creation,
        }
    }
}

/// Counters a test can interrogate.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MockStats {
    pub submissions: u32,
    /// Requests turned away because another was in flight. Stays zero for
    /// any caller that serialises correctly.
    pub busy_rejects: u32,
    pub executed: u32,
}

struct SlotState {
    data: Vec<u8>,
    /// `(previous contents, observations remaining)`.
    stale: Option<(Vec<u8>, u32)>,
    lcso: Lcso,
    version: u16,
    change: AccessCondition,
    read: AccessCondition,
    execute: AccessCondition,
    object_type: Option<ObjectType>,
}

struct Staged {
    target: SlotId,
    digest: [u8; 32],
    total_len: usize,
    version: u16,
}

struct State {
    slots: HashMap<SlotId, SlotState>,
    keys: HashMap<SlotId, SigningKey>,
    staged: Option<Staged>,
    key_seq: u64,
}

struct Shared {
    opts: MockOptions,
    state: Mutex<State>,
    in_flight: AtomicBool,
    submissions: AtomicU32,
    busy_rejects: AtomicU32,
    executed: AtomicU32,
}

#[derive(Clone)]
pub struct MockSecel {
    shared: Arc<Shared>,
}

fn default_slot(slot: SlotId, initial_lcso: Lcso) -> SlotState {
    let info = slot.info();
    let (read, change, lcso) = match info.category {
        SlotCategory::FactoryUid | SlotCategory::FactoryCert => (
            AccessCondition::Always,
            AccessCondition::Never,
            Lcso::Operational,
        ),
        SlotCategory::FactoryKey => (
            AccessCondition::Never,
            AccessCondition::Never,
            Lcso::Operational,
        ),
        SlotCategory::DeviceKey => (
            AccessCondition::Never,
            AccessCondition::Always,
            initial_lcso,
        ),
        SlotCategory::Reserved => (
            AccessCondition::Never,
            AccessCondition::Never,
            initial_lcso,
        ),
        _ => (AccessCondition::Always, AccessCondition::Always, initial_lcso),
    };
    SlotState {
        data: Vec::new(),
        stale: None,
        lcso,
        version: 0,
        change,
        read,
        execute: AccessCondition::Never,
        object_type: Some(info.data_type),
    }
}

fn derive_key(seq: u64, object: ObjectId) -> SigningKey {
    let mut attempt = 0u32;
    loop {
        let mut h = Sha256::new();
        h.update(b"mock-secel-key");
        h.update(seq.to_be_bytes());
        h.update(object.to_be_bytes());
        h.update(attempt.to_be_bytes());
        let digest: [u8; 32] = h.finalize().into();
        let bytes = Zeroizing::new(digest);
        if let Ok(key) =
            SigningKey::from_bytes(p256::FieldBytes::from_slice(&*bytes))
        {
            return key;
        }
        attempt += 1;
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

impl MockSecel {
    pub fn new(opts: MockOptions) -> Self {
        let slots = SlotId::iter()
            .map(|s| (s, default_slot(s, opts.initial_lcso)))
            .collect();
        MockSecel {
            shared: Arc::new(Shared {
                opts,
                state: Mutex::new(State {
                    slots,
                    keys: HashMap::new(),
                    staged: None,
                    key_seq: 0,
                }),
                in_flight: AtomicBool::new(false),
                submissions: AtomicU32::new(0),
                busy_rejects: AtomicU32::new(0),
                executed: AtomicU32::new(0),
            }),
        }
    }

    /// A factory-provisioned element: UID, factory keypair, and a factory
    /// certificate whose subject CN is the lowercase hex UID.
    pub fn provisioned(uid: &[u8]) -> Self {
        Self::provisioned_with(uid, MockOptions::default())
    }

    pub fn provisioned_with(uid: &[u8], opts: MockOptions) -> Self {
        let mock = Self::new(opts);
        mock.provision_factory(
            uid,
            UtcTime::new(2020, 1, 1, 0, 0, 0),
            UtcTime::new(2049, 12, 31, 23, 59, 59),
        );
        mock
    }

    /// Burn in the factory identity, as manufacturing would.
    pub fn provision_factory(
        &self,
        uid: &[u8],
        not_before: UtcTime,
        not_after: UtcTime,
    ) {
        let mut state = self.lock_state();
        state.key_seq += 1;
        let key = derive_key(state.key_seq, SlotId::FactoryKey.object_id());

        let cn = hex_lower(uid);
        let cert = certgen::generate(
            &CertParams {
                serial: &[0x01],
                issuer_cn: "factory-root",
                subject_cn: &cn,
                org: Some("edge-devices"),
                not_before,
                not_after,
            },
            key.verifying_key(),
            &key,
        )
        .expect("factory cert generation");

        // Stored certificates carry the vendor identity header.
        let mut stored = vec![0xc0u8; 1];
        stored.extend_from_slice(&[0u8; 8]);
        stored.extend_from_slice(&cert);

        if let Some(st) = state.slots.get_mut(&SlotId::FactoryUid) {
            st.data = uid[..uid.len().min(27)].to_vec();
        }
        if let Some(st) = state.slots.get_mut(&SlotId::FactoryCert) {
            st.data = stored;
        }
        state.keys.insert(SlotId::FactoryKey, key);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        match self.shared.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ---- test inspection, out of band of the bus ----

    pub fn slot_data(&self, slot: SlotId) -> Vec<u8> {
        self.lock_state()
            .slots
            .get(&slot)
            .map(|s| s.data.clone())
            .unwrap_or_default()
    }

    /// Provision slot contents directly, bypassing access conditions.
    pub fn set_slot_data(&self, slot: SlotId, data: &[u8]) {
        if let Some(st) = self.lock_state().slots.get_mut(&slot) {
            st.data = data.to_vec();
            st.stale = None;
        }
    }

    pub fn set_lcso(&self, slot: SlotId, lcso: Lcso) {
        if let Some(st) = self.lock_state().slots.get_mut(&slot) {
            st.lcso = lcso;
        }
    }

    pub fn slot_metadata(&self, slot: SlotId) -> SlotMetadata {
        let state = self.lock_state();
        let st = &state.slots[&slot];
        assemble_metadata(slot, st)
    }

    /// The public half of a slot-resident key, if one exists.
    pub fn verifying_key(&self, slot: SlotId) -> Option<VerifyingKey> {
        self.lock_state().keys.get(&slot).map(|k| *k.verifying_key())
    }

    pub fn stats(&self) -> MockStats {
        MockStats {
            submissions: self.shared.submissions.load(Ordering::SeqCst),
            busy_rejects: self.shared.busy_rejects.load(Ordering::SeqCst),
            executed: self.shared.executed.load(Ordering::SeqCst),
        }
    }
}

impl SeBus for MockSecel {
    fn submit(&self, frame: &[u8], done: Completion) -> RawStatus {
        self.shared.submissions.fetch_add(1, Ordering::SeqCst);

        let Ok(msg) = BusRequest::unpack(frame) else {
            return RawStatus::HardwareFault;
        };

        if self.shared.in_flight.swap(true, Ordering::SeqCst) {
            self.shared.busy_rejects.fetch_add(1, Ordering::SeqCst);
            return RawStatus::Busy;
        }

        let cmd = msg.body;
        let blob = msg.blob.to_vec();

        if self.shared.opts.deferred {
            let shared = self.shared.clone();
            std::thread::spawn(move || {
                if shared.opts.completion_delay_ms > 0 {
                    std::thread::sleep(std::time::Duration::from_millis(
                        shared.opts.completion_delay_ms,
                    ));
                }
                let (status, payload) = shared.execute(cmd, &blob);
                // Ready for the next request before the caller can see
                // the completion, so a prompt next submit never bounces.
                shared.in_flight.store(false, Ordering::SeqCst);
                done.finish(status, &payload);
            });
        } else {
            let (status, payload) = self.shared.execute(cmd, &blob);
            self.shared.in_flight.store(false, Ordering::SeqCst);
            done.finish(status, &payload);
        }

        RawStatus::Ok
    }
}

fn assemble_metadata(slot: SlotId, st: &SlotState) -> SlotMetadata {
    SlotMetadata {
        lcso: st.lcso,
        version: st.version,
        max_size: slot.info().max_size,
        used_size: st.data.len() as u16,
        change: st.change,
        read: st.read,
        execute: st.execute,
        object_type: st.object_type,
    }
}

/// Observe slot contents the way a post-write read does: within the commit
/// window, the previous contents are returned.
fn observe(st: &mut SlotState) -> Vec<u8> {
    match &mut st.stale {
        Some((old, remaining)) => {
            let out = old.clone();
            *remaining -= 1;
            if *remaining == 0 {
                st.stale = None;
            }
            out
        }
        None => st.data.clone(),
    }
}

impl Shared {
    fn execute(&self, cmd: SeCommand, blob: &[u8]) -> (RawStatus, Vec<u8>) {
        self.executed.fetch_add(1, Ordering::SeqCst);
        let mut state = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        match cmd {
            SeCommand::ReadData { object } => self.read_data(&mut state, object),
            SeCommand::WriteData { object, erase } => {
                self.write_data(&mut state, object, blob, erase)
            }
            SeCommand::ReadMetadata { object } => {
                self.read_metadata(&mut state, object)
            }
            SeCommand::WriteMetadata { object } => {
                self.write_metadata(&mut state, object, blob)
            }
            SeCommand::GenerateKeypair { object, export_public, .. } => {
                self.generate_keypair(&mut state, object, export_public)
            }
            SeCommand::SignHash { object } => {
                self.sign_hash(&mut state, object, blob)
            }
            SeCommand::ProtectedUpdateStart => {
                self.update_start(&mut state, blob)
            }
            SeCommand::ProtectedUpdateFinal => {
                self.update_final(&mut state, blob)
            }
            SeCommand::ReadCounter { object } => {
                self.read_counter(&mut state, object)
            }
            SeCommand::IncrementCounter { object, by } => {
                self.increment_counter(&mut state, object, by)
            }
        }
    }

    fn read_data(
        &self,
        state: &mut State,
        object: ObjectId,
    ) -> (RawStatus, Vec<u8>) {
        let Some(slot) = SlotId::from_object(object) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        let Some(st) = state.slots.get_mut(&slot) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        if st.read != AccessCondition::Always {
            return (RawStatus::AccessDenied, Vec::new());
        }
        let data = observe(st);
        (RawStatus::Ok, data)
    }

    fn write_data(
        &self,
        state: &mut State,
        object: ObjectId,
        blob: &[u8],
        erase: bool,
    ) -> (RawStatus, Vec<u8>) {
        let Some(slot) = SlotId::from_object(object) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        let max = slot.info().max_size as usize;
        let Some(st) = state.slots.get_mut(&slot) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        if st.change != AccessCondition::Always {
            // Integrity-protected objects change only through the update
            // engine; Never never changes.
            return (RawStatus::AccessDenied, Vec::new());
        }
        if blob.len() > max {
            return (RawStatus::InvalidData, Vec::new());
        }

        let old = st.data.clone();
        if erase || blob.len() >= st.data.len() {
            st.data = blob.to_vec();
        } else {
            st.data[..blob.len()].copy_from_slice(blob);
        }
        if self.opts.nvm_stale_reads > 0 {
            st.stale = Some((old, self.opts.nvm_stale_reads));
        }
        (RawStatus::Ok, Vec::new())
    }

    fn read_metadata(
        &self,
        state: &mut State,
        object: ObjectId,
    ) -> (RawStatus, Vec<u8>) {
        let Some(slot) = SlotId::from_object(object) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        let Some(st) = state.slots.get(&slot) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        let md = assemble_metadata(slot, st);
        let mut buf = [0u8; 64];
        match md.encode(&mut buf) {
            Ok(n) => (RawStatus::Ok, buf[..n].to_vec()),
            Err(_) => (RawStatus::HardwareFault, Vec::new()),
        }
    }

    fn write_metadata(
        &self,
        state: &mut State,
        object: ObjectId,
        blob: &[u8],
    ) -> (RawStatus, Vec<u8>) {
        let Some(slot) = SlotId::from_object(object) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        let Some(st) = state.slots.get_mut(&slot) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        let Ok(patch) = MetadataPatch::decode(blob) else {
            return (RawStatus::InvalidData, Vec::new());
        };

        // Lifecycle state only moves forward.
        if let Some(lcso) = patch.lcso {
            if lcso < st.lcso {
                return (RawStatus::LcsLocked, Vec::new());
            }
        }

        if st.lcso >= Lcso::Operational {
            // Metadata is frozen; a write that changes nothing is
            // tolerated, anything else is refused.
            let mut would_be = assemble_metadata(slot, st);
            would_be.apply(&patch);
            if would_be != assemble_metadata(slot, st) {
                return (RawStatus::LcsLocked, Vec::new());
            }
            return (RawStatus::Ok, Vec::new());
        }

        let mut md = assemble_metadata(slot, st);
        md.apply(&patch);
        st.lcso = md.lcso;
        st.version = md.version;
        st.change = md.change;
        st.read = md.read;
        st.execute = md.execute;
        st.object_type = md.object_type;
        (RawStatus::Ok, Vec::new())
    }

    fn generate_keypair(
        &self,
        state: &mut State,
        object: ObjectId,
        _export_public: bool,
    ) -> (RawStatus, Vec<u8>) {
        let Some(slot) = SlotId::from_object(object) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        match slot.info().category {
            SlotCategory::DeviceKey => (),
            SlotCategory::FactoryKey => {
                return (RawStatus::AccessDenied, Vec::new())
            }
            _ => return (RawStatus::InvalidSlot, Vec::new()),
        }
        let Some(st) = state.slots.get(&slot) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        if st.change != AccessCondition::Always {
            return (RawStatus::AccessDenied, Vec::new());
        }

        state.key_seq += 1;
        let key = derive_key(state.key_seq, object);
        let point = key.verifying_key().to_encoded_point(false);
        let payload = point.as_bytes().to_vec();
        state.keys.insert(slot, key);
        (RawStatus::Ok, payload)
    }

    fn sign_hash(
        &self,
        state: &mut State,
        object: ObjectId,
        blob: &[u8],
    ) -> (RawStatus, Vec<u8>) {
        let Some(slot) = SlotId::from_object(object) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        if blob.len() != 32 {
            return (RawStatus::InvalidData, Vec::new());
        }
        let Some(key) = state.keys.get(&slot) else {
            // Key slot exists but holds no key.
            return (RawStatus::AccessDenied, Vec::new());
        };

        let Ok(sig) = PrehashSigner::<Signature>::sign_prehash(key, blob)
        else {
            return (RawStatus::HardwareFault, Vec::new());
        };
        let bytes = sig.to_bytes();
        let bytes = bytes.as_slice();

        // The part hands back the two INTEGERs without an outer SEQUENCE.
        let mut buf = [0u8; 72];
        let mut w = DerWriter::new(&mut buf);
        if w.prepend_integer(&bytes[32..]).is_err()
            || w.prepend_integer(&bytes[..32]).is_err()
        {
            return (RawStatus::HardwareFault, Vec::new());
        }
        let tlv = w.finish().to_vec();
        (RawStatus::Ok, tlv)
    }

    fn update_start(
        &self,
        state: &mut State,
        m: &[u8],
    ) -> (RawStatus, Vec<u8>) {
        use manifest::*;

        if m.len() < MANIFEST_SIZE {
            return (RawStatus::InvalidData, Vec::new());
        }
        if m[ALG_OFFSET] != ALG_ES256 {
            return (RawStatus::SignatureInvalid, Vec::new());
        }

        let anchor_oid = anchor_object(m);
        let Some(anchor_slot) = SlotId::from_object(anchor_oid) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        if anchor_slot.info().category != SlotCategory::TrustAnchor {
            return (RawStatus::AccessDenied, Vec::new());
        }
        let Some(anchor_st) = state.slots.get_mut(&anchor_slot) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        // The engine reads the anchor through the same NVM path as
        // everyone else: a too-fresh write shows its previous contents.
        let anchor_data = observe(anchor_st);
        if anchor_data.is_empty() {
            return (RawStatus::SignatureInvalid, Vec::new());
        }
        let anchor_der = strip_identity_header(&anchor_data);
        let Ok(point) = x509::public_key_point(anchor_der) else {
            return (RawStatus::SignatureInvalid, Vec::new());
        };
        let Ok(anchor_key) = VerifyingKey::from_sec1_bytes(point) else {
            return (RawStatus::SignatureInvalid, Vec::new());
        };

        let target_oid = ObjectId::from_be_bytes([
            m[TARGET_OFFSET],
            m[TARGET_OFFSET + 1],
        ]);
        let Some(target_slot) = SlotId::from_object(target_oid) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        let Some(target_st) = state.slots.get(&target_slot) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        if target_st.change
            != AccessCondition::IntegrityProtected(anchor_oid)
        {
            return (RawStatus::AccessDenied, Vec::new());
        }

        let version = u16::from_be_bytes([
            m[VERSION_OFFSET],
            m[VERSION_OFFSET + 1],
        ]);
        if version <= target_st.version {
            return (RawStatus::InvalidData, Vec::new());
        }

        let digest: [u8; 32] = Sha256::digest(&m[..SIGNED_LEN]).into();
        let Ok(sig) = Signature::from_slice(&m[SIGNATURE_OFFSET..]) else {
            return (RawStatus::SignatureInvalid, Vec::new());
        };
        if anchor_key.verify_prehash(&digest, &sig).is_err() {
            return (RawStatus::SignatureInvalid, Vec::new());
        }

        let mut payload_digest = [0u8; 32];
        payload_digest
            .copy_from_slice(&m[DIGEST_OFFSET..DIGEST_OFFSET + 32]);
        let total_len = u32::from_be_bytes([
            m[LENGTH_OFFSET],
            m[LENGTH_OFFSET + 1],
            m[LENGTH_OFFSET + 2],
            m[LENGTH_OFFSET + 3],
        ]) as usize;

        state.staged = Some(Staged {
            target: target_slot,
            digest: payload_digest,
            total_len,
            version,
        });
        (RawStatus::Ok, Vec::new())
    }

    fn update_final(
        &self,
        state: &mut State,
        fragments: &[u8],
    ) -> (RawStatus, Vec<u8>) {
        let Some(staged) = state.staged.take() else {
            // Final without a verified manifest is a sequence violation.
            return (RawStatus::InvalidData, Vec::new());
        };

        if fragments.len() != staged.total_len {
            return (RawStatus::InvalidData, Vec::new());
        }
        let digest: [u8; 32] = Sha256::digest(fragments).into();
        if digest != staged.digest {
            return (RawStatus::SignatureInvalid, Vec::new());
        }

        let Some(st) = state.slots.get_mut(&staged.target) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        st.data = fragments.to_vec();
        st.version = staged.version;
        st.stale = None;
        (RawStatus::Ok, Vec::new())
    }

    fn read_counter(
        &self,
        state: &mut State,
        object: ObjectId,
    ) -> (RawStatus, Vec<u8>) {
        let Some(slot) = SlotId::from_object(object) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        let Some(st) = state.slots.get(&slot) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        let value = counter_value(st);
        (RawStatus::Ok, value.to_be_bytes().to_vec())
    }

    fn increment_counter(
        &self,
        state: &mut State,
        object: ObjectId,
        by: u32,
    ) -> (RawStatus, Vec<u8>) {
        let Some(slot) = SlotId::from_object(object) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        let Some(st) = state.slots.get_mut(&slot) else {
            return (RawStatus::InvalidSlot, Vec::new());
        };
        let value = counter_value(st).saturating_add(by);
        st.data = value.to_be_bytes().to_vec();
        (RawStatus::Ok, Vec::new())
    }
}

fn counter_value(st: &SlotState) -> u32 {
    match st.data.as_slice() {
        [a, b, c, d] => u32::from_be_bytes([*a, *b, *c, *d]),
        _ => 0,
    }
}
