// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protected certificate update workflow.
//!
//! A signed bundle arrives from the platform: a signing certificate (the
//! trust anchor for this update), a signed manifest, and the encrypted
//! payload in up to three fragments. The workflow stages the anchor, lets
//! the element verify the manifest against it, and hands over the payload
//! for an atomic replace of the device certificate. The previous
//! certificate survives every failure mode.
//!
//! Two hard-won rules shape the sequence. The anchor write must be proven
//! committed — by reading it back and comparing — before the manifest
//! verify, or the element verifies against stale bytes. And the whole run,
//! staging through install, happens under one held element lock so no
//! other initiator can slip an operation between the anchor and its use.

mod bundle;

pub use bundle::{BundleError, UpdateBundle};

use drv_secel_api::{
    AccessCondition, MetadataPatch, ObjectType, SeBus, SeError, SealError,
    SlotId,
};
use drv_secel_server::{Delay, Seal, SealGuard};
use ringbuf::{ringbuf, ringbuf_entry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use task_certmgr_api::{CertMgrError, LifecycleFlags};
use workflow_lock::{WorkflowKind, WorkflowLock};

/// Rest between the anchor data write and its readback. The readback
/// compare is the actual fence; the rest only gives the element's NVM a
/// head start.
pub const DEFAULT_REST_MS: u64 = 500;

#[derive(Clone, Debug)]
pub struct UpdateConfig {
    pub rest_ms: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            rest_ms: DEFAULT_REST_MS,
        }
    }
}

/// Why step 6 refused the manifest, with the anchor state that was in
/// force — the first things support asks for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ManifestDiag {
    pub status: SeError,
    pub anchor_type: Option<ObjectType>,
    pub anchor_change: Option<AccessCondition>,
    pub anchor_execute: Option<AccessCondition>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailReason {
    /// Another renewal workflow holds the single-entry guard.
    Busy,
    /// The bundle JSON or its fields would not parse.
    Parse(BundleError),
    /// Anchor metadata write failed and the existing metadata does not
    /// already satisfy the update.
    AnchorMeta(SeError),
    /// Anchor data write failed.
    AnchorWrite(SeError),
    /// Anchor readback after the commit rest did not match what was
    /// written.
    AnchorReadback,
    /// Target metadata write failed and the existing metadata does not
    /// already reference the anchor.
    TargetMeta(SeError),
    /// The element rejected the manifest. The security-critical failure.
    ManifestRejected(ManifestDiag),
    /// Fragment installation failed; the slot holds either the previous
    /// certificate or nothing.
    Install(SeError),
    /// Operator abandoned the workflow before manifest verification.
    Aborted,
}

impl FailReason {
    /// The flat error kind reported to the operator surface.
    pub fn error_kind(self) -> CertMgrError {
        match self {
            FailReason::Busy => CertMgrError::Busy,
            FailReason::Parse(_) => CertMgrError::ParseFailure,
            FailReason::AnchorMeta(e)
            | FailReason::AnchorWrite(e)
            | FailReason::TargetMeta(e)
            | FailReason::Install(e) => e.into(),
            FailReason::AnchorReadback => CertMgrError::HardwareFault,
            FailReason::ManifestRejected(_) => CertMgrError::SignatureInvalid,
            FailReason::Aborted => CertMgrError::TransportFailure,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Parsing,
    WritingTrustAnchorMeta,
    WritingTrustAnchor,
    VerifyingManifest,
    WritingFragments,
    Complete,
    Failed(FailReason),
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    State(UpdateState),
    MetaWriteTolerated(SlotId),
    Fenced,
    Diag(ManifestDiag),
}

ringbuf!(Trace, 32, Trace::None);

/// Signalled when a bundle finishes installing; the operator task blocks
/// on this while the worker drives the element.
#[derive(Default)]
pub struct CompletionFlag {
    done: Mutex<bool>,
    cv: Condvar,
}

impl CompletionFlag {
    fn signal(&self) {
        let mut done = match self.done.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *done = true;
        self.cv.notify_all();
    }

    /// Wait for completion; true if it arrived before the timeout.
    pub fn wait_ms(&self, timeout_ms: u64) -> bool {
        let done = match self.done.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (done, _) = match self.cv.wait_timeout_while(
            done,
            std::time::Duration::from_millis(timeout_ms),
            |done| !*done,
        ) {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        *done
    }
}

/// Cancels a pending workflow. Only honoured before manifest
/// verification; from there the run is committed.
#[derive(Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

pub struct ProtectedUpdater<'a, B: SeBus> {
    seal: &'a Seal<B>,
    flags: &'a LifecycleFlags,
    delay: Arc<dyn Delay>,
    config: UpdateConfig,
    state: UpdateState,
    abort: Arc<AtomicBool>,
    completion: Arc<CompletionFlag>,
}

impl<'a, B: SeBus> ProtectedUpdater<'a, B> {
    pub fn new(
        seal: &'a Seal<B>,
        flags: &'a LifecycleFlags,
        delay: Arc<dyn Delay>,
        config: UpdateConfig,
    ) -> Self {
        ProtectedUpdater {
            seal,
            flags,
            delay,
            config,
            state: UpdateState::Idle,
            abort: Arc::new(AtomicBool::new(false)),
            completion: Arc::new(CompletionFlag::default()),
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: self.abort.clone(),
        }
    }

    pub fn completion(&self) -> Arc<CompletionFlag> {
        self.completion.clone()
    }

    /// Run one bundle end to end. On success the device certificate slot
    /// holds the new certificate and the next TLS session will try it (the
    /// force-factory flag is cleared). On any failure the previous
    /// certificate is preserved and the specific reason is recorded.
    pub fn apply(
        &mut self,
        workflow: &WorkflowLock,
        json: &[u8],
    ) -> Result<(), CertMgrError> {
        let Ok(_token) = workflow.begin(WorkflowKind::ProtectedUpdate)
        else {
            // Leave state alone: the holder's run is the interesting one.
            return Err(FailReason::Busy.error_kind());
        };
        self.abort.store(false, Ordering::Release);

        match self.run(json) {
            Ok(()) => {
                self.set_state(UpdateState::Complete);
                self.flags.clear_force_factory();
                self.completion.signal();
                Ok(())
            }
            Err(reason) => {
                self.set_state(UpdateState::Failed(reason));
                Err(reason.error_kind())
            }
        }
    }

    fn set_state(&mut self, state: UpdateState) {
        self.state = state;
        ringbuf_entry!(Trace::State(state));
    }

    fn check_abort(&self) -> Result<(), FailReason> {
        if self.abort.load(Ordering::Acquire) {
            Err(FailReason::Aborted)
        } else {
            Ok(())
        }
    }

    fn run(&mut self, json: &[u8]) -> Result<(), FailReason> {
        self.set_state(UpdateState::Parsing);
        let bundle = UpdateBundle::parse(json).map_err(FailReason::Parse)?;
        let anchor = bundle.anchor_slot().map_err(FailReason::Parse)?;
        let target = SlotId::DeviceCert;
        self.check_abort()?;

        // Steps 2..7 hold the element lock throughout: nothing else may
        // touch the element between anchor staging and manifest use.
        let mut guard = self.seal.lock();

        // Step 2: anchor slot metadata.
        self.set_state(UpdateState::WritingTrustAnchorMeta);
        let anchor_patch = MetadataPatch::default()
            .with_execute(AccessCondition::Always)
            .with_object_type(ObjectType::TrustAnchor);
        if let Err(e) = guard.write_metadata(anchor, &anchor_patch) {
            // On production parts the metadata is locked; that is fine
            // exactly when it already says what the update needs.
            if anchor_metadata_suffices(&mut guard, anchor) {
                ringbuf_entry!(Trace::MetaWriteTolerated(anchor));
            } else {
                return Err(FailReason::AnchorMeta(element_status(e)));
            }
        }
        self.check_abort()?;

        // Step 3: anchor data.
        self.set_state(UpdateState::WritingTrustAnchor);
        guard
            .write_data(anchor, &bundle.signing_cert, true)
            .map_err(|e| FailReason::AnchorWrite(element_status(e)))?;

        // Step 4: commit fence. Rest, then prove the write by readback.
        self.delay.sleep_ms(self.config.rest_ms);
        let readback = guard
            .read_data_vec(anchor)
            .map_err(|e| FailReason::AnchorWrite(element_status(e)))?;
        if readback != bundle.signing_cert {
            return Err(FailReason::AnchorReadback);
        }
        ringbuf_entry!(Trace::Fenced);
        self.check_abort()?;

        // Step 5: target slot metadata — integrity-protected change bound
        // to the anchor, version counter reset for the manifest contract.
        let target_patch = MetadataPatch::default()
            .with_change(AccessCondition::IntegrityProtected(
                anchor.object_id(),
            ))
            .with_version(0);
        if let Err(e) = guard.write_metadata(target, &target_patch) {
            if target_metadata_suffices(&mut guard, target, anchor) {
                ringbuf_entry!(Trace::MetaWriteTolerated(target));
            } else {
                return Err(FailReason::TargetMeta(element_status(e)));
            }
        }
        self.check_abort()?;

        // Step 6: manifest verification. Past this point the run cannot
        // be abandoned.
        self.set_state(UpdateState::VerifyingManifest);
        if let Err(e) = guard.protected_update_start(&bundle.manifest) {
            let diag = manifest_diag(&mut guard, anchor, element_status(e));
            ringbuf_entry!(Trace::Diag(diag));
            return Err(FailReason::ManifestRejected(diag));
        }

        // Step 7: payload, fragments concatenated in declared order.
        self.set_state(UpdateState::WritingFragments);
        guard
            .protected_update_final(&bundle.fragments)
            .map_err(|e| FailReason::Install(element_status(e)))?;

        Ok(())
    }
}

fn element_status(e: SealError) -> SeError {
    match e {
        SealError::Element(e) => e,
        SealError::Request(_) | SealError::BufferTooSmall => {
            SeError::Protocol
        }
    }
}

fn anchor_metadata_suffices<B: SeBus>(
    guard: &mut SealGuard<'_, B>,
    anchor: SlotId,
) -> bool {
    match guard.read_metadata(anchor) {
        Ok(md) => md.object_type == Some(ObjectType::TrustAnchor),
        Err(_) => false,
    }
}

fn target_metadata_suffices<B: SeBus>(
    guard: &mut SealGuard<'_, B>,
    target: SlotId,
    anchor: SlotId,
) -> bool {
    match guard.read_metadata(target) {
        Ok(md) => {
            md.change
                == AccessCondition::IntegrityProtected(anchor.object_id())
        }
        Err(_) => false,
    }
}

fn manifest_diag<B: SeBus>(
    guard: &mut SealGuard<'_, B>,
    anchor: SlotId,
    status: SeError,
) -> ManifestDiag {
    match guard.read_metadata(anchor) {
        Ok(md) => ManifestDiag {
            status,
            anchor_type: md.object_type,
            anchor_change: Some(md.change),
            anchor_execute: Some(md.execute),
        },
        Err(_) => ManifestDiag {
            status,
            anchor_type: None,
            anchor_change: None,
            anchor_execute: None,
        },
    }
}
