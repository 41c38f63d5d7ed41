// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the certificate manager, the update workflow, and
//! the MQTT framing task.

use drv_secel_api::{RequestBuildError, SeError, SealError, SlotId};
use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Which identity the next TLS session presents.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub enum CertSelection {
    /// The operational device certificate and its slot key.
    UseDevice,
    /// Factory credentials, because this is the first selection since
    /// reset and the device pair is not yet proven.
    UseFactorySafeMode,
    /// Factory credentials, because the device certificate was tried and
    /// failed validation.
    UseFactoryFallback,
}

impl CertSelection {
    pub fn cert_slot(self) -> SlotId {
        match self {
            CertSelection::UseDevice => SlotId::DeviceCert,
            _ => SlotId::FactoryCert,
        }
    }

    pub fn key_slot(self) -> SlotId {
        match self {
            CertSelection::UseDevice => SlotId::DeviceKey,
            _ => SlotId::FactoryKey,
        }
    }

    pub fn is_factory(self) -> bool {
        !matches!(self, CertSelection::UseDevice)
    }
}

/// Why a selection came out the way it did.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub enum SelectionReason {
    /// The force-factory flag was set (every reset sets it).
    ForcedFactory,
    /// The device certificate passed every check.
    DeviceValid,
    /// The device certificate slot is empty.
    SlotEmpty,
    /// The device certificate would not parse.
    ParseFailure,
    /// Subject CN does not match the device identity.
    SubjectMismatch,
    /// Wall clock is past notAfter.
    Expired,
    /// Wall clock is before notBefore.
    NotYetValid,
    /// No trusted wall-clock time; expiry checks fail closed.
    NoTrustedTime,
    /// The element would not hand over the certificate.
    ReadFailed(SeError),
}

/// Renewal trigger policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum RenewalPolicy {
    /// Renewal only happens when the operator asks.
    #[default]
    OperatorInitiated,
    /// Falling back to factory credentials queues a certification request
    /// immediately.
    AutoOnFallback,
}

/// Task-level error kinds, one flat namespace across the certificate
/// machinery.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub enum CertMgrError {
    TransportFailure,
    ParseFailure,
    SignatureInvalid,
    SlotAccessDenied,
    SlotReserved,
    SlotLcsLocked,
    BufferTooSmall,
    Timeout,
    HardwareFault,
    CertificateExpired,
    CertificateNotYetValid,
    NoTrustedTime,
    /// Another renewal workflow holds the single-entry guard.
    Busy,
}

impl From<SeError> for CertMgrError {
    fn from(e: SeError) -> Self {
        match e {
            SeError::Busy => CertMgrError::TransportFailure,
            SeError::AccessDenied => CertMgrError::SlotAccessDenied,
            SeError::InvalidSlot => CertMgrError::SlotAccessDenied,
            SeError::InvalidData => CertMgrError::ParseFailure,
            SeError::MetadataMismatch => CertMgrError::SlotAccessDenied,
            SeError::SignatureInvalid => CertMgrError::SignatureInvalid,
            SeError::LcsLocked => CertMgrError::SlotLcsLocked,
            SeError::Timeout => CertMgrError::Timeout,
            SeError::HardwareFault => CertMgrError::HardwareFault,
            SeError::Protocol => CertMgrError::TransportFailure,
        }
    }
}

impl From<RequestBuildError> for CertMgrError {
    fn from(e: RequestBuildError) -> Self {
        match e {
            RequestBuildError::ReservedSlot => CertMgrError::SlotReserved,
            RequestBuildError::TooLarge => CertMgrError::BufferTooSmall,
            RequestBuildError::BadDigestLength => CertMgrError::ParseFailure,
            RequestBuildError::NotWritable
            | RequestBuildError::NotReadable
            | RequestBuildError::NotAKeySlot
            | RequestBuildError::NotACounter => {
                CertMgrError::SlotAccessDenied
            }
        }
    }
}

impl From<SealError> for CertMgrError {
    fn from(e: SealError) -> Self {
        match e {
            SealError::Request(e) => e.into(),
            SealError::Element(e) => e.into(),
            SealError::BufferTooSmall => CertMgrError::BufferTooSmall,
        }
    }
}

/// Commands the framing task routes inward. Payloads are owned: the MQTT
/// library's receive buffer is dead the moment the subscribe callback
/// returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// A protected-update bundle (JSON body).
    ProtectedUpdate(Vec<u8>),
    /// A new device certificate, DER (PEM tolerated).
    InstallCertificate(Vec<u8>),
    /// Platform answer to a presence check (JSON).
    CheckCertificateResponse(Vec<u8>),
    /// Platform acknowledgement of an upload (JSON).
    UploadCertificateResponse(Vec<u8>),
    /// Unified sync acknowledgement (JSON).
    SyncCertificateResponse(Vec<u8>),
}

/// Platform answer to `commands/check_certificate`.
#[derive(Copy, Clone, Debug, Deserialize)]
pub struct CheckCertificateResponse {
    pub has_certificate: bool,
}

/// Platform acknowledgement of a certificate upload.
#[derive(Clone, Debug, Deserialize)]
pub struct UploadCertificateResponse {
    pub status: String,
}

/// Unified sync acknowledgement.
#[derive(Clone, Debug, Deserialize)]
pub struct SyncCertificateResponse {
    pub status: String,
    #[serde(default)]
    pub has_certificate: Option<bool>,
}

/// Volatile lifecycle flags, shared between the certificate manager (owner
/// of selection) and the update workflow (which clears force-factory on a
/// completed install).
///
/// Reset state is force-factory set: SAFE MODE until an install proves the
/// device pair.
#[derive(Debug)]
pub struct LifecycleFlags {
    force_factory: AtomicBool,
    fallback_observed: AtomicBool,
}

impl LifecycleFlags {
    pub const fn new() -> Self {
        LifecycleFlags {
            force_factory: AtomicBool::new(true),
            fallback_observed: AtomicBool::new(false),
        }
    }

    pub fn force_factory(&self) -> bool {
        self.force_factory.load(Ordering::Acquire)
    }

    pub fn set_force_factory(&self) {
        self.force_factory.store(true, Ordering::Release);
    }

    pub fn clear_force_factory(&self) {
        self.force_factory.store(false, Ordering::Release);
    }

    pub fn fallback_observed(&self) -> bool {
        self.fallback_observed.load(Ordering::Acquire)
    }

    pub fn set_fallback_observed(&self) {
        self.fallback_observed.store(true, Ordering::Release);
    }

    pub fn clear_fallback_observed(&self) {
        self.fallback_observed.store(false, Ordering::Release);
    }
}

impl Default for LifecycleFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_slot_mapping() {
        assert_eq!(CertSelection::UseDevice.key_slot(), SlotId::DeviceKey);
        assert_eq!(
            CertSelection::UseFactorySafeMode.key_slot(),
            SlotId::FactoryKey
        );
        assert_eq!(
            CertSelection::UseFactoryFallback.cert_slot(),
            SlotId::FactoryCert
        );
        assert!(CertSelection::UseFactorySafeMode.is_factory());
        assert!(!CertSelection::UseDevice.is_factory());
    }

    #[test]
    fn flags_reset_state() {
        let flags = LifecycleFlags::new();
        assert!(flags.force_factory());
        assert!(!flags.fallback_observed());

        flags.clear_force_factory();
        flags.set_fallback_observed();
        assert!(!flags.force_factory());
        assert!(flags.fallback_observed());
    }

    #[test]
    fn seal_error_mapping() {
        assert_eq!(
            CertMgrError::from(SealError::Element(SeError::LcsLocked)),
            CertMgrError::SlotLcsLocked
        );
        assert_eq!(
            CertMgrError::from(SealError::Request(
                RequestBuildError::ReservedSlot
            )),
            CertMgrError::SlotReserved
        );
        assert_eq!(
            CertMgrError::from(SealError::BufferTooSmall),
            CertMgrError::BufferTooSmall
        );
    }
}
