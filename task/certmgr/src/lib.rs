// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Certificate lifecycle manager.
//!
//! Owns which identity the device presents: on every TLS-session start it
//! selects between the operational device certificate and the factory
//! fallback, and it is the only writer of the TLS signer's slot binding.
//!
//! The selection is deliberately paranoid. A reset can strike between
//! device-key generation and the matching certificate write, leaving the
//! slot pair mismatched, so every boot starts in SAFE MODE: factory
//! credentials until a completed install proves the pair. Validation
//! failures on the device certificate always fall back to factory, never
//! fail the session.

mod config;

pub use config::CertMgrConfig;

use arrayvec::ArrayVec;
use drv_opaque_signer::{KeyId, SlotTable};
#[cfg(feature = "csr-renewal")]
use drv_secel_api::Curve;
use drv_secel_api::{SeBus, SealError, SlotId};
use drv_secel_server::Seal;
use lib_certstore::time::UtcTime;
use lib_certstore::{pem, strip_identity_header, x509};
use ringbuf::{ringbuf, ringbuf_entry};
use task_certmgr_api::{
    CertMgrError, CertSelection, CheckCertificateResponse, Command,
    LifecycleFlags, RenewalPolicy, SelectionReason, SyncCertificateResponse,
    UploadCertificateResponse,
};

#[cfg(feature = "csr-renewal")]
use workflow_lock::{WorkflowKind, WorkflowLock};

/// Lifecycle states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClsmState {
    Booted,
    SelectingCert,
    Active(CertSelection),
    Renewing,
    Installing,
}

/// One selection outcome.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub selection: CertSelection,
    pub reason: SelectionReason,
}

/// Display-only certificate summary, produced by the allocation-free
/// parser. Never feeds a trust decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertSummary {
    pub subject_cn: String,
    pub issuer_cn: String,
    pub not_before: UtcTime,
    pub not_after: UtcTime,
    pub serial: Vec<u8>,
}

/// What the platform has told us about certificate state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlatformSync {
    pub platform_has_certificate: Option<bool>,
    pub last_upload_ok: Option<bool>,
    pub last_sync_ok: Option<bool>,
}

/// An outbound certification request, ready for framing.
#[cfg(feature = "csr-renewal")]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsrMessage {
    pub uid_hex: String,
    pub pem: String,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Startup,
    Select(CertSelection),
    SelectReason(SelectionReason),
    Install,
    InstallFailed(CertMgrError),
    Installed,
    ParseRetry,
    CsrStart,
    CsrFailed(CertMgrError),
    CsrDone,
    PlatformAck,
    UnroutedCommand,
}

ringbuf!(Trace, 32, Trace::None);

const UID_MAX: usize = 27;

/// The device's hardware identity, read once at boot.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    uid: ArrayVec<u8, UID_MAX>,
    cn: String,
}

impl DeviceIdentity {
    fn new(uid: &[u8]) -> Self {
        use std::fmt::Write as _;
        let mut cn = String::with_capacity(uid.len() * 2);
        for b in uid {
            let _ = write!(cn, "{b:02x}");
        }
        let mut stored = ArrayVec::new();
        let _ = stored.try_extend_from_slice(&uid[..uid.len().min(UID_MAX)]);
        DeviceIdentity { uid: stored, cn }
    }

    pub fn uid(&self) -> &[u8] {
        &self.uid
    }

    /// The subject CN a device certificate must carry.
    pub fn expected_cn(&self) -> &str {
        &self.cn
    }
}

pub struct CertManager<'a, B: SeBus> {
    seal: &'a Seal<B>,
    table: &'a SlotTable,
    flags: &'a LifecycleFlags,
    config: CertMgrConfig,
    identity: DeviceIdentity,
    state: ClsmState,
    platform: PlatformSync,
    renewal_requested: bool,
}

impl<'a, B: SeBus> CertManager<'a, B> {
    /// Boot-time construction: read the factory UID and register the TLS
    /// identity handle, bound to the factory key until selection says
    /// otherwise.
    pub fn new(
        seal: &'a Seal<B>,
        table: &'a SlotTable,
        flags: &'a LifecycleFlags,
        config: CertMgrConfig,
    ) -> Result<Self, CertMgrError> {
        ringbuf_entry!(Trace::Startup);

        let mut uid = [0u8; UID_MAX];
        let n = {
            let mut guard = seal.lock();
            guard
                .read_data(SlotId::FactoryUid, &mut uid)
                .map_err(CertMgrError::from)?
        };
        let identity = DeviceIdentity::new(&uid[..n]);

        let key = KeyId(config.tls_key_id);
        // Tolerate a handle surviving a task restart.
        match table.allocate(key) {
            Ok(()) | Err(drv_opaque_signer::SignerError::Exists) => (),
            Err(_) => return Err(CertMgrError::HardwareFault),
        }
        table
            .generate_key(key, SlotId::FactoryKey)
            .map_err(|_| CertMgrError::HardwareFault)?;

        Ok(CertManager {
            seal,
            table,
            flags,
            config,
            identity,
            state: ClsmState::Booted,
            platform: PlatformSync::default(),
            renewal_requested: false,
        })
    }

    pub fn state(&self) -> ClsmState {
        self.state
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn platform_sync(&self) -> PlatformSync {
        self.platform
    }

    /// True when policy queued an in-band renewal; reading clears it.
    pub fn take_renewal_request(&mut self) -> bool {
        std::mem::take(&mut self.renewal_requested)
    }

    /// Emit the identity for the TLS session about to start, rebinding the
    /// signer's slot so the session's first signature uses it.
    pub fn select_for_session(&mut self, now: Option<UtcTime>) -> Selection {
        self.state = ClsmState::SelectingCert;

        let (selection, reason) = self.decide(now);
        ringbuf_entry!(Trace::Select(selection));
        ringbuf_entry!(Trace::SelectReason(reason));

        if selection == CertSelection::UseFactoryFallback {
            self.flags.set_fallback_observed();
            if self.config.renewal == RenewalPolicy::AutoOnFallback {
                self.renewal_requested = true;
            }
        }

        // Selection happens-before the session's first sign_hash; the
        // rebind is visible to the next signature.
        let _ = self
            .table
            .rebind(KeyId(self.config.tls_key_id), selection.key_slot());

        self.state = ClsmState::Active(selection);
        Selection { selection, reason }
    }

    fn decide(
        &self,
        now: Option<UtcTime>,
    ) -> (CertSelection, SelectionReason) {
        use CertSelection::*;
        use SelectionReason::*;

        if self.flags.force_factory() {
            return (UseFactorySafeMode, ForcedFactory);
        }

        let stored = {
            let mut guard = self.seal.lock();
            match guard.read_data_vec(SlotId::DeviceCert) {
                Ok(data) => data,
                Err(SealError::Element(e)) => {
                    return (UseFactoryFallback, ReadFailed(e))
                }
                Err(_) => return (UseFactoryFallback, ParseFailure),
            }
        };
        if stored.is_empty() {
            return (UseFactoryFallback, SlotEmpty);
        }

        let der = strip_identity_header(&stored);
        let cert = match self.parse_trusted(der) {
            Ok(cert) => cert,
            Err(_) => return (UseFactoryFallback, ParseFailure),
        };

        if cert.subject_cn != self.identity.cn {
            return (UseFactoryFallback, SubjectMismatch);
        }

        // No trusted time: fail closed, treat as not yet valid.
        let Some(now) = now else {
            return (UseFactoryFallback, NoTrustedTime);
        };
        if now < cert.not_before {
            return (UseFactoryFallback, NotYetValid);
        }
        if now > cert.not_after {
            return (UseFactoryFallback, Expired);
        }

        (UseDevice, DeviceValid)
    }

    /// Trust-path parse: one backoff retry when the parser cannot get
    /// memory. The allocation-free display parser is never consulted for
    /// decisions.
    fn parse_trusted(
        &self,
        der: &[u8],
    ) -> Result<x509::Certificate, CertMgrError> {
        match x509::parse_owned(der) {
            Err(x509::X509Error::AllocationFailed) => {
                ringbuf_entry!(Trace::ParseRetry);
                std::thread::sleep(std::time::Duration::from_millis(
                    self.config.parse_retry_ms,
                ));
                x509::parse_owned(der)
                    .map_err(|_| CertMgrError::ParseFailure)
            }
            Ok(cert) => Ok(cert),
            Err(_) => Err(CertMgrError::ParseFailure),
        }
    }

    /// Display-only summary of the stored device certificate, via the
    /// allocation-free parser.
    pub fn device_cert_summary(&self) -> Option<CertSummary> {
        let stored = {
            let mut guard = self.seal.lock();
            guard.read_data_vec(SlotId::DeviceCert).ok()?
        };
        if stored.is_empty() {
            return None;
        }
        let der = strip_identity_header(&stored);
        let view = x509::parse_minimal(der).ok()?;
        Some(CertSummary {
            subject_cn: view.subject_cn.to_string(),
            issuer_cn: view.issuer_cn.to_string(),
            not_before: view.not_before,
            not_after: view.not_after,
            serial: view.serial.to_vec(),
        })
    }

    /// Install a new device certificate: validate, write, verify the
    /// write, then leave SAFE MODE. All-or-nothing: any failure leaves
    /// state and flags untouched.
    pub fn install_device_cert(
        &mut self,
        payload: &[u8],
    ) -> Result<(), CertMgrError> {
        let prev = self.state;
        self.state = ClsmState::Installing;
        ringbuf_entry!(Trace::Install);

        match self.try_install(payload) {
            Ok(()) => {
                self.flags.clear_force_factory();
                self.flags.clear_fallback_observed();
                self.state = ClsmState::Active(CertSelection::UseDevice);
                ringbuf_entry!(Trace::Installed);
                Ok(())
            }
            Err(e) => {
                ringbuf_entry!(Trace::InstallFailed(e));
                self.state = prev;
                Err(e)
            }
        }
    }

    fn try_install(&mut self, payload: &[u8]) -> Result<(), CertMgrError> {
        // Raw DER is the wire form; PEM is tolerated.
        let der = if looks_like_pem(payload) {
            let text = core::str::from_utf8(payload)
                .map_err(|_| CertMgrError::ParseFailure)?;
            pem::pem_to_der(text).map_err(|_| CertMgrError::ParseFailure)?
        } else {
            payload.to_vec()
        };

        let cert = self.parse_trusted(&der)?;
        if cert.subject_cn != self.identity.cn {
            return Err(CertMgrError::ParseFailure);
        }

        let mut guard = self.seal.lock();
        guard
            .write_data(SlotId::DeviceCert, &der, true)
            .map_err(CertMgrError::from)?;

        // The element is the only durable store; believe nothing until it
        // reads back identical.
        let readback = guard
            .read_data_vec(SlotId::DeviceCert)
            .map_err(CertMgrError::from)?;
        if readback != der {
            return Err(CertMgrError::HardwareFault);
        }
        Ok(())
    }

    /// Handle a routed platform command.
    pub fn handle_command(
        &mut self,
        cmd: &Command,
    ) -> Result<(), CertMgrError> {
        match cmd {
            Command::InstallCertificate(payload) => {
                self.install_device_cert(payload)
            }
            Command::CheckCertificateResponse(json) => {
                let rsp: CheckCertificateResponse =
                    serde_json::from_slice(json)
                        .map_err(|_| CertMgrError::ParseFailure)?;
                self.platform.platform_has_certificate =
                    Some(rsp.has_certificate);
                ringbuf_entry!(Trace::PlatformAck);
                Ok(())
            }
            Command::UploadCertificateResponse(json) => {
                let rsp: UploadCertificateResponse =
                    serde_json::from_slice(json)
                        .map_err(|_| CertMgrError::ParseFailure)?;
                self.platform.last_upload_ok = Some(rsp.status == "success");
                ringbuf_entry!(Trace::PlatformAck);
                Ok(())
            }
            Command::SyncCertificateResponse(json) => {
                let rsp: SyncCertificateResponse =
                    serde_json::from_slice(json)
                        .map_err(|_| CertMgrError::ParseFailure)?;
                self.platform.last_sync_ok = Some(rsp.status == "success");
                if let Some(has) = rsp.has_certificate {
                    self.platform.platform_has_certificate = Some(has);
                }
                ringbuf_entry!(Trace::PlatformAck);
                Ok(())
            }
            Command::ProtectedUpdate(_) => {
                // Routed to the update workflow, not here.
                ringbuf_entry!(Trace::UnroutedCommand);
                Ok(())
            }
        }
    }
}

#[cfg(feature = "csr-renewal")]
impl<B: SeBus> CertManager<'_, B> {
    /// Generate a fresh device keypair and produce a signed certification
    /// request for it. Holds the single renewal slot and one element lock
    /// across the generate-then-sign pair.
    pub fn build_csr(
        &mut self,
        workflow: &WorkflowLock,
        subject: Option<&str>,
    ) -> Result<CsrMessage, CertMgrError> {
        let _token = workflow
            .begin(WorkflowKind::CsrRenewal)
            .map_err(|_| CertMgrError::Busy)?;

        let prev = self.state;
        self.state = ClsmState::Renewing;
        ringbuf_entry!(Trace::CsrStart);

        let result = self.build_csr_inner(subject);
        self.state = prev;
        match &result {
            Ok(_) => ringbuf_entry!(Trace::CsrDone),
            Err(e) => ringbuf_entry!(Trace::CsrFailed(*e)),
        }
        result
    }

    fn build_csr_inner(
        &mut self,
        subject: Option<&str>,
    ) -> Result<CsrMessage, CertMgrError> {
        let subject = match subject {
            Some(s) => lib_csr::Subject::parse(s)
                .map_err(|_| CertMgrError::ParseFailure)?,
            None => lib_csr::Subject::common_name(&self.identity.cn),
        };

        let mut cri_buf = [0u8; lib_csr::MAX_CSR_SIZE];
        let mut csr_buf = [0u8; lib_csr::MAX_CSR_SIZE];

        let (cri_len, raw_sig) = {
            let mut guard = self.seal.lock();

            // The key slot must accept a plain write before generation.
            let md = guard
                .read_metadata(SlotId::DeviceKey)
                .map_err(CertMgrError::from)?;
            if md.change != drv_secel_api::AccessCondition::Always {
                if md.lcso >= drv_secel_api::Lcso::Operational {
                    return Err(CertMgrError::SlotLcsLocked);
                }
                guard
                    .write_metadata(
                        SlotId::DeviceKey,
                        &drv_secel_api::MetadataPatch::default().with_change(
                            drv_secel_api::AccessCondition::Always,
                        ),
                    )
                    .map_err(CertMgrError::from)?;
            }

            let point = guard
                .generate_keypair(
                    SlotId::DeviceKey,
                    Curve::NistP256,
                    self.config.key_usage,
                    false,
                )
                .map_err(CertMgrError::from)?;

            let cri = lib_csr::encode_request_info(
                &subject,
                &point,
                &mut cri_buf,
            )
            .map_err(|_| CertMgrError::BufferTooSmall)?;
            let digest = lib_csr::request_digest(cri);
            let cri_len = cri.len();

            let raw_sig = guard
                .sign_hash(SlotId::DeviceKey, &digest)
                .map_err(CertMgrError::from)?;
            (cri_len, raw_sig)
        };

        let cri = &cri_buf[cri_buf.len() - cri_len..];
        let csr = lib_csr::assemble(cri, &raw_sig, &mut csr_buf)
            .map_err(|_| CertMgrError::BufferTooSmall)?;

        Ok(CsrMessage {
            uid_hex: self.identity.cn.clone(),
            pem: lib_csr::to_pem(csr),
        })
    }
}

fn looks_like_pem(payload: &[u8]) -> bool {
    payload
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|i| payload[i..].starts_with(b"-----BEGIN"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_mock_secel::certgen::{self, CertParams};
    use drv_mock_secel::{MockOptions, MockSecel};
    use drv_opaque_signer::{OpaqueSigner, SignAlg};
    use drv_secel_server::TestDelay;
    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::ecdsa::{Signature, SigningKey};
    use std::sync::Arc;

    const UID: &[u8] = &[0x01, 0x02, 0xab, 0xcd];
    const UID_HEX: &str = "0102abcd";

    struct Rig {
        mock: MockSecel,
        seal: Seal<MockSecel>,
        table: SlotTable,
        flags: LifecycleFlags,
    }

    impl Rig {
        fn new() -> Self {
            Self::with_mock(MockSecel::provisioned(UID))
        }

        fn with_mock(mock: MockSecel) -> Self {
            let seal = Seal::new(mock.clone(), Arc::new(TestDelay::new()));
            Rig {
                mock,
                seal,
                table: SlotTable::new(),
                flags: LifecycleFlags::new(),
            }
        }

        fn manager(&self) -> CertManager<'_, MockSecel> {
            CertManager::new(
                &self.seal,
                &self.table,
                &self.flags,
                CertMgrConfig::default(),
            )
            .unwrap()
        }
    }

    fn now() -> Option<UtcTime> {
        Some(UtcTime::new(2026, 8, 1, 12, 0, 0))
    }

    fn ca() -> SigningKey {
        SigningKey::from_bytes(p256::FieldBytes::from_slice(&[0x33u8; 32]))
            .unwrap()
    }

    fn device_cert(cn: &str, nb: UtcTime, na: UtcTime) -> Vec<u8> {
        let key = ca();
        certgen::generate(
            &CertParams {
                serial: &[0x07],
                issuer_cn: "platform-ca",
                subject_cn: cn,
                org: None,
                not_before: nb,
                not_after: na,
            },
            key.verifying_key(),
            &key,
        )
        .unwrap()
    }

    #[test]
    fn boot_without_device_cert_is_safe_mode() {
        // S1: reset with factory cert present, device slot empty.
        let rig = Rig::new();
        let mut mgr = rig.manager();

        let sel = mgr.select_for_session(now());
        assert_eq!(sel.selection, CertSelection::UseFactorySafeMode);
        assert_eq!(sel.reason, SelectionReason::ForcedFactory);
        assert_eq!(
            mgr.state(),
            ClsmState::Active(CertSelection::UseFactorySafeMode)
        );

        // The session's signature path uses the factory key.
        let signer = OpaqueSigner::new(&rig.seal, &rig.table);
        let digest = [9u8; 32];
        let raw = signer
            .sign_hash(KeyId(1), SignAlg::EcdsaSha256, &digest)
            .unwrap();
        let key = rig.mock.verifying_key(SlotId::FactoryKey).unwrap();
        key.verify_prehash(&digest, &Signature::from_slice(&raw).unwrap())
            .unwrap();
    }

    #[test]
    fn empty_slot_after_safe_mode_is_fallback() {
        let rig = Rig::new();
        let mut mgr = rig.manager();
        rig.flags.clear_force_factory();

        let sel = mgr.select_for_session(now());
        assert_eq!(sel.selection, CertSelection::UseFactoryFallback);
        assert_eq!(sel.reason, SelectionReason::SlotEmpty);
        assert!(rig.flags.fallback_observed());
    }

    #[test]
    fn force_factory_dominates_any_device_cert() {
        // Selection is monotone in the force-factory flag: whatever the
        // device slot holds, a set flag yields a factory selection.
        let contents: [Option<Vec<u8>>; 4] = [
            None,
            Some(b"garbage".to_vec()),
            Some(device_cert(
                UID_HEX,
                UtcTime::new(2025, 1, 1, 0, 0, 0),
                UtcTime::new(2030, 1, 1, 0, 0, 0),
            )),
            Some(device_cert(
                "someone-else",
                UtcTime::new(2025, 1, 1, 0, 0, 0),
                UtcTime::new(2030, 1, 1, 0, 0, 0),
            )),
        ];

        for content in contents {
            let rig = Rig::new();
            if let Some(data) = &content {
                rig.mock.set_slot_data(SlotId::DeviceCert, data);
            }
            let mut mgr = rig.manager();

            let sel = mgr.select_for_session(now());
            assert_eq!(sel.selection, CertSelection::UseFactorySafeMode);
            assert!(sel.selection.is_factory());
        }
    }

    #[test]
    fn valid_device_cert_selected_after_safe_mode_cleared() {
        let rig = Rig::new();
        rig.mock.set_slot_data(
            SlotId::DeviceCert,
            &device_cert(
                UID_HEX,
                UtcTime::new(2025, 1, 1, 0, 0, 0),
                UtcTime::new(2030, 1, 1, 0, 0, 0),
            ),
        );
        rig.flags.clear_force_factory();
        let mut mgr = rig.manager();

        let sel = mgr.select_for_session(now());
        assert_eq!(sel.selection, CertSelection::UseDevice);
        assert_eq!(sel.reason, SelectionReason::DeviceValid);
        assert!(!rig.flags.fallback_observed());
    }

    #[test]
    fn expired_device_cert_falls_back() {
        // S5: notAfter 2024, wall clock 2026.
        let rig = Rig::new();
        rig.mock.set_slot_data(
            SlotId::DeviceCert,
            &device_cert(
                UID_HEX,
                UtcTime::new(2022, 1, 1, 0, 0, 0),
                UtcTime::new(2024, 1, 1, 0, 0, 0),
            ),
        );
        rig.flags.clear_force_factory();
        let mut mgr = rig.manager();

        let sel = mgr.select_for_session(now());
        assert_eq!(sel.selection, CertSelection::UseFactoryFallback);
        assert_eq!(sel.reason, SelectionReason::Expired);
        assert!(rig.flags.fallback_observed());
    }

    #[test]
    fn missing_wall_clock_fails_closed() {
        // S6: no NTP.
        let rig = Rig::new();
        rig.mock.set_slot_data(
            SlotId::DeviceCert,
            &device_cert(
                UID_HEX,
                UtcTime::new(2025, 1, 1, 0, 0, 0),
                UtcTime::new(2030, 1, 1, 0, 0, 0),
            ),
        );
        rig.flags.clear_force_factory();
        let mut mgr = rig.manager();

        let sel = mgr.select_for_session(None);
        assert_eq!(sel.selection, CertSelection::UseFactoryFallback);
        assert_eq!(sel.reason, SelectionReason::NoTrustedTime);
    }

    #[test]
    fn subject_mismatch_falls_back() {
        let rig = Rig::new();
        rig.mock.set_slot_data(
            SlotId::DeviceCert,
            &device_cert(
                "not-this-device",
                UtcTime::new(2025, 1, 1, 0, 0, 0),
                UtcTime::new(2030, 1, 1, 0, 0, 0),
            ),
        );
        rig.flags.clear_force_factory();
        let mut mgr = rig.manager();

        let sel = mgr.select_for_session(now());
        assert_eq!(sel.reason, SelectionReason::SubjectMismatch);
    }

    #[test]
    fn install_clears_safe_mode_and_survives_readback() {
        let rig = Rig::new();
        let mut mgr = rig.manager();
        let der = device_cert(
            UID_HEX,
            UtcTime::new(2025, 1, 1, 0, 0, 0),
            UtcTime::new(2030, 1, 1, 0, 0, 0),
        );

        mgr.install_device_cert(&der).unwrap();
        assert!(!rig.flags.force_factory());
        assert!(!rig.flags.fallback_observed());
        assert_eq!(mgr.state(), ClsmState::Active(CertSelection::UseDevice));
        assert_eq!(rig.mock.slot_data(SlotId::DeviceCert), der);

        // A fresh session now selects the device identity.
        let sel = mgr.select_for_session(now());
        assert_eq!(sel.selection, CertSelection::UseDevice);
    }

    #[test]
    fn install_accepts_pem() {
        let rig = Rig::new();
        let mut mgr = rig.manager();
        let der = device_cert(
            UID_HEX,
            UtcTime::new(2025, 1, 1, 0, 0, 0),
            UtcTime::new(2030, 1, 1, 0, 0, 0),
        );
        let text = pem::der_to_pem(&der, pem::CERTIFICATE_LABEL);

        mgr.install_device_cert(text.as_bytes()).unwrap();
        assert_eq!(rig.mock.slot_data(SlotId::DeviceCert), der);
    }

    #[test]
    fn install_rejects_wrong_subject_and_restores_state() {
        let rig = Rig::new();
        let mut mgr = rig.manager();
        let before = mgr.state();
        let der = device_cert(
            "imposter",
            UtcTime::new(2025, 1, 1, 0, 0, 0),
            UtcTime::new(2030, 1, 1, 0, 0, 0),
        );

        assert_eq!(
            mgr.install_device_cert(&der).unwrap_err(),
            CertMgrError::ParseFailure
        );
        assert_eq!(mgr.state(), before);
        assert!(rig.flags.force_factory());
        assert!(rig.mock.slot_data(SlotId::DeviceCert).is_empty());
    }

    #[test]
    fn auto_renewal_policy_queues_request_on_fallback() {
        let rig = Rig::new();
        rig.flags.clear_force_factory();
        let mut mgr = CertManager::new(
            &rig.seal,
            &rig.table,
            &rig.flags,
            CertMgrConfig {
                renewal: RenewalPolicy::AutoOnFallback,
                ..CertMgrConfig::default()
            },
        )
        .unwrap();

        mgr.select_for_session(now());
        assert!(mgr.take_renewal_request());
        assert!(!mgr.take_renewal_request());
    }

    #[cfg(feature = "csr-renewal")]
    mod csr {
        use super::*;
        use lib_certstore::der::{
            ecdsa_tlv_to_raw, expect_tlv, TAG_BIT_STRING, TAG_SEQUENCE,
        };
        use workflow_lock::WorkflowKind;

        #[test]
        fn csr_round_trip_verifies_under_generated_key() {
            // S2: the produced PEM parses as PKCS#10 and its signature
            // verifies against the public point the element returned at
            // generation.
            let rig = Rig::new();
            let mut mgr = rig.manager();
            let workflow = WorkflowLock::new();

            let msg = mgr.build_csr(&workflow, None).unwrap();
            assert_eq!(msg.uid_hex, UID_HEX);
            assert_eq!(workflow.holder(), None);

            let der = pem::pem_to_der(&msg.pem).unwrap();
            let (body, _) = expect_tlv(&der, TAG_SEQUENCE).unwrap();

            // request info, signatureAlgorithm, signature BIT STRING.
            let (info, rest) = expect_tlv(body, TAG_SEQUENCE).unwrap();
            let info_len = body.len() - rest.len();
            let cri = &body[..info_len];
            let (_alg, rest) = expect_tlv(rest, TAG_SEQUENCE).unwrap();
            let (bits, _) = expect_tlv(rest, TAG_BIT_STRING).unwrap();

            // Subject CN inside the request info is the device identity.
            let (_version, after_version) =
                expect_tlv(info, lib_certstore::der::TAG_INTEGER).unwrap();
            let (_name, _) =
                expect_tlv(after_version, TAG_SEQUENCE).unwrap();

            let digest = lib_csr::request_digest(cri);
            let mut raw = [0u8; 64];
            ecdsa_tlv_to_raw(&bits[1..], &mut raw).unwrap();

            let key = rig.mock.verifying_key(SlotId::DeviceKey).unwrap();
            key.verify_prehash(
                &digest,
                &Signature::from_slice(&raw).unwrap(),
            )
            .unwrap();
        }

        #[test]
        fn csr_subject_override() {
            let rig = Rig::new();
            let mut mgr = rig.manager();
            let workflow = WorkflowLock::new();

            let msg = mgr
                .build_csr(&workflow, Some("CN=custom,O=lab"))
                .unwrap();
            let der = pem::pem_to_der(&msg.pem).unwrap();
            assert!(der
                .windows(6)
                .any(|w| w == b"custom"));
        }

        #[test]
        fn csr_busy_when_update_workflow_holds_lock() {
            let rig = Rig::new();
            let mut mgr = rig.manager();
            let workflow = WorkflowLock::new();
            let _held =
                workflow.begin(WorkflowKind::ProtectedUpdate).unwrap();

            assert_eq!(
                mgr.build_csr(&workflow, None).unwrap_err(),
                CertMgrError::Busy
            );
        }

        #[test]
        fn renewed_key_differs_from_previous() {
            let rig = Rig::new();
            let mut mgr = rig.manager();
            let workflow = WorkflowLock::new();

            mgr.build_csr(&workflow, None).unwrap();
            let first = rig.mock.verifying_key(SlotId::DeviceKey).unwrap();
            mgr.build_csr(&workflow, None).unwrap();
            let second = rig.mock.verifying_key(SlotId::DeviceKey).unwrap();
            assert_ne!(first, second);
        }
    }

    #[test]
    fn platform_acknowledgements_update_sync_state() {
        let rig = Rig::new();
        let mut mgr = rig.manager();

        mgr.handle_command(&Command::CheckCertificateResponse(
            br#"{"has_certificate": true}"#.to_vec(),
        ))
        .unwrap();
        assert_eq!(
            mgr.platform_sync().platform_has_certificate,
            Some(true)
        );

        mgr.handle_command(&Command::UploadCertificateResponse(
            br#"{"status": "success"}"#.to_vec(),
        ))
        .unwrap();
        assert_eq!(mgr.platform_sync().last_upload_ok, Some(true));

        mgr.handle_command(&Command::SyncCertificateResponse(
            br#"{"status": "error", "has_certificate": false}"#.to_vec(),
        ))
        .unwrap();
        assert_eq!(mgr.platform_sync().last_sync_ok, Some(false));
        assert_eq!(
            mgr.platform_sync().platform_has_certificate,
            Some(false)
        );

        assert_eq!(
            mgr.handle_command(&Command::CheckCertificateResponse(
                b"not json".to_vec(),
            ))
            .unwrap_err(),
            CertMgrError::ParseFailure
        );
    }

    #[test]
    fn display_summary_via_minimal_parser() {
        let rig = Rig::new();
        rig.mock.set_slot_data(
            SlotId::DeviceCert,
            &device_cert(
                UID_HEX,
                UtcTime::new(2025, 1, 1, 0, 0, 0),
                UtcTime::new(2030, 1, 1, 0, 0, 0),
            ),
        );
        let mgr = rig.manager();

        let summary = mgr.device_cert_summary().unwrap();
        assert_eq!(summary.subject_cn, UID_HEX);
        assert_eq!(summary.issuer_cn, "platform-ca");
        assert_eq!(summary.not_after, UtcTime::new(2030, 1, 1, 0, 0, 0));
    }

    #[test]
    fn identity_reads_uid_once() {
        let rig = Rig::new();
        let mgr = rig.manager();
        assert_eq!(mgr.identity().uid(), UID);
        assert_eq!(mgr.identity().expected_cn(), UID_HEX);
    }

    #[test]
    fn operational_device_with_lcso_locked_key() {
        // A production part: device key slot metadata frozen with change
        // access already Always still allows renewal.
        let mock = MockSecel::provisioned_with(
            UID,
            MockOptions {
                initial_lcso: drv_secel_api::Lcso::Operational,
                ..MockOptions::default()
            },
        );
        let rig = Rig::with_mock(mock);
        let mut mgr = rig.manager();

        #[cfg(feature = "csr-renewal")]
        {
            let workflow = workflow_lock::WorkflowLock::new();
            // change is Always on the device key even at operational, so
            // the access-condition step skips its metadata write.
            mgr.build_csr(&workflow, None).unwrap();
        }
        let _ = &mut mgr;
    }
}
