// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serialised synchronous access to the secure element.
//!
//! The element accepts a request and completes it later through a
//! completion callback. This layer owns the one-holder-at-a-time discipline
//! and the blocking bridge: acquire the element mutex, submit, poll the
//! request's completion cell on a coarse timer (yielding between polls,
//! never spinning), and hand back the terminal status. Nothing here
//! retries; a timeout abandons the wait without cancelling the hardware
//! operation, and the next holder drains the leftover completion before
//! submitting its own.
//!
//! Operations live on [`SealGuard`], so holding the lock across a compound
//! sequence (keypair-then-sign, the protected-update steps) is the natural
//! shape rather than a calling convention.

use drv_secel_api::{
    BusRequest, Completion, Curve, KeyUsage, MetadataPatch, RawStatus,
    ReplyCell, SeBus, SeCommand, SeError, SealIoStats, SlotId, SlotMetadata,
    DIGEST_SIZE, MAX_REQUEST_SIZE, PUBLIC_POINT_SIZE, RAW_SIGNATURE_SIZE,
};
pub use drv_secel_api::SealError;
use lib_certstore::der;
use ringbuf::{ringbuf, ringbuf_entry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Instant;

/// Polling granularity. The contract allows up to 100 ms; anything coarser
/// trades latency for nothing.
pub const POLL_INTERVAL_MS: u64 = 50;

/// Default operation deadline.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Metadata reads and writes get longer: they ride the element's NVM
/// housekeeping path.
pub const METADATA_TIMEOUT_MS: u64 = 10_000;

/// Scheduler seam: how the polling loop waits and tells time. Production
/// wires the RTOS tick; tests substitute virtual time.
pub trait Delay: Send + Sync {
    fn sleep_ms(&self, ms: u64);
    fn now_ms(&self) -> u64;
}

/// Host-side delay over the OS clock.
pub struct StdDelay {
    epoch: Instant,
}

impl StdDelay {
    pub fn new() -> Self {
        StdDelay {
            epoch: Instant::now(),
        }
    }
}

impl Default for StdDelay {
    fn default() -> Self {
        Self::new()
    }
}

impl Delay for StdDelay {
    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Submit(SlotId),
    SubmitBare,
    Rejected(RawStatus),
    Done(RawStatus),
    Timeout,
    StaleDrained(RawStatus),
}

ringbuf!(Trace, 32, Trace::None);

struct Inner {
    /// Completion cell abandoned by a timed-out caller; the hardware
    /// operation behind it may still be running.
    pending: Option<Arc<ReplyCell>>,
    tx: Box<[u8; MAX_REQUEST_SIZE]>,
}

/// The access layer. One per element.
pub struct Seal<B: SeBus> {
    bus: B,
    owner: Mutex<Inner>,
    delay: Arc<dyn Delay>,
    stats: Mutex<SealIoStats>,
}

impl<B: SeBus> Seal<B> {
    pub fn new(bus: B, delay: Arc<dyn Delay>) -> Self {
        Seal {
            bus,
            owner: Mutex::new(Inner {
                pending: None,
                tx: Box::new([0u8; MAX_REQUEST_SIZE]),
            }),
            delay,
            stats: Mutex::new(SealIoStats::default()),
        }
    }

    /// Acquire exclusive element access, waiting without bound.
    pub fn lock(&self) -> SealGuard<'_, B> {
        let inner = match self.owner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        SealGuard { seal: self, inner }
    }

    /// Fail-fast acquisition for callers with their own deadline.
    pub fn try_lock(&self) -> Result<SealGuard<'_, B>, SeError> {
        match self.owner.try_lock() {
            Ok(inner) => Ok(SealGuard { seal: self, inner }),
            Err(TryLockError::WouldBlock) => Err(SeError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => Ok(SealGuard {
                seal: self,
                inner: poisoned.into_inner(),
            }),
        }
    }

    pub fn io_stats(&self) -> SealIoStats {
        match self.stats.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn stat(&self, f: impl FnOnce(&mut SealIoStats)) {
        let mut g = match self.stats.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut g);
    }
}

/// Exclusive element access. Every operation on the guard is one complete
/// bus transaction; the element stays locked until the guard drops.
pub struct SealGuard<'a, B: SeBus> {
    seal: &'a Seal<B>,
    inner: MutexGuard<'a, Inner>,
}

impl<B: SeBus> SealGuard<'_, B> {
    /// Read slot data into `out`, returning the byte count.
    pub fn read_data(
        &mut self,
        slot: SlotId,
        out: &mut [u8],
    ) -> Result<usize, SealError> {
        let cmd = SeCommand::read_data(slot)?;
        let payload =
            self.execute(Some(slot), cmd, &[], DEFAULT_TIMEOUT_MS)?;
        if payload.len() > out.len() {
            return Err(SealError::BufferTooSmall);
        }
        out[..payload.len()].copy_from_slice(&payload);
        Ok(payload.len())
    }

    /// Read slot data into an owned buffer.
    pub fn read_data_vec(
        &mut self,
        slot: SlotId,
    ) -> Result<Vec<u8>, SealError> {
        let cmd = SeCommand::read_data(slot)?;
        self.execute(Some(slot), cmd, &[], DEFAULT_TIMEOUT_MS)
    }

    /// Write slot data. `erase` replaces the object's contents; otherwise
    /// the write lands over the existing prefix.
    pub fn write_data(
        &mut self,
        slot: SlotId,
        data: &[u8],
        erase: bool,
    ) -> Result<(), SealError> {
        let cmd = SeCommand::write_data(slot, data.len(), erase)?;
        self.execute(Some(slot), cmd, data, DEFAULT_TIMEOUT_MS)?;
        Ok(())
    }

    pub fn read_metadata(
        &mut self,
        slot: SlotId,
    ) -> Result<SlotMetadata, SealError> {
        let cmd = SeCommand::read_metadata(slot)?;
        let payload =
            self.execute(Some(slot), cmd, &[], METADATA_TIMEOUT_MS)?;
        SlotMetadata::decode(&payload)
            .map_err(|_| SealError::Element(SeError::Protocol))
    }

    pub fn write_metadata(
        &mut self,
        slot: SlotId,
        patch: &MetadataPatch,
    ) -> Result<(), SealError> {
        let cmd = SeCommand::write_metadata(slot)?;
        let mut tlv = [0u8; 64];
        let n = patch
            .encode(&mut tlv)
            .map_err(|_| SealError::Element(SeError::Protocol))?;
        self.execute(Some(slot), cmd, &tlv[..n], METADATA_TIMEOUT_MS)?;
        Ok(())
    }

    /// Generate a fresh keypair in a key slot. The private half never
    /// leaves the element; the public point is returned here and, when
    /// `export_public` is set, additionally persisted by the element.
    pub fn generate_keypair(
        &mut self,
        slot: SlotId,
        curve: Curve,
        usage: KeyUsage,
        export_public: bool,
    ) -> Result<[u8; PUBLIC_POINT_SIZE], SealError> {
        let cmd =
            SeCommand::generate_keypair(slot, curve, usage, export_public)?;
        let payload =
            self.execute(Some(slot), cmd, &[], DEFAULT_TIMEOUT_MS)?;

        let point: [u8; PUBLIC_POINT_SIZE] = payload
            .as_slice()
            .try_into()
            .map_err(|_| SealError::Element(SeError::Protocol))?;
        if point[0] != 0x04 {
            return Err(SealError::Element(SeError::Protocol));
        }
        Ok(point)
    }

    /// Sign a 32-byte digest with a slot key, normalising the element's
    /// TLV-wrapped signature to fixed-width `r || s`.
    pub fn sign_hash(
        &mut self,
        slot: SlotId,
        digest: &[u8; DIGEST_SIZE],
    ) -> Result<[u8; RAW_SIGNATURE_SIZE], SealError> {
        let cmd = SeCommand::sign_hash(slot, digest.len())?;
        let payload =
            self.execute(Some(slot), cmd, digest, DEFAULT_TIMEOUT_MS)?;

        let mut raw = [0u8; RAW_SIGNATURE_SIZE];
        der::ecdsa_tlv_to_raw(&payload, &mut raw)
            .map_err(|_| SealError::Element(SeError::Protocol))?;
        Ok(raw)
    }

    /// Hand the element a signed update manifest for verification against
    /// the staged trust anchor.
    pub fn protected_update_start(
        &mut self,
        manifest: &[u8],
    ) -> Result<(), SealError> {
        self.execute(
            None,
            SeCommand::ProtectedUpdateStart,
            manifest,
            DEFAULT_TIMEOUT_MS,
        )?;
        Ok(())
    }

    /// Deliver the update payload fragments, concatenated in order.
    pub fn protected_update_final(
        &mut self,
        fragments: &[u8],
    ) -> Result<(), SealError> {
        self.execute(
            None,
            SeCommand::ProtectedUpdateFinal,
            fragments,
            DEFAULT_TIMEOUT_MS,
        )?;
        Ok(())
    }

    pub fn read_counter(&mut self, slot: SlotId) -> Result<u32, SealError> {
        let cmd = SeCommand::read_counter(slot)?;
        let payload =
            self.execute(Some(slot), cmd, &[], DEFAULT_TIMEOUT_MS)?;
        let bytes: [u8; 4] = payload
            .as_slice()
            .try_into()
            .map_err(|_| SealError::Element(SeError::Protocol))?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn increment_counter(
        &mut self,
        slot: SlotId,
        by: u32,
    ) -> Result<(), SealError> {
        let cmd = SeCommand::increment_counter(slot, by)?;
        self.execute(Some(slot), cmd, &[], DEFAULT_TIMEOUT_MS)?;
        Ok(())
    }

    /// One full transaction: drain any stale completion, pack, submit,
    /// poll to terminal status, collect the payload.
    fn execute(
        &mut self,
        slot: Option<SlotId>,
        cmd: SeCommand,
        blob: &[u8],
        timeout_ms: u64,
    ) -> Result<Vec<u8>, SealError> {
        let deadline = self.seal.delay.now_ms() + timeout_ms;
        self.drain_stale(deadline)?;

        let n = BusRequest::pack(&cmd, blob, &mut self.inner.tx)
            .map_err(|_| SealError::Element(SeError::Protocol))?;

        match slot {
            Some(slot) => ringbuf_entry!(Trace::Submit(slot)),
            None => ringbuf_entry!(Trace::SubmitBare),
        }
        self.seal.stat(|s| s.submitted = s.submitted.wrapping_add(1));

        let cell = ReplyCell::new();
        let accepted = self
            .seal
            .bus
            .submit(&self.inner.tx[..n], Completion::new(cell.clone()));
        if accepted != RawStatus::Ok {
            ringbuf_entry!(Trace::Rejected(accepted));
            self.seal.stat(|s| s.rejected = s.rejected.wrapping_add(1));
            return match accepted.into_result() {
                Err(e) => Err(SealError::Element(e)),
                // An "accepted" status other than Ok mapping to Ok cannot
                // happen; treat it as a transport fault if it does.
                Ok(()) => Err(SealError::Element(SeError::HardwareFault)),
            };
        }

        match self.poll(&cell, deadline) {
            Some(status) => {
                ringbuf_entry!(Trace::Done(status));
                self.seal.stat(|s| {
                    s.completed = s.completed.wrapping_add(1)
                });
                status.into_result().map_err(SealError::Element)?;
                Ok(cell.take_payload().unwrap_or_default())
            }
            None => {
                // Abandon the wait; the hardware operation runs on. Park
                // the cell so the next transaction serialises behind it.
                ringbuf_entry!(Trace::Timeout);
                self.seal.stat(|s| {
                    s.timeouts = s.timeouts.wrapping_add(1)
                });
                self.inner.pending = Some(cell);
                Err(SealError::Element(SeError::Timeout))
            }
        }
    }

    /// Wait out a completion left behind by a timed-out predecessor.
    fn drain_stale(&mut self, deadline: u64) -> Result<(), SealError> {
        let Some(cell) = self.inner.pending.take() else {
            return Ok(());
        };

        match self.poll(&cell, deadline) {
            Some(status) => {
                ringbuf_entry!(Trace::StaleDrained(status));
                self.seal.stat(|s| {
                    s.stale_drained = s.stale_drained.wrapping_add(1)
                });
                // The abandoned operation's outcome is nobody's to report;
                // dropping the cell discards it.
                Ok(())
            }
            None => {
                // Still running; put it back and give up our slot.
                self.inner.pending = Some(cell);
                self.seal.stat(|s| {
                    s.timeouts = s.timeouts.wrapping_add(1)
                });
                Err(SealError::Element(SeError::Timeout))
            }
        }
    }

    /// Poll a completion cell until terminal status or `deadline`,
    /// yielding between polls.
    fn poll(&self, cell: &ReplyCell, deadline: u64) -> Option<RawStatus> {
        loop {
            if cell.is_terminal() {
                return Some(cell.status());
            }
            let now = self.seal.delay.now_ms();
            if now >= deadline {
                return None;
            }
            let wait = POLL_INTERVAL_MS.min(deadline - now);
            self.seal.delay.sleep_ms(wait);
        }
    }
}

/// Virtual-time delay for tests: sleeping advances the clock and nothing
/// else. Shared so a test's bus thread can watch the same clock.
pub struct TestDelay {
    now: AtomicU64,
}

impl TestDelay {
    pub fn new() -> Self {
        TestDelay {
            now: AtomicU64::new(0),
        }
    }
}

impl Default for TestDelay {
    fn default() -> Self {
        Self::new()
    }
}

impl Delay for TestDelay {
    fn sleep_ms(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_secel_api::RequestBuildError;
    use std::sync::atomic::{AtomicI32, AtomicU32};
    use std::sync::Mutex as StdMutex;

    /// Scripted bus: answers every request with a fixed status/payload,
    /// optionally withholding the completion for the caller to fire later.
    struct FakeBus {
        status: RawStatus,
        payload: Vec<u8>,
        accept: RawStatus,
        withheld: StdMutex<Vec<Completion>>,
        withhold: bool,
        // Overlap detector: >1 means two requests were in flight at once.
        in_flight: AtomicI32,
        max_in_flight: AtomicI32,
        submissions: AtomicU32,
    }

    impl FakeBus {
        fn ok_with(payload: Vec<u8>) -> Self {
            FakeBus {
                status: RawStatus::Ok,
                payload,
                accept: RawStatus::Ok,
                withheld: StdMutex::new(Vec::new()),
                withhold: false,
                in_flight: AtomicI32::new(0),
                max_in_flight: AtomicI32::new(0),
                submissions: AtomicU32::new(0),
            }
        }

        fn withholding() -> Self {
            FakeBus {
                withhold: true,
                ..FakeBus::ok_with(Vec::new())
            }
        }

        fn release_all(&self, status: RawStatus) {
            for done in self.withheld.lock().unwrap().drain(..) {
                done.finish(status, &[]);
            }
        }
    }

    impl SeBus for FakeBus {
        fn submit(&self, frame: &[u8], done: Completion) -> RawStatus {
            // Every frame must parse; SEAL built it.
            BusRequest::unpack(frame).expect("well-formed frame");
            self.submissions.fetch_add(1, Ordering::SeqCst);

            if self.accept != RawStatus::Ok {
                return self.accept;
            }

            let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(n, Ordering::SeqCst);

            if self.withhold {
                self.withheld.lock().unwrap().push(done);
            } else {
                done.finish(self.status, &self.payload);
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            RawStatus::Ok
        }
    }

    fn seal_with(bus: FakeBus) -> Seal<FakeBus> {
        Seal::new(bus, Arc::new(TestDelay::new()))
    }

    #[test]
    fn read_round_trip() {
        let seal = seal_with(FakeBus::ok_with(vec![1, 2, 3]));
        let mut guard = seal.lock();

        let mut out = [0u8; 8];
        let n = guard.read_data(SlotId::FactoryUid, &mut out).unwrap();
        assert_eq!(&out[..n], &[1, 2, 3]);

        let stats = seal.io_stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn small_buffer_reported() {
        let seal = seal_with(FakeBus::ok_with(vec![0; 16]));
        let mut guard = seal.lock();
        let mut out = [0u8; 4];
        assert_eq!(
            guard.read_data(SlotId::FactoryCert, &mut out).unwrap_err(),
            SealError::BufferTooSmall
        );
    }

    #[test]
    fn request_build_errors_never_reach_the_bus() {
        let seal = seal_with(FakeBus::ok_with(Vec::new()));
        let mut guard = seal.lock();
        let mut out = [0u8; 4];

        assert_eq!(
            guard.read_data(SlotId::DeviceKey, &mut out).unwrap_err(),
            SealError::Request(RequestBuildError::NotReadable)
        );
        drop(guard);
        assert_eq!(seal.io_stats().submitted, 0);
    }

    #[test]
    fn rejection_at_submit() {
        let bus = FakeBus {
            accept: RawStatus::Busy,
            ..FakeBus::ok_with(Vec::new())
        };
        let seal = seal_with(bus);
        let mut guard = seal.lock();

        assert_eq!(
            guard.read_data(SlotId::FactoryCert, &mut [0; 4]).unwrap_err(),
            SealError::Element(SeError::Busy)
        );
        drop(guard);
        assert_eq!(seal.io_stats().rejected, 1);
    }

    #[test]
    fn timeout_abandons_then_next_caller_drains() {
        let seal = seal_with(FakeBus::withholding());

        {
            let mut guard = seal.lock();
            assert_eq!(
                guard
                    .read_data(SlotId::FactoryCert, &mut [0; 4])
                    .unwrap_err(),
                SealError::Element(SeError::Timeout)
            );
        }
        assert_eq!(seal.io_stats().timeouts, 1);

        // The hardware finishes late; the next transaction drains the
        // stale completion before submitting its own (which the scripted
        // bus withholds again, so it times out in virtual time).
        seal.bus.release_all(RawStatus::Ok);
        {
            let mut guard = seal.lock();
            let _ = guard.read_data(SlotId::FactoryCert, &mut [0; 4]);
        }
        assert_eq!(seal.io_stats().stale_drained, 1);
    }

    #[test]
    fn sign_normalises_tlv() {
        // Element emits r=1, s=0x80.. with a pad byte.
        let payload = vec![
            0x02, 0x01, 0x01, 0x02, 0x02, 0x00, 0x80,
        ];
        let seal = seal_with(FakeBus::ok_with(payload));
        let mut guard = seal.lock();

        let sig = guard.sign_hash(SlotId::FactoryKey, &[0u8; 32]).unwrap();
        assert_eq!(sig[31], 0x01);
        assert_eq!(sig[63], 0x80);
        assert_eq!(&sig[32..63], &[0u8; 31]);
    }

    #[test]
    fn generate_keypair_checks_point_shape() {
        let mut point = vec![0u8; 65];
        point[0] = 0x04;
        let seal = seal_with(FakeBus::ok_with(point));
        let mut guard = seal.lock();

        let out = guard
            .generate_keypair(
                SlotId::DeviceKey,
                Curve::NistP256,
                KeyUsage::SIGN | KeyUsage::AUTH,
                false,
            )
            .unwrap();
        assert_eq!(out[0], 0x04);

        // Wrong shape is a protocol error.
        let seal = seal_with(FakeBus::ok_with(vec![0x04; 33]));
        let mut guard = seal.lock();
        assert_eq!(
            guard
                .generate_keypair(
                    SlotId::DeviceKey,
                    Curve::NistP256,
                    KeyUsage::SIGN,
                    false,
                )
                .unwrap_err(),
            SealError::Element(SeError::Protocol)
        );
    }

    #[test]
    fn element_error_statuses_propagate() {
        let bus = FakeBus {
            status: RawStatus::AccessDenied,
            ..FakeBus::ok_with(Vec::new())
        };
        let seal = seal_with(bus);
        let mut guard = seal.lock();

        assert_eq!(
            guard
                .write_data(SlotId::UserSmall0, &[1], true)
                .unwrap_err(),
            SealError::Element(SeError::AccessDenied)
        );
    }

    #[test]
    fn hardware_facing_calls_are_totally_ordered() {
        let seal = Arc::new(Seal::new(
            FakeBus::ok_with(vec![0u8; 4]),
            Arc::new(StdDelay::new()),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let seal = seal.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let mut guard = seal.lock();
                    let mut out = [0u8; 8];
                    guard.read_data(SlotId::FactoryUid, &mut out).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(seal.bus.submissions.load(Ordering::SeqCst), 400);
        assert_eq!(seal.bus.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn try_lock_fails_fast_under_contention() {
        let seal = seal_with(FakeBus::ok_with(Vec::new()));
        let _guard = seal.lock();
        assert_eq!(seal.try_lock().err(), Some(SeError::Busy));
    }
}
