// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the secure element bus.
//!
//! The element is an external co-processor holding keys and certificates in
//! addressable slots. Commands travel to it as framed messages: a hubpack
//! header and body, an optional binary blob, and a CRC trailer. The element
//! answers asynchronously; the [`SeBus`] submission contract below turns the
//! "accepted now, finished later" hardware shape into a per-request
//! completion cell that the access layer polls.

mod error;
mod metadata;
mod slots;

pub use error::{RawStatus, RequestBuildError, SeError, SealError};
pub use metadata::{
    AccessCondition, Lcso, MetadataError, MetadataPatch, ObjectType,
    SlotMetadata,
};
pub use slots::{ObjectId, SlotCategory, SlotId, SlotInfo};

use crc::{Crc, CRC_16_XMODEM};
use hubpack::SerializedSize;
use num_traits::FromPrimitive;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use static_assertions::const_assert;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
pub const CRC_SIZE: usize = <u16 as SerializedSize>::MAX_SIZE;

/// Largest blob carried in one frame: a full certificate slot plus the
/// vendor identity header the element prepends on reads.
pub const MAX_BLOB_SIZE: usize = 1792;
const_assert!(MAX_BLOB_SIZE >= slots::DEVICE_CERT_MAX_SIZE as usize + 9);

pub const MAX_REQUEST_SIZE: usize =
    Header::MAX_SIZE + SeCommand::MAX_SIZE + MAX_BLOB_SIZE + CRC_SIZE;

pub const DIGEST_SIZE: usize = 32;
pub const RAW_SIGNATURE_SIZE: usize = 64;
pub const PUBLIC_POINT_SIZE: usize = 65;

pub type BusRequest<'a> = Msg<'a, SeCommand, MAX_REQUEST_SIZE>;

/// Protocol version, the first byte of any frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize, SerializedSize)]
#[repr(u8)]
pub enum Protocol {
    /// Indicates that no message is present.
    Ignore,
    /// The current frame format.
    V1,
}

/// A message header for a request or reply.
///
/// Kept fixed-size by limiting fields to types with fixed-size hubpack
/// serialization, so `Header::MAX_SIZE` is also its exact size.
#[derive(Debug, Serialize, Deserialize, SerializedSize)]
pub struct Header {
    pub protocol: Protocol,
    pub body_size: u16,
}

impl Header {
    fn new(body_size: u16) -> Header {
        Header {
            protocol: Protocol::V1,
            body_size,
        }
    }
}

/// Errors in frame encoding or decoding, distinct from element statuses:
/// these mean the bytes never made sense, not that the element refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SerializedSize)]
pub enum FrameError {
    /// Output buffer too small for header, body, blob, and CRC.
    Truncated,
    /// CRC trailer did not match the frame contents.
    InvalidCrc,
    /// Frame protocol byte was not a version we speak.
    UnsupportedProtocol,
    /// Body failed to serialize or deserialize.
    Codec,
    /// Blob exceeds `MAX_BLOB_SIZE`.
    BlobTooLarge,
}

impl From<hubpack::Error> for FrameError {
    fn from(_: hubpack::Error) -> Self {
        FrameError::Codec
    }
}

/// A framed message: `Header || body || blob || crc16`.
///
/// The body is the serialized [`SeCommand`]; the blob carries bulk payload
/// (slot data, digests, manifests) without round-tripping through serde.
/// Replies come back through the request's completion cell, not a frame.
#[derive(Debug)]
pub struct Msg<'a, T, const N: usize> {
    pub header: Header,
    pub body: T,
    pub blob: &'a [u8],
}

impl<'a, T, const N: usize> Msg<'a, T, N>
where
    T: Serialize + DeserializeOwned + SerializedSize,
{
    /// Serialize a header, body, and blob, compute and append the CRC, and
    /// return the total frame size.
    pub fn pack(
        body: &T,
        blob: &[u8],
        buf: &mut [u8; N],
    ) -> Result<usize, FrameError> {
        if blob.len() > MAX_BLOB_SIZE {
            return Err(FrameError::BlobTooLarge);
        }

        let mut size =
            hubpack::serialize(&mut buf[Header::MAX_SIZE..], body)?;

        buf[Header::MAX_SIZE + size..Header::MAX_SIZE + size + blob.len()]
            .copy_from_slice(blob);
        size += blob.len();

        let body_size =
            u16::try_from(size).map_err(|_| FrameError::BlobTooLarge)?;
        size += hubpack::serialize(buf, &Header::new(body_size))?;

        let crc = CRC16.checksum(&buf[..size]);
        size += hubpack::serialize(&mut buf[size..], &crc)?;

        Ok(size)
    }

    /// Deserialize a frame, verify its CRC, and return the message with the
    /// blob borrowed out of `buf`.
    pub fn unpack(buf: &'a [u8]) -> Result<Msg<'a, T, N>, FrameError> {
        let (header, rest) = hubpack::deserialize::<Header>(buf)?;
        if header.protocol != Protocol::V1 {
            return Err(FrameError::UnsupportedProtocol);
        }

        let (body, blob_buf) = hubpack::deserialize::<T>(rest)?;
        let end = Header::MAX_SIZE + header.body_size as usize;
        if buf.len() < end + CRC_SIZE {
            return Err(FrameError::Truncated);
        }
        let (checksummed_part, tail) = buf.split_at(end);
        let computed_crc = CRC16.checksum(checksummed_part);

        let (crc, _) = hubpack::deserialize::<u16>(tail)?;
        if computed_crc != crc {
            return Err(FrameError::InvalidCrc);
        }

        let consumed = rest.len() - blob_buf.len();
        let blob_len = (header.body_size as usize)
            .checked_sub(consumed)
            .ok_or(FrameError::Truncated)?;
        if blob_len > blob_buf.len() {
            return Err(FrameError::Truncated);
        }
        Ok(Msg {
            header,
            body,
            blob: &blob_buf[..blob_len],
        })
    }
}

/// Named elliptic curve for keypair generation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SerializedSize)]
#[repr(u8)]
pub enum Curve {
    NistP256,
}

/// Key usage bits, combined with `|`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SerializedSize)]
pub struct KeyUsage(pub u8);

impl KeyUsage {
    pub const AUTH: KeyUsage = KeyUsage(0x01);
    pub const ENCRYPT: KeyUsage = KeyUsage(0x02);
    pub const SIGN: KeyUsage = KeyUsage(0x10);

    pub fn contains(self, other: KeyUsage) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for KeyUsage {
    type Output = KeyUsage;

    fn bitor(self, rhs: KeyUsage) -> KeyUsage {
        KeyUsage(self.0 | rhs.0)
    }
}

/// The body of a request frame.
///
/// Commands carry their bulk bytes (write data, digests, manifests,
/// fragments) in the frame blob, not in the body; the body holds only the
/// addressing and mode fields.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize, SerializedSize)]
pub enum SeCommand {
    ReadData { object: ObjectId },
    WriteData { object: ObjectId, erase: bool },
    ReadMetadata { object: ObjectId },
    WriteMetadata { object: ObjectId },
    GenerateKeypair {
        object: ObjectId,
        curve: Curve,
        usage: KeyUsage,
        export_public: bool,
    },
    SignHash { object: ObjectId },
    ProtectedUpdateStart,
    ProtectedUpdateFinal,
    ReadCounter { object: ObjectId },
    IncrementCounter { object: ObjectId, by: u32 },
}

impl SeCommand {
    /// Build a data read. Private-key slots never emit key material, so a
    /// read against one is refused here, before anything reaches the bus.
    pub fn read_data(slot: SlotId) -> Result<Self, RequestBuildError> {
        let info = slot.info();
        match info.category {
            SlotCategory::FactoryKey | SlotCategory::DeviceKey => {
                Err(RequestBuildError::NotReadable)
            }
            SlotCategory::Reserved => Err(RequestBuildError::ReservedSlot),
            _ => Ok(SeCommand::ReadData {
                object: info.object_id,
            }),
        }
    }

    pub fn write_data(
        slot: SlotId,
        len: usize,
        erase: bool,
    ) -> Result<Self, RequestBuildError> {
        let info = slot.info();
        match info.category {
            SlotCategory::Reserved => {
                return Err(RequestBuildError::ReservedSlot)
            }
            SlotCategory::FactoryUid
            | SlotCategory::FactoryCert
            | SlotCategory::FactoryKey
            | SlotCategory::DeviceKey => {
                return Err(RequestBuildError::NotWritable)
            }
            SlotCategory::Counter => {
                // Counters are increment-only.
                return Err(RequestBuildError::NotWritable);
            }
            _ => (),
        }
        if len > info.max_size as usize {
            return Err(RequestBuildError::TooLarge);
        }
        Ok(SeCommand::WriteData {
            object: info.object_id,
            erase,
        })
    }

    pub fn read_metadata(slot: SlotId) -> Result<Self, RequestBuildError> {
        match slot.info().category {
            SlotCategory::Reserved => Err(RequestBuildError::ReservedSlot),
            _ => Ok(SeCommand::ReadMetadata {
                object: slot.info().object_id,
            }),
        }
    }

    pub fn write_metadata(slot: SlotId) -> Result<Self, RequestBuildError> {
        match slot.info().category {
            SlotCategory::Reserved => Err(RequestBuildError::ReservedSlot),
            SlotCategory::FactoryUid
            | SlotCategory::FactoryCert
            | SlotCategory::FactoryKey => Err(RequestBuildError::NotWritable),
            _ => Ok(SeCommand::WriteMetadata {
                object: slot.info().object_id,
            }),
        }
    }

    pub fn generate_keypair(
        slot: SlotId,
        curve: Curve,
        usage: KeyUsage,
        export_public: bool,
    ) -> Result<Self, RequestBuildError> {
        let info = slot.info();
        match info.category {
            SlotCategory::DeviceKey => Ok(SeCommand::GenerateKeypair {
                object: info.object_id,
                curve,
                usage,
                export_public,
            }),
            // The factory pair is burned in at manufacturing.
            SlotCategory::FactoryKey => Err(RequestBuildError::NotWritable),
            _ => Err(RequestBuildError::NotAKeySlot),
        }
    }

    pub fn sign_hash(
        slot: SlotId,
        digest_len: usize,
    ) -> Result<Self, RequestBuildError> {
        if digest_len != DIGEST_SIZE {
            return Err(RequestBuildError::BadDigestLength);
        }
        let info = slot.info();
        match info.category {
            SlotCategory::FactoryKey | SlotCategory::DeviceKey => {
                Ok(SeCommand::SignHash {
                    object: info.object_id,
                })
            }
            _ => Err(RequestBuildError::NotAKeySlot),
        }
    }

    pub fn read_counter(slot: SlotId) -> Result<Self, RequestBuildError> {
        match slot.info().category {
            SlotCategory::Counter => Ok(SeCommand::ReadCounter {
                object: slot.info().object_id,
            }),
            _ => Err(RequestBuildError::NotACounter),
        }
    }

    pub fn increment_counter(
        slot: SlotId,
        by: u32,
    ) -> Result<Self, RequestBuildError> {
        match slot.info().category {
            SlotCategory::Counter => Ok(SeCommand::IncrementCounter {
                object: slot.info().object_id,
                by,
            }),
            _ => Err(RequestBuildError::NotACounter),
        }
    }
}

/// Per-request completion cell.
///
/// The element's completion interrupt historically wrote a process-global
/// volatile status word; here every request gets its own cell, so a
/// completion that arrives after the caller gave up lands in an abandoned
/// cell instead of confusing the next request. The payload is written before
/// the status is released, so a poller that observes a terminal status with
/// `Acquire` may take the payload.
#[derive(Debug)]
pub struct ReplyCell {
    status: AtomicU8,
    payload: Mutex<Option<Vec<u8>>>,
}

impl ReplyCell {
    pub fn new() -> Arc<ReplyCell> {
        Arc::new(ReplyCell {
            status: AtomicU8::new(RawStatus::Busy as u8),
            payload: Mutex::new(None),
        })
    }

    /// Current status; `RawStatus::Busy` until the element completes.
    pub fn status(&self) -> RawStatus {
        let raw = self.status.load(Ordering::Acquire);
        RawStatus::from_u8(raw).unwrap_or(RawStatus::HardwareFault)
    }

    pub fn is_terminal(&self) -> bool {
        self.status() != RawStatus::Busy
    }

    /// Take the reply payload, if the element produced one.
    pub fn take_payload(&self) -> Option<Vec<u8>> {
        match self.payload.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        }
    }
}

/// Handle passed to the bus with each request; the bus (or its interrupt
/// context) calls [`Completion::finish`] exactly once with the terminal
/// status.
pub struct Completion {
    cell: Arc<ReplyCell>,
}

impl Completion {
    pub fn new(cell: Arc<ReplyCell>) -> Self {
        Completion { cell }
    }

    /// Record the terminal status and payload. Payload first, then the
    /// status store with release ordering, pairing with the poller's
    /// acquire load.
    pub fn finish(self, status: RawStatus, payload: &[u8]) {
        if let Ok(mut guard) = self.cell.payload.lock() {
            *guard = Some(payload.to_vec());
        }
        self.cell.status.store(status as u8, Ordering::Release);
    }
}

/// The bus to the element.
///
/// `submit` returns the element's immediate acceptance status; the terminal
/// status arrives later through `done`. A non-`Ok` return means nothing was
/// started and `done` will never fire. Implementations never complete with
/// `Busy`: that value is the in-flight sentinel.
pub trait SeBus: Send + Sync {
    fn submit(&self, frame: &[u8], done: Completion) -> RawStatus;
}

/// Bus traffic counters, in the fashion of the I/O stats every transport
/// driver here grows sooner or later. All counters wrap.
#[derive(Default, Clone, Copy, PartialEq, Debug, Serialize, Deserialize, SerializedSize)]
pub struct SealIoStats {
    /// Requests handed to the bus.
    pub submitted: u32,

    /// Requests the bus refused at submission.
    pub rejected: u32,

    /// Requests that reached a terminal status.
    pub completed: u32,

    /// Requests abandoned after the polling deadline.
    pub timeouts: u32,

    /// Abandoned requests whose completion was later drained by a
    /// subsequent caller.
    pub stale_drained: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let cmd = SeCommand::read_data(SlotId::DeviceCert).unwrap();
        let mut buf = [0u8; MAX_REQUEST_SIZE];
        let blob = [0u8; 0];
        let size = BusRequest::pack(&cmd, &blob, &mut buf).unwrap();

        let msg = BusRequest::unpack(&buf[..size]).unwrap();
        assert_eq!(msg.body, cmd);
        assert_eq!(msg.blob, &[] as &[u8]);
    }

    #[test]
    fn frame_round_trip_with_blob() {
        let cmd =
            SeCommand::write_data(SlotId::TrustAnchor, 4, true).unwrap();
        let mut buf = [0u8; MAX_REQUEST_SIZE];
        let size =
            BusRequest::pack(&cmd, &[0xde, 0xad, 0xbe, 0xef], &mut buf)
                .unwrap();

        let msg = BusRequest::unpack(&buf[..size]).unwrap();
        assert_eq!(msg.body, cmd);
        assert_eq!(msg.blob, &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn corrupt_frame_fails_crc() {
        let cmd = SeCommand::read_data(SlotId::FactoryCert).unwrap();
        let mut buf = [0u8; MAX_REQUEST_SIZE];
        let size = BusRequest::pack(&cmd, &[1, 2, 3], &mut buf).unwrap();

        // Flip a bit in the trailer itself.
        buf[size - 1] ^= 0x40;
        assert_eq!(
            BusRequest::unpack(&buf[..size]).unwrap_err(),
            FrameError::InvalidCrc
        );
    }

    #[test]
    fn key_slots_are_not_readable() {
        assert_eq!(
            SeCommand::read_data(SlotId::DeviceKey).unwrap_err(),
            RequestBuildError::NotReadable
        );
        assert_eq!(
            SeCommand::read_data(SlotId::FactoryKey).unwrap_err(),
            RequestBuildError::NotReadable
        );
    }

    #[test]
    fn reserved_slot_writes_fail_at_construction() {
        assert_eq!(
            SeCommand::write_data(SlotId::ReservedUpdate, 1, true)
                .unwrap_err(),
            RequestBuildError::ReservedSlot
        );
    }

    #[test]
    fn factory_slots_are_immutable() {
        for slot in [SlotId::FactoryUid, SlotId::FactoryCert] {
            assert_eq!(
                SeCommand::write_data(slot, 1, true).unwrap_err(),
                RequestBuildError::NotWritable
            );
        }
        assert_eq!(
            SeCommand::generate_keypair(
                SlotId::FactoryKey,
                Curve::NistP256,
                KeyUsage::SIGN,
                false
            )
            .unwrap_err(),
            RequestBuildError::NotWritable
        );
    }

    #[test]
    fn sign_hash_requires_exact_digest() {
        assert_eq!(
            SeCommand::sign_hash(SlotId::DeviceKey, 20).unwrap_err(),
            RequestBuildError::BadDigestLength
        );
        assert!(SeCommand::sign_hash(SlotId::DeviceKey, 32).is_ok());
    }

    mod frame_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn round_trip_any_blob(
                blob in proptest::collection::vec(any::<u8>(), 0..MAX_BLOB_SIZE),
                erase in any::<bool>(),
            ) {
                let cmd = SeCommand::WriteData {
                    object: SlotId::UserLarge0.object_id(),
                    erase,
                };
                let mut buf = [0u8; MAX_REQUEST_SIZE];
                let size = BusRequest::pack(&cmd, &blob, &mut buf).unwrap();

                let msg = BusRequest::unpack(&buf[..size]).unwrap();
                prop_assert_eq!(msg.body, cmd);
                prop_assert_eq!(msg.blob, &blob[..]);
            }
        }
    }

    #[test]
    fn completion_cell_handoff() {
        let cell = ReplyCell::new();
        assert_eq!(cell.status(), RawStatus::Busy);
        assert!(!cell.is_terminal());

        Completion::new(cell.clone()).finish(RawStatus::Ok, &[7, 8]);
        assert_eq!(cell.status(), RawStatus::Ok);
        assert_eq!(cell.take_payload(), Some(vec![7, 8]));
        assert_eq!(cell.take_payload(), None);
    }
}
