// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Status and error types for the secure element bus.

use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

/// The element's flat status word, as delivered on the wire.
///
/// `Busy` doubles as the in-flight sentinel in a completion cell; the
/// element itself never terminates a request with it.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    SerializedSize,
    FromPrimitive,
)]
#[repr(u8)]
pub enum RawStatus {
    Ok = 0x00,
    Busy = 0x01,
    AccessDenied = 0x02,
    InvalidSlot = 0x03,
    InvalidData = 0x04,
    MetadataMismatch = 0x05,
    SignatureInvalid = 0x06,
    LcsLocked = 0x07,
    Timeout = 0x08,
    HardwareFault = 0x09,
}

impl RawStatus {
    /// Fold a terminal status into a `Result`. `Busy` maps to
    /// `SeError::Busy`: a caller sees it only from the fail-fast lock
    /// acquisition or from a bus that refused submission.
    pub fn into_result(self) -> Result<(), SeError> {
        match self {
            RawStatus::Ok => Ok(()),
            RawStatus::Busy => Err(SeError::Busy),
            RawStatus::AccessDenied => Err(SeError::AccessDenied),
            RawStatus::InvalidSlot => Err(SeError::InvalidSlot),
            RawStatus::InvalidData => Err(SeError::InvalidData),
            RawStatus::MetadataMismatch => Err(SeError::MetadataMismatch),
            RawStatus::SignatureInvalid => Err(SeError::SignatureInvalid),
            RawStatus::LcsLocked => Err(SeError::LcsLocked),
            RawStatus::Timeout => Err(SeError::Timeout),
            RawStatus::HardwareFault => Err(SeError::HardwareFault),
        }
    }
}

/// A failed element operation. The access layer reports these raw and never
/// retries; recovery policy belongs to the callers above it.
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
pub enum SeError {
    /// The element (or its lock) is held by another initiator.
    Busy,
    /// An access condition refused the operation.
    AccessDenied,
    /// The addressed object does not exist on this element.
    InvalidSlot,
    /// Payload rejected (length, format, or state).
    InvalidData,
    /// Metadata write conflicts with the object's current metadata.
    MetadataMismatch,
    /// A signature or signed structure failed verification.
    SignatureInvalid,
    /// The object's lifecycle state forbids the change.
    LcsLocked,
    /// No terminal status before the polling deadline. The hardware
    /// operation was not cancelled and may still complete.
    Timeout,
    /// The element misbehaved at the transport level.
    HardwareFault,
    /// The request frame could not be encoded or the reply frame could not
    /// be decoded.
    Protocol,
}

impl From<SeError> for RawStatus {
    fn from(e: SeError) -> RawStatus {
        match e {
            SeError::Busy => RawStatus::Busy,
            SeError::AccessDenied => RawStatus::AccessDenied,
            SeError::InvalidSlot => RawStatus::InvalidSlot,
            SeError::InvalidData => RawStatus::InvalidData,
            SeError::MetadataMismatch => RawStatus::MetadataMismatch,
            SeError::SignatureInvalid => RawStatus::SignatureInvalid,
            SeError::LcsLocked => RawStatus::LcsLocked,
            SeError::Timeout => RawStatus::Timeout,
            SeError::HardwareFault | SeError::Protocol => {
                RawStatus::HardwareFault
            }
        }
    }
}

impl From<crate::FrameError> for SeError {
    fn from(_: crate::FrameError) -> SeError {
        SeError::Protocol
    }
}

/// A request that could not be built. These surface at construction, before
/// anything touches the bus: the registry is total, so an ineligible slot or
/// payload is a caller bug, not an element condition.
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
pub enum RequestBuildError {
    /// The slot is reserved by the protected-update machinery.
    ReservedSlot,
    /// The slot's category never permits this write.
    NotWritable,
    /// Private-key slots never emit key material.
    NotReadable,
    /// Keypair or signing operation against a non-key slot.
    NotAKeySlot,
    /// Counter operation against a non-counter slot.
    NotACounter,
    /// Payload exceeds the slot's maximum size.
    TooLarge,
    /// `sign_hash` requires exactly a 32-byte digest.
    BadDigestLength,
}

/// A failed access-layer operation, as reported to tasks.
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
pub enum SealError {
    /// The request never made sense; nothing reached the bus.
    Request(RequestBuildError),
    /// The element's terminal (or acceptance) status.
    Element(SeError),
    /// Caller-supplied output buffer smaller than the reply.
    BufferTooSmall,
}

impl From<RequestBuildError> for SealError {
    fn from(e: RequestBuildError) -> Self {
        SealError::Request(e)
    }
}

impl From<SeError> for SealError {
    fn from(e: SeError) -> Self {
        SealError::Element(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn raw_status_from_wire_byte() {
        assert_eq!(RawStatus::from_u8(0x00), Some(RawStatus::Ok));
        assert_eq!(RawStatus::from_u8(0x06), Some(RawStatus::SignatureInvalid));
        assert_eq!(RawStatus::from_u8(0xAA), None);
    }

    #[test]
    fn status_result_mapping() {
        assert!(RawStatus::Ok.into_result().is_ok());
        assert_eq!(
            RawStatus::LcsLocked.into_result().unwrap_err(),
            SeError::LcsLocked
        );
    }
}
