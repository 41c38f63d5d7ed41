// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The slot registry: a static, read-only map from logical slot to element
//! object, with the access semantics each category carries.

use crate::metadata::ObjectType;
use core::fmt;
use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};

pub(crate) const DEVICE_CERT_MAX_SIZE: u16 = 1728;

/// A 16-bit element object address.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub struct ObjectId(pub u16);

impl ObjectId {
    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 2]) -> Self {
        ObjectId(u16::from_be_bytes(bytes))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Access semantics shared by every slot of a category.
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
pub enum SlotCategory {
    /// Read-only hardware identity, burned at manufacturing.
    FactoryUid,
    /// Pre-provisioned certificate; read-always, never writable.
    FactoryCert,
    /// Private key paired with the factory certificate; signable only.
    FactoryKey,
    /// Operational certificate; writable subject to access conditions.
    DeviceCert,
    /// Private key paired with the device certificate; signable,
    /// regeneratable, never readable.
    DeviceKey,
    /// Verification anchor for signed update manifests.
    TrustAnchor,
    /// Shared confidentiality secret for protected updates.
    ProtectedSecret,
    /// Application-defined blob storage.
    UserData,
    /// Hardware-enforced monotonic counter; increment only.
    Counter,
    /// Claimed by the protected-update machinery; direct writes fail.
    Reserved,
}

/// Logical slot identifiers. The registry below maps each to its hardware
/// object and size class.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub enum SlotId {
    FactoryUid,
    FactoryCert,
    FactoryKey,
    DeviceCert,
    DeviceKey,
    TrustAnchor,
    UpdateSecret,
    UserSmall0,
    UserSmall1,
    UserLarge0,
    UserLarge1,
    Counter0,
    Counter1,
    ReservedUpdate,
}

/// One registry row.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlotInfo {
    pub object_id: ObjectId,
    pub max_size: u16,
    pub data_type: ObjectType,
    pub category: SlotCategory,
}

impl SlotId {
    pub const ALL: [SlotId; 14] = [
        SlotId::FactoryUid,
        SlotId::FactoryCert,
        SlotId::FactoryKey,
        SlotId::DeviceCert,
        SlotId::DeviceKey,
        SlotId::TrustAnchor,
        SlotId::UpdateSecret,
        SlotId::UserSmall0,
        SlotId::UserSmall1,
        SlotId::UserLarge0,
        SlotId::UserLarge1,
        SlotId::Counter0,
        SlotId::Counter1,
        SlotId::ReservedUpdate,
    ];

    pub fn iter() -> impl Iterator<Item = SlotId> {
        Self::ALL.into_iter()
    }

    /// Registry lookup. Total: every `SlotId` has a row.
    pub const fn info(self) -> SlotInfo {
        match self {
            SlotId::FactoryUid => SlotInfo {
                object_id: ObjectId(0xe0c2),
                max_size: 27,
                data_type: ObjectType::ByteString,
                category: SlotCategory::FactoryUid,
            },
            SlotId::FactoryCert => SlotInfo {
                object_id: ObjectId(0xe0e0),
                max_size: DEVICE_CERT_MAX_SIZE,
                data_type: ObjectType::DeviceCert,
                category: SlotCategory::FactoryCert,
            },
            SlotId::FactoryKey => SlotInfo {
                object_id: ObjectId(0xe0f0),
                max_size: 0,
                data_type: ObjectType::ByteString,
                category: SlotCategory::FactoryKey,
            },
            SlotId::DeviceCert => SlotInfo {
                object_id: ObjectId(0xe0e1),
                max_size: DEVICE_CERT_MAX_SIZE,
                data_type: ObjectType::DeviceCert,
                category: SlotCategory::DeviceCert,
            },
            SlotId::DeviceKey => SlotInfo {
                object_id: ObjectId(0xe0f1),
                max_size: 0,
                data_type: ObjectType::ByteString,
                category: SlotCategory::DeviceKey,
            },
            SlotId::TrustAnchor => SlotInfo {
                object_id: ObjectId(0xe0e8),
                max_size: 1200,
                data_type: ObjectType::TrustAnchor,
                category: SlotCategory::TrustAnchor,
            },
            SlotId::UpdateSecret => SlotInfo {
                object_id: ObjectId(0xf1d4),
                max_size: 64,
                data_type: ObjectType::UpdateSecret,
                category: SlotCategory::ProtectedSecret,
            },
            SlotId::UserSmall0 => SlotInfo {
                object_id: ObjectId(0xf1d5),
                max_size: 140,
                data_type: ObjectType::ByteString,
                category: SlotCategory::UserData,
            },
            SlotId::UserSmall1 => SlotInfo {
                object_id: ObjectId(0xf1d6),
                max_size: 140,
                data_type: ObjectType::ByteString,
                category: SlotCategory::UserData,
            },
            SlotId::UserLarge0 => SlotInfo {
                object_id: ObjectId(0xf1e0),
                max_size: 1500,
                data_type: ObjectType::ByteString,
                category: SlotCategory::UserData,
            },
            SlotId::UserLarge1 => SlotInfo {
                object_id: ObjectId(0xf1e1),
                max_size: 1500,
                data_type: ObjectType::ByteString,
                category: SlotCategory::UserData,
            },
            // Counters are a single 32-bit big-endian value.
            SlotId::Counter0 => SlotInfo {
                object_id: ObjectId(0xe120),
                max_size: 4,
                data_type: ObjectType::ByteString,
                category: SlotCategory::Counter,
            },
            SlotId::Counter1 => SlotInfo {
                object_id: ObjectId(0xe121),
                max_size: 4,
                data_type: ObjectType::ByteString,
                category: SlotCategory::Counter,
            },
            SlotId::ReservedUpdate => SlotInfo {
                object_id: ObjectId(0xf1c0),
                max_size: 0,
                data_type: ObjectType::ByteString,
                category: SlotCategory::Reserved,
            },
        }
    }

    pub const fn category(self) -> SlotCategory {
        self.info().category
    }

    pub const fn object_id(self) -> ObjectId {
        self.info().object_id
    }

    /// Reverse lookup from a hardware object address.
    pub fn from_object(object: ObjectId) -> Option<SlotId> {
        Self::ALL.into_iter().find(|s| s.object_id() == object)
    }

    /// The certificate slot paired with a key slot, and vice versa. The
    /// factory pair is fixed at manufacturing; the device pair is what the
    /// lifecycle machinery renews together.
    pub const fn paired(self) -> Option<SlotId> {
        match self {
            SlotId::FactoryCert => Some(SlotId::FactoryKey),
            SlotId::FactoryKey => Some(SlotId::FactoryCert),
            SlotId::DeviceCert => Some(SlotId::DeviceKey),
            SlotId::DeviceKey => Some(SlotId::DeviceCert),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_total_and_unique() {
        for slot in SlotId::iter() {
            let info = slot.info();
            assert_eq!(SlotId::from_object(info.object_id), Some(slot));
        }

        let mut ids: Vec<u16> =
            SlotId::iter().map(|s| s.object_id().0).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), SlotId::ALL.len());
    }

    #[test]
    fn key_cert_pairing_is_symmetric() {
        assert_eq!(SlotId::DeviceKey.paired(), Some(SlotId::DeviceCert));
        assert_eq!(SlotId::DeviceCert.paired(), Some(SlotId::DeviceKey));
        assert_eq!(SlotId::FactoryKey.paired(), Some(SlotId::FactoryCert));
        assert_eq!(SlotId::TrustAnchor.paired(), None);
    }

    #[test]
    fn unknown_object_has_no_slot() {
        assert_eq!(SlotId::from_object(ObjectId(0x0001)), None);
    }

    #[test]
    fn user_data_size_classes() {
        assert_eq!(SlotId::UserSmall0.info().max_size, 140);
        assert_eq!(SlotId::UserLarge0.info().max_size, 1500);
    }

    #[test]
    fn counters_are_word_sized() {
        for slot in [SlotId::Counter0, SlotId::Counter1] {
            assert_eq!(slot.info().max_size, 4);
            assert_eq!(slot.info().category, SlotCategory::Counter);
        }
    }
}
