// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object metadata, as the element stores it: a TLV record under outer tag
//! 0x20 with one inner TLV per field.
//!
//! Tags: 0xC0 lifecycle state, 0xC1 version, 0xC4 max size, 0xC5 used size,
//! 0xD0 change access, 0xD1 read access, 0xD3 execute access, 0xE8 object
//! type.

use crate::slots::ObjectId;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

const TAG_METADATA: u8 = 0x20;
const TAG_LCSO: u8 = 0xc0;
const TAG_VERSION: u8 = 0xc1;
const TAG_MAX_SIZE: u8 = 0xc4;
const TAG_USED_SIZE: u8 = 0xc5;
const TAG_CHANGE_AC: u8 = 0xd0;
const TAG_READ_AC: u8 = 0xd1;
const TAG_EXECUTE_AC: u8 = 0xd3;
const TAG_OBJECT_TYPE: u8 = 0xe8;

const AC_ALWAYS: u8 = 0x00;
const AC_INTEGRITY: u8 = 0x21;
const AC_NEVER: u8 = 0xff;

/// Lifecycle state of a single object. Monotonic non-decreasing toward
/// `Operational`; at `Operational` most metadata becomes immutable.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, FromPrimitive,
)]
#[repr(u8)]
pub enum Lcso {
    Creation = 0x01,
    Initialization = 0x03,
    Operational = 0x07,
    Termination = 0x0f,
}

/// Object type tag (0xE8).
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ObjectType {
    ByteString = 0x00,
    TrustAnchor = 0x11,
    DeviceCert = 0x12,
    UpdateSecret = 0x22,
    AuthRef = 0x23,
}

/// One access condition expression.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessCondition {
    Always,
    Never,
    /// Permitted only through an integrity-protected operation verified
    /// against the named anchor object.
    IntegrityProtected(ObjectId),
}

impl AccessCondition {
    fn encoded_len(self) -> usize {
        match self {
            AccessCondition::Always | AccessCondition::Never => 1,
            AccessCondition::IntegrityProtected(_) => 3,
        }
    }

    fn encode(self, out: &mut [u8]) -> usize {
        match self {
            AccessCondition::Always => {
                out[0] = AC_ALWAYS;
                1
            }
            AccessCondition::Never => {
                out[0] = AC_NEVER;
                1
            }
            AccessCondition::IntegrityProtected(oid) => {
                out[0] = AC_INTEGRITY;
                out[1..3].copy_from_slice(&oid.to_be_bytes());
                3
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, MetadataError> {
        match bytes {
            [AC_ALWAYS] => Ok(AccessCondition::Always),
            [AC_NEVER] => Ok(AccessCondition::Never),
            [AC_INTEGRITY, hi, lo] => Ok(AccessCondition::IntegrityProtected(
                ObjectId::from_be_bytes([*hi, *lo]),
            )),
            _ => Err(MetadataError::BadValue),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetadataError {
    Truncated,
    BadTag(u8),
    BadLength,
    BadValue,
}

/// Full metadata of one object, as read back from the element.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlotMetadata {
    pub lcso: Lcso,
    pub version: u16,
    pub max_size: u16,
    pub used_size: u16,
    pub change: AccessCondition,
    pub read: AccessCondition,
    pub execute: AccessCondition,
    pub object_type: Option<ObjectType>,
}

impl Default for SlotMetadata {
    fn default() -> Self {
        SlotMetadata {
            lcso: Lcso::Creation,
            version: 0,
            max_size: 0,
            used_size: 0,
            change: AccessCondition::Always,
            read: AccessCondition::Always,
            execute: AccessCondition::Never,
            object_type: None,
        }
    }
}

/// Fields to change in a metadata write. Absent fields are left untouched;
/// `max_size` and `used_size` are device-managed and cannot be patched.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataPatch {
    pub lcso: Option<Lcso>,
    pub version: Option<u16>,
    pub change: Option<AccessCondition>,
    pub read: Option<AccessCondition>,
    pub execute: Option<AccessCondition>,
    pub object_type: Option<ObjectType>,
}

impl MetadataPatch {
    pub fn with_lcso(mut self, lcso: Lcso) -> Self {
        self.lcso = Some(lcso);
        self
    }

    pub fn with_version(mut self, version: u16) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_change(mut self, ac: AccessCondition) -> Self {
        self.change = Some(ac);
        self
    }

    pub fn with_read(mut self, ac: AccessCondition) -> Self {
        self.read = Some(ac);
        self
    }

    pub fn with_execute(mut self, ac: AccessCondition) -> Self {
        self.execute = Some(ac);
        self
    }

    pub fn with_object_type(mut self, t: ObjectType) -> Self {
        self.object_type = Some(t);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == MetadataPatch::default()
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, MetadataError> {
        let mut w = TlvWriter::new(out);
        w.begin_outer()?;
        if let Some(lcso) = self.lcso {
            w.field(TAG_LCSO, &[lcso as u8])?;
        }
        if let Some(version) = self.version {
            w.field(TAG_VERSION, &version.to_be_bytes())?;
        }
        if let Some(ac) = self.change {
            let mut buf = [0u8; 3];
            let n = ac.encode(&mut buf);
            w.field(TAG_CHANGE_AC, &buf[..n])?;
        }
        if let Some(ac) = self.read {
            let mut buf = [0u8; 3];
            let n = ac.encode(&mut buf);
            w.field(TAG_READ_AC, &buf[..n])?;
        }
        if let Some(ac) = self.execute {
            let mut buf = [0u8; 3];
            let n = ac.encode(&mut buf);
            w.field(TAG_EXECUTE_AC, &buf[..n])?;
        }
        if let Some(t) = self.object_type {
            w.field(TAG_OBJECT_TYPE, &[t as u8])?;
        }
        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MetadataError> {
        let mut patch = MetadataPatch::default();
        for_each_field(bytes, |tag, value| {
            match tag {
                TAG_LCSO => {
                    patch.lcso = Some(decode_lcso(value)?);
                }
                TAG_VERSION => {
                    patch.version = Some(decode_u16(value)?);
                }
                TAG_CHANGE_AC => {
                    patch.change = Some(AccessCondition::decode(value)?);
                }
                TAG_READ_AC => {
                    patch.read = Some(AccessCondition::decode(value)?);
                }
                TAG_EXECUTE_AC => {
                    patch.execute = Some(AccessCondition::decode(value)?);
                }
                TAG_OBJECT_TYPE => {
                    let t = value
                        .first()
                        .and_then(|b| ObjectType::from_u8(*b))
                        .ok_or(MetadataError::BadValue)?;
                    patch.object_type = Some(t);
                }
                // max/used size are device-managed; tolerate but ignore.
                TAG_MAX_SIZE | TAG_USED_SIZE => (),
                other => return Err(MetadataError::BadTag(other)),
            }
            Ok(())
        })?;
        Ok(patch)
    }
}

impl SlotMetadata {
    /// Apply a patch, as the element does on a metadata write.
    pub fn apply(&mut self, patch: &MetadataPatch) {
        if let Some(lcso) = patch.lcso {
            self.lcso = lcso;
        }
        if let Some(version) = patch.version {
            self.version = version;
        }
        if let Some(ac) = patch.change {
            self.change = ac;
        }
        if let Some(ac) = patch.read {
            self.read = ac;
        }
        if let Some(ac) = patch.execute {
            self.execute = ac;
        }
        if let Some(t) = patch.object_type {
            self.object_type = Some(t);
        }
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<usize, MetadataError> {
        let mut w = TlvWriter::new(out);
        w.begin_outer()?;
        w.field(TAG_LCSO, &[self.lcso as u8])?;
        w.field(TAG_VERSION, &self.version.to_be_bytes())?;
        w.field(TAG_MAX_SIZE, &self.max_size.to_be_bytes())?;
        w.field(TAG_USED_SIZE, &self.used_size.to_be_bytes())?;
        let mut buf = [0u8; 3];
        let n = self.change.encode(&mut buf);
        w.field(TAG_CHANGE_AC, &buf[..n])?;
        let n = self.read.encode(&mut buf);
        w.field(TAG_READ_AC, &buf[..n])?;
        let n = self.execute.encode(&mut buf);
        w.field(TAG_EXECUTE_AC, &buf[..n])?;
        if let Some(t) = self.object_type {
            w.field(TAG_OBJECT_TYPE, &[t as u8])?;
        }
        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MetadataError> {
        let mut md = SlotMetadata::default();
        for_each_field(bytes, |tag, value| {
            match tag {
                TAG_LCSO => md.lcso = decode_lcso(value)?,
                TAG_VERSION => md.version = decode_u16(value)?,
                TAG_MAX_SIZE => md.max_size = decode_u16(value)?,
                TAG_USED_SIZE => md.used_size = decode_u16(value)?,
                TAG_CHANGE_AC => {
                    md.change = AccessCondition::decode(value)?;
                }
                TAG_READ_AC => md.read = AccessCondition::decode(value)?,
                TAG_EXECUTE_AC => {
                    md.execute = AccessCondition::decode(value)?;
                }
                TAG_OBJECT_TYPE => {
                    md.object_type = Some(
                        value
                            .first()
                            .and_then(|b| ObjectType::from_u8(*b))
                            .ok_or(MetadataError::BadValue)?,
                    );
                }
                other => return Err(MetadataError::BadTag(other)),
            }
            Ok(())
        })?;
        Ok(md)
    }
}

fn decode_lcso(value: &[u8]) -> Result<Lcso, MetadataError> {
    value
        .first()
        .and_then(|b| Lcso::from_u8(*b))
        .ok_or(MetadataError::BadValue)
}

fn decode_u16(value: &[u8]) -> Result<u16, MetadataError> {
    match value {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(MetadataError::BadLength),
    }
}

/// Walk the inner TLVs of a 0x20 metadata record.
fn for_each_field(
    bytes: &[u8],
    mut f: impl FnMut(u8, &[u8]) -> Result<(), MetadataError>,
) -> Result<(), MetadataError> {
    if bytes.len() < 2 || bytes[0] != TAG_METADATA {
        return Err(MetadataError::BadValue);
    }
    let inner_len = bytes[1] as usize;
    let inner = bytes
        .get(2..2 + inner_len)
        .ok_or(MetadataError::Truncated)?;

    let mut idx = 0;
    while idx < inner.len() {
        if idx + 2 > inner.len() {
            return Err(MetadataError::Truncated);
        }
        let tag = inner[idx];
        let len = inner[idx + 1] as usize;
        let value = inner
            .get(idx + 2..idx + 2 + len)
            .ok_or(MetadataError::Truncated)?;
        f(tag, value)?;
        idx += 2 + len;
    }
    Ok(())
}

struct TlvWriter<'a> {
    out: &'a mut [u8],
    len: usize,
}

impl<'a> TlvWriter<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        TlvWriter { out, len: 0 }
    }

    fn begin_outer(&mut self) -> Result<(), MetadataError> {
        if self.out.len() < 2 {
            return Err(MetadataError::Truncated);
        }
        self.out[0] = TAG_METADATA;
        // Length byte patched in finish().
        self.len = 2;
        Ok(())
    }

    fn field(&mut self, tag: u8, value: &[u8]) -> Result<(), MetadataError> {
        let end = self.len + 2 + value.len();
        if end > self.out.len() {
            return Err(MetadataError::Truncated);
        }
        self.out[self.len] = tag;
        self.out[self.len + 1] = value.len() as u8;
        self.out[self.len + 2..end].copy_from_slice(value);
        self.len = end;
        Ok(())
    }

    fn finish(self) -> Result<usize, MetadataError> {
        let inner = self.len - 2;
        if inner > u8::MAX as usize {
            return Err(MetadataError::BadLength);
        }
        self.out[1] = inner as u8;
        Ok(self.len)
    }
}
