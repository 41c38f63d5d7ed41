// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal X.509 parsing: the handful of fields the lifecycle machinery
//! compares, nothing resembling general path validation.

use crate::der::{
    self, expect_tlv, read_tlv, DerError, TAG_BIT_STRING, TAG_CONTEXT_0,
    TAG_GENERALIZED_TIME, TAG_IA5_STRING, TAG_INTEGER, TAG_OID,
    TAG_PRINTABLE_STRING, TAG_SEQUENCE, TAG_SET, TAG_UTC_TIME,
    TAG_UTF8_STRING,
};
use crate::time::UtcTime;
use alloc::string::String;
use alloc::vec::Vec;

/// OID 2.5.4.3 (id-at-commonName), DER-encoded body.
const OID_COMMON_NAME: &[u8] = &[0x55, 0x04, 0x03];

/// OID 1.2.840.10045.4.3.2 (ecdsa-with-SHA256).
pub const OID_ECDSA_WITH_SHA256: &[u8] =
    &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];
/// OID 1.2.840.10045.2.1 (id-ecPublicKey).
pub const OID_EC_PUBLIC_KEY: &[u8] =
    &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
/// OID 1.2.840.10045.3.1.7 (prime256v1).
pub const OID_PRIME256V1: &[u8] =
    &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum X509Error {
    Der(DerError),
    /// The name contained no commonName attribute.
    MissingCn,
    /// A CN attribute was not a string type we accept.
    BadString,
    BadTime,
    /// SubjectPublicKeyInfo did not hold an uncompressed P-256 point.
    BadPublicKey,
    /// The owned parser could not get memory for its copies. Retryable;
    /// the borrowed parser remains available for display.
    AllocationFailed,
}

impl From<DerError> for X509Error {
    fn from(e: DerError) -> Self {
        X509Error::Der(e)
    }
}

impl From<crate::time::TimeError> for X509Error {
    fn from(_: crate::time::TimeError) -> Self {
        X509Error::BadTime
    }
}

/// Borrowed view of the fields we care about. Produced without allocating,
/// so it stays usable when the heap is fragmented; suitable for display and
/// for validity comparison, with the owned [`Certificate`] reserved for
/// decisions that must outlive the DER buffer.
#[derive(Copy, Clone, Debug)]
pub struct CertView<'a> {
    pub serial: &'a [u8],
    pub issuer_cn: &'a str,
    pub subject_cn: &'a str,
    pub not_before: UtcTime,
    pub not_after: UtcTime,
    pub raw: &'a [u8],
}

impl CertView<'_> {
    pub fn is_valid(&self, now: UtcTime) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

/// Owned parse result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    pub serial: Vec<u8>,
    pub issuer_cn: String,
    pub subject_cn: String,
    pub not_before: UtcTime,
    pub not_after: UtcTime,
    pub der: Vec<u8>,
}

impl Certificate {
    pub fn is_valid(&self, now: UtcTime) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

/// Parse the display/comparison fields out of a DER certificate without
/// allocating.
pub fn parse_minimal(der: &[u8]) -> Result<CertView<'_>, X509Error> {
    let (cert_body, trailing) = expect_tlv(der, TAG_SEQUENCE)?;
    if !trailing.is_empty() {
        return Err(DerError::BadValue.into());
    }

    let (tbs, _sig_alg_and_sig) = expect_tlv(cert_body, TAG_SEQUENCE)?;

    // Optional [0] EXPLICIT version.
    let rest = match read_tlv(tbs)? {
        (tlv, rest) if tlv.tag == TAG_CONTEXT_0 => rest,
        _ => tbs,
    };

    let (serial, rest) = expect_tlv(rest, TAG_INTEGER)?;
    // signature AlgorithmIdentifier, unused here.
    let (_sig_alg, rest) = expect_tlv(rest, TAG_SEQUENCE)?;
    let (issuer, rest) = expect_tlv(rest, TAG_SEQUENCE)?;
    let (validity, rest) = expect_tlv(rest, TAG_SEQUENCE)?;
    let (subject, _rest) = expect_tlv(rest, TAG_SEQUENCE)?;

    let (not_before, validity_rest) = parse_time(validity)?;
    let (not_after, _) = parse_time(validity_rest)?;

    Ok(CertView {
        serial,
        issuer_cn: common_name(issuer)?,
        subject_cn: common_name(subject)?,
        not_before,
        not_after,
        raw: der,
    })
}

/// Owned parse for trust decisions. Distinguishes allocation failure from
/// malformed input so the caller can back off and retry the former.
pub fn parse_owned(der: &[u8]) -> Result<Certificate, X509Error> {
    let view = parse_minimal(der)?;

    let mut raw = Vec::new();
    raw.try_reserve_exact(der.len())
        .map_err(|_| X509Error::AllocationFailed)?;
    raw.extend_from_slice(der);

    let mut serial = Vec::new();
    serial
        .try_reserve_exact(view.serial.len())
        .map_err(|_| X509Error::AllocationFailed)?;
    serial.extend_from_slice(view.serial);

    let mut issuer_cn = String::new();
    issuer_cn
        .try_reserve_exact(view.issuer_cn.len())
        .map_err(|_| X509Error::AllocationFailed)?;
    issuer_cn.push_str(view.issuer_cn);

    let mut subject_cn = String::new();
    subject_cn
        .try_reserve_exact(view.subject_cn.len())
        .map_err(|_| X509Error::AllocationFailed)?;
    subject_cn.push_str(view.subject_cn);

    Ok(Certificate {
        serial,
        issuer_cn,
        subject_cn,
        not_before: view.not_before,
        not_after: view.not_after,
        der: raw,
    })
}

/// Extract the uncompressed P-256 point from a certificate's
/// SubjectPublicKeyInfo.
pub fn public_key_point(der: &[u8]) -> Result<&[u8; 65], X509Error> {
    let (cert_body, _) = expect_tlv(der, TAG_SEQUENCE)?;
    let (tbs, _) = expect_tlv(cert_body, TAG_SEQUENCE)?;

    let rest = match read_tlv(tbs)? {
        (tlv, rest) if tlv.tag == TAG_CONTEXT_0 => rest,
        _ => tbs,
    };
    let (_serial, rest) = expect_tlv(rest, TAG_INTEGER)?;
    let (_sig_alg, rest) = expect_tlv(rest, TAG_SEQUENCE)?;
    let (_issuer, rest) = expect_tlv(rest, TAG_SEQUENCE)?;
    let (_validity, rest) = expect_tlv(rest, TAG_SEQUENCE)?;
    let (_subject, rest) = expect_tlv(rest, TAG_SEQUENCE)?;
    let (spki, _) = expect_tlv(rest, TAG_SEQUENCE)?;

    let (_alg, spki_rest) = expect_tlv(spki, TAG_SEQUENCE)?;
    let (bits, _) = expect_tlv(spki_rest, TAG_BIT_STRING)?;

    // One unused-bits byte, then the uncompressed point.
    match bits {
        [0x00, point @ ..] if point.len() == 65 && point[0] == 0x04 => {
            Ok(point.try_into().map_err(|_| X509Error::BadPublicKey)?)
        }
        _ => Err(X509Error::BadPublicKey),
    }
}

fn parse_time(buf: &[u8]) -> Result<(UtcTime, &[u8]), X509Error> {
    let (tlv, rest) = read_tlv(buf)?;
    let t = match tlv.tag {
        TAG_UTC_TIME => UtcTime::from_utc_time(tlv.value)?,
        TAG_GENERALIZED_TIME => UtcTime::from_generalized_time(tlv.value)?,
        _ => return Err(X509Error::BadTime),
    };
    Ok((t, rest))
}

/// Find the commonName attribute in an X.501 Name: a SEQUENCE of SETs of
/// AttributeTypeAndValue.
fn common_name(name: &[u8]) -> Result<&str, X509Error> {
    let mut rest = name;
    while !rest.is_empty() {
        let (rdn, after) = expect_tlv(rest, TAG_SET)?;
        rest = after;

        let mut inner = rdn;
        while !inner.is_empty() {
            let (atv, after_atv) = expect_tlv(inner, TAG_SEQUENCE)?;
            inner = after_atv;

            let (oid, value_buf) = expect_tlv(atv, TAG_OID)?;
            if oid != OID_COMMON_NAME {
                continue;
            }
            let (value, _) = read_tlv(value_buf)?;
            return match value.tag {
                TAG_UTF8_STRING | TAG_PRINTABLE_STRING | TAG_IA5_STRING => {
                    core::str::from_utf8(value.value)
                        .map_err(|_| X509Error::BadString)
                }
                _ => Err(X509Error::BadString),
            };
        }
    }
    Err(X509Error::MissingCn)
}

/// Assemble a Name with optional CN and O attributes, used by test
/// fixtures and the CSR path. Returns the DER bytes written at the tail of
/// `buf`.
pub fn encode_name<'a>(
    cn: Option<&str>,
    org: Option<&str>,
    buf: &'a mut [u8],
) -> Result<&'a [u8], DerError> {
    /// OID 2.5.4.10 (id-at-organizationName).
    const OID_ORG: &[u8] = &[0x55, 0x04, 0x0a];

    let mut w = der::DerWriter::new(buf);
    let name_mark = w.mark();

    // RDNs in reverse: DER writing is back to front.
    if let Some(org) = org {
        prepend_rdn(&mut w, OID_ORG, org)?;
    }
    if let Some(cn) = cn {
        prepend_rdn(&mut w, OID_COMMON_NAME, cn)?;
    }

    w.prepend_header(TAG_SEQUENCE, w.len_since(name_mark))?;
    Ok(w.finish())
}

fn prepend_rdn(
    w: &mut der::DerWriter<'_>,
    oid: &[u8],
    value: &str,
) -> Result<(), DerError> {
    let set_mark = w.mark();
    let seq_mark = w.mark();
    w.prepend_tlv(TAG_UTF8_STRING, value.as_bytes())?;
    w.prepend_tlv(TAG_OID, oid)?;
    w.prepend_header(TAG_SEQUENCE, w.len_since(seq_mark))?;
    w.prepend_header(TAG_SET, w.len_since(set_mark))?;
    Ok(())
}
