// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PKCS#10 certification requests over a slot-resident key.
//!
//! The builder never sees the private key: the caller generates the pair
//! in the element, hands over the public point, and signs the request-info
//! digest through whatever path it owns. Every buffer is caller-supplied
//! and bounded, so the path works unchanged on a heap fragmented by a
//! prior TLS session.
//!
//! Assembly is three steps so the element lock can be held across exactly
//! the operations that need it:
//!
//! 1. [`encode_request_info`] — the CertificationRequestInfo DER,
//! 2. [`request_digest`] — SHA-256 of it, signed by the key slot,
//! 3. [`assemble`] — wrap info, algorithm, and signature into the CSR.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::string::String;
use lib_certstore::der::{
    ecdsa_raw_to_der, DerError, DerWriter, TAG_CONTEXT_0, TAG_OID,
    TAG_SEQUENCE,
};
use lib_certstore::pem;
use lib_certstore::x509::{
    encode_name, OID_ECDSA_WITH_SHA256, OID_EC_PUBLIC_KEY, OID_PRIME256V1,
};
use sha2::{Digest, Sha256};

/// Enough for a P-256 request with the longest subject the parser accepts.
pub const MAX_CSR_SIZE: usize = 768;

/// Longest accepted subject attribute value.
pub const MAX_ATTRIBUTE_LEN: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CsrError {
    Der(DerError),
    /// Subject string did not parse as `CN=...,O=...`.
    BadSubject,
    /// A subject attribute exceeds [`MAX_ATTRIBUTE_LEN`].
    AttributeTooLong,
    /// A subject with neither CN nor O.
    EmptySubject,
}

impl From<DerError> for CsrError {
    fn from(e: DerError) -> Self {
        CsrError::Der(e)
    }
}

/// Request subject. Either attribute may be absent, not both.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Subject<'a> {
    pub cn: Option<&'a str>,
    pub org: Option<&'a str>,
}

impl<'a> Subject<'a> {
    pub fn common_name(cn: &'a str) -> Self {
        Subject {
            cn: Some(cn),
            org: None,
        }
    }

    /// Parse an operator-supplied `CN=...,O=...` string. Attribute order
    /// is free; unknown attributes are rejected.
    pub fn parse(s: &'a str) -> Result<Self, CsrError> {
        let mut subject = Subject::default();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (attr, value) =
                part.split_once('=').ok_or(CsrError::BadSubject)?;
            let value = value.trim();
            if value.len() > MAX_ATTRIBUTE_LEN {
                return Err(CsrError::AttributeTooLong);
            }
            match attr.trim() {
                "CN" => subject.cn = Some(value),
                "O" => subject.org = Some(value),
                _ => return Err(CsrError::BadSubject),
            }
        }
        if subject.cn.is_none() && subject.org.is_none() {
            return Err(CsrError::EmptySubject);
        }
        Ok(subject)
    }
}

/// Encode the CertificationRequestInfo: version 0, subject, a P-256
/// SubjectPublicKeyInfo, and the empty attributes set.
pub fn encode_request_info<'a>(
    subject: &Subject<'_>,
    public_point: &[u8; 65],
    buf: &'a mut [u8],
) -> Result<&'a [u8], CsrError> {
    for value in [subject.cn, subject.org].into_iter().flatten() {
        if value.len() > MAX_ATTRIBUTE_LEN {
            return Err(CsrError::AttributeTooLong);
        }
    }

    let mut w = DerWriter::new(buf);
    let cri_mark = w.mark();

    // attributes [0] — present and empty.
    w.prepend_header(TAG_CONTEXT_0, 0)?;

    // subjectPKInfo.
    let spki_mark = w.mark();
    w.prepend_bit_string(public_point)?;
    let alg_mark = w.mark();
    w.prepend_tlv(TAG_OID, OID_PRIME256V1)?;
    w.prepend_tlv(TAG_OID, OID_EC_PUBLIC_KEY)?;
    w.prepend_header(TAG_SEQUENCE, w.len_since(alg_mark))?;
    w.prepend_header(TAG_SEQUENCE, w.len_since(spki_mark))?;

    // subject Name.
    let mut name_buf = [0u8; 2 * MAX_ATTRIBUTE_LEN + 32];
    let name = encode_name(subject.cn, subject.org, &mut name_buf)?;
    w.prepend(name)?;

    // version 0.
    w.prepend_integer(&[0])?;

    w.prepend_header(TAG_SEQUENCE, w.len_since(cri_mark))?;
    Ok(w.finish())
}

/// The digest the key slot signs.
pub fn request_digest(request_info: &[u8]) -> [u8; 32] {
    Sha256::digest(request_info).into()
}

/// Wrap a request info and its raw `r || s` signature into the final CSR.
pub fn assemble<'a>(
    request_info: &[u8],
    raw_signature: &[u8; 64],
    buf: &'a mut [u8],
) -> Result<&'a [u8], CsrError> {
    let mut sig_der = [0u8; 80];
    let sig_len = ecdsa_raw_to_der(raw_signature, &mut sig_der)?;

    let mut w = DerWriter::new(buf);
    let csr_mark = w.mark();
    w.prepend_bit_string(&sig_der[..sig_len])?;
    let alg_mark = w.mark();
    w.prepend_tlv(TAG_OID, OID_ECDSA_WITH_SHA256)?;
    w.prepend_header(TAG_SEQUENCE, w.len_since(alg_mark))?;
    w.prepend(request_info)?;
    w.prepend_header(TAG_SEQUENCE, w.len_since(csr_mark))?;
    Ok(w.finish())
}

/// PEM-armour a CSR.
pub fn to_pem(csr_der: &[u8]) -> String {
    pem::der_to_pem(csr_der, pem::CERTIFICATE_REQUEST_LABEL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_certstore::der::{expect_tlv, read_tlv, TAG_INTEGER};
    use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
    use p256::ecdsa::{Signature, SigningKey};

    fn test_key() -> SigningKey {
        SigningKey::from_bytes(p256::FieldBytes::from_slice(&[0x42u8; 32]))
            .unwrap()
    }

    #[test]
    fn subject_parsing() {
        let s = Subject::parse("CN=device-1,O=edge").unwrap();
        assert_eq!(s.cn, Some("device-1"));
        assert_eq!(s.org, Some("edge"));

        let s = Subject::parse("O=edge").unwrap();
        assert_eq!(s.cn, None);
        assert_eq!(s.org, Some("edge"));

        let s = Subject::parse(" CN = spaced ").unwrap();
        assert_eq!(s.cn, Some("spaced"));

        assert_eq!(Subject::parse("X=nope").unwrap_err(), CsrError::BadSubject);
        assert_eq!(Subject::parse("CN").unwrap_err(), CsrError::BadSubject);
        assert_eq!(Subject::parse("").unwrap_err(), CsrError::EmptySubject);
    }

    #[test]
    fn request_info_structure() {
        let key = test_key();
        let point: [u8; 65] = key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .try_into()
            .unwrap();

        let mut buf = [0u8; MAX_CSR_SIZE];
        let cri = encode_request_info(
            &Subject::parse("CN=abc,O=def").unwrap(),
            &point,
            &mut buf,
        )
        .unwrap();

        let (body, rest) = expect_tlv(cri, TAG_SEQUENCE).unwrap();
        assert!(rest.is_empty());

        // version INTEGER 0.
        let (version, rest) = expect_tlv(body, TAG_INTEGER).unwrap();
        assert_eq!(version, &[0]);

        // subject Name, then SPKI, then empty [0] attributes.
        let (_name, rest) = expect_tlv(rest, TAG_SEQUENCE).unwrap();
        let (_spki, rest) = expect_tlv(rest, TAG_SEQUENCE).unwrap();
        let (attrs, rest) = expect_tlv(rest, TAG_CONTEXT_0).unwrap();
        assert!(attrs.is_empty());
        assert!(rest.is_empty());
    }

    #[test]
    fn full_request_verifies() {
        let key = test_key();
        let point: [u8; 65] = key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .try_into()
            .unwrap();

        let mut cri_buf = [0u8; MAX_CSR_SIZE];
        let cri = encode_request_info(
            &Subject::common_name("round-trip"),
            &point,
            &mut cri_buf,
        )
        .unwrap();

        let digest = request_digest(cri);
        let sig: Signature = key.sign_prehash(&digest).unwrap();
        let raw: [u8; 64] =
            sig.to_bytes().as_slice().try_into().unwrap();

        let mut csr_buf = [0u8; MAX_CSR_SIZE];
        let csr = assemble(cri, &raw, &mut csr_buf).unwrap();

        // Walk the CSR: the embedded request info must be byte-identical,
        // and the signature must verify over its digest.
        let (body, _) = expect_tlv(csr, TAG_SEQUENCE).unwrap();
        let (info_tlv, rest) = read_tlv(body).unwrap();
        assert_eq!(info_tlv.tag, TAG_SEQUENCE);
        let info_len = body.len() - rest.len();
        assert_eq!(&body[..info_len], cri);

        let (_alg, rest2) = expect_tlv(rest, TAG_SEQUENCE).unwrap();
        let (sig_bits, _) =
            expect_tlv(rest2, lib_certstore::der::TAG_BIT_STRING).unwrap();
        assert_eq!(sig_bits[0], 0);

        let mut raw_rt = [0u8; 64];
        lib_certstore::der::ecdsa_tlv_to_raw(&sig_bits[1..], &mut raw_rt)
            .unwrap();
        let sig_rt = Signature::from_slice(&raw_rt).unwrap();
        key.verifying_key().verify_prehash(&digest, &sig_rt).unwrap();
    }

    #[test]
    fn pem_armour() {
        let der = [0x30u8, 0x03, 0x02, 0x01, 0x00];
        let pem = to_pem(&der);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert_eq!(lib_certstore::pem::pem_to_der(&pem).unwrap(), der);
    }

    #[test]
    fn oversize_attribute_rejected() {
        let long = "x".repeat(MAX_ATTRIBUTE_LEN + 1);
        let s = format!("CN={long}");
        assert_eq!(
            Subject::parse(&s).unwrap_err(),
            CsrError::AttributeTooLong
        );
    }

    #[test]
    fn buffers_are_reusable() {
        let key = test_key();
        let point: [u8; 65] = key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .try_into()
            .unwrap();

        let mut buf = [0u8; MAX_CSR_SIZE];
        let first = encode_request_info(
            &Subject::common_name("one"),
            &point,
            &mut buf,
        )
        .unwrap()
        .to_vec();
        let second = encode_request_info(
            &Subject::common_name("one"),
            &point,
            &mut buf,
        )
        .unwrap()
        .to_vec();
        assert_eq!(first, second);
    }
}
