// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test-support certificate generation.
//!
//! Builds real, verifiable ECDSA-P256 certificates with the same DER writer
//! the firmware uses for certification requests. This stands in for the
//! platform CA in tests; production devices only ever consume certificates.

use lib_certstore::der::{
    ecdsa_raw_to_der, DerError, DerWriter, TAG_CONTEXT_0, TAG_OID,
    TAG_SEQUENCE, TAG_UTC_TIME,
};
use lib_certstore::time::UtcTime;
use lib_certstore::x509::{
    encode_name, OID_ECDSA_WITH_SHA256, OID_EC_PUBLIC_KEY, OID_PRIME256V1,
};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CertGenError {
    Der(DerError),
    /// UTCTime only reaches 2049.
    YearOutOfRange,
    Signing,
}

impl From<DerError> for CertGenError {
    fn from(e: DerError) -> Self {
        CertGenError::Der(e)
    }
}

pub struct CertParams<'a> {
    pub serial: &'a [u8],
    pub issuer_cn: &'a str,
    pub subject_cn: &'a str,
    pub org: Option<&'a str>,
    pub not_before: UtcTime,
    pub not_after: UtcTime,
}

/// Render a timestamp as UTCTime bytes.
pub fn utc_bytes(t: UtcTime) -> Result<[u8; 13], CertGenError> {
    if !(1950..=2049).contains(&t.year) {
        return Err(CertGenError::YearOutOfRange);
    }
    let yy = (t.year % 100) as u8;
    let mut out = [0u8; 13];
    let mut push = |i: usize, v: u8| {
        out[i] = b'0' + v / 10;
        out[i + 1] = b'0' + v % 10;
    };
    push(0, yy);
    push(2, t.month);
    push(4, t.day);
    push(6, t.hour);
    push(8, t.minute);
    push(10, t.second);
    out[12] = b'Z';
    Ok(out)
}

/// Build and sign a certificate over `subject_public`, issued under
/// `issuer_key`.
pub fn generate(
    params: &CertParams<'_>,
    subject_public: &VerifyingKey,
    issuer_key: &SigningKey,
) -> Result<Vec<u8>, CertGenError> {
    let mut tbs_buf = [0u8; 1024];
    let tbs = encode_tbs(params, subject_public, &mut tbs_buf)?;

    let digest: [u8; 32] = Sha256::digest(tbs).into();
    let sig: Signature = issuer_key
        .sign_prehash(&digest)
        .map_err(|_| CertGenError::Signing)?;
    let raw: [u8; 64] = sig
        .to_bytes()
        .as_slice()
        .try_into()
        .map_err(|_| CertGenError::Signing)?;

    let mut sig_der = [0u8; 80];
    let sig_len = ecdsa_raw_to_der(&raw, &mut sig_der)?;

    let mut buf = [0u8; 1200];
    let mut w = DerWriter::new(&mut buf);
    let cert_mark = w.mark();
    w.prepend_bit_string(&sig_der[..sig_len])?;
    prepend_sig_alg(&mut w)?;
    w.prepend(tbs)?;
    w.prepend_header(TAG_SEQUENCE, w.len_since(cert_mark))?;
    Ok(w.finish().to_vec())
}

fn encode_tbs<'a>(
    params: &CertParams<'_>,
    subject_public: &VerifyingKey,
    buf: &'a mut [u8],
) -> Result<&'a [u8], CertGenError> {
    let not_before = utc_bytes(params.not_before)?;
    let not_after = utc_bytes(params.not_after)?;
    let point = subject_public.to_encoded_point(false);

    let mut w = DerWriter::new(buf);
    let tbs_mark = w.mark();

    // subjectPublicKeyInfo.
    let spki_mark = w.mark();
    w.prepend_bit_string(point.as_bytes())?;
    let alg_mark = w.mark();
    w.prepend_tlv(TAG_OID, OID_PRIME256V1)?;
    w.prepend_tlv(TAG_OID, OID_EC_PUBLIC_KEY)?;
    w.prepend_header(TAG_SEQUENCE, w.len_since(alg_mark))?;
    w.prepend_header(TAG_SEQUENCE, w.len_since(spki_mark))?;

    // subject.
    let mut name_buf = [0u8; 256];
    let subject =
        encode_name(Some(params.subject_cn), params.org, &mut name_buf)?;
    w.prepend(subject)?;

    // validity.
    let val_mark = w.mark();
    w.prepend_tlv(TAG_UTC_TIME, &not_after)?;
    w.prepend_tlv(TAG_UTC_TIME, &not_before)?;
    w.prepend_header(TAG_SEQUENCE, w.len_since(val_mark))?;

    // issuer.
    let mut issuer_buf = [0u8; 256];
    let issuer = encode_name(Some(params.issuer_cn), None, &mut issuer_buf)?;
    w.prepend(issuer)?;

    // signature AlgorithmIdentifier.
    prepend_sig_alg(&mut w)?;

    // serialNumber.
    w.prepend_integer(params.serial)?;

    // [0] EXPLICIT version v3.
    let v_mark = w.mark();
    w.prepend_integer(&[0x02])?;
    w.prepend_header(TAG_CONTEXT_0, w.len_since(v_mark))?;

    w.prepend_header(TAG_SEQUENCE, w.len_since(tbs_mark))?;
    Ok(w.finish())
}

fn prepend_sig_alg(w: &mut DerWriter<'_>) -> Result<(), DerError> {
    let mark = w.mark();
    w.prepend_tlv(TAG_OID, OID_ECDSA_WITH_SHA256)?;
    w.prepend_header(TAG_SEQUENCE, w.len_since(mark))?;
    Ok(())
}
