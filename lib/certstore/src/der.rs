// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Just enough DER to read certificates and build certification requests.
//!
//! Reading is a plain TLV cursor. Writing goes backwards, end of the buffer
//! toward the front, so a container's length is known when its header is
//! prepended; the working buffer is caller-supplied and reusable.

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0c;
pub const TAG_PRINTABLE_STRING: u8 = 0x13;
pub const TAG_IA5_STRING: u8 = 0x16;
pub const TAG_UTC_TIME: u8 = 0x17;
pub const TAG_GENERALIZED_TIME: u8 = 0x18;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;
pub const TAG_CONTEXT_0: u8 = 0xa0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DerError {
    Truncated,
    BadLength,
    BadTag { expected: u8, got: u8 },
    BadValue,
    /// An ECDSA signature component exceeded the curve width.
    IntegerTooLarge,
    BufferTooSmall,
}

/// One parsed TLV.
#[derive(Copy, Clone, Debug)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub value: &'a [u8],
}

/// Read the TLV at the head of `buf`, returning it and the remainder.
pub fn read_tlv(buf: &[u8]) -> Result<(Tlv<'_>, &[u8]), DerError> {
    if buf.len() < 2 {
        return Err(DerError::Truncated);
    }
    let tag = buf[0];
    let (len, header) = match buf[1] {
        n @ 0x00..=0x7f => (n as usize, 2),
        0x81 => {
            let n = *buf.get(2).ok_or(DerError::Truncated)? as usize;
            (n, 3)
        }
        0x82 => {
            let hi = *buf.get(2).ok_or(DerError::Truncated)? as usize;
            let lo = *buf.get(3).ok_or(DerError::Truncated)? as usize;
            (hi << 8 | lo, 4)
        }
        _ => return Err(DerError::BadLength),
    };
    let value = buf
        .get(header..header + len)
        .ok_or(DerError::Truncated)?;
    Ok((Tlv { tag, value }, &buf[header + len..]))
}

/// Read a TLV and require its tag.
pub fn expect_tlv(buf: &[u8], tag: u8) -> Result<(&[u8], &[u8]), DerError> {
    let (tlv, rest) = read_tlv(buf)?;
    if tlv.tag != tag {
        return Err(DerError::BadTag {
            expected: tag,
            got: tlv.tag,
        });
    }
    Ok((tlv.value, rest))
}

/// Normalise an element-emitted ECDSA signature to fixed-width `r || s`.
///
/// The element wraps the pair as two DER INTEGERs, optionally inside an
/// outer SEQUENCE, with leading zero pad bytes where the most significant
/// bit is set. Components longer than the curve width after stripping are
/// rejected.
pub fn ecdsa_tlv_to_raw(
    sig: &[u8],
    out: &mut [u8; 64],
) -> Result<(), DerError> {
    // Tolerate both the bare INTEGER pair and a full SEQUENCE wrapper.
    let body = match sig.first() {
        Some(&TAG_SEQUENCE) => {
            let (value, rest) = expect_tlv(sig, TAG_SEQUENCE)?;
            if !rest.is_empty() {
                return Err(DerError::BadValue);
            }
            value
        }
        _ => sig,
    };

    let (r, rest) = expect_tlv(body, TAG_INTEGER)?;
    let (s, rest) = expect_tlv(rest, TAG_INTEGER)?;
    if !rest.is_empty() {
        return Err(DerError::BadValue);
    }

    out.fill(0);
    copy_stripped(r, &mut out[..32])?;
    copy_stripped(s, &mut out[32..])?;
    Ok(())
}

fn copy_stripped(component: &[u8], out: &mut [u8]) -> Result<(), DerError> {
    let mut stripped = component;
    while let Some((&0, rest)) = stripped.split_first() {
        stripped = rest;
    }
    if stripped.len() > out.len() {
        return Err(DerError::IntegerTooLarge);
    }
    let start = out.len() - stripped.len();
    out[start..].copy_from_slice(stripped);
    Ok(())
}

/// Encode a fixed-width `r || s` signature as the DER
/// `SEQUENCE { INTEGER r, INTEGER s }` a certificate or CSR carries.
pub fn ecdsa_raw_to_der(
    raw: &[u8; 64],
    out: &mut [u8],
) -> Result<usize, DerError> {
    // Worst case: two 33-byte integers plus headers.
    let mut tmp = [0u8; 72];
    let mut w = DerWriter::new(&mut tmp);
    let mark = w.mark();
    w.prepend_integer(&raw[32..])?;
    w.prepend_integer(&raw[..32])?;
    w.prepend_header(TAG_SEQUENCE, w.len_since(mark))?;
    let encoded = w.finish();

    if out.len() < encoded.len() {
        return Err(DerError::BufferTooSmall);
    }
    out[..encoded.len()].copy_from_slice(encoded);
    Ok(encoded.len())
}

/// Backwards DER writer: content is prepended, so each container's length
/// is exact when its header goes on. `finish` returns the written tail.
pub struct DerWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> DerWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let pos = buf.len();
        DerWriter { buf, pos }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Position marker for [`Self::len_since`].
    pub fn mark(&self) -> usize {
        self.pos
    }

    /// Bytes written since `mark` — the content length of a container
    /// about to be closed.
    pub fn len_since(&self, mark: usize) -> usize {
        mark - self.pos
    }

    pub fn prepend(&mut self, bytes: &[u8]) -> Result<(), DerError> {
        if bytes.len() > self.pos {
            return Err(DerError::BufferTooSmall);
        }
        self.pos -= bytes.len();
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn prepend_byte(&mut self, byte: u8) -> Result<(), DerError> {
        self.prepend(&[byte])
    }

    /// Prepend a tag and definite length for `content_len` bytes already
    /// written.
    pub fn prepend_header(
        &mut self,
        tag: u8,
        content_len: usize,
    ) -> Result<(), DerError> {
        match content_len {
            0..=0x7f => self.prepend(&[tag, content_len as u8]),
            0x80..=0xff => self.prepend(&[tag, 0x81, content_len as u8]),
            0x100..=0xffff => self.prepend(&[
                tag,
                0x82,
                (content_len >> 8) as u8,
                content_len as u8,
            ]),
            _ => Err(DerError::BadLength),
        }
    }

    /// Prepend a complete TLV.
    pub fn prepend_tlv(
        &mut self,
        tag: u8,
        value: &[u8],
    ) -> Result<(), DerError> {
        self.prepend(value)?;
        self.prepend_header(tag, value.len())
    }

    /// Prepend an INTEGER from unsigned big-endian bytes: leading zeros
    /// stripped, a 0x00 pad added back when the top bit is set.
    pub fn prepend_integer(&mut self, be: &[u8]) -> Result<(), DerError> {
        let mut stripped = be;
        while let Some((&0, rest)) = stripped.split_first() {
            stripped = rest;
        }
        if stripped.is_empty() {
            return self.prepend_tlv(TAG_INTEGER, &[0]);
        }

        let pad = stripped[0] & 0x80 != 0;
        self.prepend(stripped)?;
        if pad {
            self.prepend_byte(0)?;
        }
        self.prepend_header(TAG_INTEGER, stripped.len() + pad as usize)
    }

    /// Prepend a BIT STRING with zero unused bits.
    pub fn prepend_bit_string(
        &mut self,
        value: &[u8],
    ) -> Result<(), DerError> {
        self.prepend(value)?;
        self.prepend_byte(0)?;
        self.prepend_header(TAG_BIT_STRING, value.len() + 1)
    }

    pub fn finish(self) -> &'a [u8] {
        let DerWriter { buf, pos } = self;
        &buf[pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlv_cursor_short_and_long_lengths() {
        let mut buf = vec![0x30, 0x02, 0xaa, 0xbb];
        let (tlv, rest) = read_tlv(&buf).unwrap();
        assert_eq!(tlv.tag, 0x30);
        assert_eq!(tlv.value, &[0xaa, 0xbb]);
        assert!(rest.is_empty());

        buf = vec![0x04, 0x81, 0x03, 1, 2, 3, 0xff];
        let (tlv, rest) = read_tlv(&buf).unwrap();
        assert_eq!(tlv.value, &[1, 2, 3]);
        assert_eq!(rest, &[0xff]);

        let mut long = vec![0x30, 0x82, 0x01, 0x00];
        long.extend(core::iter::repeat(7u8).take(0x100));
        let (tlv, _) = read_tlv(&long).unwrap();
        assert_eq!(tlv.value.len(), 0x100);
    }

    #[test]
    fn truncated_value_detected() {
        assert_eq!(
            read_tlv(&[0x30, 0x05, 1, 2]).unwrap_err(),
            DerError::Truncated
        );
    }

    #[test]
    fn writer_builds_nested_sequence() {
        let mut buf = [0u8; 32];
        let mut w = DerWriter::new(&mut buf);
        let mark = w.mark();
        w.prepend_tlv(TAG_OCTET_STRING, &[9, 9]).unwrap();
        w.prepend_integer(&[0x05]).unwrap();
        w.prepend_header(TAG_SEQUENCE, w.len_since(mark)).unwrap();

        assert_eq!(
            w.finish(),
            &[0x30, 0x07, 0x02, 0x01, 0x05, 0x04, 0x02, 9, 9]
        );
    }

    #[test]
    fn integer_gets_msb_pad() {
        let mut buf = [0u8; 8];
        let mut w = DerWriter::new(&mut buf);
        w.prepend_integer(&[0x80]).unwrap();
        assert_eq!(w.finish(), &[0x02, 0x02, 0x00, 0x80]);
    }

    #[test]
    fn integer_zero() {
        let mut buf = [0u8; 8];
        let mut w = DerWriter::new(&mut buf);
        w.prepend_integer(&[0, 0, 0]).unwrap();
        assert_eq!(w.finish(), &[0x02, 0x01, 0x00]);
    }

    #[test]
    fn tlv_signature_with_pads_normalises() {
        // r = 1 (minimal), s with a legal 0x00 pad for msb=1.
        let sig = [
            0x02, 0x01, 0x01, // r = 1
            0x02, 0x21, 0x00, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xaa,
        ];
        let mut raw = [0u8; 64];
        ecdsa_tlv_to_raw(&sig, &mut raw).unwrap();

        assert_eq!(raw[31], 0x01);
        assert_eq!(&raw[..31], &[0u8; 31]);
        assert_eq!(raw[32], 0x80);
        assert_eq!(raw[63], 0xaa);
    }

    #[test]
    fn oversize_component_rejected() {
        // 33 significant bytes.
        let mut sig = vec![0x02, 0x21];
        sig.push(0x01);
        sig.extend_from_slice(&[0u8; 32]);
        sig.extend_from_slice(&[0x02, 0x01, 0x01]);
        let mut raw = [0u8; 64];
        assert_eq!(
            ecdsa_tlv_to_raw(&sig, &mut raw).unwrap_err(),
            DerError::IntegerTooLarge
        );
    }

    use proptest::prelude::*;

    proptest! {
        // Any legal padding on either component normalises to the same
        // canonical 64-byte form.
        #[test]
        fn tlv_to_raw_is_canonical(
            r in proptest::collection::vec(any::<u8>(), 1..=32),
            s in proptest::collection::vec(any::<u8>(), 1..=32),
            r_pad in 0usize..3,
            s_pad in 0usize..3,
        ) {
            let encode = |v: &[u8], pad: usize| {
                let mut body = vec![0u8; pad];
                body.extend_from_slice(v);
                let mut tlv = vec![TAG_INTEGER, body.len() as u8];
                tlv.extend_from_slice(&body);
                tlv
            };

            let mut sig = encode(&r, r_pad);
            sig.extend_from_slice(&encode(&s, s_pad));

            let mut raw = [0u8; 64];
            ecdsa_tlv_to_raw(&sig, &mut raw).unwrap();
            prop_assert_eq!(raw.len(), 64);

            let canon = |v: &[u8]| {
                let mut out = [0u8; 32];
                let stripped: Vec<u8> =
                    v.iter().copied().skip_while(|b| *b == 0).collect();
                out[32 - stripped.len()..].copy_from_slice(&stripped);
                out
            };
            prop_assert_eq!(&raw[..32], &canon(&r)[..]);
            prop_assert_eq!(&raw[32..], &canon(&s)[..]);
        }
    }

    #[test]
    fn raw_to_der_and_back() {
        let mut raw = [0u8; 64];
        raw[0] = 0x80; // forces a pad on r
        raw[31] = 0x01;
        raw[63] = 0x02;

        let mut der = [0u8; 80];
        let n = ecdsa_raw_to_der(&raw, &mut der).unwrap();

        let mut round = [0u8; 64];
        ecdsa_tlv_to_raw(&der[..n], &mut round).unwrap();
        assert_eq!(round, raw);
    }
}
