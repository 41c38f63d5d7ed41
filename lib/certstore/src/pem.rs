// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RFC 7468 textual encoding, 64-column body lines.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

pub const CERTIFICATE_LABEL: &str = "CERTIFICATE";
pub const CERTIFICATE_REQUEST_LABEL: &str = "CERTIFICATE REQUEST";

const LINE_WIDTH: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PemError {
    MissingBegin,
    MissingEnd,
    /// BEGIN and END lines carry different labels.
    LabelMismatch,
    Base64,
}

/// Encode DER as PEM under the given label.
pub fn der_to_pem(der: &[u8], label: &str) -> String {
    let body = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in body.as_bytes().chunks(LINE_WIDTH) {
        // Chunks of an ASCII string are ASCII.
        if let Ok(line) = core::str::from_utf8(chunk) {
            out.push_str(line);
        }
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

/// Decode PEM text back to DER, tolerating surrounding noise and any line
/// wrapping inside the body.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>, PemError> {
    let begin = pem.find("-----BEGIN ").ok_or(PemError::MissingBegin)?;
    let after_begin = &pem[begin + "-----BEGIN ".len()..];
    let label_end = after_begin.find("-----").ok_or(PemError::MissingBegin)?;
    let label = &after_begin[..label_end];
    let body_start = &after_begin[label_end + 5..];

    let end_marker = format!("-----END {label}-----");
    let end = body_start.find("-----END ").ok_or(PemError::MissingEnd)?;
    if !body_start[end..].starts_with(&end_marker) {
        return Err(PemError::LabelMismatch);
    }

    let mut body = String::new();
    for line in body_start[..end].lines() {
        body.push_str(line.trim());
    }

    STANDARD.decode(body).map_err(|_| PemError::Base64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encode_shape() {
        let der = vec![0u8; 100];
        let pem = der_to_pem(&der, CERTIFICATE_LABEL);

        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        for line in pem.lines() {
            assert!(line.len() <= 64 || line.starts_with("-----"));
        }
    }

    #[test]
    fn label_mismatch_detected() {
        let pem = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE REQUEST-----\n";
        // END for a different label: the matching END never appears.
        assert_eq!(pem_to_der(pem).unwrap_err(), PemError::LabelMismatch);
    }

    #[test]
    fn surrounding_noise_tolerated() {
        let der = vec![1u8, 2, 3, 4, 5];
        let pem = format!(
            "subject: something\n{}trailing noise",
            der_to_pem(&der, CERTIFICATE_REQUEST_LABEL)
        );
        assert_eq!(pem_to_der(&pem).unwrap(), der);
    }

    #[test]
    fn missing_markers() {
        assert_eq!(pem_to_der("AAAA").unwrap_err(), PemError::MissingBegin);
        assert_eq!(
            pem_to_der("-----BEGIN CERTIFICATE-----\nAAAA\n").unwrap_err(),
            PemError::MissingEnd
        );
    }

    proptest! {
        #[test]
        fn round_trip_any_bytes(der in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let pem = der_to_pem(&der, CERTIFICATE_LABEL);
            prop_assert_eq!(pem_to_der(&pem).unwrap(), der);
        }
    }
}
