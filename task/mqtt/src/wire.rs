// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outbound payload framing. Everything leaving the device is JSON; the
//! only non-JSON traffic in the system is the tolerated raw-DER install
//! on the inbound certificate topic.

use serde_json::json;

/// `{"uid": "...", "csr": "-----BEGIN CERTIFICATE REQUEST-----..."}`
pub fn csr_body(uid_hex: &str, pem: &str) -> Vec<u8> {
    body(json!({ "uid": uid_hex, "csr": pem }))
}

/// Ask whether the platform holds a certificate for this device.
pub fn check_certificate_body(uid_hex: &str) -> Vec<u8> {
    body(json!({ "uid": uid_hex, "request": "check_certificate" }))
}

pub fn status_body(uid_hex: &str, status: &str) -> Vec<u8> {
    body(json!({ "uid": uid_hex, "status": status }))
}

pub fn ack_body(command: &str, ok: bool) -> Vec<u8> {
    body(json!({
        "command": command,
        "status": if ok { "success" } else { "error" },
    }))
}

pub fn telemetry_body(uid_hex: &str, sequence: u32) -> Vec<u8> {
    body(json!({ "uid": uid_hex, "seq": sequence }))
}

fn body(value: serde_json::Value) -> Vec<u8> {
    // Serialising a Value built from literals cannot fail.
    serde_json::to_vec(&value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csr_body_shape() {
        let body = csr_body("0102abcd", "-----BEGIN CERTIFICATE REQUEST-----\nAA\n-----END CERTIFICATE REQUEST-----\n");
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["uid"], "0102abcd");
        assert!(v["csr"]
            .as_str()
            .unwrap()
            .starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
    }

    #[test]
    fn ack_body_status() {
        let v: serde_json::Value =
            serde_json::from_slice(&ack_body("protected_update", true))
                .unwrap();
        assert_eq!(v["status"], "success");
        let v: serde_json::Value =
            serde_json::from_slice(&ack_body("protected_update", false))
                .unwrap();
        assert_eq!(v["status"], "error");
    }

    #[test]
    fn check_request_names_the_device() {
        let v: serde_json::Value =
            serde_json::from_slice(&check_certificate_body("ff00")).unwrap();
        assert_eq!(v["uid"], "ff00");
        assert_eq!(v["request"], "check_certificate");
    }
}
