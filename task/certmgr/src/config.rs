// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Certificate manager configuration. Compiled in or injected by the
//! integration; there is no file or environment parsing on the device.

use drv_secel_api::KeyUsage;
use task_certmgr_api::RenewalPolicy;

#[derive(Clone, Debug)]
pub struct CertMgrConfig {
    /// When a renewal is triggered without the operator asking.
    pub renewal: RenewalPolicy,
    /// Key handle registered with the TLS stack for the device identity.
    pub tls_key_id: u32,
    /// Usage bits for freshly generated device keys.
    pub key_usage: KeyUsage,
    /// One retry, after this many milliseconds, when the trust-path
    /// certificate parser cannot get memory.
    pub parse_retry_ms: u64,
}

impl Default for CertMgrConfig {
    fn default() -> Self {
        CertMgrConfig {
            renewal: RenewalPolicy::OperatorInitiated,
            tls_key_id: 1,
            key_usage: KeyUsage::SIGN | KeyUsage::AUTH,
            parse_retry_ms: 20,
        }
    }
}
