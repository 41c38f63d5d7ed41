// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-entry guard for renewal workflows.
//!
//! At most one certificate-renewal workflow may run at a time, whichever
//! flavor it is; a second request must see who holds the slot and report
//! busy rather than interleave element traffic with the first. The token is
//! RAII: dropping it reopens the slot.

#![cfg_attr(not(test), no_std)]

use spin::Mutex;

/// The workflows that contend for the single renewal slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkflowKind {
    /// Key generation plus certification request.
    CsrRenewal,
    /// Signed-bundle protected update.
    ProtectedUpdate,
}

#[derive(Debug)]
pub struct WorkflowLock {
    current: Mutex<Option<WorkflowKind>>,
}

impl WorkflowLock {
    pub const fn new() -> Self {
        WorkflowLock {
            current: Mutex::new(None),
        }
    }

    /// Claim the renewal slot. On contention, returns the kind currently
    /// holding it.
    pub fn begin(
        &self,
        kind: WorkflowKind,
    ) -> Result<WorkflowToken<'_>, WorkflowKind> {
        let mut current = self.current.lock();
        match *current {
            Some(holder) => Err(holder),
            None => {
                *current = Some(kind);
                Ok(WorkflowToken { lock: self, kind })
            }
        }
    }

    /// The workflow currently holding the slot, if any.
    pub fn holder(&self) -> Option<WorkflowKind> {
        *self.current.lock()
    }
}

impl Default for WorkflowLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of exclusive renewal access; release is on drop.
#[derive(Debug)]
pub struct WorkflowToken<'a> {
    lock: &'a WorkflowLock,
    kind: WorkflowKind,
}

impl WorkflowToken<'_> {
    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }
}

impl Drop for WorkflowToken<'_> {
    fn drop(&mut self) {
        *self.lock.current.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn second_workflow_sees_holder() {
        let lock = WorkflowLock::new();

        let token = lock.begin(WorkflowKind::CsrRenewal).unwrap();
        assert_eq!(
            lock.begin(WorkflowKind::ProtectedUpdate).unwrap_err(),
            WorkflowKind::CsrRenewal
        );
        assert_eq!(lock.holder(), Some(WorkflowKind::CsrRenewal));

        drop(token);
        assert_eq!(lock.holder(), None);
        lock.begin(WorkflowKind::ProtectedUpdate).unwrap();
    }

    #[test]
    fn same_kind_still_conflicts() {
        let lock = WorkflowLock::new();
        let _token = lock.begin(WorkflowKind::ProtectedUpdate).unwrap();
        assert!(lock.begin(WorkflowKind::ProtectedUpdate).is_err());
    }

    #[test]
    fn contended_from_threads() {
        let lock = Arc::new(WorkflowLock::new());
        let mut handles = Vec::new();
        let wins = Arc::new(std::sync::atomic::AtomicU32::new(0));

        for _ in 0..8 {
            let lock = lock.clone();
            let wins = wins.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    if let Ok(token) = lock.begin(WorkflowKind::CsrRenewal) {
                        // Exactly one holder at a time; re-entry must fail
                        // while we hold the token.
                        assert!(lock.begin(WorkflowKind::CsrRenewal).is_err());
                        wins.fetch_add(
                            1,
                            std::sync::atomic::Ordering::Relaxed,
                        );
                        drop(token);
                    }
                    std::hint::spin_loop();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert!(wins.load(std::sync::atomic::Ordering::Relaxed) > 0);
        assert_eq!(lock.holder(), None);
    }
}
