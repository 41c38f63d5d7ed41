// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for debugging tasks and drivers
//!
//! This contains an implementation for a static ring buffer designed to be
//! used to instrument arbitrary contexts. While there is nothing to prevent
//! these ring buffers from being left in production code, the design center
//! is primarily around debugging in development: entries can be inspected
//! from a debugger or, in host builds, read back programmatically from tests.
//!
//! The type recorded in a ring buffer must implement [`Copy`] and
//! [`PartialEq`]; consecutive duplicate entries are collapsed into a single
//! entry with a count.
//!
//! Ring buffers are declared with the [`ringbuf!`] macro, providing the type
//! of the per-entry payload, the number of entries, and a static initializer:
//!
//! ```ignore
//! ringbuf!(Trace, 16, Trace::None);
//! ```
//!
//! Entries are recorded with [`ringbuf_entry!`]:
//!
//! ```ignore
//! ringbuf_entry!(Trace::Startup);
//! ```
//!
//! If you use the variant of `ringbuf!` that leaves the name of the data
//! structure implicit, you can only have one per module; provide a name to
//! lift this constraint.

#![cfg_attr(not(test), no_std)]

use spin::Mutex;

/// A single entry in a ring buffer.
///
/// `line` is the source line that recorded the entry; `count` is the number
/// of consecutive times the identical payload was recorded from that line.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

#[derive(Debug)]
struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

/// The static wrapper declared by [`ringbuf!`].
///
/// Entries may be recorded from several threads, so the buffer sits behind
/// a spin mutex held only for the length of one record.
pub struct StaticRingbuf<T: Copy + PartialEq, const N: usize> {
    inner: Mutex<Ringbuf<T, N>>,
}

impl<T: Copy + PartialEq, const N: usize> StaticRingbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            inner: Mutex::new(Ringbuf {
                last: None,
                buffer: [RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: init,
                }; N],
            }),
        }
    }

    pub fn record(&self, line: u16, payload: T) {
        let mut rb = self.inner.lock();

        // Collapse a repeat of the most recent entry into its count.
        if let Some(last) = rb.last {
            let ent = &mut rb.buffer[last];
            if ent.line == line && ent.payload == payload {
                ent.count = ent.count.wrapping_add(1);
                return;
            }
        }

        let ndx = match rb.last {
            None => 0,
            Some(last) if last + 1 < N => last + 1,
            Some(_) => 0,
        };

        let generation = rb.buffer[ndx].generation.wrapping_add(1);
        rb.buffer[ndx] = RingbufEntry {
            line,
            generation,
            count: 1,
            payload,
        };
        rb.last = Some(ndx);
    }

    /// The most recently recorded entry, if any entry has been recorded.
    pub fn last_entry(&self) -> Option<RingbufEntry<T>> {
        let rb = self.inner.lock();
        rb.last.map(|ndx| rb.buffer[ndx])
    }

    /// Visit every recorded entry, oldest first.
    pub fn for_each(&self, mut f: impl FnMut(&RingbufEntry<T>)) {
        let rb = self.inner.lock();
        let Some(last) = rb.last else {
            return;
        };
        for i in 0..N {
            let ndx = (last + 1 + i) % N;
            let ent = &rb.buffer[ndx];
            if ent.count != 0 {
                f(ent);
            }
        }
    }

    /// Count of distinct recorded entries currently resident.
    pub fn len(&self) -> usize {
        let mut n = 0;
        self.for_each(|_| n += 1);
        n
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().last.is_none()
    }
}

/// Declares a ring buffer of the given payload type, size, and initializer.
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        static $name: $crate::StaticRingbuf<$t, $n> =
            $crate::StaticRingbuf::new($init);
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

/// Records an entry in a ring buffer declared with [`ringbuf!`].
#[macro_export]
macro_rules! ringbuf_entry {
    ($name:ident, $payload:expr) => {{
        #[cfg(not(feature = "disabled"))]
        $name.record(line!() as u16, $payload);
        #[cfg(feature = "disabled")]
        let _ = &$payload;
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}
