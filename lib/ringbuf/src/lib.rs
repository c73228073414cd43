// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing the conversion firmware
//!
//! This contains an implementation for a static ring buffer designed to be
//! used to instrument arbitrary contexts, including interrupt handlers and
//! fault handlers. Each entry records the source line that produced it, a
//! generation number that tells you how many times its slot has been reused,
//! and a count of identical consecutive entries, so that a tight loop doesn't
//! flush everything interesting out of the buffer.
//!
//! Buffers are plain statics, so they can be read out of a halted target with
//! GDB:
//!
//! ```console
//! (gdb) print kern::conversion::__RINGBUF
//! ```
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module. (You can lift
//! this constraint by providing a name.)
//!
//! Every insertion happens inside `critical_section::with`, so the final
//! binary must link a `critical-section` implementation. Host tests enable the
//! `std` feature of that crate.
//!
//! ## Creating a ring buffer
//!
//! ```ignore
//! #[derive(Copy, Clone, PartialEq)]
//! enum Trace {
//!     None,
//!     Overrun(u8),
//! }
//!
//! ringbuf!(Trace, 16, Trace::None);
//!
//! ringbuf_entry!(Trace::Overrun(2));
//! ```
//!
//! You can also provide a name for the ring buffer, to distinguish between
//! them if you have more than one:
//!
//! ```ignore
//! ringbuf!(FAULT_RINGBUF, u32, 4, 0);
//!
//! ringbuf_entry!(FAULT_RINGBUF, cfsr);
//! ```

#![cfg_attr(not(test), no_std)]

use core::cell::RefCell;
use critical_section::Mutex;

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// The resulting ringbuffer will be static, so `NAME` should be uppercase.
/// Its type is [`StaticRingbuf<T, N>`].
///
/// To support the common case of having one quickly-installed ringbuffer per
/// module, if you omit the name, it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::StaticRingbuf<$t, $n> =
            $crate::StaticRingbuf::new($init);
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// `ringbuf_entry!(NAME, expr)` will insert `expr` into the ringbuffer called
/// `NAME`.
///
/// If you declared your ringbuffer without a name, you can also use this
/// without a name, and it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both buf and payload, without letting them access each
        // other, by evaluating them in a tuple where each cannot
        // accidentally use the other's binding.
        let (p, buf) = ($payload, &$buf);
        $crate::StaticRingbuf::entry(buf, line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of
/// arbitrary type. When a ring buffer entry is generated with an identical
/// payload to the most recent entry (in terms of both `line` and `payload`),
/// `count` will be incremented rather than generating a new entry.
///
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of parametrized type and size. This is the unsynchronized
/// core; statics use [`StaticRingbuf`] via the [`ringbuf!`] macro.
///
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // A fresh buffer has no last entry. Treating that as an out-of-range
        // index means the lookup below finds nothing and the first entry
        // lands in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Only reuse this entry if we don't overflow the count.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // Compare-and-reset rather than remainder: our targets have no
        // hardware divide, and this also turns usize::MAX into 0.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let Some(ent) = self.buffer.get_mut(ndx) else {
            // Only possible for a zero-length buffer.
            return;
        };
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Most recently written entry, if any.
    pub fn latest(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|i| self.buffer.get(i))
    }

    /// Visits the populated entries from oldest to newest.
    pub fn for_each(&self, mut f: impl FnMut(&RingbufEntry<T>)) {
        let Some(last) = self.last else {
            return;
        };
        let start = last.wrapping_add(1);
        for i in 0..N {
            let ndx = if start + i >= N { start + i - N } else { start + i };
            let ent = &self.buffer[ndx];
            if ent.count != 0 {
                f(ent);
            }
        }
    }
}

/// A [`Ringbuf`] that can live in a `static` and be written from any
/// context, interrupts included.
pub struct StaticRingbuf<T: Copy + PartialEq, const N: usize> {
    inner: Mutex<RefCell<Ringbuf<T, N>>>,
}

impl<T: Copy + PartialEq, const N: usize> StaticRingbuf<T, { N }> {
    pub const fn new(init: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Ringbuf::new(init))),
        }
    }

    pub fn entry(&self, line: u16, payload: T) {
        critical_section::with(|cs| {
            self.inner.borrow_ref_mut(cs).entry(line, payload)
        });
    }

    /// Runs `f` with exclusive access to the underlying buffer.
    pub fn with<R>(&self, f: impl FnOnce(&Ringbuf<T, N>) -> R) -> R {
        critical_section::with(|cs| f(&self.inner.borrow_ref(cs)))
    }

    /// Copy of the most recently written entry, if any.
    pub fn latest(&self) -> Option<RingbufEntry<T>> {
        self.with(|rb| rb.latest().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq)]
    enum Trace {
        None,
        Tick(u8),
    }

    #[test]
    fn first_entry_lands_in_slot_zero() {
        let mut rb = Ringbuf::<Trace, 4>::new(Trace::None);
        assert!(rb.latest().is_none());
        rb.entry(10, Trace::Tick(1));
        assert_eq!(rb.last, Some(0));
        assert_eq!(
            rb.buffer[0],
            RingbufEntry {
                line: 10,
                generation: 1,
                count: 1,
                payload: Trace::Tick(1),
            }
        );
    }

    #[test]
    fn identical_entries_are_counted() {
        let mut rb = Ringbuf::<Trace, 4>::new(Trace::None);
        rb.entry(10, Trace::Tick(1));
        rb.entry(10, Trace::Tick(1));
        rb.entry(10, Trace::Tick(1));
        assert_eq!(rb.last, Some(0));
        assert_eq!(rb.buffer[0].count, 3);

        // Same payload from a different line is a new entry.
        rb.entry(11, Trace::Tick(1));
        assert_eq!(rb.last, Some(1));
        assert_eq!(rb.buffer[1].count, 1);
    }

    #[test]
    fn wraps_and_bumps_generation() {
        let mut rb = Ringbuf::<Trace, 3>::new(Trace::None);
        for i in 0..5 {
            rb.entry(1, Trace::Tick(i));
        }
        assert_eq!(rb.last, Some(1));
        assert_eq!(rb.buffer[0].generation, 2);
        assert_eq!(rb.buffer[0].payload, Trace::Tick(3));
        assert_eq!(rb.buffer[2].generation, 1);

        let mut seen = vec![];
        rb.for_each(|e| seen.push(e.payload));
        assert_eq!(seen, [Trace::Tick(2), Trace::Tick(3), Trace::Tick(4)]);
    }

    #[test]
    fn partial_buffer_skips_empty_slots() {
        let mut rb = Ringbuf::<Trace, 8>::new(Trace::None);
        rb.entry(1, Trace::Tick(0));
        rb.entry(2, Trace::Tick(1));
        let mut seen = vec![];
        rb.for_each(|e| seen.push(e.line));
        assert_eq!(seen, [1, 2]);
    }

    #[test]
    fn saturated_count_starts_new_entry() {
        let mut rb = Ringbuf::<Trace, 2>::new(Trace::None);
        rb.entry(5, Trace::Tick(9));
        rb.buffer[0].count = u32::MAX;
        rb.entry(5, Trace::Tick(9));
        assert_eq!(rb.last, Some(1));
        assert_eq!(rb.buffer[1].count, 1);
    }

    #[cfg(not(feature = "disabled"))]
    #[test]
    fn macros_record_line_numbers() {
        ringbuf!(TEST_RINGBUF, Trace, 4, Trace::None);
        ringbuf_entry!(TEST_RINGBUF, Trace::Tick(7));
        let line = line!() - 1;
        let latest = TEST_RINGBUF.latest().unwrap();
        assert_eq!(latest.line as u32, line);
        assert_eq!(latest.payload, Trace::Tick(7));
    }
}
