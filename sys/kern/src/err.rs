// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Internally, fallible operations return `Result` with a typed error that
//! says what went wrong in enough detail to trace. At the edge, those errors
//! collapse into the wire codes of `abi::Error` and are queued in an
//! [`ErrorTracker`] until the host polls for them.

use core::cell::RefCell;

use abi::{Error, ERROR_QUEUE_DEPTH};
use critical_section::Mutex;
use heapless::Deque;

/// Reasons an algorithm image can fail to load.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadError {
    /// The image is larger than the staging area.
    TooLarge,
    /// The first four bytes aren't the ELF magic.
    BadMagic,
    /// A header or segment extends past the end of the upload.
    Truncated,
    /// A segment's destination isn't inside a reserved algorithm region.
    OutOfRegion { vaddr: u32, len: u32 },
    /// No segment carried any file data.
    NothingLoaded,
    /// The entry point isn't in an executable algorithm region.
    BadEntry { entry: u32 },
}

/// Every load failure but an oversized upload looks the same to the host.
impl From<LoadError> for Error {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::TooLarge => Error::BadUserCodeSize,
            _ => Error::BadUserCodeLoad,
        }
    }
}

/// Bounded FIFO of error codes waiting to be reported.
///
/// Errors are one-shot: each is reported once, oldest first, and then
/// forgotten. When the queue is full, newer errors are dropped.
pub struct ErrorTracker {
    queue: Mutex<RefCell<Deque<Error, ERROR_QUEUE_DEPTH>>>,
}

impl ErrorTracker {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(RefCell::new(Deque::new())),
        }
    }

    /// Queues `e` unless the queue is full.
    pub fn add(&self, e: Error) {
        critical_section::with(|cs| {
            // Full means drop.
            let _ = self.queue.borrow_ref_mut(cs).push_back(e);
        });
    }

    /// Queues `e` if `cond` is false. Returns `cond`, so guards read as
    /// `if errors.assert(ok, Error::X) { ... }`.
    pub fn assert(&self, cond: bool, e: Error) -> bool {
        if !cond {
            self.add(e);
        }
        cond
    }

    /// Removes and returns the oldest pending error, or `Error::None`.
    pub fn pop(&self) -> Error {
        critical_section::with(|cs| {
            self.queue.borrow_ref_mut(cs).pop_front().unwrap_or_default()
        })
    }

    pub fn has_error(&self) -> bool {
        critical_section::with(|cs| !self.queue.borrow_ref(cs).is_empty())
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.queue.borrow_ref(cs).len())
    }

    pub fn is_empty(&self) -> bool {
        !self.has_error()
    }
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_pops_none() {
        let t = ErrorTracker::new();
        assert!(!t.has_error());
        assert_eq!(t.pop(), Error::None);
    }

    #[test]
    fn assert_returns_condition() {
        let t = ErrorTracker::new();
        assert!(t.assert(true, Error::BadParam));
        assert!(!t.has_error());
        assert!(!t.assert(false, Error::NotIdle));
        assert_eq!(t.pop(), Error::NotIdle);
        assert_eq!(t.pop(), Error::None);
    }

    #[test]
    fn reports_oldest_first() {
        let t = ErrorTracker::new();
        t.add(Error::BadParam);
        t.add(Error::NotRunning);
        t.add(Error::ConversionAborted);
        assert_eq!(t.pop(), Error::BadParam);
        assert_eq!(t.pop(), Error::NotRunning);
        assert_eq!(t.pop(), Error::ConversionAborted);
        assert_eq!(t.pop(), Error::None);
    }

    #[test]
    fn full_queue_drops_newest() {
        let t = ErrorTracker::new();
        for _ in 0..ERROR_QUEUE_DEPTH {
            t.add(Error::BadParam);
        }
        t.add(Error::NotIdle);
        assert_eq!(t.len(), ERROR_QUEUE_DEPTH);
        for _ in 0..ERROR_QUEUE_DEPTH {
            assert_eq!(t.pop(), Error::BadParam);
        }
        assert_eq!(t.pop(), Error::None);
    }

    #[test]
    fn load_errors_map_to_wire_codes() {
        assert_eq!(Error::from(LoadError::TooLarge), Error::BadUserCodeSize);
        assert_eq!(Error::from(LoadError::BadMagic), Error::BadUserCodeLoad);
        assert_eq!(
            Error::from(LoadError::OutOfRegion { vaddr: 0, len: 4 }),
            Error::BadUserCodeLoad
        );
    }

    fn code() -> impl Strategy<Value = Error> {
        (1u8..=7).prop_map(|b| {
            num_traits::FromPrimitive::from_u8(b).unwrap_or(Error::BadParam)
        })
    }

    proptest! {
        #[test]
        fn behaves_like_a_bounded_fifo(
            codes in proptest::collection::vec(code(), 0..20),
        ) {
            let t = ErrorTracker::new();
            for &c in &codes {
                t.add(c);
            }
            let kept = codes.len().min(ERROR_QUEUE_DEPTH);
            prop_assert_eq!(t.len(), kept);
            for &c in &codes[..kept] {
                prop_assert_eq!(t.pop(), c);
            }
            prop_assert_eq!(t.pop(), Error::None);
        }
    }
}
