// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Messages between the pipeline stages.
//!
//! The capture interrupt posts into a two-deep [`Mailbox`]; the relay moves
//! messages one at a time into a single-slot [`Rendezvous`] that the runner
//! takes from.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU8, Ordering};

use critical_section::Mutex;
use heapless::Deque;
use sample_exchange::Half;

/// Depth of the capture-to-relay mailbox.
pub const MAILBOX_DEPTH: usize = 2;

/// Request to process one half of the input.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub half: Half,
    /// Time this run of the algorithm.
    pub measure: bool,
}

impl Message {
    pub fn new(half: Half, measure: bool) -> Self {
        Self { half, measure }
    }

    /// Encodes as 1 (first), 2 (second), 3 (first, measured) or 4 (second,
    /// measured).
    pub fn tag(self) -> u8 {
        let base = self.half as u8;
        if self.measure {
            base + 2
        } else {
            base
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::new(Half::First, false)),
            2 => Some(Self::new(Half::Second, false)),
            3 => Some(Self::new(Half::First, true)),
            4 => Some(Self::new(Half::Second, true)),
            _ => None,
        }
    }
}

pub struct Mailbox {
    queue: Mutex<RefCell<Deque<Message, MAILBOX_DEPTH>>>,
}

impl Mailbox {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(RefCell::new(Deque::new())),
        }
    }

    /// Posts `msg`, handing it back if the mailbox is full.
    pub fn post(&self, msg: Message) -> Result<(), Message> {
        critical_section::with(|cs| {
            self.queue.borrow_ref_mut(cs).push_back(msg)
        })
    }

    /// Takes the oldest message.
    pub fn fetch(&self) -> Option<Message> {
        critical_section::with(|cs| self.queue.borrow_ref_mut(cs).pop_front())
    }

    /// Number of messages waiting.
    pub fn used(&self) -> usize {
        critical_section::with(|cs| self.queue.borrow_ref(cs).len())
    }

    /// Discards everything waiting.
    pub fn reset(&self) {
        critical_section::with(|cs| self.queue.borrow_ref_mut(cs).clear());
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

const EMPTY: u8 = 0;

/// Single-slot handoff. Offering into a full slot fails, so the producer
/// can't get more than one message ahead of the consumer.
///
/// This is one atomic byte so that the runner can take from it without
/// needing a critical section.
pub struct Rendezvous {
    slot: AtomicU8,
}

impl Rendezvous {
    pub const fn new() -> Self {
        Self {
            slot: AtomicU8::new(EMPTY),
        }
    }

    /// Places `msg` in the slot if it's empty. Returns whether it was taken.
    pub fn offer(&self, msg: Message) -> bool {
        self.slot
            .compare_exchange(
                EMPTY,
                msg.tag(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn take(&self) -> Option<Message> {
        Message::from_tag(self.slot.swap(EMPTY, Ordering::AcqRel))
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load(Ordering::Acquire) == EMPTY
    }

    pub fn clear(&self) {
        self.slot.store(EMPTY, Ordering::Release);
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}
