// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the converter drivers.
//!
//! The drivers stream samples by DMA in circular mode over a double buffer
//! and report each half as it completes. Their implementations are
//! board-specific and live outside the kernel.

use core::cell::Cell;

use abi::{Rate, Sample, ALT_INPUT_COUNT};
use critical_section::Mutex;
use sample_exchange::Half;

/// Called from interrupt context when the capture hardware has filled one
/// half of its buffer.
pub type HalfComplete = fn(Half);

/// Blocking read of one of the auxiliary analog inputs, numbered from zero.
/// Called from the kernel on behalf of a running algorithm.
pub type AltRead = fn(u8) -> Sample;

/// The board's auxiliary inputs, as algorithms see them.
///
/// This holds a function pointer that the kernel calls privileged, so it
/// must not live anywhere the runner can write.
pub struct AltInputs {
    read: Mutex<Cell<Option<AltRead>>>,
}

impl AltInputs {
    pub const fn new() -> Self {
        Self {
            read: Mutex::new(Cell::new(None)),
        }
    }

    pub fn install(&self, read: AltRead) {
        critical_section::with(|cs| self.read.borrow(cs).set(Some(read)));
    }

    /// Reads input `id`, blocking until the conversion is done. Inputs the
    /// board doesn't have read as zero.
    pub fn read(&self, id: u32) -> Sample {
        if id >= ALT_INPUT_COUNT as u32 {
            return 0;
        }
        match critical_section::with(|cs| self.read.borrow(cs).get()) {
            Some(read) => read(id as u8),
            None => 0,
        }
    }
}

impl Default for AltInputs {
    fn default() -> Self {
        Self::new()
    }
}

/// Analog input.
pub trait Capture {
    /// Starts filling `count` samples at `buffer` continuously, calling
    /// `on_half` whenever a half fills.
    ///
    /// # Safety
    ///
    /// `buffer` must remain valid for `count` samples until `stop` is called.
    unsafe fn start(
        &mut self,
        buffer: *mut Sample,
        count: usize,
        on_half: HalfComplete,
    );

    fn stop(&mut self);

    /// Switches the sample clock to `rate`, by programming the trigger timer
    /// with `divider` (the board's timer frequency over the rate).
    fn set_rate(&mut self, rate: Rate, divider: u32);
}

/// Analog output channels.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Channel {
    /// Carries the algorithm's output.
    Conversion = 0,
    /// Carries the signal generator's buffer.
    Generator = 1,
}

/// Analog output.
pub trait Emission {
    /// Starts emitting `count` samples from `buffer` on `channel`, looping.
    ///
    /// # Safety
    ///
    /// `buffer` must remain valid for `count` samples until `stop` is called
    /// on the same channel.
    unsafe fn start(
        &mut self,
        channel: Channel,
        buffer: *const Sample,
        count: usize,
    );

    fn stop(&mut self, channel: Channel);

    fn is_running(&self, channel: Channel) -> bool;

    /// If a half of `channel`'s buffer has been sent since the last call,
    /// returns which one, so it can be refilled.
    fn wants_more(&mut self, channel: Channel) -> Option<Half>;
}
