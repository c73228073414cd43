// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire and ABI definitions shared between the conversion kernel, the host
//! link, and (by convention) the companion application on the other end of
//! the serial link.
//!
//! Everything in here is part of the externally visible contract: numeric
//! values of enums are sent over the wire as single bytes and must not be
//! renumbered.

#![no_std]

use num_derive::FromPrimitive;
use static_assertions::const_assert;

/// One ADC/DAC code. The converters are 12 bits wide, so only the bottom 12
/// bits are meaningful.
pub type Sample = u16;

/// Converter code for zero signal level; the hardware idles here.
pub const MID_SCALE: Sample = 2048;

/// Largest value a 12-bit converter can produce.
pub const MAX_SAMPLE_VALUE: Sample = 4095;

/// Hard upper bound on the number of samples in any exchange, counting both
/// halves.
pub const MAX_SAMPLE_BUFFER_SIZE: usize = 8192;

/// Same bound, in bytes.
pub const MAX_SAMPLE_BUFFER_BYTESIZE: usize =
    MAX_SAMPLE_BUFFER_SIZE * core::mem::size_of::<Sample>();

/// Size of the staging area that receives uploaded algorithm images.
pub const MAX_ELF_FILE_SIZE: usize = 16 * 1024;

/// Number of error codes that can be pending before new ones are dropped.
pub const ERROR_QUEUE_DEPTH: usize = 8;

/// Largest block sent by a chunked buffer read before waiting for the host
/// to acknowledge it.
pub const READ_CHUNK_SIZE: usize = 512;

/// Parameter byte that turns the sample-rate command into a query.
pub const RATE_QUERY: u8 = 0xFF;

/// Length of the identifier string returned by [`Command::ReadIdentifier`].
pub const IDENTIFIER_LEN: usize = 7;

/// Auxiliary analog inputs an algorithm can read while it runs.
pub const ALT_INPUT_COUNT: usize = 2;

const_assert!(MAX_SAMPLE_BUFFER_SIZE % 2 == 0);
const_assert!(MAX_SAMPLE_BUFFER_SIZE <= u16::MAX as usize * 2);
const_assert!(MAX_ELF_FILE_SIZE <= u16::MAX as usize + 1);

/// Error codes reported to the host through the status command.
///
/// These are queued, one-shot signals rather than persistent fault states:
/// once the host has read one, it is gone.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Error {
    /// Sentinel returned when no error is pending.
    #[default]
    None = 0,
    /// A command parameter was out of range.
    BadParam = 1,
    /// A command's parameter bytes did not arrive.
    BadParamSize = 2,
    /// An uploaded algorithm image could not be loaded.
    BadUserCodeLoad = 3,
    /// An uploaded algorithm image is too large for the staging area.
    BadUserCodeSize = 4,
    /// The command requires conversion to be stopped.
    NotIdle = 5,
    /// Conversion was aborted by an overrun or by a fault in the algorithm.
    ConversionAborted = 6,
    /// The command requires conversion to be running.
    NotRunning = 7,
}

impl From<Error> for u8 {
    fn from(e: Error) -> Self {
        e as u8
    }
}

/// Conversion state, as reported in the first byte of a status reply.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum RunStatus {
    #[default]
    Idle = 0,
    Running = 1,
}

impl From<RunStatus> for u8 {
    fn from(s: RunStatus) -> Self {
        s as u8
    }
}

/// Single-byte host commands.
///
/// Handlers read any additional parameter bytes themselves, so the command
/// byte is the only framing the protocol has.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Command {
    WriteInputBuffer = b'A',
    SetBufferSize = b'B',
    UpdateGenerator = b'D',
    LoadAlgorithm = b'E',
    ReadStatus = b'I',
    StartMeasurement = b'M',
    StartConversion = b'R',
    StopConversion = b'S',
    StartGenerator = b'W',
    ReadInputBuffer = b'a',
    ReadOutputBuffer = b'd',
    UnloadAlgorithm = b'e',
    ReadIdentifier = b'i',
    ReadExecTime = b'm',
    SampleRate = b'r',
    ReadConversionResults = b's',
    ReadConversionInput = b't',
    StopGenerator = b'w',
}

impl Command {
    /// Decodes a command byte, returning `None` for bytes that don't name a
    /// command.
    pub fn from_byte(b: u8) -> Option<Self> {
        num_traits::FromPrimitive::from_u8(b)
    }
}

/// System calls available to the runner, by the number passed in r11. An
/// argument, if any, goes in r0, and the result comes back there.
///
/// Algorithms may make `Cycles` and `ReadAlt` calls themselves. `Wait` is
/// for the runner's own loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum Sysnum {
    /// Blocks until the next message and returns its tag.
    Wait = 0,
    /// Returns the cycle counter.
    Cycles = 1,
    /// Returns a reading of auxiliary input r0, or zero if there's no such
    /// input.
    ReadAlt = 2,
}

impl Sysnum {
    pub fn from_u32(n: u32) -> Option<Self> {
        num_traits::FromPrimitive::from_u32(n)
    }
}

/// Preset sample rates, indexed the way the host selects them.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum Rate {
    R8K = 0,
    R16K = 1,
    R20K = 2,
    #[default]
    R32K = 3,
    R48K = 4,
    R96K = 5,
}

impl Rate {
    /// Number of presets; boards supply one timer divider per preset.
    pub const COUNT: usize = 6;

    pub const ALL: [Rate; Self::COUNT] = [
        Rate::R8K,
        Rate::R16K,
        Rate::R20K,
        Rate::R32K,
        Rate::R48K,
        Rate::R96K,
    ];

    /// Looks up a preset by its wire index.
    pub fn from_index(index: u8) -> Option<Self> {
        num_traits::FromPrimitive::from_u8(index)
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Nominal sample rate in Hertz.
    pub fn hz(self) -> u32 {
        match self {
            Rate::R8K => 8_000,
            Rate::R16K => 16_000,
            Rate::R20K => 20_000,
            Rate::R32K => 32_000,
            Rate::R48K => 48_000,
            Rate::R96K => 96_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(u8::from(Error::None), 0);
        assert_eq!(u8::from(Error::BadUserCodeLoad), 3);
        assert_eq!(u8::from(Error::ConversionAborted), 6);
        assert_eq!(u8::from(Error::NotRunning), 7);
        assert_eq!(Error::from_u8(5), Some(Error::NotIdle));
        assert_eq!(Error::from_u8(8), None);
    }

    #[test]
    fn commands_decode() {
        assert_eq!(Command::from_byte(b'B'), Some(Command::SetBufferSize));
        assert_eq!(
            Command::from_byte(b's'),
            Some(Command::ReadConversionResults)
        );
        assert_eq!(Command::from_byte(b'u'), None);
        assert_eq!(Command::from_byte(0), None);
    }

    #[test]
    fn sysnums_are_stable() {
        assert_eq!(Sysnum::from_u32(0), Some(Sysnum::Wait));
        assert_eq!(Sysnum::from_u32(1), Some(Sysnum::Cycles));
        assert_eq!(Sysnum::from_u32(2), Some(Sysnum::ReadAlt));
        assert_eq!(Sysnum::from_u32(3), None);
    }

    #[test]
    fn rate_indices() {
        for (i, rate) in Rate::ALL.iter().enumerate() {
            assert_eq!(usize::from(rate.index()), i);
            assert_eq!(Rate::from_index(i as u8), Some(*rate));
        }
        assert_eq!(Rate::from_index(6), None);
        assert_eq!(Rate::from_index(RATE_QUERY), None);
        assert_eq!(Rate::default().hz(), 32_000);
    }
}
