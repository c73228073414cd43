// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host link.
//!
//! The host drives everything over a byte stream. Each command is a single
//! byte; handlers then read whatever fixed-size parameters they need
//! straight off the link. There is no other framing, so a handler that
//! reads the wrong number of bytes desynchronizes the stream.
//!
//! Errors are never replied directly. Handlers queue them in the runtime's
//! error tracker and skip the rest of their work; the host finds out on its
//! next status read.

#![cfg_attr(not(test), no_std)]

use abi::{
    Command, Error, Rate, RunStatus, IDENTIFIER_LEN, MAX_SAMPLE_BUFFER_SIZE,
    RATE_QUERY, READ_CHUNK_SIZE,
};
use kern::conversion::Runtime;
use kern::loader::Loader;
use kern::periph::{Capture, Channel, Emission, HalfComplete};
use kern::sclock::SampleClock;
use ringbuf::{ringbuf, ringbuf_entry};
use sample_exchange::SampleBuffer;

/// A byte stream to the host, typically USB CDC.
pub trait Transport {
    /// Whether a host is attached. Nothing is read while it isn't.
    fn is_active(&self) -> bool;

    /// Reads up to `buf.len()` bytes, waiting a transport-defined time for
    /// them to arrive. Returns how many were read; zero on timeout.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Writes `buf`, returning how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> usize;
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Command(Command),
    Unknown(u8),
    Rejected(Command, Error),
    Loaded { len: usize },
    RateSet { rate: Rate, divider: u32 },
    Chunked { half_len: usize },
}

ringbuf!(Trace, 32, Trace::None);

pub struct Dispatcher<'a, T, C, E> {
    rt: &'a Runtime<'a>,
    loader: Loader<'a>,
    link: T,
    capture: C,
    emission: E,
    on_half: HalfComplete,
    clock: SampleClock,
    identifier: [u8; IDENTIFIER_LEN],
}

impl<'a, T, C, E> Dispatcher<'a, T, C, E>
where
    T: Transport,
    C: Capture,
    E: Emission,
{
    /// Creates a dispatcher for this board. `on_half` is handed to the
    /// capture driver each time conversion starts.
    pub fn new(
        rt: &'a Runtime<'a>,
        loader: Loader<'a>,
        link: T,
        capture: C,
        emission: E,
        on_half: HalfComplete,
    ) -> Self {
        Self {
            rt,
            loader,
            link,
            capture,
            emission,
            on_half,
            clock: SampleClock::board(),
            identifier: kern::config::IDENTIFIER,
        }
    }

    /// Services the link forever.
    pub fn run(&mut self) -> ! {
        loop {
            self.poll();
        }
    }

    /// Reads and handles at most one command. Returns whether one was read.
    pub fn poll(&mut self) -> bool {
        if !self.link.is_active() {
            return false;
        }
        let mut cmd = [0u8];
        if self.link.read(&mut cmd) == 0 {
            return false;
        }
        self.dispatch(cmd[0]);
        true
    }

    /// Handles one command byte. Bytes that aren't commands are ignored.
    pub fn dispatch(&mut self, byte: u8) {
        let Some(cmd) = Command::from_byte(byte) else {
            ringbuf_entry!(Trace::Unknown(byte));
            return;
        };
        ringbuf_entry!(Trace::Command(cmd));

        match cmd {
            Command::WriteInputBuffer => self.write_input_buffer(),
            Command::SetBufferSize => self.set_buffer_size(),
            Command::UpdateGenerator => self.update_generator(),
            Command::LoadAlgorithm => self.load_algorithm(),
            Command::ReadStatus => self.read_status(),
            Command::StartMeasurement => {
                if self.require(RunStatus::Running, cmd) {
                    self.rt.start_measurement();
                }
            }
            Command::StartConversion => {
                if self.require(RunStatus::Idle, cmd) {
                    self.rt.start(
                        &mut self.capture,
                        &mut self.emission,
                        self.on_half,
                    );
                }
            }
            Command::StopConversion => {
                if self.require(RunStatus::Running, cmd) {
                    self.rt.stop(&mut self.capture, &mut self.emission);
                }
            }
            Command::StartGenerator => {
                let g = &self.rt.generator;
                // Safety: the generator exchange outlives the dispatcher,
                // and only the host link writes to it.
                unsafe {
                    self.emission.start(
                        Channel::Generator,
                        g.as_ptr(),
                        g.size(),
                    );
                }
            }
            Command::ReadInputBuffer => {
                // Safety: a torn read of a buffer capture is filling is
                // what the host asked for; it only ever sees whole samples.
                let bytes = unsafe { self.rt.input.bytes() };
                self.link.write(bytes);
            }
            Command::ReadOutputBuffer => {
                // Safety: as above, for the runner's output.
                let bytes = unsafe { self.rt.output.bytes() };
                self.link.write(bytes);
            }
            Command::UnloadAlgorithm => {
                if self.require(RunStatus::Idle, cmd) {
                    self.rt.algorithm.unload();
                }
            }
            Command::ReadIdentifier => {
                self.link.write(&self.identifier);
            }
            Command::ReadExecTime => {
                let cycles = self.rt.stopwatch.last();
                self.link.write(&cycles.to_le_bytes());
            }
            Command::SampleRate => self.sample_rate(),
            Command::ReadConversionResults => {
                let rt = self.rt;
                self.send_modified(&rt.output);
            }
            Command::ReadConversionInput => {
                let rt = self.rt;
                self.send_modified(&rt.input);
            }
            Command::StopGenerator => self.emission.stop(Channel::Generator),
        }
    }

    /// Queues the matching state error unless the runtime is in `want`.
    fn require(&mut self, want: RunStatus, cmd: Command) -> bool {
        let e = match want {
            RunStatus::Idle => Error::NotIdle,
            RunStatus::Running => Error::NotRunning,
        };
        self.check(self.rt.status() == want, e, cmd)
    }

    fn check(&mut self, cond: bool, e: Error, cmd: Command) -> bool {
        if !cond {
            ringbuf_entry!(Trace::Rejected(cmd, e));
        }
        self.rt.errors.assert(cond, e)
    }

    /// Reads a little-endian u16 parameter, queueing `BadParamSize` if it
    /// doesn't arrive.
    fn read_u16(&mut self, cmd: Command) -> Option<u16> {
        let mut buf = [0u8; 2];
        let n = self.link.read(&mut buf);
        self.check(n == buf.len(), Error::BadParamSize, cmd)
            .then(|| u16::from_le_bytes(buf))
    }

    fn write_input_buffer(&mut self) {
        // Safety: the host is the only writer it asked for; if capture is
        // running, its data simply loses to the next DMA pass.
        let bytes = unsafe { self.rt.input.bytes_mut() };
        self.link.read(bytes);
    }

    fn set_buffer_size(&mut self) {
        let cmd = Command::SetBufferSize;
        if !self.require(RunStatus::Idle, cmd) {
            return;
        }
        let Some(count) = self.read_u16(cmd) else {
            return;
        };
        // The host sends the size of one half.
        let count = usize::from(count) * 2;
        if self.check(count <= MAX_SAMPLE_BUFFER_SIZE, Error::BadParam, cmd) {
            self.rt.input.set_size(count);
            self.rt.output.set_size(count);
        }
    }

    fn update_generator(&mut self) {
        let cmd = Command::UpdateGenerator;
        let Some(count) = self.read_u16(cmd) else {
            return;
        };
        let count = usize::from(count);
        if !self.check(count <= MAX_SAMPLE_BUFFER_SIZE, Error::BadParam, cmd) {
            return;
        }

        let g = &self.rt.generator;
        if !self.emission.is_running(Channel::Generator) {
            g.set_size(count);
            // Safety: the generator isn't being emitted, so nothing else is
            // looking at it.
            let bytes = unsafe { g.bytes_mut() };
            self.link.read(bytes);
            return;
        }

        // While running, refill whichever half the DAC has finished with.
        match self.emission.wants_more(Channel::Generator) {
            None => {
                self.link.write(&[0]);
            }
            Some(half) => {
                self.link.write(&[1]);
                // Safety: the DAC is draining the other half.
                let bytes = unsafe { g.half_bytes_mut(half) };
                self.link.read(bytes);
            }
        }
    }

    fn load_algorithm(&mut self) {
        let cmd = Command::LoadAlgorithm;
        if !self.require(RunStatus::Idle, cmd) {
            return;
        }
        let Some(len) = self.read_u16(cmd) else {
            return;
        };
        let len = usize::from(len);
        let fits = len < self.loader.capacity();
        if !self.check(fits, Error::BadUserCodeSize, cmd) {
            return;
        }

        let n = self.link.read(&mut self.loader.staging_mut()[..len]);
        match self.loader.load(n, &self.rt.algorithm) {
            Ok(()) => ringbuf_entry!(Trace::Loaded { len: n }),
            Err(e) => {
                let e = Error::from(e);
                ringbuf_entry!(Trace::Rejected(cmd, e));
                self.rt.errors.add(e);
            }
        }
    }

    fn read_status(&mut self) {
        let status = u8::from(self.rt.status());
        let error = u8::from(self.rt.errors.pop());
        self.link.write(&[status, error]);
    }

    fn sample_rate(&mut self) {
        let cmd = Command::SampleRate;
        let mut index = [0u8];
        let n = self.link.read(&mut index);
        if !self.check(n == 1, Error::BadParamSize, cmd) {
            return;
        }

        if index[0] == RATE_QUERY {
            self.link.write(&[self.clock.rate().index()]);
            return;
        }
        let rate = Rate::from_index(index[0]);
        if !self.check(rate.is_some(), Error::BadParam, cmd) {
            return;
        }
        if let Some(rate) = rate {
            let divider = self.clock.divider(rate);
            self.clock.set_rate(rate);
            self.capture.set_rate(rate, divider);
            ringbuf_entry!(Trace::RateSet { rate, divider });
        }
    }

    /// Sends the most recently produced half of `buf`: a u16 sample count,
    /// then the samples in chunks, each acknowledged by one byte from the
    /// host. Sends a zero count if no half is pending.
    fn send_modified(&mut self, buf: &SampleBuffer<'_>) {
        let Some(half) = buf.take_modified() else {
            self.link.write(&[0, 0]);
            return;
        };

        let half_len = buf.half_len();
        ringbuf_entry!(Trace::Chunked { half_len });
        self.link.write(&(half_len as u16).to_le_bytes());

        // Safety: the producer won't come back to this half until the other
        // one is done, which takes longer than the host does to read it.
        let bytes = unsafe { buf.half_bytes(half) };
        for chunk in bytes.chunks(READ_CHUNK_SIZE) {
            self.link.write(chunk);
            self.wait_ack();
        }
    }

    fn wait_ack(&mut self) {
        let mut ack = [0u8];
        while self.link.is_active() && self.link.read(&mut ack) == 0 {}
    }

    pub fn link(&mut self) -> &mut T {
        &mut self.link
    }

    pub fn capture(&mut self) -> &mut C {
        &mut self.capture
    }

    pub fn emission(&mut self) -> &mut E {
        &mut self.emission
    }

    pub fn clock(&self) -> &SampleClock {
        &self.clock
    }
}
