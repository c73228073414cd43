// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The conversion runtime.
//!
//! Conversion is a three-stage pipeline:
//!
//! - The **capture** interrupt fires whenever the input DMA finishes a half
//!   buffer. It marks that half and posts a [`Message`] to the relay.
//!
//! - The **relay** runs with full privilege. It forwards one message at a
//!   time to the runner through a single-slot [`Rendezvous`], and only
//!   fetches from the mailbox while the runner is idle, waiting for work.
//!   While the runner is busy, messages stay in the mailbox where capture
//!   can see them.
//!
//! - The **runner** takes the message, calls the loaded algorithm on the
//!   named input half, and copies what it returns into the same half of the
//!   output exchange, where the output DMA picks it up.
//!
//! On target, the runner executes unprivileged and must stay away from
//! critical sections, so everything it touches in here is an atomic.
//!
//! The capture stage never blocks. If it finds the relay mailbox already
//! backed up, the algorithm isn't keeping up with the sample rate; rather
//! than let input and output drift apart, the whole run is aborted.

use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use abi::{Error, RunStatus};
use ringbuf::{ringbuf, ringbuf_entry};
use sample_exchange::{Half, SampleBuffer};

use crate::arch;
use crate::err::ErrorTracker;
use crate::loader::AlgorithmSlot;
use crate::mailbox::{Mailbox, Message, Rendezvous};
use crate::periph::{Capture, Channel, Emission, HalfComplete};
use crate::time::Stopwatch;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Start { size: usize },
    Stop,
    Overrun { pending: usize },
    Aborted,
    MeasurementArmed,
}

ringbuf!(Trace, 16, Trace::None);

/// All state shared between the pipeline stages and the host link.
pub struct Runtime<'a> {
    pub input: SampleBuffer<'a>,
    pub output: SampleBuffer<'a>,
    /// Independent of conversion; streamed by the signal generator.
    pub generator: SampleBuffer<'a>,
    pub errors: ErrorTracker,
    pub algorithm: AlgorithmSlot,
    pub stopwatch: Stopwatch,
    status: AtomicU8,
    measure: AtomicBool,
    mailbox: Mailbox,
    rendezvous: Rendezvous,
    /// Set while the runner waits for a message, cleared when the relay
    /// hands it one.
    runner_idle: AtomicBool,
    runner_stack: Range<u32>,
}

impl<'a> Runtime<'a> {
    /// Creates an idle runtime. `runner_stack` is the address range reserved
    /// for the runner's stack, used to decide whether a fault can be
    /// recovered from.
    pub const fn new(
        input: SampleBuffer<'a>,
        output: SampleBuffer<'a>,
        generator: SampleBuffer<'a>,
        runner_stack: Range<u32>,
    ) -> Self {
        Self {
            input,
            output,
            generator,
            errors: ErrorTracker::new(),
            algorithm: AlgorithmSlot::new(),
            stopwatch: Stopwatch::new(),
            status: AtomicU8::new(RunStatus::Idle as u8),
            measure: AtomicBool::new(false),
            mailbox: Mailbox::new(),
            rendezvous: Rendezvous::new(),
            runner_idle: AtomicBool::new(true),
            runner_stack,
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.status.load(Ordering::Acquire) == RunStatus::Running as u8 {
            RunStatus::Running
        } else {
            RunStatus::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == RunStatus::Running
    }

    /// Begins converting. The caller checks that we're idle.
    ///
    /// The output is cleared to mid-scale first, so that nothing left over
    /// from a previous run gets emitted before the algorithm produces its
    /// first half.
    pub fn start(
        &self,
        capture: &mut impl Capture,
        emission: &mut impl Emission,
        on_half: HalfComplete,
    ) {
        self.output.clear();
        self.mailbox.reset();
        self.rendezvous.clear();
        self.measure.store(false, Ordering::Relaxed);
        let _ = self.input.take_modified();
        let _ = self.output.take_modified();

        let size = self.input.size();
        ringbuf_entry!(Trace::Start { size });
        // Safety: both exchanges live at least as long as we do, and we stop
        // the hardware in `stop` before anything else can happen to them.
        unsafe {
            capture.start(self.input.as_ptr(), size, on_half);
            emission.start(
                Channel::Conversion,
                self.output.as_ptr(),
                self.output.size(),
            );
        }
        self.status.store(RunStatus::Running as u8, Ordering::Release);
    }

    /// Stops converting. The caller checks that we're running.
    pub fn stop(
        &self,
        capture: &mut impl Capture,
        emission: &mut impl Emission,
    ) {
        emission.stop(Channel::Conversion);
        capture.stop();
        self.status.store(RunStatus::Idle as u8, Ordering::Release);
        ringbuf_entry!(Trace::Stop);
    }

    /// Drops the algorithm and tells the host. Callable from any context,
    /// including fault handlers. The run status is left alone: capture keeps
    /// going, and halves pass straight through until the host reacts.
    pub fn abort(&self) {
        self.algorithm.unload();
        self.errors.add(Error::ConversionAborted);
        ringbuf_entry!(Trace::Aborted);
    }

    /// Arms timing of the next half dispatched to the algorithm. The caller
    /// checks that we're running.
    pub fn start_measurement(&self) {
        self.measure.store(true, Ordering::Release);
        ringbuf_entry!(Trace::MeasurementArmed);
    }

    /// Capture half-complete notification, from interrupt context.
    pub fn capture_complete(&self, half: Half) {
        let pending = self.mailbox.used();
        if pending > 1 {
            ringbuf_entry!(Trace::Overrun { pending });
            self.mailbox.reset();
            self.abort();
            return;
        }

        self.input.mark(half);
        let measure = self.measure.swap(false, Ordering::AcqRel);
        if self.mailbox.post(Message::new(half, measure)).is_err() {
            // Only reachable if something else posted since we checked.
            self.abort();
            return;
        }
        arch::wake_relay();
    }

    /// Moves one message from the mailbox to the runner, if the runner is
    /// idle and has taken the last one. Returns whether anything moved.
    pub fn relay_step(&self) -> bool {
        if !self.is_runner_idle() || !self.rendezvous.is_empty() {
            return false;
        }
        match self.mailbox.fetch() {
            Some(msg) => {
                self.runner_idle.store(false, Ordering::Release);
                // We're the only producer, and the slot was empty.
                self.rendezvous.offer(msg)
            }
            None => false,
        }
    }

    /// The runner has finished with its last message and is waiting for
    /// another.
    pub fn runner_idle(&self) {
        self.runner_idle.store(true, Ordering::Release);
    }

    pub fn is_runner_idle(&self) -> bool {
        self.runner_idle.load(Ordering::Acquire)
    }

    /// Takes the message waiting for the runner, if any.
    pub fn take_message(&self) -> Option<Message> {
        self.rendezvous.take()
    }

    /// Runs one message through the runner, if one is waiting, and then
    /// goes back to waiting. Returns whether anything ran.
    pub fn runner_step(&self) -> bool {
        match self.take_message() {
            Some(msg) => {
                self.process(msg);
                self.runner_idle();
                true
            }
            None => false,
        }
    }

    /// Runs the loaded algorithm on one half of the input.
    ///
    /// This is the body of the runner and is called unprivileged on target.
    pub fn process(&self, msg: Message) {
        let half = msg.half;
        let len = self.input.half_len();
        let src = self.input.half_ptr(half);

        let result = match self.algorithm.get() {
            Some(entry) => {
                let start = if msg.measure { arch::cycle_count() } else { 0 };
                // Safety: the entry point came from a successful load. What
                // it does with the half we hand it is up to it; on target a
                // bad access traps into fault recovery.
                let r = unsafe { entry(src, len) };
                if msg.measure {
                    self.stopwatch.record(start, arch::cycle_count());
                }
                r
            }
            None => src,
        };

        if result.is_null() {
            return;
        }
        // Safety: the algorithm promises `len` samples at `result`. On
        // target, the runner can only read memory the MPU gives it.
        let samples = unsafe { core::slice::from_raw_parts(result, len) };
        match half {
            Half::First => self.output.modify_first_half(samples),
            Half::Second => self.output.modify_second_half(samples),
        }
    }

    /// Whether `sp` lies in the runner's stack.
    pub fn in_runner_stack(&self, sp: u32) -> bool {
        self.runner_stack.contains(&sp)
    }

    /// Messages posted by capture but not yet relayed.
    pub fn pending(&self) -> usize {
        self.mailbox.used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{Rate, Sample, MID_SCALE};
    use std::cell::Cell;

    const STACK: Range<u32> = 0x2001_4000..0x2001_7c00;

    #[derive(Default)]
    struct FakeCapture {
        running: Option<usize>,
    }

    impl Capture for FakeCapture {
        unsafe fn start(
            &mut self,
            _: *mut Sample,
            count: usize,
            _: HalfComplete,
        ) {
            self.running = Some(count);
        }
        fn stop(&mut self) {
            self.running = None;
        }
        fn set_rate(&mut self, _: Rate, _: u32) {}
    }

    #[derive(Default)]
    struct FakeEmission {
        running: [Option<usize>; 2],
    }

    impl Emission for FakeEmission {
        unsafe fn start(
            &mut self,
            ch: Channel,
            _: *const Sample,
            count: usize,
        ) {
            self.running[ch as usize] = Some(count);
        }
        fn stop(&mut self, ch: Channel) {
            self.running[ch as usize] = None;
        }
        fn is_running(&self, ch: Channel) -> bool {
            self.running[ch as usize].is_some()
        }
        fn wants_more(&mut self, _: Channel) -> Option<Half> {
            None
        }
    }

    fn ignore(_: Half) {}

    struct Bench {
        input: Vec<Sample>,
        output: Vec<Sample>,
        generator: Vec<Sample>,
    }

    impl Bench {
        fn new(size: usize) -> Self {
            Self {
                input: vec![0; size],
                output: vec![0; size],
                generator: vec![0; size],
            }
        }

        fn runtime(&mut self) -> Runtime<'_> {
            Runtime::new(
                SampleBuffer::new(&mut self.input),
                SampleBuffer::new(&mut self.output),
                SampleBuffer::new(&mut self.generator),
                STACK,
            )
        }
    }

    fn fill_input(rt: &Runtime<'_>, half: Half, base: Sample) {
        let p = rt.input.half_ptr(half);
        for i in 0..rt.input.half_len() {
            // Safety: in bounds of the half.
            unsafe { p.add(i).write(base + i as Sample) };
        }
    }

    fn output_half(rt: &Runtime<'_>, half: Half) -> Vec<Sample> {
        // Safety: no writer is active.
        unsafe { rt.output.half(half).to_vec() }
    }

    unsafe extern "C" fn invert(p: *mut Sample, len: usize) -> *mut Sample {
        for i in 0..len {
            unsafe { *p.add(i) = 4095 - *p.add(i) };
        }
        p
    }

    unsafe extern "C" fn nothing(_: *mut Sample, _: usize) -> *mut Sample {
        core::ptr::null_mut()
    }

    unsafe extern "C" fn slow(p: *mut Sample, _: usize) -> *mut Sample {
        arch::advance_cycles(195 + 1234);
        p
    }

    #[test]
    fn start_and_stop() {
        let mut b = Bench::new(64);
        b.output.fill(7);
        let rt = b.runtime();
        let mut cap = FakeCapture::default();
        let mut emi = FakeEmission::default();

        assert_eq!(rt.status(), RunStatus::Idle);
        rt.start(&mut cap, &mut emi, ignore);
        assert!(rt.is_running());
        assert_eq!(cap.running, Some(64));
        assert!(emi.is_running(Channel::Conversion));
        assert!(!emi.is_running(Channel::Generator));
        // Safety: no writer is active.
        assert!(unsafe { rt.output.samples() }.iter().all(|&s| s == MID_SCALE));

        rt.stop(&mut cap, &mut emi);
        assert_eq!(rt.status(), RunStatus::Idle);
        assert_eq!(cap.running, None);
        assert!(!emi.is_running(Channel::Conversion));
    }

    #[test]
    fn unloaded_passes_through() {
        let mut b = Bench::new(64);
        let rt = b.runtime();
        fill_input(&rt, Half::Second, 100);

        rt.capture_complete(Half::Second);
        assert_eq!(rt.input.take_modified(), Some(Half::Second));
        assert!(rt.relay_step());
        assert!(rt.runner_step());

        let expected: Vec<Sample> = (100..132).collect();
        assert_eq!(output_half(&rt, Half::Second), expected);
        assert_eq!(rt.output.take_modified(), Some(Half::Second));
    }

    #[test]
    fn algorithm_output_lands_in_matching_half() {
        let mut b = Bench::new(64);
        let rt = b.runtime();
        rt.algorithm.install(invert);
        fill_input(&rt, Half::First, 0);

        rt.capture_complete(Half::First);
        rt.relay_step();
        rt.runner_step();

        let expected: Vec<Sample> = (0..32).map(|i| 4095 - i).collect();
        assert_eq!(output_half(&rt, Half::First), expected);
        assert_eq!(rt.output.take_modified(), Some(Half::First));
    }

    #[test]
    fn null_result_writes_nothing() {
        let mut b = Bench::new(64);
        b.output.fill(9);
        let rt = b.runtime();
        rt.algorithm.install(nothing);

        rt.capture_complete(Half::First);
        rt.relay_step();
        assert!(rt.runner_step());
        assert!(output_half(&rt, Half::First).iter().all(|&s| s == 9));
        assert_eq!(rt.output.take_modified(), None);
    }

    #[test]
    fn measurement_is_one_shot() {
        let mut b = Bench::new(64);
        let rt = b.runtime();
        rt.algorithm.install(slow);

        rt.start_measurement();
        rt.capture_complete(Half::First);
        rt.relay_step();
        rt.runner_step();
        assert_eq!(rt.stopwatch.last(), 1234);

        rt.stopwatch.record(0, 0);
        rt.capture_complete(Half::Second);
        rt.relay_step();
        rt.runner_step();
        assert_eq!(rt.stopwatch.last(), 0);
    }

    #[test]
    fn relay_waits_for_runner() {
        let mut b = Bench::new(64);
        let rt = b.runtime();

        rt.capture_complete(Half::First);
        rt.capture_complete(Half::Second);
        assert_eq!(rt.pending(), 2);

        assert!(rt.relay_step());
        // The runner hasn't taken the first one yet.
        assert!(!rt.relay_step());
        assert_eq!(rt.pending(), 1);

        // Taken, but still being worked on.
        assert_eq!(rt.take_message().map(|m| m.half), Some(Half::First));
        assert!(!rt.is_runner_idle());
        assert!(!rt.relay_step());
        assert_eq!(rt.pending(), 1);

        rt.runner_idle();
        assert!(rt.relay_step());
        assert!(rt.runner_step());
        assert!(rt.is_runner_idle());
        assert!(!rt.relay_step());
        assert!(!rt.runner_step());
        assert_eq!(rt.pending(), 0);
    }

    #[test]
    fn busy_runner_overruns_on_fourth_half() {
        let mut b = Bench::new(64);
        let rt = b.runtime();
        rt.algorithm.install(invert);

        // The runner picks up the first half and is still busy with it
        // while the relay is woken for each of the following captures.
        rt.capture_complete(Half::First);
        assert!(rt.relay_step());
        assert!(rt.take_message().is_some());

        rt.capture_complete(Half::Second);
        assert!(!rt.relay_step());
        assert_eq!(rt.pending(), 1);
        rt.capture_complete(Half::First);
        assert!(!rt.relay_step());
        assert_eq!(rt.pending(), 2);
        assert!(rt.algorithm.is_loaded());
        assert!(rt.errors.is_empty());

        rt.capture_complete(Half::Second);
        assert_eq!(rt.pending(), 0);
        assert!(!rt.algorithm.is_loaded());
        assert_eq!(rt.errors.pop(), Error::ConversionAborted);
        assert_eq!(rt.errors.pop(), Error::None);
    }

    #[test]
    fn keeping_up_never_overruns() {
        let mut b = Bench::new(64);
        let rt = b.runtime();
        rt.algorithm.install(invert);

        for half in [Half::First, Half::Second].into_iter().cycle().take(9) {
            rt.capture_complete(half);
            assert!(rt.relay_step());
            assert!(rt.runner_step());
        }
        assert!(rt.algorithm.is_loaded());
        assert!(rt.errors.is_empty());
    }

    #[test]
    fn overrun_aborts() {
        let mut b = Bench::new(64);
        let rt = b.runtime();
        rt.algorithm.install(invert);

        rt.capture_complete(Half::First);
        rt.capture_complete(Half::Second);
        assert!(rt.errors.is_empty());

        rt.capture_complete(Half::First);
        assert_eq!(rt.pending(), 0);
        assert!(!rt.algorithm.is_loaded());
        assert_eq!(rt.errors.pop(), Error::ConversionAborted);
        assert_eq!(rt.errors.pop(), Error::None);
    }

    #[test]
    fn abort_keeps_status() {
        let mut b = Bench::new(64);
        let rt = b.runtime();
        let mut cap = FakeCapture::default();
        let mut emi = FakeEmission::default();
        rt.algorithm.install(invert);
        rt.start(&mut cap, &mut emi, ignore);

        rt.abort();
        assert!(rt.is_running());
        assert!(!rt.algorithm.is_loaded());
        assert_eq!(rt.errors.pop(), Error::ConversionAborted);
    }

    #[test]
    fn capture_wakes_relay() {
        let mut b = Bench::new(16);
        let rt = b.runtime();
        let before = arch::relay_wakeups();
        rt.capture_complete(Half::First);
        assert_eq!(arch::relay_wakeups(), before + 1);
    }

    #[test]
    fn runner_stack_bounds() {
        let mut b = Bench::new(16);
        let rt = b.runtime();
        assert!(rt.in_runner_stack(STACK.start));
        assert!(rt.in_runner_stack(STACK.end - 4));
        assert!(!rt.in_runner_stack(STACK.end));
        assert!(!rt.in_runner_stack(STACK.start - 4));
    }

    #[test]
    fn start_discards_stale_messages() {
        let mut b = Bench::new(64);
        let rt = b.runtime();
        let mut cap = FakeCapture::default();
        let mut emi = FakeEmission::default();
        rt.capture_complete(Half::First);
        rt.relay_step();
        rt.capture_complete(Half::Second);

        rt.start(&mut cap, &mut emi, ignore);
        assert_eq!(rt.pending(), 0);
        assert!(!rt.runner_step());
        assert_eq!(rt.input.take_modified(), None);
    }

    thread_local! {
        static SEEN: Cell<usize> = const { Cell::new(0) };
    }

    unsafe extern "C" fn count_len(p: *mut Sample, len: usize) -> *mut Sample {
        SEEN.with(|s| s.set(len));
        p
    }

    #[test]
    fn algorithm_sees_half_size() {
        let mut b = Bench::new(256);
        let rt = b.runtime();
        rt.input.set_size(100);
        rt.output.set_size(100);
        rt.algorithm.install(count_len);
        rt.capture_complete(Half::Second);
        rt.relay_step();
        rt.runner_step();
        assert_eq!(SEEN.with(Cell::get), 50);
    }
}
