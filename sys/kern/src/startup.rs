// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware startup, and the statics that everything hangs off.
//!
//! The board's `main` does its clock and pin setup, creates the converter
//! drivers, hands its auxiliary input reader to [`set_alt_input`], and then
//! calls [`start`] with the function that runs the host link. That function
//! typically builds a dispatcher around [`runtime`] and [`take_loader`],
//! handing [`capture_isr`] to the capture driver.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use abi::{Sample, MAX_ELF_FILE_SIZE};
use sample_exchange::{Half, SampleBuffer};

use crate::arch;
use crate::config::{self, Region};
use crate::conversion::Runtime;
use crate::loader::{LoadRegion, Loader};
use crate::mailbox::Message;
use crate::periph::{AltInputs, AltRead};
use crate::recovery::ResumePoint;

/// Builds an exchange over a board region.
const fn exchange(r: Region) -> SampleBuffer<'static> {
    let base = r.base as usize as *mut Sample;
    // Safety: the board reserves these regions for the exchanges, and each
    // is only used here, once.
    unsafe { SampleBuffer::from_raw(base, r.sample_capacity()) }
}

/// The runner reads and writes this unprivileged, so the board's linker
/// script must place `.runner_data` inside the runner RAM region.
#[link_section = ".runner_data"]
static RUNTIME: Runtime<'static> = Runtime::new(
    exchange(config::INPUT),
    exchange(config::OUTPUT),
    exchange(config::GENERATOR),
    config::RUNNER_STACK.base..config::RUNNER_STACK.end(),
);

pub fn runtime() -> &'static Runtime<'static> {
    &RUNTIME
}

/// Kept out of `.runner_data`, because the kernel calls through it.
static ALT_INPUTS: AltInputs = AltInputs::new();

/// Installs the board's reader for the auxiliary analog inputs.
pub fn set_alt_input(read: AltRead) {
    ALT_INPUTS.install(read);
}

pub fn alt_inputs() -> &'static AltInputs {
    &ALT_INPUTS
}

/// Capture half-complete callback, to be handed to the capture driver.
pub fn capture_isr(half: Half) {
    RUNTIME.capture_complete(half);
}

/// Top of the runner's loop. The runner starts here, and comes back here
/// with a clean stack after a fault.
pub fn runner_entry() -> ! {
    loop {
        if let Some(msg) = Message::from_tag(arch::wait_for_message()) {
            RUNTIME.process(msg);
        }
    }
}

pub fn resume_point() -> ResumePoint {
    ResumePoint {
        entry: runner_entry,
        stack_top: config::RUNNER_STACK.end(),
    }
}

static LOADER_TAKEN: AtomicBool = AtomicBool::new(false);

const REGION_COUNT: usize = config::ALGORITHM_REGIONS.len();

/// Hands out the algorithm loader, with its staging area and the board's
/// algorithm regions. Returns `None` after the first call.
pub fn take_loader() -> Option<Loader<'static>> {
    static mut STAGING: [u8; MAX_ELF_FILE_SIZE] = [0; MAX_ELF_FILE_SIZE];
    static mut REGIONS: MaybeUninit<[LoadRegion<'static>; REGION_COUNT]> =
        MaybeUninit::uninit();

    if LOADER_TAKEN.swap(true, Ordering::AcqRel) {
        return None;
    }

    let regions = core::array::from_fn(|i| {
        // Safety: the board reserves these regions for algorithms, and this
        // is the only place that makes slices over them.
        unsafe { LoadRegion::from_board(&config::ALGORITHM_REGIONS[i]) }
    });
    // Safety: the flag above means we only get here once, so these are the
    // only references to either static.
    let (staging, regions) = unsafe {
        (
            &mut *core::ptr::addr_of_mut!(STAGING),
            (*core::ptr::addr_of_mut!(REGIONS)).write(regions),
        )
    };
    Some(Loader::new(staging, regions))
}

/// Starts the runner and then `comm`, and never returns.
pub fn start(comm: fn() -> !) -> ! {
    arch::start(comm, runner_entry, config::RUNNER_STACK.end())
}
