// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M.
//!
//! # Threads
//!
//! Two thread-mode contexts share the processor, both on the process stack:
//!
//! - the **comm** thread runs the host link. It's privileged, and it's what
//!   runs whenever there's nothing else to do.
//! - the **runner** thread calls into the loaded algorithm. It's
//!   unprivileged, confined by the MPU to its own stack, the exchanges and
//!   the algorithm regions, so that a wild algorithm faults rather than
//!   corrupting anything.
//!
//! The relay stage is the `PendSV` handler. The capture interrupt pends it
//! after posting a message. If the runner is waiting, the relay moves the
//! message through the rendezvous, hands it over and switches to the runner.
//! If the runner is busy, the relay leaves the mailbox alone and returns to
//! it, so `PendSV` preempting the runner costs a context save and nothing
//! more. The runner waits by making a system call, which relays whatever is
//! pending or switches back to comm.
//!
//! # Notes on ARM-M interrupts
//!
//! On any interrupt, the processor stacks a small subset of machine state and
//! then calls our ISR. That's enough for a handler that returns to the code
//! it interrupted, but not for one that switches threads, because the rest of
//! the registers (r4-r11 and the upper FP registers) are still live with the
//! old thread's values.
//!
//! So `SVCall` and `PendSV` do the full save/restore sequence around their
//! Rust bodies, depositing everything into the current thread's
//! [`SavedState`] and reading it back out of whichever thread is current on
//! the way out. Other interrupts (notably capture) don't switch, and instead
//! pend `PendSV` to have it happen once they return.
//!
//! All of this runs at the lowest exception priority, so `SVCall` and
//! `PendSV` never preempt each other, while capture can preempt both.

use core::arch::{self, global_asm};
use core::sync::atomic::{AtomicPtr, Ordering};

use abi::Sysnum;
use cortex_m::peripheral::{DCB, DWT, MPU, SCB};
use ringbuf::{ringbuf, ringbuf_entry};
use static_assertions::const_assert;

use crate::config::{self, Region};
use crate::loader::EntryFn;
use crate::recovery::{self, FaultContext, ResumePoint};
use crate::startup;

#[cfg(not(armv7m))]
compile_error!("memory protection is only implemented for ARMv7-M");

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Fault { kind: u32, cfsr: u32 },
    BadSyscall(u32),
}

ringbuf!(Trace, 8, Trace::None);

/// Registers that must be saved across thread switches.
#[repr(C)]
#[derive(Debug)]
pub struct SavedState {
    // NOTE: the following fields must be kept contiguous!
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    psp: u32,
    exc_return: u32,
    s16_31: [u32; 16],
    // NOTE: the above fields must be kept contiguous!
}

impl SavedState {
    const EMPTY: Self = Self {
        r4: 0,
        r5: 0,
        r6: 0,
        r7: 0,
        r8: 0,
        r9: 0,
        r10: 0,
        r11: 0,
        psp: 0,
        exc_return: 0,
        s16_31: [0; 16],
    };
}

/// Stuff placed on the stack at exception entry whether or not an FPU is
/// present.
#[derive(Debug, Default)]
#[repr(C)]
struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

const COMM: usize = 0;
const RUNNER: usize = 1;

static mut THREADS: [SavedState; 2] = [SavedState::EMPTY, SavedState::EMPTY];

/// We have to use a global to record the current thread, since we don't have
/// a scratch register.
#[no_mangle]
static CURRENT_THREAD_PTR: AtomicPtr<SavedState> =
    AtomicPtr::new(core::ptr::null_mut());

const COMM_STACK_SIZE: usize = 4096;

#[repr(C, align(8))]
struct CommStack([u8; COMM_STACK_SIZE]);

static mut COMM_STACK: CommStack = CommStack([0; COMM_STACK_SIZE]);

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// Return to thread mode on the process stack, with a basic (non-FP) frame.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    struct RegionAttributes: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Memory shared with DMA or otherwise not to be cached.
        const DMA = 1 << 3;
    }
}

/// PMSAv7-style precomputed region data.
///
/// This struct is `repr(C)` to preserve the order of its fields, which happens
/// to match the order of registers in the MPU.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
struct RegionDescExt {
    rbar: u32,
    rasr: u32,
}

const fn compute_region_extension_data(
    r: Region,
    attributes: RegionAttributes,
) -> RegionDescExt {
    // Regions are protected at the next power of two up; the build script
    // checks that this is aligned.
    let size = r.size.next_power_of_two();
    if size < 32 || r.base & (size - 1) != 0 {
        panic!();
    }

    let xn = !attributes.contains(RegionAttributes::EXECUTE);
    // These AP encodings are chosen such that we never deny *privileged*
    // code (i.e. us) access to the memory.
    let ap = if attributes.contains(RegionAttributes::WRITE) {
        0b011
    } else if attributes.contains(RegionAttributes::READ) {
        0b010
    } else {
        0b001
    };
    // See table B3-13 in the ARMv7-M ARM.
    let (tex, scb) = if attributes.contains(RegionAttributes::DMA) {
        // Outer and inner non-cacheable, shared.
        (0b001, 0b100)
    } else {
        // Outer and inner write-back, read and write allocate, not shared.
        (0b001, 0b011)
    };
    // The MPU expresses size as log2 _minus one_, so the minimum region of
    // 32 bytes is represented as 4.
    let l2size = 30 - size.leading_zeros();

    let rasr =
        (xn as u32) << 28 | ap << 24 | tex << 19 | scb << 16 | l2size << 1 | 1;
    RegionDescExt { rbar: r.base, rasr }
}

const FIXED_REGIONS: usize = 5;
const REGION_COUNT: usize = FIXED_REGIONS + config::ALGORITHM_REGIONS.len();
const_assert!(REGION_COUNT <= 8);

/// What the runner may touch. Anything else (the generator, peripherals,
/// our own state) faults from unprivileged code.
static REGIONS: [RegionDescExt; REGION_COUNT] = {
    const RW: RegionAttributes =
        RegionAttributes::READ.union(RegionAttributes::WRITE);
    let mut out = [RegionDescExt { rbar: 0, rasr: 0 }; REGION_COUNT];
    out[0] = compute_region_extension_data(
        config::FLASH,
        RegionAttributes::READ.union(RegionAttributes::EXECUTE),
    );
    out[1] = compute_region_extension_data(config::RUNNER_RAM, RW);
    out[2] = compute_region_extension_data(config::RUNNER_STACK, RW);
    out[3] = compute_region_extension_data(
        config::INPUT,
        RW.union(RegionAttributes::DMA),
    );
    out[4] = compute_region_extension_data(
        config::OUTPUT,
        RW.union(RegionAttributes::DMA),
    );
    let mut i = 0;
    while i < config::ALGORITHM_REGIONS.len() {
        let a = &config::ALGORITHM_REGIONS[i];
        // Not cached, so that freshly loaded code is what gets fetched.
        let mut attrs = RW.union(RegionAttributes::DMA);
        if a.execute {
            attrs = attrs.union(RegionAttributes::EXECUTE);
        }
        out[FIXED_REGIONS + i] = compute_region_extension_data(a.region, attrs);
        i += 1;
    }
    out
};

fn apply_memory_protection() {
    // We are manufacturing authority to interact with the MPU here, because
    // nothing else in the firmware uses it.
    let mpu = unsafe { &*MPU::PTR };

    // Safety: turning the MPU off only widens what we can access.
    unsafe {
        mpu.ctrl.write(0);
    }

    for (i, data) in REGIONS.iter().enumerate() {
        // Safety: we're loading values computed at build time from the board
        // description, which only restrict the runner and not us.
        unsafe {
            mpu.rnr.write(i as u32);
            mpu.rbar.write(data.rbar);
            mpu.rasr.write(data.rasr);
        }
    }

    const ENABLE: u32 = 0b001;
    const PRIVDEFENA: u32 = 0b100;
    // Safety: this has no memory safety implications. The worst it can do is
    // cause us to fault, which is safe. The register API doesn't know this.
    unsafe {
        mpu.ctrl.write(ENABLE | PRIVDEFENA);
    }
}

/// Lays out a fresh exception frame at the top of a stack so that returning
/// into `state` starts `entry` from scratch.
///
/// # Safety
///
/// `stack_top` must be the top of a stack that nothing is using.
unsafe fn initial_frame(
    state: &mut SavedState,
    entry: fn() -> !,
    stack_top: u32,
) {
    let frame_size = core::mem::size_of::<BaseExceptionFrame>() as u32;
    let frame_addr = (stack_top - frame_size) & !7;
    let frame = BaseExceptionFrame {
        pc: entry as usize as u32 | 1,
        xpsr: INITIAL_PSR,
        lr: 0xFFFF_FFFF,
        ..Default::default()
    };
    // Safety: our caller promises the stack is ours to scribble on.
    unsafe {
        (frame_addr as *mut BaseExceptionFrame).write_volatile(frame);
    }
    *state = SavedState::EMPTY;
    state.psp = frame_addr;
    state.exc_return = EXC_RETURN_THREAD_PSP;
}

/// Raw pointer to one of the thread states.
fn thread(i: usize) -> *mut SavedState {
    // Safety: we only form a pointer here, not a reference.
    unsafe { core::ptr::addr_of_mut!(THREADS[i]) }
}

/// Makes thread `i` the one we'll return to, with the matching privilege.
fn switch_to(i: usize) {
    CURRENT_THREAD_PTR.store(thread(i), Ordering::Relaxed);
    let npriv = u32::from(i == RUNNER);
    // Safety: in handler mode, CONTROL.nPRIV only affects the thread we
    // return to.
    unsafe {
        arch::asm!("
            mrs {tmp}, CONTROL
            bic {tmp}, {tmp}, #1
            orr {tmp}, {tmp}, {npriv}
            msr CONTROL, {tmp}
            ",
            tmp = out(reg) _,
            npriv = in(reg) npriv,
            options(nomem, nostack),
        );
    }
}

/// Reads the r0 that a thread had when it took its exception.
///
/// # Safety
///
/// `state` must be a thread that's stopped in an exception.
unsafe fn get_arg(state: *mut SavedState) -> u32 {
    // Safety: a stopped thread's psp points at its stacked r0.
    unsafe { ((*state).psp as *const u32).read_volatile() }
}

/// Writes the r0 that a thread will see when it returns from its exception.
///
/// # Safety
///
/// `state` must be a thread that's stopped in an exception.
unsafe fn set_return(state: *mut SavedState, value: u32) {
    // Safety: a stopped thread's psp points at its stacked r0.
    unsafe {
        ((*state).psp as *mut u32).write_volatile(value);
    }
}

/// The relay: moves a message along and picks which thread runs next.
fn schedule() {
    let rt = startup::runtime();
    if !rt.is_runner_idle() {
        // Comm only runs while the runner waits, so the runner is current
        // and busy. Anything capture posted stays in the mailbox.
        switch_to(RUNNER);
        return;
    }

    rt.relay_step();
    let next = match rt.take_message() {
        Some(msg) => {
            // Safety: the runner is idle, so it's stopped in its syscall.
            unsafe { set_return(thread(RUNNER), u32::from(msg.tag())) };
            RUNNER
        }
        None => COMM,
    };
    switch_to(next);
}

pub fn start(comm: fn() -> !, runner: fn() -> !, runner_stack_top: u32) -> ! {
    // Enable faults and set fault/exception priorities. Faults preempt
    // everything; the converter interrupts preempt the relay and the
    // threads; SVCall and PendSV are at the bottom.
    //
    // Safety: this is actually fairly safe. We're purely lowering priorities
    // from their defaults, so it can't cause any surprise preemption or
    // anything. But these operations are `unsafe` in the `cortex_m` crate.
    unsafe {
        let scb = &*SCB::PTR;
        // MEMFAULT, BUSFAULT, USGFAULT on.
        scb.shcsr.modify(|x| x | 0b111 << 16);
        // Set priority of Usage, Bus, MemManage to 0 (highest configurable).
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // SVCall, SysTick and PendSV to 0xFF (lowest configurable).
        scb.shpr[7].write(0xFF);
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);

        // Trap on divide by zero rather than quietly producing 0, so that a
        // sloppy algorithm is caught.
        const DIV_0_TRP: u32 = 1 << 4;
        scb.ccr.modify(|x| x | DIV_0_TRP);

        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        let icb = &*cortex_m::peripheral::ICB::PTR;
        let irq_count = ((icb.ictr.read() as usize & 0xF) + 1) * 32;
        for i in 0..irq_count {
            nvic.ipr[i].write(0x40u8);
        }
    }

    // Cycle counter, for measurements.
    //
    // Safety: enabling tracing and the counter has no memory effects.
    unsafe {
        const TRCENA: u32 = 1 << 24;
        (*DCB::PTR).demcr.modify(|x| x | TRCENA);
        (*DWT::PTR).cyccnt.write(0);
        (*DWT::PTR).ctrl.modify(|x| x | 1);
    }

    apply_memory_protection();

    let comm_top = unsafe { core::ptr::addr_of!(COMM_STACK) } as u32
        + COMM_STACK_SIZE as u32;
    // Safety: neither thread has started, so both stacks are unused, and
    // nothing else is looking at the states.
    unsafe {
        initial_frame(&mut *thread(COMM), comm, comm_top);
        initial_frame(&mut *thread(RUNNER), runner, runner_stack_top);
    }

    // The runner goes first, so that it reaches its wait before any capture
    // can happen.
    CURRENT_THREAD_PTR.store(thread(RUNNER), Ordering::Relaxed);

    // Safety: this is setting the process stack pointer, which has no effect
    // _assuming_ this code is running on the main stack.
    unsafe {
        cortex_m::register::psp::write((*thread(RUNNER)).psp);
    }

    // Flip into handler mode by a trap, so we can return into an
    // unprivileged thread running off the process stack. The SVC entry
    // sequence detects that it came from the main stack and starts up rather
    // than handling a call.
    unsafe {
        arch::asm!("
            @ Restore callee-save registers.
            ldm {state}, {{r4-r11}}
            @ Trap into the kernel.
            svc #0xFF
            @ noreturn generates a UDF here in case that should return.
            ",
            state = in(reg) &(*thread(RUNNER)).r4,
            options(noreturn),
        )
    }
}

// Handler that gets linked into the vector table for the Supervisor Call (SVC)
// instruction. (Name is dictated by the `cortex_m` crate.)
//
// First, we inspect LR, which on exception entry contains bits describing the
// _previous_ (interrupted) processor state. If the SVC came from the main
// stack, this is startup. Otherwise we store the calling thread's context,
// call `syscall_entry`, and restore context from whichever thread is current
// afterwards.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        @ Inspect LR to figure out the caller's mode.
        mov r0, lr
        mov r1, #0xFFFFFFF3
        bic r0, r1
        @ Is the call coming from thread mode + main stack, i.e.
        @ from the startup routine?
        cmp r0, #0x8
        beq 1f

        @ store volatile state.
        @ first, get a pointer to the current thread.
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r1, [r0]
        movs r2, r1
        @ fetch the process-mode stack pointer.
        @ fetching into r12 means the order in the stm below is right.
        mrs r12, PSP
        @ now, store volatile registers, plus the PSP in r12, plus LR.
        stm r2!, {{r4-r12, lr}}
        vstm r2, {{s16-s31}}

        @ syscall number is passed in r11. Move it into r0 to pass it as
        @ an argument to the handler, then call the handler.
        movs r0, r11
        bl syscall_entry

        @ we're returning back to *some* thread, maybe not the same one.
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r0, [r0]
        @ restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        vldm r0, {{s16-s31}}
        msr PSP, r12

        @ resume
        bx lr

    1:  @ starting up the first thread.
        movs r0, #1         @ get bitmask to...
        msr CONTROL, r0     @ ...shed privs from thread mode.
                            @ note: no barrier here because exc return
                            @ serves as barrier

        mov lr, {exc_return}    @ materialize EXC_RETURN value to
                                @ return into thread mode, PSP

        bx lr                   @ branch into the runner
    ",
    exc_return = const EXC_RETURN_THREAD_PSP,
}

/// The Rust side of the SVCall handler.
#[no_mangle]
unsafe extern "C" fn syscall_entry(nr: u32) {
    let current = CURRENT_THREAD_PTR.load(Ordering::Relaxed);
    match Sysnum::from_u32(nr) {
        Some(Sysnum::Wait) if current == thread(RUNNER) => {
            startup::runtime().runner_idle();
            schedule();
        }
        Some(Sysnum::Cycles) => {
            // Safety: the caller is stopped in this exception.
            unsafe { set_return(current, (*DWT::PTR).cyccnt.read()) };
        }
        Some(Sysnum::ReadAlt) => {
            // Safety: the caller is stopped in this exception.
            unsafe {
                let id = get_arg(current);
                let sample = startup::alt_inputs().read(id);
                set_return(current, u32::from(sample));
            }
        }
        _ => ringbuf_entry!(Trace::BadSyscall(nr)),
    }
}

global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        @ store volatile state.
        @ first, get a pointer to the current thread.
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r1, [r0]
        @ fetch the process-mode stack pointer.
        @ fetching into r12 means the order in the stm below is right.
        mrs r12, PSP
        @ now, store volatile registers, plus the PSP in r12, plus LR.
        stm r1!, {{r4-r12, lr}}
        vstm r1, {{s16-s31}}

        bl pendsv_entry

        @ we're returning back to *some* thread, maybe not the same one.
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r0, [r0]
        @ restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        vldm r0, {{s16-s31}}
        msr PSP, r12

        @ resume
        bx lr
    ",
}

/// The Rust side of the PendSV handler, after all volatile registers have been
/// saved somewhere predictable.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    schedule();
}

/// Asks for a relay pass once the current interrupt returns.
pub fn wake_relay() {
    SCB::set_pendsv();
}

/// Makes a system call from thread mode.
fn syscall(nr: Sysnum) -> u32 {
    let r: u32;
    // Safety: the handler preserves everything but r0.
    unsafe {
        arch::asm!("
            push {{r11}}
            mov r11, {nr}
            svc #0
            pop {{r11}}
            ",
            nr = in(reg) nr as u32,
            out("r0") r,
        );
    }
    r
}

/// Blocks the runner until the relay hands it a message, and returns the
/// message's tag.
pub fn wait_for_message() -> u8 {
    syscall(Sysnum::Wait) as u8
}

/// Reads the cycle counter. Works unprivileged, by asking the kernel.
pub fn cycle_count() -> u32 {
    syscall(Sysnum::Cycles)
}

/// Loaded code is Thumb code.
pub fn algorithm_entry(addr: u32) -> Option<EntryFn> {
    if addr == 0 {
        return None;
    }
    let addr = (addr | 1) as usize;
    // Safety: the loader has checked that this is inside an executable
    // algorithm region. Whether there's a function there is the uploader's
    // problem; if not, calling it faults into recovery.
    Some(unsafe { core::mem::transmute::<usize, EntryFn>(addr) })
}

/// Makes freshly copied code visible to instruction fetch.
pub fn sync_loaded_code() {
    cortex_m::asm::dsb();
    // Safety: we only use SCB for cache maintenance, which doesn't conflict
    // with anyone.
    let mut scb = unsafe { cortex_m::Peripherals::steal() }.SCB;
    scb.invalidate_icache();
    cortex_m::asm::isb();
}

/// Restarts the current thread (which the fault handler has established is
/// the runner) at `point`.
///
/// # Safety
///
/// Only call this from the fault handler, on the way back to the faulting
/// thread.
pub unsafe fn force_resume(point: &ResumePoint) {
    // Whatever lazy FP state was pending belonged to the frame we're
    // throwing away.
    const LSPACT: u32 = 1 << 0;
    // Safety: we're in the fault handler, nothing else touches FPCCR.
    unsafe {
        let fpu = &*cortex_m::peripheral::FPU::PTR;
        fpu.fpccr.modify(|x| x & !LSPACT);
    }

    let state = CURRENT_THREAD_PTR.load(Ordering::Relaxed);
    // Safety: the runner is stopped in this fault and its stack is dead.
    unsafe { initial_frame(&mut *state, point.entry, point.stack_top) };
}

#[repr(u8)]
#[allow(dead_code)]
enum FaultType {
    HardFault = 3,
    MemoryManagement = 4,
    BusFault = 5,
    UsageFault = 6,
}

global_asm! {"
    .section .text.configurable_fault
    .globl configurable_fault
    .type configurable_fault,function
    .cpu cortex-m4  @ least common denominator we support
    configurable_fault:
        @ Read the current thread pointer.
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r0, [r0]
        mrs r12, PSP

        @ Save the rest of the integer context, plus the PSP (now in r12),
        @ plus exc_return (now in LR). We refrain from touching the floating
        @ point registers, which could induce a lazy save onto a stack we
        @ already know is bad.
        mov r2, r0
        stm r2!, {{r4-r12, lr}}

        @ Pull our fault number out of IPSR, allowing for program text to be
        @ shared across all faults.
        mrs r1, IPSR
        and r1, r1, #0xf
        bl handle_fault

        @ If we got back here, the thread has been rewound. Reload it.
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r0, [r0]

        @ Restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        vldm r0, {{s16-s31}}
        msr PSP, r12

        @ resume
        bx lr

    .section .text.MemoryManagement
    .globl MemoryManagement
    .type MemoryManagement,function
    MemoryManagement:
        b configurable_fault

    .section .text.BusFault
    .globl BusFault
    .type BusFault,function
    BusFault:
        b configurable_fault

    .section .text.UsageFault
    .globl UsageFault
    .type UsageFault,function
    UsageFault:
        b configurable_fault

    .section .text.HardFault
    .globl HardFault
    .type HardFault,function
    HardFault:
        b configurable_fault
    ",
}

bitflags::bitflags! {
    /// Bits in the Configurable Fault Status Register.
    #[repr(transparent)]
    struct Cfsr: u32 {
        // Bits 0-7: MMFSR (Memory Management Fault Status Register)
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        // MMFSR bit 2 reserved
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        // MMFSR bit 6 reserved
        const MMARVALID = 1 << 7;

        // Bits 8-15: BFSR (Bus Fault Status Register)
        const IBUSERR = 1 << (8 + 0);
        const PRECISERR = 1 << (8 + 1);
        const IMPRECISERR = 1 << (8 + 2);
        const UNSTKERR = 1 << (8 + 3);
        const STKERR = 1 << (8 + 4);
        const LSPERR = 1 << (8 + 5);
        // BFSR bit 6 reserved
        const BFARVALID = 1 << (8 + 7);

        // Bits 16-31: UFSR (Usage Fault Status Register)
        const UNDEFINSTR = 1 << (16 + 0);
        const INVSTATE = 1 << (16 + 1);
        const INVPC = 1 << (16 + 2);
        const NOCP = 1 << (16 + 3);
        const UNALIGNED = 1 << (16 + 8);
        const DIVBYZERO = 1 << (16 + 9);
    }
}

/// Rust entry point for faults.
///
/// # Safety
///
/// In brief: don't call this. This is an implementation factor of the fault
/// handler assembly code and should not be used for other purposes.
#[no_mangle]
unsafe extern "C" fn handle_fault(state: *mut SavedState, fault_type: u32) {
    // Safety: SCB is a static, always-present register block, and we only
    // take a shared reference.
    let scb = unsafe { &*SCB::PTR };
    let cfsr = Cfsr::from_bits_truncate(scb.cfsr.read());
    ringbuf_entry!(Trace::Fault {
        kind: fault_type,
        cfsr: cfsr.bits()
    });

    // Safety: the assembly stub passes the state it just saved into.
    let (exc_return, psp) = unsafe { ((*state).exc_return, (*state).psp) };

    // A fault taken while stacking another exception leaves that exception
    // pending, and we'd take it again on the way out. Clear the pended bits
    // for architectural exceptions (SHCSR 15:12).
    //
    // Safety: blanket-unsafe register API; we're at a higher priority than
    // anything being cleared.
    unsafe {
        scb.shcsr.modify(|bits| bits & !(0b1111 << 12));
    }

    let address = if cfsr.contains(Cfsr::MMARVALID) {
        Some(scb.mmfar.read())
    } else if cfsr.contains(Cfsr::BFARVALID) {
        Some(scb.bfar.read())
    } else {
        None
    };

    // These are write-one-to-clear registers, so writing back what we read
    // clears the recorded conditions.
    //
    // Safety: it is not at _all_ clear why these writes are unsafe.
    unsafe {
        scb.cfsr.write(cfsr.bits());
        if fault_type == FaultType::HardFault as u32 {
            scb.hfsr.write(scb.hfsr.read());
        }
    }

    let from_process_stack = exc_return & 0b100 != 0;
    let ctx = FaultContext {
        stack_pointer: if from_process_stack {
            psp
        } else {
            cortex_m::register::msp::read()
        },
        from_thread_mode: exc_return & 0b1000 != 0,
        from_process_stack,
        status: cfsr.bits(),
        address,
    };

    // Safety: we are the fault handler.
    unsafe {
        recovery::recover(startup::runtime(), &ctx, startup::resume_point());
    }
}
