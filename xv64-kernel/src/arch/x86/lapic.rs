//! The local APIC, through its memory-mapped registers: core identity, the periodic timer
//! and end-of-interrupt. The legacy PICs are masked off.

use crate::param::NCPU;
use crate::trap::Vector;
use crate::vm::{self, PhysAddr};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use x86_64::instructions::port::Port;

const LAPIC_BASE: usize = 0xFEE0_0000;

const ID: usize = 0x020;
const TPR: usize = 0x080;
const EOI: usize = 0x0B0;
const SVR: usize = 0x0F0;
const TIMER: usize = 0x320;
const LINT0: usize = 0x350;
const LINT1: usize = 0x360;
const ERROR: usize = 0x370;
const TICR: usize = 0x380;
const TDCR: usize = 0x3E0;

const ENABLE: u32 = 0x100;
const PERIODIC: u32 = 0x2_0000;
const MASKED: u32 = 0x1_0000;
const DIVIDE_BY_1: u32 = 0xB;
/// Bus cycles between timer ticks
const TIMER_COUNT: u32 = 10_000_000;

const UNASSIGNED: u8 = u8::MAX;

/// Core index of each APIC id
static CPU_INDEX: [AtomicU8; 256] = [const { AtomicU8::new(UNASSIGNED) }; 256];
static CPUS_STARTED: AtomicUsize = AtomicUsize::new(0);

fn register(offset: usize) -> *mut u32 {
    vm::phys_to_virt(PhysAddr(LAPIC_BASE + offset)).cast()
}

fn read(offset: usize) -> u32 {
    unsafe { register(offset).read_volatile() }
}

fn write(offset: usize, value: u32) {
    unsafe { register(offset).write_volatile(value) };
    // Wait for the write to finish.
    read(ID);
}

fn apic_id() -> usize {
    (read(ID) >> 24) as usize
}

/// Index of the calling core, in the order the cores came up.
pub(crate) fn cpu_index() -> usize {
    usize::from(CPU_INDEX[apic_id()].load(Ordering::Relaxed))
}

/// Enables this core's APIC and starts its timer. Returns the index the core gets.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn init() -> usize {
    let cpu = CPUS_STARTED.fetch_add(1, Ordering::SeqCst);
    assert!(cpu < NCPU, "lapic: more than {NCPU} cores");
    CPU_INDEX[apic_id()].store(cpu as u8, Ordering::Relaxed);

    write(SVR, ENABLE | Vector::Spurious as u32);
    write(TDCR, DIVIDE_BY_1);
    write(TIMER, PERIODIC | Vector::Timer as u32);
    write(TICR, TIMER_COUNT);
    write(LINT0, MASKED);
    write(LINT1, MASKED);
    // Clear any stale error, then any outstanding interrupt.
    write(ERROR, 0);
    write(ERROR, 0);
    write(EOI, 0);
    write(TPR, 0);
    cpu
}

pub(crate) fn end_of_interrupt() {
    write(EOI, 0);
}

/// Masks every line of both 8259 PICs; interrupts come through the APIC only.
pub(crate) fn disable_pic() {
    unsafe {
        Port::<u8>::new(0x21).write(0xFF);
        Port::<u8>::new(0xA1).write(0xFF);
    }
}
