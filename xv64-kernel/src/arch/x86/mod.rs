//! x86-64 hardware under the kernel: segment and interrupt tables, the local APIC timer,
//! the COM1 console and the assembly entry paths.

pub mod boot;
mod context;
mod entry;
mod gdt;
mod idt;
mod lapic;
pub(crate) mod serial;

use crate::hal::{ContextEntry, Hal};
use crate::tlb::AddressSwitch;
use crate::trap::Trapframe;
use crate::vm::PhysAddr;
use crate::Kernel;
use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::once::Once;
use x86_64::instructions::{hlt, interrupts};
use x86_64::registers::control::Cr2;

pub(crate) use context::Context;

static KERNEL: Once<Kernel<X86>> = Once::new();

/// Set once CR4.PCIDE is on, on every core
static PCID_ENABLED: AtomicBool = AtomicBool::new(false);

/// CR3 bit asking the processor to keep translations cached under the new PCID
const CR3_NO_FLUSH: u64 = 1 << 63;

/// The kernel started by [`boot`].
pub fn kernel() -> &'static Kernel<X86> {
    KERNEL.get().expect("kernel not started")
}

pub struct X86;

impl Hal for X86 {
    type Context = Context;

    fn cpu_id(&self) -> usize {
        lapic::cpu_index()
    }

    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    fn disable_interrupts(&self) {
        interrupts::disable();
    }

    fn enable_interrupts(&self) {
        interrupts::enable();
    }

    fn wait_for_interrupt(&self) {
        interrupts::enable_and_hlt();
    }

    fn prime_context(
        &self,
        context: &mut Context,
        stack_top: usize,
        entry: ContextEntry,
        arg: usize,
    ) {
        context.prime(stack_top, entry, arg);
    }

    unsafe fn swap_context(&self, save: *mut Context, load: *const Context) {
        unsafe { context::swtch(&mut (*save).rsp, (*load).rsp) };
    }

    fn load_address_space(&self, root: PhysAddr, switch: AddressSwitch) {
        let mut cr3 = root.0 as u64;
        if PCID_ENABLED.load(Ordering::Relaxed) {
            cr3 |= u64::from(switch.tag);
            if !switch.invalidate {
                cr3 |= CR3_NO_FLUSH;
            }
        }
        unsafe { asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags)) };
    }

    fn set_kernel_stack(&self, top: usize) {
        gdt::set_kernel_stack(self.cpu_id(), top);
    }

    fn acknowledge_interrupt(&self) {
        lapic::end_of_interrupt();
    }

    fn fault_address(&self) -> usize {
        Cr2::read_raw() as usize
    }

    fn cycle_counter(&self) -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    fn touch_user(&self, address: usize) -> u64 {
        unsafe { core::ptr::read_volatile(address as *const u64) }
    }

    unsafe fn return_to_user(&self, frame: *const Trapframe) -> ! {
        unsafe { entry::trapret(frame) }
    }

    fn halt(&self) -> ! {
        interrupts::disable();
        loop {
            hlt();
        }
    }
}

/// Every trap and interrupt stub lands here with the frame it pushed.
extern "C" fn trap_entry(frame: &mut Trapframe) {
    kernel().trap(frame);
}
