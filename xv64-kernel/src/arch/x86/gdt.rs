//! Segments, the task-state segment and the `syscall` MSRs, one set per core.
//!
//! The descriptor order fixes the selectors in [`crate::trap`]: kernel code 0x08, kernel
//! data 0x10, user data 0x18 and user code 0x20. `sysret` needs user data right below user
//! code.

use super::entry::{self, SCRATCH_KERNEL_STACK, SCRATCH_USER_STACK};
use crate::param::NCPU;
use crate::trap::{KERNEL_CS, KERNEL_DS, USER_CS, USER_DS};
use core::ptr::addr_of_mut;
use x86_64::instructions::tables::load_tss;
use x86_64::registers::model_specific::{Efer, EferFlags, KernelGsBase, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::registers::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::{PrivilegeLevel, VirtAddr};

/// What `syscall_entry` reads through the kernel GS base
#[repr(C)]
struct SyscallScratch {
    kernel_stack: usize,
    user_stack: usize,
}

static mut TSS: [TaskStateSegment; NCPU] = [const { TaskStateSegment::new() }; NCPU];
static mut GDT: [GlobalDescriptorTable; NCPU] = [const { GlobalDescriptorTable::new() }; NCPU];
static mut SCRATCH: [SyscallScratch; NCPU] = [const {
    SyscallScratch {
        kernel_stack: 0,
        user_stack: 0,
    }
}; NCPU];

const _: () = assert!(core::mem::offset_of!(SyscallScratch, kernel_stack) == SCRATCH_KERNEL_STACK);
const _: () = assert!(core::mem::offset_of!(SyscallScratch, user_stack) == SCRATCH_USER_STACK);

/// Loads this core's GDT and TSS and points `syscall` at the kernel.
///
/// # Safety
/// Must run once on each core, as core `cpu`, with interrupts disabled.
pub(crate) unsafe fn init(cpu: usize) {
    let tss = unsafe { &*addr_of_mut!(TSS[cpu]) };
    let gdt = unsafe { &mut *addr_of_mut!(GDT[cpu]) };
    let kernel_code = gdt.append(Descriptor::kernel_code_segment());
    let kernel_data = gdt.append(Descriptor::kernel_data_segment());
    let user_data = gdt.append(Descriptor::user_data_segment());
    let user_code = gdt.append(Descriptor::user_code_segment());
    let tss_selector = gdt.append(Descriptor::tss_segment(tss));
    assert_eq!(u64::from(kernel_code.0), KERNEL_CS);
    assert_eq!(u64::from(kernel_data.0), KERNEL_DS);
    assert_eq!(u64::from(user_data.0), USER_DS);
    assert_eq!(u64::from(user_code.0), USER_CS);

    gdt.load();
    unsafe {
        CS::set_reg(kernel_code);
        SS::set_reg(kernel_data);
        DS::set_reg(SegmentSelector::new(0, PrivilegeLevel::Ring0));
        ES::set_reg(SegmentSelector::new(0, PrivilegeLevel::Ring0));
        load_tss(tss_selector);
    }

    let scratch = unsafe { addr_of_mut!(SCRATCH[cpu]) };
    KernelGsBase::write(VirtAddr::from_ptr(scratch));
    Star::write(user_code, user_data, kernel_code, kernel_data)
        .expect("syscall selectors out of order");
    LStar::write(VirtAddr::new(entry::syscall_entry as usize as u64));
    SFMask::write(RFlags::INTERRUPT_FLAG | RFlags::DIRECTION_FLAG);
    unsafe { Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS)) };
}

/// Makes `top` the stack both interrupts from user mode and `syscall` arrive on.
pub(crate) fn set_kernel_stack(cpu: usize, top: usize) {
    unsafe {
        (*addr_of_mut!(TSS[cpu])).privilege_stack_table[0] = VirtAddr::new(top as u64);
        (*addr_of_mut!(SCRATCH[cpu])).kernel_stack = top;
    }
}
