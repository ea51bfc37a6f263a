use super::entry::vectors;
use crate::trap::Vector;
use spin::once::Once;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

static IDT: Once<InterruptDescriptorTable> = Once::new();

/// Points every gate at its stub; only the syscall gate may be raised from user mode.
fn build() -> InterruptDescriptorTable {
    let mut idt = InterruptDescriptorTable::new();
    let stub = |vector: usize| VirtAddr::new(unsafe { vectors[vector] });

    macro_rules! gates {
        ($($field:ident = $vector:expr),* $(,)?) => {
            $(unsafe { idt.$field.set_handler_addr(stub($vector)); })*
        };
    }
    gates! {
        divide_error = 0,
        debug = 1,
        non_maskable_interrupt = 2,
        breakpoint = 3,
        overflow = 4,
        bound_range_exceeded = 5,
        invalid_opcode = 6,
        device_not_available = 7,
        double_fault = 8,
        invalid_tss = 10,
        segment_not_present = 11,
        stack_segment_fault = 12,
        general_protection_fault = 13,
        page_fault = 14,
        x87_floating_point = 16,
        alignment_check = 17,
        machine_check = 18,
        simd_floating_point = 19,
        virtualization = 20,
    }

    for vector in 32..=255u8 {
        let options = unsafe { idt[vector].set_handler_addr(stub(usize::from(vector))) };
        if u64::from(vector) == u64::from(Vector::Syscall) {
            options.set_privilege_level(PrivilegeLevel::Ring3);
        }
    }
    idt
}

/// Loads the shared table on the calling core.
pub(crate) fn init() {
    IDT.call_once(build).load();
}
