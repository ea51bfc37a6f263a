//! Assembly entry and exit paths.
//!
//! Every vector has a stub that pushes a dummy error code where the CPU did not push one,
//! then the vector number, and jumps to `alltraps`, which saves the general registers into
//! a [`Trapframe`] and calls `trap_entry`. The `syscall` instruction enters through
//! `syscall_entry`, which switches to the kernel stack by hand and builds the same frame
//! with vector 256. Both leave through `trapret` and `iretq`.

use super::trap_entry;
use crate::trap::{Trapframe, USER_CS, USER_DS};
use core::arch::global_asm;
use core::mem::offset_of;

extern "C" {
    /// Addresses of the 256 vector stubs
    pub(crate) static vectors: [u64; 256];
    pub(crate) fn syscall_entry();
    fn trapret_from(frame: *const Trapframe) -> !;
}

/// Restores `frame` and leaves the kernel through it.
///
/// # Safety
/// `frame` must be the top of the current kernel stack, describing a valid return.
pub(crate) unsafe fn trapret(frame: *const Trapframe) -> ! {
    unsafe { trapret_from(frame) }
}

/// Byte offset of the kernel stack top in a core's syscall scratch block
pub(crate) const SCRATCH_KERNEL_STACK: usize = 0;
/// Byte offset of the saved user stack pointer in a core's syscall scratch block
pub(crate) const SCRATCH_USER_STACK: usize = 8;

global_asm!(
    ".altmacro",
    ".macro vector n",
    "vector\\n:",
    // Vectors 8, 10-14, 17, 21, 29 and 30 come with a CPU-pushed error code.
    ".if (\\n == 8) || ((\\n >= 10) && (\\n <= 14)) || (\\n == 17) || (\\n == 21) || (\\n == 29) || (\\n == 30)",
    ".else",
    "push 0",
    ".endif",
    "push \\n",
    "jmp alltraps",
    ".endm",
    "",
    ".macro vector_address n",
    ".quad vector\\n",
    ".endm",
    "",
    ".section .text",
    ".set i, 0",
    ".rept 256",
    "vector %i",
    ".set i, i + 1",
    ".endr",
    "",
    "alltraps:",
    "push r15",
    "push r14",
    "push r13",
    "push r12",
    "push r11",
    "push r10",
    "push r9",
    "push r8",
    "push rdi",
    "push rsi",
    "push rbp",
    "push rdx",
    "push rcx",
    "push rbx",
    "push rax",
    "mov rdi, rsp",
    "cld",
    "call {trap_entry}",
    "jmp trapret_common",
    "",
    ".global trapret_from",
    "trapret_from:",
    "mov rsp, rdi",
    "trapret_common:",
    "pop rax",
    "pop rbx",
    "pop rcx",
    "pop rdx",
    "pop rbp",
    "pop rsi",
    "pop rdi",
    "pop r8",
    "pop r9",
    "pop r10",
    "pop r11",
    "pop r12",
    "pop r13",
    "pop r14",
    "pop r15",
    // Vector number and error code
    "add rsp, 16",
    "iretq",
    "",
    // rcx holds the user rip and r11 the user rflags; interrupts are masked by SFMASK.
    ".global syscall_entry",
    "syscall_entry:",
    "swapgs",
    "mov gs:[{user_stack}], rsp",
    "mov rsp, gs:[{kernel_stack}]",
    "push {user_ds}",
    "push qword ptr gs:[{user_stack}]",
    "swapgs",
    "push r11",
    "push {user_cs}",
    "push rcx",
    "push 0",
    "push 256",
    "jmp alltraps",
    "",
    ".section .rodata",
    ".balign 8",
    ".global vectors",
    "vectors:",
    ".set i, 0",
    ".rept 256",
    "vector_address %i",
    ".set i, i + 1",
    ".endr",
    ".section .text",
    trap_entry = sym trap_entry,
    user_stack = const SCRATCH_USER_STACK,
    kernel_stack = const SCRATCH_KERNEL_STACK,
    user_ds = const USER_DS,
    user_cs = const USER_CS,
);

const _: () = assert!(offset_of!(Trapframe, trapno) == 15 * 8);
const _: () = assert!(core::mem::size_of::<Trapframe>() == 22 * 8);
