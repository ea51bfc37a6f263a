use crate::hal::ContextEntry;
use core::arch::global_asm;

/// A suspended kernel flow. Its callee-saved registers sit on its own stack, in the order
/// `swtch` pops them.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct Context {
    pub(crate) rsp: usize,
}

/// Slots `swtch` pops: r15, r14, r13, r12, rbx, rbp, then the return address
const SAVED_WORDS: usize = 7;

impl Context {
    /// Arranges for the first `swtch` into this context to run `entry(arg)` on the stack
    /// ending at `stack_top`, which must be 16-byte aligned.
    pub(crate) fn prime(&mut self, stack_top: usize, entry: ContextEntry, arg: usize) {
        let frame = (stack_top - SAVED_WORDS * 8) as *mut usize;
        let words = [0, 0, arg, entry as usize, 0, 0, context_start as usize];
        for (i, word) in words.into_iter().enumerate() {
            unsafe { frame.add(i).write(word) };
        }
        self.rsp = frame as usize;
    }
}

extern "C" {
    /// Pushes the callee-saved registers, stores the stack pointer through `save`, then
    /// resumes the flow whose stack pointer is `load`.
    pub(crate) fn swtch(save: *mut usize, load: usize);
    /// First return target of a primed context: calls r12 with r13 as its argument.
    fn context_start();
}

global_asm!(
    ".global swtch",
    "swtch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    "",
    ".global context_start",
    "context_start:",
    "mov rdi, r13",
    "call r12",
    "ud2",
);
