//! Compile-time sizing of the kernel's fixed tables.

use crate::vm::PAGE_SIZE;

/// Maximum number of processes
pub const NPROC: usize = 64;
/// Maximum number of cores the kernel drives
pub const NCPU: usize = 8;
/// Size of each process's kernel stack
pub const KSTACK_SIZE: usize = 2 * PAGE_SIZE;
/// Hardware TLB tags handed out to processes. Tag 0 is the kernel's and is not in the pool.
pub const NTAGS: usize = 8;
/// Machine words carried by one IPC message
pub const MSG_WORDS: usize = 8;
/// Open resource slots per process
pub const NOFILE: usize = 16;
/// Maximum number of `exec` arguments
pub const MAX_ARGS: usize = 32;
/// Longest string argument copied in from user space, terminator included
pub const MAX_STR: usize = 256;
/// Bytes kept of a process name
pub const PROC_NAME_LEN: usize = 16;
/// Size of both syscall tables
pub const NSYSCALL: usize = 32;
