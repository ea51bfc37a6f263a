//! Syscall numbers, the two dispatch tables, and argument fetching.
//!
//! `int 64` reaches the general table, whose handlers see their arguments through
//! [`SyscallArgs`]. The `syscall` instruction reaches the fast table, whose handlers get
//! the raw frame and keep their whole exchange in registers.

use crate::hal::Hal;
use crate::ipc::{self, IpcError};
use crate::param::NSYSCALL;
use crate::proc::ProcError;
use crate::trap::Trapframe;
use crate::vm::{AddressSpace, VmError};
use crate::{exec, sysproc, Kernel};
use alloc::vec::Vec;
use log::warn;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Value a failed syscall returns, -1 as the user sees it
pub const FAILURE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum Sysno {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Pipe = 4,
    Read = 5,
    Kill = 6,
    Exec = 7,
    Fstat = 8,
    Chdir = 9,
    Dup = 10,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Open = 15,
    Write = 16,
    Mknod = 17,
    Unlink = 18,
    Link = 19,
    Mkdir = 20,
    Close = 21,
    SetSize = 22,
    NullCall = 23,
    Send = 24,
    Recv = 25,
    SendRecv = 26,
    TlbReload = 27,
    TlbReloadTouch = 28,
    TouchPages = 29,
}

/// Which table a syscall is looked up in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Table {
    General,
    Fast,
}

/// Where general syscalls find their arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyscallAbi {
    /// rdi, rsi, rdx, r10, r8, r9
    #[default]
    Registers,
    /// Words above the return address on the user stack
    UserStack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// An argument is out of range for its use
    BadArgument,
    /// An argument points outside the caller's memory
    BadAddress,
    Proc(ProcError),
    Vm(VmError),
    Ipc(IpcError),
    File(crate::file::FileError),
    Load(exec::LoadError),
    /// The caller was killed while the call waited
    Killed,
}

impl From<ProcError> for SyscallError {
    fn from(value: ProcError) -> Self {
        Self::Proc(value)
    }
}

impl From<VmError> for SyscallError {
    fn from(value: VmError) -> Self {
        match value {
            VmError::BadAddress => Self::BadAddress,
            VmError::OutOfMemory => Self::Vm(value),
        }
    }
}

impl From<IpcError> for SyscallError {
    fn from(value: IpcError) -> Self {
        Self::Ipc(value)
    }
}

impl From<crate::file::FileError> for SyscallError {
    fn from(value: crate::file::FileError) -> Self {
        Self::File(value)
    }
}

impl From<exec::LoadError> for SyscallError {
    fn from(value: exec::LoadError) -> Self {
        Self::Load(value)
    }
}

pub(crate) type SyscallFn<H> = fn(&Kernel<H>, &mut SyscallArgs<'_>) -> Result<u64, SyscallError>;
pub(crate) type FastcallFn<H> = fn(&Kernel<H>, &mut Trapframe) -> u64;

pub(crate) struct SyscallTables<H: Hal> {
    general: [Option<SyscallFn<H>>; NSYSCALL],
    fast: [Option<FastcallFn<H>>; NSYSCALL],
}

impl<H: Hal> SyscallTables<H> {
    pub(crate) fn new() -> Self {
        let general_handlers: &[(Sysno, SyscallFn<H>)] = &[
            (Sysno::Fork, sysproc::sys_fork),
            (Sysno::Exit, sysproc::sys_exit),
            (Sysno::Wait, sysproc::sys_wait),
            (Sysno::Read, sysproc::sys_read),
            (Sysno::Kill, sysproc::sys_kill),
            (Sysno::Exec, exec::sys_exec),
            (Sysno::Dup, sysproc::sys_dup),
            (Sysno::Getpid, sysproc::sys_getpid),
            (Sysno::Sbrk, sysproc::sys_sbrk),
            (Sysno::Sleep, sysproc::sys_sleep),
            (Sysno::Uptime, sysproc::sys_uptime),
            (Sysno::Write, sysproc::sys_write),
            (Sysno::Close, sysproc::sys_close),
        ];
        let fast_handlers: &[(Sysno, FastcallFn<H>)] = &[
            (Sysno::NullCall, sysproc::sys_null_call),
            (Sysno::Send, ipc::sys_send),
            (Sysno::Recv, ipc::sys_recv),
            (Sysno::SendRecv, ipc::sys_send_recv),
            (Sysno::TlbReload, sysproc::sys_tlb_reload),
            (Sysno::TlbReloadTouch, sysproc::sys_tlb_reload_touch),
            (Sysno::TouchPages, sysproc::sys_touch_pages),
        ];

        let mut general = [None; NSYSCALL];
        for &(number, handler) in general_handlers {
            general[index(number)] = Some(handler);
        }
        let mut fast = [None; NSYSCALL];
        for &(number, handler) in fast_handlers {
            fast[index(number)] = Some(handler);
        }

        Self { general, fast }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn index(number: Sysno) -> usize {
    u64::from(number) as usize
}

/// Arguments of a general syscall, fetched under the kernel's configured convention and
/// checked against the caller's memory.
pub(crate) struct SyscallArgs<'a> {
    frame: &'a mut Trapframe,
    space: &'a mut AddressSpace,
    abi: SyscallAbi,
}

impl<'a> SyscallArgs<'a> {
    pub(crate) fn new(
        frame: &'a mut Trapframe,
        space: &'a mut AddressSpace,
        abi: SyscallAbi,
    ) -> Self {
        Self { frame, space, abi }
    }

    pub(crate) fn frame(&self) -> &Trapframe {
        &*self.frame
    }

    pub(crate) fn frame_mut(&mut self) -> &mut Trapframe {
        &mut *self.frame
    }

    pub(crate) fn space(&mut self) -> &mut AddressSpace {
        &mut *self.space
    }

    /// The `n`th argument as a raw word.
    pub(crate) fn word(&self, n: usize) -> Result<u64, SyscallError> {
        match self.abi {
            SyscallAbi::Registers => {
                let frame = &*self.frame;
                [frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9]
                    .get(n)
                    .copied()
                    .ok_or(SyscallError::BadArgument)
            }
            SyscallAbi::UserStack => {
                let address = usize::try_from(self.frame.rsp)
                    .ok()
                    .and_then(|rsp| rsp.checked_add(8 * (n + 1)))
                    .ok_or(SyscallError::BadAddress)?;
                Ok(self.space.read_u64(address)?)
            }
        }
    }

    /// The `n`th argument as a signed integer.
    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn int(&self, n: usize) -> Result<i64, SyscallError> {
        Ok(self.word(n)? as i64)
    }

    /// The `n`th argument as a length or index that must fit `usize`.
    pub(crate) fn size(&self, n: usize) -> Result<usize, SyscallError> {
        usize::try_from(self.word(n)?).map_err(|_| SyscallError::BadArgument)
    }

    /// The `n`th argument as a pointer to `len` bytes of the caller's memory.
    pub(crate) fn pointer(&self, n: usize, len: usize) -> Result<usize, SyscallError> {
        let address = usize::try_from(self.word(n)?).map_err(|_| SyscallError::BadAddress)?;
        match address.checked_add(len) {
            Some(end) if end <= self.space.size() => Ok(address),
            _ => Err(SyscallError::BadAddress),
        }
    }

    /// Copies in `len` bytes the `n`th argument points to.
    pub(crate) fn buffer(&self, n: usize, len: usize) -> Result<Vec<u8>, SyscallError> {
        let address = self.pointer(n, len)?;
        let mut buffer = alloc::vec![0; len];
        self.space.copy_in(address, &mut buffer)?;
        Ok(buffer)
    }

    /// Copies in the NUL-terminated string the `n`th argument points to.
    pub(crate) fn string(&self, n: usize, max: usize) -> Result<Vec<u8>, SyscallError> {
        let address = usize::try_from(self.word(n)?).map_err(|_| SyscallError::BadAddress)?;
        Ok(self.space.fetch_str(address, max)?)
    }
}

impl<H: Hal> Kernel<H> {
    /// Runs the general syscall named in rax and leaves its result there.
    pub(crate) fn syscall(&self, frame: &mut Trapframe) {
        let number = frame.rax;
        let handler = usize::try_from(number)
            .ok()
            .and_then(|n| self.syscalls.general.get(n).copied().flatten());
        let Some(handler) = handler else {
            frame.rax = self.unknown_syscall(number);
            return;
        };

        let me = self.myproc();
        let space = unsafe { self.private(me) }.space_mut();
        let mut args = SyscallArgs::new(frame, space, self.abi);
        let result = handler(self, &mut args);
        frame.rax = result.unwrap_or(FAILURE);
    }

    /// Runs the fast-path syscall named in rax and leaves its result there.
    pub(crate) fn fastcall(&self, frame: &mut Trapframe) {
        let number = frame.rax;
        let handler = usize::try_from(number)
            .ok()
            .and_then(|n| self.syscalls.fast.get(n).copied().flatten());
        frame.rax = match handler {
            Some(handler) => handler(self, frame),
            None => self.unknown_syscall(number),
        };
    }

    fn unknown_syscall(&self, number: u64) -> u64 {
        let (pid, name) = self.identity(self.myproc());
        warn!("{pid} {name}: unknown sys call {number}");
        FAILURE
    }
}
