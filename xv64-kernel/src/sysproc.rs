//! Handlers behind the syscall tables: process control and the timing calls.

use crate::hal::Hal;
use crate::proc::{Pid, ProcError, WaitChannel};
use crate::syscall::{SyscallArgs, SyscallError};
use crate::trap::Trapframe;
use crate::vm::PAGE_SIZE;
use crate::Kernel;
use alloc::vec;
use core::mem::size_of;

pub(crate) fn sys_fork<H: Hal>(
    kernel: &Kernel<H>,
    args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    let pid = kernel.fork(args.frame())?;
    Ok(u64::from(pid.as_u32()))
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn sys_exit<H: Hal>(
    kernel: &Kernel<H>,
    args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    kernel.exit(args.int(0)? as i32)
}

/// wait(status): reaps a child, storing its exit status at `status` unless it is null.
pub(crate) fn sys_wait<H: Hal>(
    kernel: &Kernel<H>,
    args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    let status_address = match args.word(0)? {
        0 => None,
        _ => Some(args.pointer(0, size_of::<i32>())?),
    };
    // Checked before reaping: a reaped child cannot be put back.
    if let Some(address) = status_address {
        args.space().check_user(address, size_of::<i32>())?;
    }
    let (pid, status) = kernel.wait().ok_or(ProcError::NoChildren)?;
    if let Some(address) = status_address {
        args.space().copy_out(address, &status.to_ne_bytes())?;
    }
    Ok(u64::from(pid.as_u32()))
}

pub(crate) fn sys_kill<H: Hal>(
    kernel: &Kernel<H>,
    args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    let pid = u32::try_from(args.word(0)?).map_err(|_| SyscallError::BadArgument)?;
    kernel.kill(Pid::new(pid))?;
    Ok(0)
}

pub(crate) fn sys_getpid<H: Hal>(
    kernel: &Kernel<H>,
    _args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    let (pid, _) = kernel.identity(kernel.myproc());
    Ok(u64::from(pid.as_u32()))
}

/// sbrk(n): grows (or with a negative `n` shrinks) user memory, returning the old size.
pub(crate) fn sys_sbrk<H: Hal>(
    kernel: &Kernel<H>,
    args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    let delta = isize::try_from(args.int(0)?).map_err(|_| SyscallError::BadArgument)?;
    let space = args.space();
    let old_size = space.size();
    let new_size = old_size
        .checked_add_signed(delta)
        .ok_or(SyscallError::BadArgument)?;
    if new_size >= old_size {
        space.grow(new_size)?;
    } else {
        space.shrink(new_size);
        // Translations of the freed pages may still be cached under the old tag.
        kernel.refresh_address_space();
    }
    Ok(old_size as u64)
}

/// sleep(n): waits for `n` timer ticks. Fails if the caller is killed meanwhile.
pub(crate) fn sys_sleep<H: Hal>(
    kernel: &Kernel<H>,
    args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    let n = args.word(0)?;
    let me = kernel.myproc();
    let mut ticks = kernel.lock(&kernel.ticks);
    let ticks0 = *ticks;
    while *ticks - ticks0 < n {
        if kernel.is_killed(me) {
            return Err(SyscallError::Killed);
        }
        ticks = kernel.sleep(WaitChannel::Ticks, ticks);
    }
    Ok(0)
}

/// Ticks since boot
pub(crate) fn sys_uptime<H: Hal>(
    kernel: &Kernel<H>,
    _args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    Ok(kernel.ticks())
}

pub(crate) fn sys_read<H: Hal>(
    kernel: &Kernel<H>,
    args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    let file = kernel.file(args.size(0)?)?;
    let len = args.size(2)?;
    let address = args.pointer(1, len)?;
    let mut buffer = vec![0; len];
    let n = file.read(&mut buffer)?;
    args.space().copy_out(address, &buffer[..n])?;
    Ok(n as u64)
}

pub(crate) fn sys_write<H: Hal>(
    kernel: &Kernel<H>,
    args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    let file = kernel.file(args.size(0)?)?;
    let len = args.size(2)?;
    let data = args.buffer(1, len)?;
    Ok(file.write(&data)? as u64)
}

pub(crate) fn sys_dup<H: Hal>(
    kernel: &Kernel<H>,
    args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    let file = kernel.file(args.size(0)?)?;
    Ok(kernel.fd_alloc(file)? as u64)
}

pub(crate) fn sys_close<H: Hal>(
    kernel: &Kernel<H>,
    args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    kernel.fd_close(args.size(0)?)?;
    Ok(0)
}

/// Does nothing; measures the bare cost of a fast call.
pub(crate) fn sys_null_call<H: Hal>(_kernel: &Kernel<H>, _frame: &mut Trapframe) -> u64 {
    1
}

/// tlb_reload(runs): reloads the caller's address space `runs` times and returns the
/// average cycles one reload took.
pub(crate) fn sys_tlb_reload<H: Hal>(kernel: &Kernel<H>, frame: &mut Trapframe) -> u64 {
    let runs = frame.rdi;
    let mut total = 0;
    for _ in 0..runs {
        let start = kernel.hal.cycle_counter();
        kernel.reload_address_space();
        total += kernel.hal.cycle_counter() - start;
    }
    average(total, runs)
}

/// tlb_reload_touch(pages, runs): touches `pages` pages, then times a reload; the
/// average reload cost shows how much of the warmed TLB the reload throws away.
pub(crate) fn sys_tlb_reload_touch<H: Hal>(kernel: &Kernel<H>, frame: &mut Trapframe) -> u64 {
    let pages = user_pages(kernel, frame.rdi);
    let runs = frame.rsi;
    let mut total = 0;
    for _ in 0..runs {
        touch(kernel, pages);
        let start = kernel.hal.cycle_counter();
        kernel.reload_address_space();
        total += kernel.hal.cycle_counter() - start;
    }
    average(total, runs)
}

/// touch_pages(pages, runs): reloads the address space, then times touching `pages`
/// pages; the average shows the cost of refilling the TLB after a reload.
pub(crate) fn sys_touch_pages<H: Hal>(kernel: &Kernel<H>, frame: &mut Trapframe) -> u64 {
    let pages = user_pages(kernel, frame.rdi);
    let runs = frame.rsi;
    let mut total = 0;
    for _ in 0..runs {
        kernel.reload_address_space();
        let start = kernel.hal.cycle_counter();
        touch(kernel, pages);
        total += kernel.hal.cycle_counter() - start;
    }
    average(total, runs)
}

/// `requested` clamped to the caller's whole pages
fn user_pages<H: Hal>(kernel: &Kernel<H>, requested: u64) -> usize {
    let size = unsafe { kernel.private(kernel.myproc()) }.space().size();
    usize::try_from(requested)
        .unwrap_or(usize::MAX)
        .min(size / PAGE_SIZE)
}

fn touch<H: Hal>(kernel: &Kernel<H>, pages: usize) {
    let sum = (0..pages).fold(0u64, |sum, page| {
        sum.wrapping_add(kernel.hal.touch_user(page * PAGE_SIZE))
    });
    core::hint::black_box(sum);
}

fn average(total: u64, runs: u64) -> u64 {
    total.checked_div(runs).unwrap_or(0)
}
