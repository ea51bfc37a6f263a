//! exec: replacing a process's memory with a fresh program image.
//!
//! Executable formats belong to the [`Loader`]; the kernel only builds the new address
//! space around what it loads and lays out the initial user stack:
//!
//! ```text
//!   size ->  +----------------+
//!            | argument bytes |
//!            | argv[0..argc]  |
//!            | 0              |
//!   rsp  ->  | fake return pc |
//!            |      ...       |
//!            +----------------+ one stack page
//!            |  guard page    |
//!            +----------------+ end of image
//! ```

use crate::hal::Hal;
use crate::param::{MAX_ARGS, MAX_STR};
use crate::proc::ProcName;
use crate::syscall::{SyscallArgs, SyscallError};
use crate::trap::Trapframe;
use crate::vm::{AddressSpace, VmError, PAGE_SIZE, PGROUNDUP};
use crate::Kernel;
use alloc::vec::Vec;
use core::mem::size_of;
use log::debug;

/// Populates address spaces from executable images.
pub trait Loader: Sync {
    /// Loads the image named `path` into the empty `space`, returning its entry point.
    fn load(&self, path: &[u8], space: &mut AddressSpace) -> Result<usize, LoadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    NotFound,
    /// The image is malformed or does not fit user memory
    BadImage,
    Vm(VmError),
}

impl From<VmError> for LoadError {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

impl<H: Hal> Kernel<H> {
    /// Installs the loader exec uses. Only the first call has an effect.
    pub fn set_loader(&self, loader: &'static dyn Loader) {
        self.loader.call_once(|| loader);
    }
}

/// exec(path, argv): runs the program at `path` in place of the caller. `argv` is a
/// null-terminated array of string pointers. Returns only on failure, with the caller
/// untouched.
pub(crate) fn sys_exec<H: Hal>(
    kernel: &Kernel<H>,
    args: &mut SyscallArgs<'_>,
) -> Result<u64, SyscallError> {
    let path = args.string(0, MAX_STR)?;
    let argv = fetch_argv(args)?;
    let loader = kernel.loader.get().ok_or(LoadError::NotFound)?;

    let mut space = AddressSpace::create_empty()?;
    let entry = loader.load(&path, &mut space)?;
    let (stack_pointer, argv_address) = build_stack(&mut space, &argv)?;

    *args.frame_mut() = Trapframe {
        rdi: argv.len() as u64,
        rsi: argv_address as u64,
        ..Trapframe::user(entry as u64, stack_pointer as u64)
    };
    let old = core::mem::replace(args.space(), space);
    kernel.refresh_address_space();
    drop(old);

    let last = path.rsplit(|&byte| byte == b'/').next().unwrap_or(&path[..]);
    let name = ProcName::new(last);
    unsafe { kernel.private(kernel.myproc()) }.name = name;
    debug!("exec {name}");
    Ok(0)
}

fn fetch_argv(args: &mut SyscallArgs<'_>) -> Result<Vec<Vec<u8>>, SyscallError> {
    let base = args.size(1)?;
    let space = args.space();
    let mut argv = Vec::new();
    loop {
        let slot = argv
            .len()
            .checked_mul(size_of::<u64>())
            .and_then(|offset| base.checked_add(offset))
            .ok_or(SyscallError::BadAddress)?;
        let pointer = usize::try_from(space.read_u64(slot)?)
            .map_err(|_| SyscallError::BadAddress)?;
        if pointer == 0 {
            return Ok(argv);
        }
        if argv.len() == MAX_ARGS {
            return Err(SyscallError::BadArgument);
        }
        argv.push(space.fetch_str(pointer, MAX_STR)?);
    }
}

/// Adds a guard page and a stack page above the image and pushes the arguments.
/// Returns the initial stack pointer and the address of the argv array.
fn build_stack(
    space: &mut AddressSpace,
    argv: &[Vec<u8>],
) -> Result<(usize, usize), SyscallError> {
    let guard = PGROUNDUP!(space.size());
    space.grow(guard + 2 * PAGE_SIZE)?;
    space.clear_user(guard)?;

    let mut stack = UserStack {
        space,
        pointer: guard + 2 * PAGE_SIZE,
        floor: guard + PAGE_SIZE,
    };
    let mut pointers = Vec::with_capacity(argv.len() + 1);
    for arg in argv {
        stack.push(&[arg.as_slice(), &[0]].concat(), size_of::<u64>())?;
        pointers.push(stack.pointer as u64);
    }
    pointers.push(0);

    let array: Vec<u8> = pointers.iter().flat_map(|p| p.to_ne_bytes()).collect();
    stack.push(&array, 16)?;
    let argv_address = stack.pointer;
    stack.push(&u64::MAX.to_ne_bytes(), size_of::<u64>())?;
    Ok((stack.pointer, argv_address))
}

struct UserStack<'a> {
    space: &'a mut AddressSpace,
    pointer: usize,
    /// Lowest usable address
    floor: usize,
}

impl UserStack<'_> {
    fn push(&mut self, bytes: &[u8], align: usize) -> Result<(), SyscallError> {
        let pointer = self
            .pointer
            .checked_sub(bytes.len())
            .map(|pointer| pointer & !(align - 1))
            .filter(|&pointer| pointer >= self.floor)
            .ok_or(SyscallError::BadArgument)?;
        self.space.copy_out(pointer, bytes)?;
        self.pointer = pointer;
        Ok(())
    }
}
