//! Bringing the machine up: heap, console, kernel address space and per-core tables,
//! then the first process.
//!
//! The bootloader glue in the kernel image calls [`init`] once on the boot core, then
//! [`add_image`] for each program it was handed, then [`run`]. Every other core enters
//! through [`start_secondary`].

use super::{gdt, idt, kernel, lapic, serial, X86, KERNEL, PCID_ENABLED};
use crate::exec::{LoadError, Loader};
use crate::kalloc::ALLOCATOR;
use crate::syscall::Sysno;
use crate::tlb::TlbPolicy;
use crate::println::{self, println};
use crate::vm::{self, AddressSpace, PhysAddr, PGROUNDUP};
use crate::{Kernel, KernelConfig};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::arch::global_asm;
use core::arch::x86_64::__cpuid;
use core::ptr::addr_of;
use core::sync::atomic::Ordering;
use log::info;
use spin::mutex::Mutex;
use x86_64::registers::control::{Cr3, Cr4, Cr4Flags};

/// CPUID.1:ECX bit for process-context identifiers
const CPUID_PCID: u32 = 1 << 17;

/// Flat program images, loaded at address 0 and entered there
struct Images(Mutex<Vec<(&'static [u8], &'static [u8])>>);

static IMAGES: Images = Images(Mutex::new(Vec::new()));

impl Loader for Images {
    fn load(&self, path: &[u8], space: &mut AddressSpace) -> Result<usize, LoadError> {
        let images = self.0.lock();
        let &(_, image) = images
            .iter()
            .find(|(name, _)| *name == path)
            .ok_or(LoadError::NotFound)?;
        if image.is_empty() {
            return Err(LoadError::BadImage);
        }
        space.grow(PGROUNDUP!(image.len()))?;
        space.copy_out(0, image)?;
        Ok(0)
    }
}

/// Makes `image` available to exec as `path`.
pub fn add_image(path: &'static [u8], image: &'static [u8]) {
    IMAGES.0.lock().push((path, image));
}

/// Brings up the boot core. `heap` is the physical memory given to the kernel heap;
/// `direct_map_offset` is where all of physical memory is mapped.
///
/// # Safety
/// Must run once, first, on the boot core with interrupts disabled and the bootloader's
/// page tables loaded.
pub unsafe fn init(direct_map_offset: usize, heap: PhysAddr, heap_len: usize) {
    vm::set_direct_map_offset(direct_map_offset);
    println::set_debug_print(serial::com1());
    println!();
    info!("xv64 kernel booting");

    ALLOCATOR.init(heap, heap_len);
    let (root, _) = Cr3::read();
    vm::kvm_init(PhysAddr(root.start_address().as_u64() as usize));

    let pcid = cfg!(feature = "pcid") && unsafe { __cpuid(1) }.ecx & CPUID_PCID != 0;
    PCID_ENABLED.store(pcid, Ordering::Relaxed);
    let tlb_policy = if pcid {
        TlbPolicy::Tagged
    } else {
        TlbPolicy::AlwaysInvalidate
    };
    info!("tlb policy: {tlb_policy:?}");

    let kernel = KERNEL.call_once(|| {
        Kernel::new(
            X86,
            KernelConfig {
                tlb_policy,
                ..KernelConfig::default()
            },
        )
    });
    kernel.set_loader(&IMAGES);
    lapic::disable_pic();
    unsafe { init_cpu() };
}

/// Per-core setup shared by every core.
unsafe fn init_cpu() {
    let cpu = lapic::init();
    unsafe { gdt::init(cpu) };
    idt::init();
    if PCID_ENABLED.load(Ordering::Relaxed) {
        unsafe { Cr4::update(|flags| flags.insert(Cr4Flags::PCID)) };
    }
    info!("cpu{cpu}: started");
}

/// Starts the first process on the boot core and schedules forever.
pub fn run() -> ! {
    let kernel = kernel();
    let pid = kernel
        .userinit(initcode())
        .expect("userinit: no memory for the first process");
    for _ in 0..2 {
        kernel
            .install_file(pid, Arc::new(serial::Console))
            .expect("userinit: console");
    }
    info!("first process is pid {pid}");
    kernel.run()
}

/// Entry of every core after the boot core.
///
/// # Safety
/// Must run once per core, after [`init`], with interrupts disabled.
pub unsafe fn start_secondary() -> ! {
    unsafe { init_cpu() };
    kernel().run()
}

fn initcode() -> &'static [u8] {
    extern "C" {
        static initcode_start: u8;
        static initcode_end: u8;
    }
    let start = unsafe { addr_of!(initcode_start) };
    let end = unsafe { addr_of!(initcode_end) };
    unsafe { core::slice::from_raw_parts(start, end as usize - start as usize) }
}

// The first user program, run at address 0: exec("/init", ["/init"]) and, if that fails,
// sleep forever.
global_asm!(
    ".section .rodata.initcode, \"a\"",
    ".global initcode_start",
    ".global initcode_end",
    "initcode_start:",
    "lea rdi, [rip + 3f]",
    "lea rsi, [rip + 4f]",
    "mov rax, {exec}",
    "int {syscall}",
    "2:",
    "mov rdi, 100",
    "mov rax, {sleep}",
    "int {syscall}",
    "jmp 2b",
    "3:",
    ".asciz \"/init\"",
    ".balign 8",
    "4:",
    ".quad 3b - initcode_start",
    ".quad 0",
    "initcode_end:",
    ".section .text",
    exec = const Sysno::Exec as u64,
    sleep = const Sysno::Sleep as u64,
    syscall = const crate::trap::Vector::Syscall as u64,
);
