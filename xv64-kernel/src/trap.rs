//! Trap dispatch: interrupts, exceptions and both syscall paths arrive here.

use crate::dev::DeviceSlot;
use crate::hal::Hal;
use crate::proc::{ProcState, WaitChannel};
use crate::syscall::Table;
use crate::vm::{PAGE_SIZE, PGROUNDDOWN};
use crate::Kernel;
use log::{error, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Segment selectors, in GDT order
pub const KERNEL_CS: u64 = 0x08;
pub const KERNEL_DS: u64 = 0x10;
pub const USER_DS: u64 = 0x18 | 3;
pub const USER_CS: u64 = 0x20 | 3;

/// Interrupt enable bit of rflags
pub const FL_IF: u64 = 0x200;

/// First vector the interrupt controller delivers hardware lines on
pub const T_IRQ0: u64 = 32;

/// Vectors the dispatcher knows. Everything else is unexpected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum Vector {
    Timer = T_IRQ0,
    Keyboard = T_IRQ0 + 1,
    Serial = T_IRQ0 + 4,
    Irq7 = T_IRQ0 + 7,
    Disk = T_IRQ0 + 14,
    SecondaryDisk = T_IRQ0 + 15,
    Spurious = T_IRQ0 + 31,
    /// `int 64`, the general syscall gate
    Syscall = 64,
    /// Not a hardware vector: recorded by the `syscall` instruction entry path
    FastSyscall = 256,
}

/// Register state saved on entry to the kernel, laid out as the entry stubs push it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trapframe {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    pub trapno: u64,
    pub err: u64,

    // Pushed by the hardware
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Trapframe {
    /// Did the trap interrupt user-mode code?
    #[must_use]
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// A frame that enters user mode at `rip` with stack `rsp` and interrupts on.
    #[must_use]
    pub fn user(rip: u64, rsp: u64) -> Self {
        Self {
            rip,
            rsp,
            cs: USER_CS,
            ss: USER_DS,
            rflags: FL_IF,
            ..Self::default()
        }
    }
}

impl<H: Hal> Kernel<H> {
    /// Entry point of every trap, from either privilege level.
    pub fn trap(&self, frame: &mut Trapframe) {
        match Vector::try_from(frame.trapno) {
            Ok(Vector::Syscall) if self.current_slot().is_some() => {
                self.dispatch_syscall(frame, Table::General);
            }
            Ok(Vector::FastSyscall) if self.current_slot().is_some() => {
                self.dispatch_syscall(frame, Table::Fast);
            }
            Ok(Vector::Timer) => self.timer_interrupt(),
            Ok(Vector::Disk) => self.device_interrupt(DeviceSlot::Disk),
            Ok(Vector::Keyboard) => self.device_interrupt(DeviceSlot::Keyboard),
            Ok(Vector::Serial) => self.device_interrupt(DeviceSlot::Serial),
            Ok(Vector::SecondaryDisk) => {
                // Bochs raises spurious secondary-channel IDE interrupts.
            }
            Ok(Vector::Irq7 | Vector::Spurious) => {
                warn!(
                    "cpu{}: spurious interrupt at {:#x}:{:#x}",
                    self.hal.cpu_id(),
                    frame.cs,
                    frame.rip
                );
                self.hal.acknowledge_interrupt();
            }
            _ => self.unexpected_trap(frame),
        }
        self.return_checkpoint(frame);
    }

    fn dispatch_syscall(&self, frame: &mut Trapframe, table: Table) {
        if self.is_killed(self.myproc()) {
            self.exit(-1);
        }
        match table {
            Table::General => self.syscall(frame),
            Table::Fast => self.fastcall(frame),
        }
    }

    fn timer_interrupt(&self) {
        if self.hal.cpu_id() == 0 {
            let mut ticks = self.lock(&self.ticks);
            *ticks += 1;
            self.wakeup(WaitChannel::Ticks);
            drop(ticks);
        }
        self.hal.acknowledge_interrupt();
        self.with_cpu(|cpu| {
            if cpu.current.is_some() {
                cpu.preempt_requested = true;
            }
        });
    }

    fn device_interrupt(&self, slot: DeviceSlot) {
        match self.devices.get(slot) {
            Some(device) => device.interrupt(),
            None => warn!("cpu{}: interrupt from {slot:?} with no driver", self.hal.cpu_id()),
        }
        self.hal.acknowledge_interrupt();
    }

    fn unexpected_trap(&self, frame: &Trapframe) {
        match self.current_slot() {
            Some(slot) if frame.from_user() => {
                let (pid, name) = self.identity(slot);
                error!(
                    "pid {pid} {name}: trap {} err {} on cpu {} rip {:#x} addr {:#x}--kill proc",
                    frame.trapno,
                    frame.err,
                    self.hal.cpu_id(),
                    frame.rip,
                    self.hal.fault_address()
                );
                self.oops(slot, frame);
                self.mark_killed(slot);
            }
            _ => {
                error!(
                    "unexpected trap {} from cpu {} rip {:#x} (cr2={:#x})",
                    frame.trapno,
                    self.hal.cpu_id(),
                    frame.rip,
                    self.hal.fault_address()
                );
                self.dump_kernel(frame);
                panic!("trap");
            }
        }
    }

    /// Work owed before a trap returns to user mode: a killed process exits, and one the
    /// timer asked to step aside yields.
    fn return_checkpoint(&self, frame: &Trapframe) {
        let Some(slot) = self.current_slot() else {
            return;
        };
        if !frame.from_user() {
            return;
        }

        if self.is_killed(slot) {
            self.exit(-1);
        }
        if self.state_of(slot) == ProcState::Running && self.take_preempt_request() {
            self.yield_now();
        }
        if self.is_killed(slot) {
            self.exit(-1);
        }
    }

    /// Logs the state of a trap taken in kernel mode.
    pub(crate) fn dump_kernel(&self, frame: &Trapframe) {
        dump_state(frame);
        if let Some(slot) = self.current_slot() {
            let (pid, name) = self.identity(slot);
            error!("current process: pid {pid} {name} ({:?})", self.state_of(slot));
        }
        dump_stack(core::ptr::from_ref(frame) as usize);
    }

    /// Logs a user-mode fault: registers and the words at the top of the user stack.
    fn oops(&self, slot: usize, frame: &Trapframe) {
        dump_state(frame);
        let space = unsafe { self.private(slot) }.space.as_ref();
        let Some(space) = space else {
            return;
        };
        let Ok(mut address) = usize::try_from(frame.rsp) else {
            return;
        };
        // rsp is whatever user code left there; none of this may overflow.
        let Some(end) = address
            .checked_add(PAGE_SIZE)
            .map(|past| PGROUNDDOWN!(past).min(space.size()))
        else {
            return;
        };
        error!("user stack from {address:#x}:");
        while let Some(next) = address.checked_add(8).filter(|&next| next <= end) {
            match space.read_u64(address) {
                Ok(word) => error!("  {address:#x}: {word:#018x}"),
                Err(_) => break,
            }
            address = next;
        }
    }
}

/// Logs every register in `frame`.
pub(crate) fn dump_state(frame: &Trapframe) {
    error!(
        "rax {:#018x} rbx {:#018x} rcx {:#018x} rdx {:#018x}",
        frame.rax, frame.rbx, frame.rcx, frame.rdx
    );
    error!(
        "rbp {:#018x} rsi {:#018x} rdi {:#018x} r8  {:#018x}",
        frame.rbp, frame.rsi, frame.rdi, frame.r8
    );
    error!(
        "r9  {:#018x} r10 {:#018x} r11 {:#018x} r12 {:#018x}",
        frame.r9, frame.r10, frame.r11, frame.r12
    );
    error!(
        "r13 {:#018x} r14 {:#018x} r15 {:#018x}",
        frame.r13, frame.r14, frame.r15
    );
    error!(
        "trap {} err {:#x} rip {:#018x} cs {:#x} rflags {:#x} rsp {:#018x} ss {:#x}",
        frame.trapno, frame.err, frame.rip, frame.cs, frame.rflags, frame.rsp, frame.ss
    );
}

/// Logs the kernel words from `address` to the end of its page.
pub(crate) fn dump_stack(address: usize) {
    let mut address = address & !7;
    let end = (address & !(PAGE_SIZE - 1)) + PAGE_SIZE;
    error!("stack from {address:#x}:");
    while address < end {
        let mut row = [0usize; 4];
        let words = ((end - address) / 8).min(row.len());
        for (i, word) in row.iter_mut().take(words).enumerate() {
            *word = unsafe { core::ptr::read_volatile((address as *const usize).add(i)) };
        }
        error!("  {address:#x}: {:x?}", &row[..words]);
        address += words * 8;
    }
}
