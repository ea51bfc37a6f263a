//! Processes and the per-core scheduler.
//!
//! Everything another core may look at lives in [`PublicProcData`] inside the one
//! process-table lock. The rest of a process (kernel stack, address space, saved context,
//! open resources) is [`PrivateProcData`]: only the process itself touches it while it
//! runs, and anyone else only while holding the table lock with the process switched out.

use crate::cpu::LockGuard;
use crate::dev::DeviceSlot;
use crate::file::OpenFile;
use crate::hal::Hal;
use crate::ipc::Envelope;
use crate::param::{KSTACK_SIZE, NOFILE, NPROC, PROC_NAME_LEN};
use crate::tlb::{AddressSwitch, TagLease};
use crate::trap::Trapframe;
use crate::vm::{self, AddressSpace, VmError, PAGE_SIZE, PGROUNDUP};
use crate::Kernel;
use alloc::sync::Arc;
use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;
use log::{debug, info};

/// Process identifier. Never reused while the kernel runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(u32);

impl Pid {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a sleeping process waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitChannel {
    /// The global tick counter advanced
    Ticks,
    /// A child of this process exited
    Children(Pid),
    /// A message landed in this process's mailbox
    Mailbox(Pid),
    /// A device finished the operation named by `token`
    Device { device: DeviceSlot, token: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    #[default]
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// Every slot of the process table is in use
    TableFull,
    NoSuchProcess,
    /// wait() with nothing to wait for
    NoChildren,
    Vm(VmError),
}

impl From<VmError> for ProcError {
    fn from(value: VmError) -> Self {
        Self::Vm(value)
    }
}

#[derive(Debug, Default)]
pub(crate) struct PublicProcData {
    pub(crate) state: ProcState,
    pub(crate) pid: Pid,
    /// Slot of the parent; init for orphans
    pub(crate) parent: Option<usize>,
    /// If sleeping, what for
    pub(crate) chan: Option<WaitChannel>,
    /// Exit at the next return to user mode
    pub(crate) killed: bool,
    pub(crate) exit_status: i32,
    /// Last message delivered and not yet received
    pub(crate) mailbox: Option<Envelope>,
    pub(crate) tlb_lease: Option<TagLease>,
}

pub struct ProcTable {
    pub(crate) procs: [PublicProcData; NPROC],
    next_pid: u32,
    /// Slot of the first process, which adopts orphans
    pub(crate) init: Option<usize>,
}

impl ProcTable {
    pub(crate) fn new() -> Self {
        Self {
            procs: core::array::from_fn(|_| PublicProcData::default()),
            next_pid: 1,
            init: None,
        }
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Slot holding the live process `pid`
    pub(crate) fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.procs
            .iter()
            .position(|proc| proc.state != ProcState::Unused && proc.pid == pid)
    }

    /// Makes every process sleeping on `chan` runnable.
    pub(crate) fn wakeup(&mut self, chan: WaitChannel) {
        self.procs
            .iter_mut()
            .filter(|proc| proc.state == ProcState::Sleeping && proc.chan == Some(chan))
            .for_each(|proc| proc.state = ProcState::Runnable);
    }
}

/// Process name, for debugging
#[derive(Clone, Copy, Default)]
pub(crate) struct ProcName {
    bytes: [u8; PROC_NAME_LEN],
    len: usize,
}

impl ProcName {
    pub(crate) fn new(name: &[u8]) -> Self {
        let len = name.len().min(PROC_NAME_LEN);
        let mut bytes = [0; PROC_NAME_LEN];
        bytes[..len].copy_from_slice(&name[..len]);
        Self { bytes, len }
    }
}

impl fmt::Display for ProcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("?"))
    }
}

impl fmt::Debug for ProcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

pub(crate) struct KernelStack(NonNull<u8>);

// Owned exclusively by one process slot.
unsafe impl Send for KernelStack {}

impl KernelStack {
    fn new() -> Option<Self> {
        vm::alloc_pages(KSTACK_SIZE / PAGE_SIZE).map(Self)
    }

    pub(crate) fn top(&self) -> usize {
        self.0.as_ptr() as usize + KSTACK_SIZE
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        unsafe { vm::free_pages(self.0, KSTACK_SIZE / PAGE_SIZE) };
    }
}

pub(crate) struct PrivateProcData<H: Hal> {
    pub(crate) kstack: Option<KernelStack>,
    pub(crate) space: Option<AddressSpace>,
    /// Frame the process leaves the kernel through, at the top of `kstack`
    pub(crate) trapframe: *mut Trapframe,
    /// swap_context() here to run the process
    pub(crate) context: H::Context,
    pub(crate) files: [Option<Arc<dyn OpenFile>>; NOFILE],
    pub(crate) name: ProcName,
}

impl<H: Hal> Default for PrivateProcData<H> {
    fn default() -> Self {
        Self {
            kstack: None,
            space: None,
            trapframe: core::ptr::null_mut(),
            context: H::Context::default(),
            files: core::array::from_fn(|_| None),
            name: ProcName::default(),
        }
    }
}

impl<H: Hal> PrivateProcData<H> {
    pub(crate) fn space(&self) -> &AddressSpace {
        self.space.as_ref().expect("process without an address space")
    }

    pub(crate) fn space_mut(&mut self) -> &mut AddressSpace {
        self.space.as_mut().expect("process without an address space")
    }

    fn kernel_stack_top(&self) -> usize {
        self.kstack.as_ref().expect("process without a kernel stack").top()
    }
}

impl<H: Hal> Kernel<H> {
    pub(crate) fn lock_table(&self) -> LockGuard<'_, H, ProcTable> {
        self.lock(&self.table)
    }

    /// The private half of the process in `slot`.
    ///
    /// # Safety
    /// The caller must be that process, running on this core, or must have the process
    /// switched out: either holding the table lock while it is not Running, or having
    /// allocated the slot and not yet made it Runnable.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn private(&self, slot: usize) -> &mut PrivateProcData<H> {
        unsafe { &mut *self.private_data[slot].get() }
    }

    /// Finds an Unused slot and sets it up as an Embryo that will start in `forkret`.
    fn allocate(&self) -> Result<usize, ProcError> {
        let slot = {
            let mut table = self.lock_table();
            let slot = table
                .procs
                .iter()
                .position(|proc| proc.state == ProcState::Unused)
                .ok_or(ProcError::TableFull)?;
            let pid = table.allocate_pid();
            table.procs[slot] = PublicProcData {
                state: ProcState::Embryo,
                pid,
                ..PublicProcData::default()
            };
            slot
        };

        if let Err(error) = self.prepare(slot) {
            self.discard(slot);
            return Err(error);
        }
        Ok(slot)
    }

    fn prepare(&self, slot: usize) -> Result<(), ProcError> {
        let private = unsafe { self.private(slot) };
        let kstack = KernelStack::new().ok_or(ProcError::Vm(VmError::OutOfMemory))?;

        // The first return to user mode goes through a frame at the very top of the stack.
        let frame_address = kstack.top() - size_of::<Trapframe>();
        private.trapframe = frame_address as *mut Trapframe;
        unsafe { private.trapframe.write(Trapframe::default()) };
        private.kstack = Some(kstack);
        private.space = Some(AddressSpace::create_empty()?);

        let kernel = core::ptr::from_ref(self) as usize;
        self.hal
            .prime_context(&mut private.context, frame_address, forkret::<H>, kernel);
        Ok(())
    }

    /// Hands an Embryo that never ran back to the table.
    fn discard(&self, slot: usize) {
        *unsafe { self.private(slot) } = PrivateProcData::default();
        self.lock_table().procs[slot] = PublicProcData::default();
    }

    /// Creates the first process from `image`, loaded at address 0 with a one-page stack
    /// above it. It adopts every orphan and must never exit.
    pub fn userinit(&self, image: &[u8]) -> Result<Pid, ProcError> {
        let slot = self.allocate()?;
        let private = unsafe { self.private(slot) };
        let size = PGROUNDUP!(image.len()) + PAGE_SIZE;
        let space = private.space_mut();
        if let Err(error) = space.grow(size).and_then(|_| space.copy_out(0, image)) {
            self.discard(slot);
            return Err(error.into());
        }
        unsafe { *private.trapframe = Trapframe::user(0, size as u64) };
        private.name = ProcName::new(b"initcode");

        let mut table = self.lock_table();
        table.init = Some(slot);
        table.procs[slot].state = ProcState::Runnable;
        info!("init is pid {}", table.procs[slot].pid);
        Ok(table.procs[slot].pid)
    }

    /// Creates a copy of the calling process that resumes from `frame` with 0 as the
    /// syscall result. The caller gets the child's pid.
    pub fn fork(&self, frame: &Trapframe) -> Result<Pid, ProcError> {
        let parent = self.myproc();
        let child = self.allocate()?;
        let parent_data = unsafe { self.private(parent) };
        let child_data = unsafe { self.private(child) };

        if let Err(error) = parent_data.space().copy_into(child_data.space_mut()) {
            self.discard(child);
            return Err(error.into());
        }
        unsafe { *child_data.trapframe = Trapframe { rax: 0, ..*frame } };
        child_data.files.clone_from(&parent_data.files);
        child_data.name = parent_data.name;

        let mut table = self.lock_table();
        table.procs[child].parent = Some(parent);
        table.procs[child].state = ProcState::Runnable;
        Ok(table.procs[child].pid)
    }

    /// Exit the current process. Does not return. The process stays a Zombie until its
    /// parent calls [`Kernel::wait`].
    pub fn exit(&self, status: i32) -> ! {
        let me = self.myproc();
        if self.lock_table().init == Some(me) {
            panic!("init exiting");
        }

        let private = unsafe { self.private(me) };
        private.files.iter_mut().for_each(|file| drop(file.take()));
        self.switch_kernel_space();
        private.space_mut().shrink(0);

        let mut table = self.lock_table();
        if let Some(parent) = table.procs[me].parent {
            let parent = table.procs[parent].pid;
            table.wakeup(WaitChannel::Children(parent));
        }

        let init = table.init.expect("exit: no init process");
        let mut orphaned_zombie = false;
        for proc in table.procs.iter_mut().filter(|proc| proc.parent == Some(me)) {
            proc.parent = Some(init);
            orphaned_zombie |= proc.state == ProcState::Zombie;
        }
        if orphaned_zombie {
            let init = table.procs[init].pid;
            table.wakeup(WaitChannel::Children(init));
        }

        let proc = &mut table.procs[me];
        proc.state = ProcState::Zombie;
        proc.exit_status = status;
        proc.tlb_lease = None;
        proc.mailbox = None;
        debug!("pid {} exited with status {status}", proc.pid);

        let _table = self.sched(table);
        panic!("zombie exit");
    }

    /// Waits for a child to exit and reaps it, returning its pid and exit status.
    /// `None` when the caller has no children or has been killed.
    pub fn wait(&self) -> Option<(Pid, i32)> {
        let me = self.myproc();
        let mut table = self.lock_table();
        loop {
            let zombie = table.procs.iter().position(|proc| {
                proc.parent == Some(me) && proc.state == ProcState::Zombie
            });
            if let Some(slot) = zombie {
                let reaped = (table.procs[slot].pid, table.procs[slot].exit_status);
                *unsafe { self.private(slot) } = PrivateProcData::default();
                table.procs[slot] = PublicProcData::default();
                return Some(reaped);
            }

            let have_kids = table.procs.iter().any(|proc| proc.parent == Some(me));
            if !have_kids || table.procs[me].killed {
                return None;
            }
            let pid = table.procs[me].pid;
            table = self.sleep_locked(WaitChannel::Children(pid), table);
        }
    }

    /// Marks `pid` killed. It exits the next time it heads back to user mode; a sleeping
    /// target is left asleep.
    pub fn kill(&self, pid: Pid) -> Result<(), ProcError> {
        let mut table = self.lock_table();
        let slot = table.slot_of(pid).ok_or(ProcError::NoSuchProcess)?;
        table.procs[slot].killed = true;
        Ok(())
    }

    pub(crate) fn mark_killed(&self, slot: usize) {
        self.lock_table().procs[slot].killed = true;
    }

    pub(crate) fn is_killed(&self, slot: usize) -> bool {
        self.lock_table().procs[slot].killed
    }

    pub(crate) fn state_of(&self, slot: usize) -> ProcState {
        self.lock_table().procs[slot].state
    }

    pub(crate) fn identity(&self, slot: usize) -> (Pid, ProcName) {
        let pid = self.lock_table().procs[slot].pid;
        (pid, unsafe { self.private(slot) }.name)
    }

    /// State of the process `pid`, if it exists
    pub fn process_state(&self, pid: Pid) -> Option<ProcState> {
        let table = self.lock_table();
        table.slot_of(pid).map(|slot| table.procs[slot].state)
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_now(&self) {
        let mut table = self.lock_table();
        let me = self.myproc();
        table.procs[me].state = ProcState::Runnable;
        drop(self.sched(table));
    }

    /// Releases `guard`, sleeps on `chan` and reacquires the lock once woken. No wakeup is
    /// lost: the table lock is taken before `guard` is let go.
    pub(crate) fn sleep<'a, T>(
        &'a self,
        chan: WaitChannel,
        guard: LockGuard<'a, H, T>,
    ) -> LockGuard<'a, H, T> {
        let lock = guard.lock();
        let table = self.lock_table();
        drop(guard);
        drop(self.sleep_locked(chan, table));
        self.lock(lock)
    }

    /// [`Kernel::sleep`] for callers already holding the table lock.
    pub(crate) fn sleep_locked<'a>(
        &'a self,
        chan: WaitChannel,
        mut table: LockGuard<'a, H, ProcTable>,
    ) -> LockGuard<'a, H, ProcTable> {
        let me = self.myproc();
        table.procs[me].chan = Some(chan);
        table.procs[me].state = ProcState::Sleeping;
        let mut table = self.sched(table);
        table.procs[me].chan = None;
        table
    }

    /// Wakes every process sleeping on `chan`.
    pub fn wakeup(&self, chan: WaitChannel) {
        self.lock_table().wakeup(chan);
    }

    /// Switches to this core's scheduler. The caller holds the table lock and no other,
    /// and has already moved its process out of Running.
    fn sched<'a>(&'a self, table: LockGuard<'a, H, ProcTable>) -> LockGuard<'a, H, ProcTable> {
        let me = self.myproc();
        let cpu = unsafe { self.cpus.this(&self.hal) };
        assert_eq!(cpu.depth, 1, "sched locks");
        assert_ne!(table.procs[me].state, ProcState::Running, "sched running");
        assert!(!self.hal.interrupts_enabled(), "sched interruptible");

        let intena = cpu.intena;
        let context: *mut H::Context = &mut unsafe { self.private(me) }.context;
        let scheduler: *const H::Context = &cpu.scheduler;
        unsafe { self.hal.swap_context(context, scheduler) };
        unsafe { self.cpus.this(&self.hal) }.intena = intena;
        table
    }

    /// Loads the kernel's own address space on this core.
    pub(crate) fn switch_kernel_space(&self) {
        if let Some(root) = vm::kernel_root() {
            self.hal.load_address_space(root, AddressSwitch::KERNEL);
        }
    }

    /// Runs the next runnable process, in table order after the one this core ran last,
    /// until it gives the core back. Returns whether anything ran.
    pub fn schedule_once(&self) -> bool {
        // Let devices in between rounds.
        self.hal.enable_interrupts();

        let mut table = self.lock_table();
        let start = self.with_cpu(|cpu| cpu.last_dispatched + 1);
        let Some(slot) = (0..NPROC)
            .map(|offset| (start + offset) % NPROC)
            .find(|&slot| table.procs[slot].state == ProcState::Runnable)
        else {
            return false;
        };

        let private = unsafe { self.private(slot) };
        let cpu = unsafe { self.cpus.this(&self.hal) };
        cpu.current = Some(slot);
        cpu.last_dispatched = slot;
        // A tick meant for whoever ran here before is not this process's.
        cpu.preempt_requested = false;
        private.space().activate(
            &self.hal,
            &self.tlb,
            &mut table.procs[slot].tlb_lease,
            &mut cpu.tag_generations,
            private.kernel_stack_top(),
        );
        table.procs[slot].state = ProcState::Running;

        let scheduler: *mut H::Context = &mut cpu.scheduler;
        unsafe { self.hal.swap_context(scheduler, &private.context) };

        // The process is done running for now; it switched back here.
        self.switch_kernel_space();
        unsafe { self.cpus.this(&self.hal) }.current = None;
        drop(table);
        true
    }

    /// Per-core scheduler loop. Never returns.
    pub fn run(&self) -> ! {
        loop {
            if !self.schedule_once() {
                self.hal.wait_for_interrupt();
            }
        }
    }

    /// Loads the running process's address space on this core again.
    pub(crate) fn reload_address_space(&self) {
        let me = self.myproc();
        let private = unsafe { self.private(me) };
        let mut table = self.lock_table();
        let cpu = unsafe { self.cpus.this(&self.hal) };
        private.space().activate(
            &self.hal,
            &self.tlb,
            &mut table.procs[me].tlb_lease,
            &mut cpu.tag_generations,
            private.kernel_stack_top(),
        );
    }

    /// Gives the running process a fresh TLB tag and reloads its space, after its
    /// mappings shrank or were replaced.
    pub(crate) fn refresh_address_space(&self) {
        let me = self.myproc();
        self.lock_table().procs[me].tlb_lease = None;
        self.reload_address_space();
    }
}

/// A new process's first scheduling switches here; it leaves for user mode.
extern "C" fn forkret<H: Hal>(kernel: usize) -> ! {
    let kernel = unsafe { &*(kernel as *const Kernel<H>) };
    // Still holding the table lock from the scheduler.
    unsafe { kernel.table.force_unlock() };
    kernel.pop_off();

    let frame = unsafe { kernel.private(kernel.myproc()) }.trapframe;
    unsafe { kernel.hal.return_to_user(frame) }
}
