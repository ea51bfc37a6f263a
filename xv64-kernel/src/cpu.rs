use crate::hal::Hal;
use crate::param::{NCPU, NTAGS};
use crate::Kernel;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use spin::mutex::{Mutex, MutexGuard};

/// Per-core state
pub(crate) struct Cpu<H: Hal> {
    /// Slot of the process running on this core
    pub(crate) current: Option<usize>,
    /// swap_context() here to enter the scheduler
    pub(crate) scheduler: H::Context,
    /// Depth of push_off nesting
    pub(crate) depth: usize,
    /// Were interrupts enabled before the outermost push_off?
    pub(crate) intena: bool,
    /// A timer tick asked the running process to give up the core
    pub(crate) preempt_requested: bool,
    /// Slot dispatched last; the next scan starts after it
    pub(crate) last_dispatched: usize,
    /// Generation each TLB tag was last invalidated for on this core
    pub(crate) tag_generations: [Option<u64>; NTAGS],
}

impl<H: Hal> Default for Cpu<H> {
    fn default() -> Self {
        Self {
            current: None,
            scheduler: H::Context::default(),
            depth: 0,
            intena: false,
            preempt_requested: false,
            last_dispatched: crate::param::NPROC - 1,
            tag_generations: [None; NTAGS],
        }
    }
}

pub(crate) struct Cpus<H: Hal>([UnsafeCell<Cpu<H>>; NCPU]);

// Each core only touches its own entry, and only with interrupts disabled.
unsafe impl<H: Hal> Sync for Cpus<H> {}

impl<H: Hal> Cpus<H> {
    pub(crate) fn new() -> Self {
        Self(core::array::from_fn(|_| UnsafeCell::new(Cpu::default())))
    }

    /// The calling core's state.
    ///
    /// # Safety
    /// Interrupts must be disabled for as long as the reference is used, and the reference
    /// must not be held across a context switch.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn this(&self, hal: &H) -> &mut Cpu<H> {
        let id = hal.cpu_id();
        assert!(id < NCPU, "cpu id {id} out of range");
        unsafe { &mut *self.0[id].get() }
    }
}

/// Keeps interrupts off on this core until dropped; nests.
pub struct InterruptGuard<'a, H: Hal> {
    kernel: &'a Kernel<H>,
}

impl<H: Hal> Drop for InterruptGuard<'_, H> {
    fn drop(&mut self) {
        self.kernel.pop_off();
    }
}

/// A held spin lock that also keeps interrupts off on the holding core.
pub struct LockGuard<'a, H: Hal, T> {
    guard: MutexGuard<'a, T>,
    lock: &'a Mutex<T>,
    _interrupts: InterruptGuard<'a, H>,
}

impl<'a, H: Hal, T> LockGuard<'a, H, T> {
    /// The lock this guard holds, for re-acquiring it later.
    pub(crate) fn lock(&self) -> &'a Mutex<T> {
        self.lock
    }
}

impl<H: Hal, T> Deref for LockGuard<'_, H, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<H: Hal, T> DerefMut for LockGuard<'_, H, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<H: Hal> Kernel<H> {
    /// Disables interrupts, remembering whether they were on before the outermost call.
    /// push_off/pop_off are matched: two push_off()s take two pop_off()s to undo.
    pub(crate) fn push_off(&self) {
        let enabled = self.hal.interrupts_enabled();
        self.hal.disable_interrupts();
        let cpu = unsafe { self.cpus.this(&self.hal) };
        if cpu.depth == 0 {
            cpu.intena = enabled;
        }
        cpu.depth += 1;
    }

    pub(crate) fn pop_off(&self) {
        assert!(!self.hal.interrupts_enabled(), "pop_off - interruptible");
        let cpu = unsafe { self.cpus.this(&self.hal) };
        cpu.depth = cpu
            .depth
            .checked_sub(1)
            .expect("pop_off without push_off");
        if cpu.depth == 0 && cpu.intena {
            self.hal.enable_interrupts();
        }
    }

    pub(crate) fn without_interrupts(&self) -> InterruptGuard<'_, H> {
        self.push_off();
        InterruptGuard { kernel: self }
    }

    /// Acquires `lock` with interrupts disabled on this core.
    pub(crate) fn lock<'a, T>(&'a self, lock: &'a Mutex<T>) -> LockGuard<'a, H, T> {
        let interrupts = self.without_interrupts();
        LockGuard {
            guard: lock.lock(),
            lock,
            _interrupts: interrupts,
        }
    }

    /// Runs `f` on this core's state with interrupts disabled.
    pub(crate) fn with_cpu<R>(&self, f: impl FnOnce(&mut Cpu<H>) -> R) -> R {
        let _interrupts = self.without_interrupts();
        f(unsafe { self.cpus.this(&self.hal) })
    }

    /// Slot of the process running on this core, if any.
    pub(crate) fn current_slot(&self) -> Option<usize> {
        self.with_cpu(|cpu| cpu.current)
    }

    /// Slot of the process running on this core.
    pub(crate) fn myproc(&self) -> usize {
        self.current_slot().expect("no process running on this cpu")
    }

    /// Takes back a preemption request left by the timer.
    pub(crate) fn take_preempt_request(&self) -> bool {
        self.with_cpu(|cpu| core::mem::take(&mut cpu.preempt_requested))
    }
}
