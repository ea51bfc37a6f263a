//! A host machine for the unit tests.
//!
//! Every kernel control flow (each process and the test thread acting as core 0's
//! scheduler) is an OS thread. `swap_context` hands a baton from one thread to the next,
//! so exactly one flow per simulated core runs at a time. User programs are closures
//! registered at instruction-pointer values; they reach the kernel only by filling in
//! their trap frame and calling [`Kernel::trap`], and touch their memory through a
//! per-core TLB that caches translations under the tag each load selected.

use crate::file::{FileError, OpenFile};
use crate::hal::{ContextEntry, Hal};
use crate::ipc::Message;
use crate::param::NCPU;
use crate::proc::Pid;
use crate::syscall::{SyscallAbi, Sysno, FAILURE};
use crate::tlb::AddressSwitch;
use crate::trap::{Trapframe, Vector, KERNEL_CS, USER_CS, USER_DS};
use crate::vm::{self, PhysAddr, PAGE_SIZE};
use crate::{Kernel, KernelConfig};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Scheduling rounds `run_until` allows before calling a test hung
const MAX_ROUNDS: usize = 10_000;
/// How long `run_on_two_cores_until` waits before calling a test hung
const TWO_CORE_DEADLINE: Duration = Duration::from_secs(30);
/// Where `wait_status` has the kernel store the status
const STATUS_SCRATCH: u64 = 0x800;
/// Gap left below the user stack pointer for stack-convention arguments
const ARGUMENT_GAP: u64 = 128;

type Program = Arc<dyn Fn(&mut SimUser) + Send + Sync>;

/// Lets one suspended thread continue, on the core it is handed.
#[derive(Default)]
struct Baton {
    core: Mutex<Option<usize>>,
    handed: Condvar,
}

impl Baton {
    fn hand_over(&self, core: usize) {
        *self.core.lock().unwrap() = Some(core);
        self.handed.notify_one();
    }

    fn wait(&self) -> usize {
        let mut core = self.core.lock().unwrap();
        loop {
            if let Some(core) = core.take() {
                return core;
            }
            core = self.handed.wait(core).unwrap();
        }
    }
}

thread_local! {
    static CORE: Cell<usize> = const { Cell::new(0) };
    static OWN_BATON: RefCell<Option<Arc<Baton>>> = const { RefCell::new(None) };
}

fn own_baton() -> Arc<Baton> {
    OWN_BATON.with(|baton| baton.borrow_mut().get_or_insert_with(Arc::default).clone())
}

/// A suspended flow: the baton its thread waits on
#[derive(Default)]
pub(crate) struct SimContext {
    baton: Option<Arc<Baton>>,
}

/// Translations one core has cached
#[derive(Default)]
struct Tlb {
    root: Option<PhysAddr>,
    tag: u16,
    entries: HashMap<(u16, usize), PhysAddr>,
    invalidations: u64,
    touches: u64,
}

impl Tlb {
    fn load(&mut self, root: PhysAddr, switch: AddressSwitch) {
        if switch.invalidate {
            self.entries.retain(|&(tag, _), _| tag != switch.tag);
            self.invalidations += 1;
        }
        self.root = Some(root);
        self.tag = switch.tag;
    }

    fn translate(&mut self, address: usize) -> Option<*mut u8> {
        let page = address / PAGE_SIZE;
        let frame = match self.entries.get(&(self.tag, page)) {
            Some(&frame) => frame,
            None => {
                let frame = vm::hardware_translate(self.root?, page * PAGE_SIZE)?;
                self.entries.insert((self.tag, page), frame);
                frame
            }
        };
        Some(vm::phys_to_virt(frame).wrapping_add(address % PAGE_SIZE))
    }
}

/// Console at descriptors 0 and 1 of the first process
#[derive(Default)]
struct SimConsole {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<u8>>,
}

impl OpenFile for SimConsole {
    fn read(&self, buffer: &mut [u8]) -> Result<usize, FileError> {
        let mut input = self.input.lock().unwrap();
        let n = buffer.len().min(input.len());
        for (slot, byte) in buffer.iter_mut().zip(input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> Result<usize, FileError> {
        self.output.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }
}

#[derive(Default)]
struct SimState {
    kernel: OnceLock<&'static Kernel<SimHal>>,
    interrupts: [AtomicBool; NCPU],
    kernel_stacks: [AtomicUsize; NCPU],
    tlbs: [Mutex<Tlb>; NCPU],
    acknowledged: AtomicUsize,
    cycles: AtomicU64,
    programs: Mutex<HashMap<usize, Program>>,
    next_entry: AtomicUsize,
    console: Arc<SimConsole>,
    /// Panic raised by a process thread, for `run_until` to rethrow
    failure: Mutex<Option<Box<dyn Any + Send>>>,
}

impl SimState {
    fn kernel(&self) -> &'static Kernel<SimHal> {
        self.kernel.get().expect("simulated machine without a kernel")
    }

    fn register(&self, program: Program) -> usize {
        let entry = 0x1000 * (self.next_entry.fetch_add(1, Ordering::SeqCst) + 1);
        self.programs.lock().unwrap().insert(entry, program);
        entry
    }

    fn program(&self, entry: usize) -> Program {
        self.programs
            .lock()
            .unwrap()
            .get(&entry)
            .cloned()
            .unwrap_or_else(|| panic!("no program at {entry:#x}"))
    }

    fn tlb(&self) -> std::sync::MutexGuard<'_, Tlb> {
        self.tlbs[CORE.get()].lock().unwrap()
    }
}

#[derive(Default)]
pub(crate) struct SimHal {
    state: Arc<SimState>,
}

impl SimHal {
    /// Interrupts acknowledged so far, on all cores
    pub(crate) fn acknowledged(&self) -> usize {
        self.state.acknowledged.load(Ordering::SeqCst)
    }

    /// Address-space loads on `core` that dropped cached translations
    pub(crate) fn tlb_invalidations(&self, core: usize) -> u64 {
        self.state.tlbs[core].lock().unwrap().invalidations
    }

    /// User pages touched by the kernel on `core`
    pub(crate) fn user_touches(&self, core: usize) -> u64 {
        self.state.tlbs[core].lock().unwrap().touches
    }

    /// Stack user-mode traps on `core` currently arrive on
    pub(crate) fn kernel_stack(&self, core: usize) -> usize {
        self.state.kernel_stacks[core].load(Ordering::SeqCst)
    }

    /// Hands a panic raised on this flow to `run_until` and gives the core back to the
    /// scheduler, which resumes holding the table lock it switched with. The flow never
    /// runs again.
    fn abandon(&self, payload: Box<dyn Any + Send>) -> ! {
        *self.state.failure.lock().unwrap() = Some(payload);
        let kernel = self.state.kernel();
        self.disable_interrupts();
        let cpu = unsafe { kernel.cpus.this(self) };
        cpu.depth = 1;
        cpu.scheduler
            .baton
            .clone()
            .expect("process ran without a scheduler")
            .hand_over(CORE.get());
        loop {
            std::thread::park();
        }
    }

    fn user_pointer(&self, address: u64) -> *mut u8 {
        usize::try_from(address)
            .ok()
            .and_then(|address| self.state.tlb().translate(address))
            .unwrap_or_else(|| panic!("user page fault at {address:#x}"))
    }

    fn user_write(&self, address: u64, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            unsafe { *self.user_pointer(address + i as u64) = byte };
        }
    }

    fn user_read(&self, address: u64, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| unsafe { *self.user_pointer(address + i as u64) })
            .collect()
    }
}

impl Hal for SimHal {
    type Context = SimContext;

    fn cpu_id(&self) -> usize {
        CORE.get()
    }

    fn interrupts_enabled(&self) -> bool {
        self.state.interrupts[CORE.get()].load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) {
        self.state.interrupts[CORE.get()].store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.state.interrupts[CORE.get()].store(true, Ordering::SeqCst);
    }

    fn wait_for_interrupt(&self) {
        self.enable_interrupts();
        std::thread::yield_now();
    }

    fn prime_context(
        &self,
        context: &mut SimContext,
        _stack_top: usize,
        entry: ContextEntry,
        arg: usize,
    ) {
        let baton = Arc::new(Baton::default());
        context.baton = Some(baton.clone());
        std::thread::spawn(move || {
            OWN_BATON.with(|own| *own.borrow_mut() = Some(baton.clone()));
            CORE.set(baton.wait());
            entry(arg)
        });
    }

    unsafe fn swap_context(&self, save: *mut SimContext, load: *const SimContext) {
        let mine = own_baton();
        let next = unsafe { (*load).baton.clone() }.expect("switch to an unprimed context");
        unsafe { (*save).baton = Some(mine.clone()) };
        next.hand_over(CORE.get());
        CORE.set(mine.wait());
    }

    fn load_address_space(&self, root: PhysAddr, switch: AddressSwitch) {
        self.state.tlb().load(root, switch);
    }

    fn set_kernel_stack(&self, top: usize) {
        self.state.kernel_stacks[CORE.get()].store(top, Ordering::SeqCst);
    }

    fn acknowledge_interrupt(&self) {
        self.state.acknowledged.fetch_add(1, Ordering::SeqCst);
    }

    fn fault_address(&self) -> usize {
        0
    }

    fn cycle_counter(&self) -> u64 {
        self.state.cycles.fetch_add(1, Ordering::SeqCst)
    }

    fn touch_user(&self, address: usize) -> u64 {
        let mut tlb = self.state.tlb();
        tlb.touches += 1;
        match tlb.translate(address) {
            Some(pointer) => unsafe { pointer.cast::<u64>().read_unaligned() },
            None => 0,
        }
    }

    unsafe fn return_to_user(&self, frame: *const Trapframe) -> ! {
        self.enable_interrupts();
        let mut user = SimUser {
            kernel: self.state.kernel(),
            frame: frame.cast_mut(),
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let entry = usize::try_from(user.frame().rip).expect("user rip");
            let program = self.state.program(entry);
            program(&mut user);
            user.exit(0)
        }));
        if let Err(payload) = outcome {
            self.abandon(payload);
        }
        unreachable!("user program returned");
    }

    fn halt(&self) -> ! {
        panic!("halt");
    }
}

/// The view a user program has of its own process.
pub(crate) struct SimUser {
    kernel: &'static Kernel<SimHal>,
    frame: *mut Trapframe,
}

impl SimUser {
    pub(crate) fn frame(&self) -> &Trapframe {
        unsafe { &*self.frame }
    }

    fn frame_mut(&mut self) -> &mut Trapframe {
        unsafe { &mut *self.frame }
    }

    fn state(&self) -> &SimState {
        &self.kernel.hal.state
    }

    /// Enters the kernel through `vector` as user-mode code would.
    fn enter(&mut self, vector: u64, interrupts: bool) {
        let hal = &self.kernel.hal;
        if interrupts {
            hal.enable_interrupts();
        } else {
            hal.disable_interrupts();
        }
        let frame = self.frame_mut();
        frame.trapno = vector;
        frame.cs = USER_CS;
        frame.ss = USER_DS;
        self.kernel.trap(unsafe { &mut *self.frame });
        self.kernel.hal.enable_interrupts();
    }

    /// `int 64` with `number` in rax and `args` placed per the kernel's convention.
    pub(crate) fn syscall_raw(&mut self, number: u64, args: &[u64]) -> u64 {
        match self.kernel.abi {
            SyscallAbi::Registers => {
                self.set_registers(number, args);
                self.enter(Vector::Syscall.into(), true);
            }
            SyscallAbi::UserStack => {
                let rsp = self.frame().rsp;
                let sp = (rsp & !0xf) - ARGUMENT_GAP;
                let words: Vec<u8> = core::iter::once(0)
                    .chain(args.iter().copied())
                    .flat_map(u64::to_ne_bytes)
                    .collect();
                self.store(sp, &words);
                self.frame_mut().rsp = sp;
                self.frame_mut().rax = number;
                self.enter(Vector::Syscall.into(), true);
                if self.frame().rsp == sp {
                    self.frame_mut().rsp = rsp;
                }
            }
        }
        self.frame().rax
    }

    pub(crate) fn syscall(&mut self, number: Sysno, args: &[u64]) -> u64 {
        self.syscall_raw(number.into(), args)
    }

    /// General syscall whose arguments are wherever `rsp` says.
    pub(crate) fn syscall_with_stack(&mut self, number: Sysno, rsp: u64) -> u64 {
        let saved = self.frame().rsp;
        self.frame_mut().rsp = rsp;
        self.frame_mut().rax = number.into();
        self.enter(Vector::Syscall.into(), true);
        self.frame_mut().rsp = saved;
        self.frame().rax
    }

    /// The `syscall` instruction: arguments always in registers, interrupts masked.
    pub(crate) fn fastcall(&mut self, number: Sysno, args: &[u64]) -> u64 {
        self.set_registers(number.into(), args);
        self.enter(Vector::FastSyscall.into(), false);
        self.frame().rax
    }

    pub(crate) fn set_stack_pointer(&mut self, rsp: u64) {
        self.frame_mut().rsp = rsp;
    }

    fn set_registers(&mut self, number: u64, args: &[u64]) {
        let frame = self.frame_mut();
        frame.rax = number;
        let registers = [
            &mut frame.rdi,
            &mut frame.rsi,
            &mut frame.rdx,
            &mut frame.r10,
            &mut frame.r8,
            &mut frame.r9,
        ];
        for (register, &arg) in registers.into_iter().zip(args) {
            *register = arg;
        }
    }

    /// Forks; the child runs `child` and exits when it returns.
    pub(crate) fn fork(&mut self, child: impl Fn(&mut SimUser) + Send + Sync + 'static) -> u64 {
        let entry = self.state().register(Arc::new(child));
        let rip = self.frame().rip;
        self.frame_mut().rip = entry as u64;
        let pid = self.syscall(Sysno::Fork, &[]);
        self.frame_mut().rip = rip;
        pid
    }

    #[allow(clippy::cast_sign_loss)]
    pub(crate) fn exit(&mut self, status: i32) -> ! {
        self.syscall(Sysno::Exit, &[status as u64]);
        unreachable!("exit returned");
    }

    pub(crate) fn wait(&mut self) -> u64 {
        self.syscall(Sysno::Wait, &[0])
    }

    /// wait() that also reports the exit status
    pub(crate) fn wait_status(&mut self) -> (u64, i32) {
        let pid = self.syscall(Sysno::Wait, &[STATUS_SCRATCH]);
        let status = self.load(STATUS_SCRATCH, 4);
        (pid, i32::from_ne_bytes(status.try_into().unwrap()))
    }

    pub(crate) fn getpid(&mut self) -> u64 {
        self.syscall(Sysno::Getpid, &[])
    }

    pub(crate) fn kill(&mut self, pid: u64) -> u64 {
        self.syscall(Sysno::Kill, &[pid])
    }

    pub(crate) fn sleep(&mut self, ticks: u64) -> u64 {
        self.syscall(Sysno::Sleep, &[ticks])
    }

    #[allow(clippy::cast_sign_loss)]
    pub(crate) fn sbrk(&mut self, delta: i64) -> u64 {
        self.syscall(Sysno::Sbrk, &[delta as u64])
    }

    pub(crate) fn write(&mut self, fd: u64, address: u64, len: u64) -> u64 {
        self.syscall(Sysno::Write, &[fd, address, len])
    }

    /// exec(); runs the new program if it succeeds and only returns on failure.
    pub(crate) fn exec(&mut self, path: u64, argv: u64) -> u64 {
        let result = self.syscall(Sysno::Exec, &[path, argv]);
        if result == FAILURE {
            return result;
        }
        let entry = usize::try_from(self.frame().rip).expect("user rip");
        let program = self.state().program(entry);
        program(self);
        self.exit(0)
    }

    /// Gives up the core without going through a trap.
    pub(crate) fn yield_now(&mut self) {
        self.kernel.yield_now();
    }

    pub(crate) fn send(&mut self, target: u64, message: Message) -> u64 {
        message.store(self.frame_mut());
        self.fastcall(Sysno::Send, &[target])
    }

    pub(crate) fn recv(&mut self) -> (u64, Message) {
        let from = self.fastcall(Sysno::Recv, &[]);
        (from, Message::from_frame(self.frame()))
    }

    pub(crate) fn send_recv(&mut self, target: u64, message: Message) -> (u64, Message) {
        message.store(self.frame_mut());
        let from = self.fastcall(Sysno::SendRecv, &[target]);
        (from, Message::from_frame(self.frame()))
    }

    /// Stores through the current translation, as a user-mode store would.
    pub(crate) fn store(&mut self, address: u64, bytes: &[u8]) {
        self.kernel.hal.user_write(address, bytes);
    }

    pub(crate) fn load(&mut self, address: u64, len: usize) -> Vec<u8> {
        self.kernel.hal.user_read(address, len)
    }

    /// A timer interrupt arriving while this process runs in user mode.
    pub(crate) fn tick(&mut self) {
        self.enter(Vector::Timer.into(), false);
    }

    /// A timer interrupt arriving while this process is inside the kernel.
    pub(crate) fn tick_in_kernel(&mut self) {
        let hal = &self.kernel.hal;
        hal.disable_interrupts();
        self.kernel.trap(&mut Trapframe {
            trapno: Vector::Timer.into(),
            cs: KERNEL_CS,
            ..Trapframe::default()
        });
        hal.enable_interrupts();
    }

    /// Core this process is running on
    pub(crate) fn core(&self) -> usize {
        CORE.get()
    }

    /// An exception raised by user code.
    pub(crate) fn fault(&mut self, vector: u64) {
        self.enter(vector, false);
    }

    /// Sleeps forever.
    pub(crate) fn idle(&mut self) -> ! {
        loop {
            self.sleep(u64::MAX);
        }
    }
}

/// Values pushed from any simulated flow, read back by the test thread.
pub(crate) struct Log<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Log<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for Log<T> {
    fn default() -> Self {
        Self(Arc::default())
    }
}

impl<T: Clone> Log<T> {
    pub(crate) fn push(&self, value: T) {
        self.0.lock().unwrap().push(value);
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }
}

pub(crate) fn boot() -> &'static Kernel<SimHal> {
    boot_with(KernelConfig::default())
}

/// A fresh kernel on a fresh simulated machine. The kernel address space is a single
/// empty root page shared by every test.
pub(crate) fn boot_with(config: KernelConfig) -> &'static Kernel<SimHal> {
    if vm::kernel_root().is_none() {
        let root = vm::alloc_pages(1).expect("kernel root");
        vm::kvm_init(vm::virt_to_phys(root.as_ptr()));
    }

    let kernel: &'static Kernel<SimHal> =
        Box::leak(Box::new(Kernel::new(SimHal::default(), config)));
    assert!(kernel.hal.state.kernel.set(kernel).is_ok());
    kernel
}

/// Makes `program` the first process, with the console at descriptors 0 and 1.
pub(crate) fn start(
    kernel: &'static Kernel<SimHal>,
    program: impl Fn(&mut SimUser) + Send + Sync + 'static,
) -> Pid {
    let state = &kernel.hal.state;
    state.programs.lock().unwrap().insert(0, Arc::new(program));
    let pid = kernel.userinit(&[0; PAGE_SIZE]).expect("userinit");
    for _ in 0..2 {
        kernel
            .install_file(pid, state.console.clone())
            .expect("console");
    }
    pid
}

/// Registers `program` for exec to find; returns its entry point.
pub(crate) fn program(
    kernel: &'static Kernel<SimHal>,
    program: impl Fn(&mut SimUser) + Send + Sync + 'static,
) -> usize {
    kernel.hal.state.register(Arc::new(program))
}

pub(crate) fn console_input(kernel: &'static Kernel<SimHal>, bytes: &[u8]) {
    kernel.hal.state.console.input.lock().unwrap().extend(bytes);
}

pub(crate) fn console_output(kernel: &'static Kernel<SimHal>) -> Vec<u8> {
    kernel.hal.state.console.output.lock().unwrap().clone()
}

/// Runs core 0's scheduler until `done` holds, rethrowing any panic a process raised.
pub(crate) fn run_until(kernel: &'static Kernel<SimHal>, mut done: impl FnMut() -> bool) {
    for _ in 0..MAX_ROUNDS {
        if let Some(payload) = kernel.hal.state.failure.lock().unwrap().take() {
            resume_unwind(payload);
        }
        if done() {
            return;
        }
        assert!(kernel.schedule_once(), "simulation stalled: nothing runnable");
    }
    panic!("simulation still running after {MAX_ROUNDS} rounds");
}

/// [`run_until`] with a second thread driving core 1's scheduler alongside core 0's.
/// Core 0 finding nothing runnable is not a stall here: core 1 may hold the only
/// runnable process.
pub(crate) fn run_on_two_cores_until(
    kernel: &'static Kernel<SimHal>,
    mut done: impl FnMut() -> bool,
) {
    let stop = Arc::new(AtomicBool::new(false));
    let second = {
        let stop = stop.clone();
        std::thread::spawn(move || {
            CORE.set(1);
            while !stop.load(Ordering::SeqCst) {
                if !kernel.schedule_once() {
                    std::thread::yield_now();
                }
            }
        })
    };
    let deadline = Instant::now() + TWO_CORE_DEADLINE;
    loop {
        if let Some(payload) = kernel.hal.state.failure.lock().unwrap().take() {
            stop.store(true, Ordering::SeqCst);
            resume_unwind(payload);
        }
        if done() {
            break;
        }
        if Instant::now() > deadline {
            stop.store(true, Ordering::SeqCst);
            panic!("simulation still running on two cores after {TWO_CORE_DEADLINE:?}");
        }
        if !kernel.schedule_once() {
            std::thread::yield_now();
        }
    }
    stop.store(true, Ordering::SeqCst);
    second.join().expect("core 1 scheduler panicked");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlb::TlbPolicy;
    use core::mem::size_of;

    const CHILDREN: u64 = 4;

    fn fill_and_check(policy: TlbPolicy) -> (Vec<u64>, u64) {
        let kernel = boot_with(KernelConfig {
            tlb_policy: policy,
            ..KernelConfig::default()
        });
        let log = Log::default();
        let out = log.clone();
        start(kernel, move |u| {
            for id in 0..CHILDREN {
                let seen = out.clone();
                u.fork(move |c| {
                    for round in 0..3 {
                        c.store(0x100, &(id * 100 + round).to_ne_bytes());
                        c.yield_now();
                        let word = c.load(0x100, 8);
                        seen.push(u64::from_ne_bytes(word.try_into().unwrap()));
                    }
                    c.exit(0)
                });
            }
            for _ in 0..CHILDREN {
                u.wait();
            }
            u.idle()
        });
        run_until(kernel, || log.len() == 3 * CHILDREN as usize);
        let mut values = log.snapshot();
        values.sort_unstable();
        (values, kernel.hal.tlb_invalidations(0))
    }

    #[test]
    fn memory_contents_do_not_depend_on_the_tlb_policy() {
        let (tagged, tagged_invalidations) = fill_and_check(TlbPolicy::Tagged);
        let (flushing, flushing_invalidations) = fill_and_check(TlbPolicy::AlwaysInvalidate);
        let expected: Vec<u64> = {
            let mut all: Vec<u64> = (0..CHILDREN)
                .flat_map(|id| (0..3).map(move |round| id * 100 + round))
                .collect();
            all.sort_unstable();
            all
        };
        assert_eq!(tagged, expected);
        assert_eq!(flushing, expected);
        assert!(tagged_invalidations < flushing_invalidations);
    }

    #[test]
    fn activation_points_user_traps_at_the_process_kernel_stack() {
        let kernel = boot();
        let log = Log::default();
        let out = log.clone();
        start(kernel, move |u| {
            let frame = core::ptr::from_ref(u.frame()) as usize;
            out.push(frame + size_of::<Trapframe>());
            u.idle()
        });
        run_until(kernel, || log.len() == 1);
        let stack_top = log.snapshot()[0];
        assert_eq!(kernel.hal.kernel_stack(0), stack_top);
        assert_eq!(stack_top % PAGE_SIZE, 0);
    }
}
