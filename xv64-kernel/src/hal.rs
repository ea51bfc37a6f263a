//! The narrow interface between the kernel core and the machine.
//!
//! The process table, the address-space manager, the trap dispatcher and IPC are written
//! against [`Hal`] only. `arch::x86_64` is the implementation for real hardware; the unit
//! tests run the same code on the host through `sim`.

use crate::tlb::AddressSwitch;
use crate::trap::Trapframe;
use crate::vm::PhysAddr;

/// First code run by a freshly primed context. Receives the argument given to
/// [`Hal::prime_context`].
pub type ContextEntry = extern "C" fn(usize) -> !;

pub trait Hal: Sync + Sized + 'static {
    /// Callee-owned state of a suspended kernel control flow.
    ///
    /// Only meaningful while the flow is not executing.
    type Context: Default + Send;

    /// Index of the calling core, below [`crate::param::NCPU`].
    fn cpu_id(&self) -> usize;

    fn interrupts_enabled(&self) -> bool;

    fn disable_interrupts(&self);

    fn enable_interrupts(&self);

    /// Enables interrupts and idles until the next one arrives.
    fn wait_for_interrupt(&self);

    /// Sets up `context` so that the first switch into it runs `entry(arg)` on the stack
    /// ending at `stack_top`.
    fn prime_context(
        &self,
        context: &mut Self::Context,
        stack_top: usize,
        entry: ContextEntry,
        arg: usize,
    );

    /// Saves the running flow into `save` and resumes the flow held in `load`.
    ///
    /// Saves exactly the registers the calling convention makes callee-owned plus the stack
    /// pointer; everything else is the caller's to preserve.
    ///
    /// # Safety
    /// Interrupts must be disabled and must not be re-enabled before the switch completes.
    /// `load` must hold a primed or previously saved context, and both pointers must stay
    /// valid until the flow saved into `save` is resumed.
    unsafe fn swap_context(&self, save: *mut Self::Context, load: *const Self::Context);

    /// Makes the page-table hierarchy rooted at `root` active on this core.
    fn load_address_space(&self, root: PhysAddr, switch: AddressSwitch);

    /// Stack the hardware moves to when a user-mode flow enters the kernel on this core.
    fn set_kernel_stack(&self, top: usize);

    /// Signals end-of-interrupt to the interrupt controller.
    fn acknowledge_interrupt(&self);

    /// Linear address behind the most recent page fault.
    fn fault_address(&self) -> usize;

    /// Free-running cycle counter, used by the timing syscalls.
    fn cycle_counter(&self) -> u64;

    /// Loads the word at user address `address` through the translation active on this
    /// core, the way a user-mode load would.
    fn touch_user(&self, address: usize) -> u64;

    /// Leaves the kernel through `frame` exactly as the trap return path does.
    ///
    /// # Safety
    /// `frame` must describe a user-mode flow and stay valid until that flow next enters
    /// the kernel.
    unsafe fn return_to_user(&self, frame: *const Trapframe) -> !;

    /// Stops this core for good.
    fn halt(&self) -> !;
}
