#![cfg_attr(not(test), no_std)]

/*
   Copyright 2024 Claire Moore

   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

       http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

extern crate alloc;

pub mod param;
pub(crate) mod println;

pub mod cpu;
pub mod dev;
pub mod exec;
pub mod file;
pub mod hal;
pub mod ipc;
pub mod proc;
pub mod syscall;
mod sysproc;
pub mod tlb;
pub mod trap;
pub mod vm;

#[cfg(target_os = "none")]
pub mod arch;
#[cfg(target_os = "none")]
mod kalloc;

#[cfg(test)]
mod sim;

use crate::cpu::Cpus;
use crate::dev::Devices;
use crate::exec::Loader;
use crate::hal::Hal;
use crate::param::NPROC;
use crate::proc::{PrivateProcData, ProcTable};
use crate::syscall::{SyscallAbi, SyscallTables};
use crate::tlb::{TagAllocator, TlbPolicy};
use core::cell::UnsafeCell;
use spin::mutex::Mutex;
use spin::once::Once;

/// Choices made once, when the kernel is built
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelConfig {
    pub tlb_policy: TlbPolicy,
    pub syscall_abi: SyscallAbi,
}

/// The whole kernel: process table, per-core state and dispatch tables, over one
/// hardware implementation.
///
/// Saved contexts point back into this value, so it must live in static storage for as
/// long as any core runs it.
pub struct Kernel<H: Hal> {
    hal: H,
    cpus: Cpus<H>,
    table: Mutex<ProcTable>,
    private_data: [UnsafeCell<PrivateProcData<H>>; NPROC],
    ticks: Mutex<u64>,
    tlb: TagAllocator,
    syscalls: SyscallTables<H>,
    devices: Devices,
    loader: Once<&'static dyn Loader>,
    abi: SyscallAbi,
}

// Private process data is only touched under the rules of `Kernel::private`; everything
// else is behind a lock or per-core with interrupts off.
unsafe impl<H: Hal> Sync for Kernel<H> {}
unsafe impl<H: Hal + Send> Send for Kernel<H> {}

impl<H: Hal> Kernel<H> {
    #[must_use]
    pub fn new(hal: H, config: KernelConfig) -> Self {
        Self {
            hal,
            cpus: Cpus::new(),
            table: Mutex::new(ProcTable::new()),
            private_data: core::array::from_fn(|_| UnsafeCell::new(PrivateProcData::default())),
            ticks: Mutex::new(0),
            tlb: TagAllocator::new(config.tlb_policy),
            syscalls: SyscallTables::new(),
            devices: Devices::new(),
            loader: Once::new(),
            abi: config.syscall_abi,
        }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Timer ticks counted since boot
    pub fn ticks(&self) -> u64 {
        *self.lock(&self.ticks)
    }
}
