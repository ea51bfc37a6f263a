//! Interrupt entry points of the device drivers.
//!
//! Drivers live outside the kernel core. Each registers one [`DeviceInterrupt`] per line
//! it owns and otherwise talks to processes through `WaitChannel::Device` sleeps.

use crate::hal::Hal;
use crate::Kernel;
use spin::once::Once;

/// Interrupt lines the dispatcher hands to drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSlot {
    Disk,
    Keyboard,
    Serial,
}

/// A driver's interrupt handler. It must fully service the device before returning; the
/// dispatcher acknowledges the interrupt afterwards.
pub trait DeviceInterrupt: Sync {
    fn interrupt(&self);
}

pub(crate) struct Devices {
    disk: Once<&'static dyn DeviceInterrupt>,
    keyboard: Once<&'static dyn DeviceInterrupt>,
    serial: Once<&'static dyn DeviceInterrupt>,
}

impl Devices {
    pub(crate) const fn new() -> Self {
        Self {
            disk: Once::new(),
            keyboard: Once::new(),
            serial: Once::new(),
        }
    }

    fn slot(&self, slot: DeviceSlot) -> &Once<&'static dyn DeviceInterrupt> {
        match slot {
            DeviceSlot::Disk => &self.disk,
            DeviceSlot::Keyboard => &self.keyboard,
            DeviceSlot::Serial => &self.serial,
        }
    }

    pub(crate) fn get(&self, slot: DeviceSlot) -> Option<&'static dyn DeviceInterrupt> {
        self.slot(slot).get().copied()
    }
}

impl<H: Hal> Kernel<H> {
    /// Routes interrupts on `slot` to `driver`. A line keeps its first driver.
    pub fn attach_device(&self, slot: DeviceSlot, driver: &'static dyn DeviceInterrupt) {
        self.devices.slot(slot).call_once(|| driver);
    }
}
