//! The COM1 UART: sink for kernel output and the console behind descriptors 0 and 1.

use crate::file::{FileError, OpenFile};
use crate::println::DebugPrint;
use spin::mutex::Mutex;
use spin::once::Once;
use uart_16550::SerialPort;

const COM1: u16 = 0x3F8;

pub(crate) struct Serial(Mutex<SerialPort>);

static COM: Once<Serial> = Once::new();

/// The initialized COM1 port
pub(crate) fn com1() -> &'static Serial {
    COM.call_once(|| {
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        Serial(Mutex::new(port))
    })
}

impl DebugPrint for Serial {
    fn print_byte(&self, byte: u8) -> core::fmt::Result {
        self.0.lock().send(byte);
        Ok(())
    }

    fn print_str(&self, string: &str) -> core::fmt::Result {
        let mut port = self.0.lock();
        for byte in string.bytes() {
            port.send(byte);
        }
        Ok(())
    }
}

/// COM1 as an open file
pub(crate) struct Console;

impl OpenFile for Console {
    /// Takes whatever bytes have already arrived; never waits.
    fn read(&self, buffer: &mut [u8]) -> Result<usize, FileError> {
        let mut port = com1().0.lock();
        let mut count = 0;
        for slot in buffer.iter_mut() {
            match port.try_receive() {
                Ok(byte) => *slot = byte,
                Err(_) => break,
            }
            count += 1;
        }
        Ok(count)
    }

    fn write(&self, data: &[u8]) -> Result<usize, FileError> {
        let mut port = com1().0.lock();
        for &byte in data {
            port.send(byte);
        }
        Ok(data.len())
    }
}
