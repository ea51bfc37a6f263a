use core::fmt::Write;

static PRINT_IMPL: spin::once::Once<&'static dyn DebugPrint> = spin::once::Once::new();
const LEVEL_FILTER: log::LevelFilter = log::LevelFilter::Debug;

#[allow(unused_macros)]
macro_rules! print {
    ($($arg:tt)*) => { use core::fmt::Write; core::write!($crate::println::DebugWriter, $($arg)*).expect("Unable to write!"); }
}

macro_rules! println {
    ($($arg:tt)*) => { use core::fmt::Write; core::writeln!($crate::println::DebugWriter, $($arg)*).expect("Unable to write!"); }
}

/// Sends kernel output and the `log` records to `sink`. Only the first sink sticks.
#[inline]
#[allow(dead_code)]
pub(crate) fn set_debug_print(sink: &'static dyn DebugPrint) {
    PRINT_IMPL.call_once(|| sink);
    // A second call finds the logger already set; the sink above is all that matters.
    if log::set_logger(&DebugWriter).is_ok() {
        log::set_max_level(LEVEL_FILTER);
    }
}

/// A byte-at-a-time output device
pub(crate) trait DebugPrint: Sync {
    fn print_byte(&self, byte: u8) -> core::fmt::Result;

    fn print_str(&self, string: &str) -> core::fmt::Result {
        for byte in string.bytes() {
            self.print_byte(byte)?;
        }
        Ok(())
    }
}

pub(crate) struct DebugWriter;

impl Write for DebugWriter {
    /// Output before a sink is set goes nowhere.
    fn write_str(&mut self, string: &str) -> core::fmt::Result {
        match PRINT_IMPL.get() {
            Some(sink) => sink.print_str(string),
            None => Ok(()),
        }
    }
}

impl log::Log for DebugWriter {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let file = record.file().unwrap_or("");
            let line = record.line().unwrap_or(0);

            println!(
                "[{}] ({}:{}:{}): {}",
                record.level(),
                record.target(),
                file,
                line,
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

#[allow(unused_imports)]
pub(crate) use print;
#[allow(unused_imports)]
pub(crate) use println;
