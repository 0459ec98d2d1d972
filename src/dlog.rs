//! Structured logging over the boot console.
//!
//! Replaces printf-style debug output with the `log` facade. Records are
//! serialized by a spinlock so lines from different pCPUs do not interleave.

use core::fmt::Write;

use crate::sync::SpinLock;

struct UartLogger {
    lock: SpinLock<()>,
}

static LOGGER: UartLogger = UartLogger {
    lock: SpinLock::new(()),
};

impl log::Log for UartLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _guard = self.lock.lock();
        let mut w = crate::uart::writer();
        let _ = write!(w, "{}: ", record.level());
        let _ = w.write_fmt(*record.args());
        let _ = w.write_str("\n");
    }

    fn flush(&self) {}
}

/// Install the UART logger. Called once from `one_time_init`; calling it
/// again is harmless.
pub fn init(level: log::LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
