//! Kernel logging over the serial port.
//! Wires the `log` facade to COM1 so every subsystem can use `log::info!`
//! and friends without caring about the output device.

use log::{LevelFilter, Metadata, Record};

use crate::serial_println;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            serial_println!(
                "[{:>5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger. Safe to call more than once; only the first
/// call takes effect (tests re-enter `init` freely).
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        let level = if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
        log::set_max_level(level);
    }
}
