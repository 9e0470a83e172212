//! Forwarding of `log` records to the serial port.

use bare_metal::cpu::io::com::{SerialPort, COM1_ADDR};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

use core::fmt::Write;

pub static COM1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1_ADDR) });

static LOGGER: SerialLogger = SerialLogger;

/// Writes every record as `[LEVEL] target: message` to COM1.
pub struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut port = COM1.lock();
        // nowhere to report a failing serial port to
        let _ = writeln!(port, "[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Program the serial port and install the logger. Call once during early init.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
    COM1.lock().init();
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

pub fn set_level(max_level: LevelFilter) {
    log::set_max_level(max_level);
}
