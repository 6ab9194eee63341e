//! `log` backend over the console
//!
//! Lines go out as `[LEVEL] target: message` through the locked UART, the
//! same path as `uart_println!`. Trap handlers must not log: they use the
//! diagnostic channel instead.

use core::fmt;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            console_write(format_args!("{}", Line(record)));
        }
    }

    fn flush(&self) {}
}

/// Formats one record as a console line
struct Line<'a, 'b>(&'a Record<'b>);

impl fmt::Display for Line<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {}: {}", self.0.level(), self.0.target(), self.0.args())
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
fn console_write(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = crate::arch::aarch64::uart::UART.lock().write_fmt(args);
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
fn console_write(_args: fmt::Arguments) {}

/// Install the kernel logger with `level` as the maximum level
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use log::Level;

    #[test]
    fn test_line_format() {
        let line = Line(
            &Record::builder()
                .level(Level::Warn)
                .target("bedrock::page")
                .args(format_args!("{} frames", 12))
                .build(),
        )
        .to_string();
        assert_eq!(line, "[WARN] bedrock::page: 12 frames\n");
    }
}
