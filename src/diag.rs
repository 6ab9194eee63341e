//! Polling diagnostic output
//!
//! Trap handlers run with interrupts masked, so anything buffered or
//! interrupt-driven would never reach the wire. This channel writes byte by
//! byte through a `DiagnosticSink`, never allocates and never locks.

use core::fmt;

/// Byte-at-a-time, polling output
pub trait DiagnosticSink {
    fn put_byte(&mut self, byte: u8);
}

/// `fmt::Write` adapter over a sink; `\n` goes out as `\r\n`
pub struct DiagWriter<'a, S: DiagnosticSink + ?Sized> {
    sink: &'a mut S,
}

impl<'a, S: DiagnosticSink + ?Sized> DiagWriter<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        DiagWriter { sink }
    }
}

impl<S: DiagnosticSink + ?Sized> fmt::Write for DiagWriter<'_, S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.sink.put_byte(b'\r');
            }
            self.sink.put_byte(byte);
        }
        Ok(())
    }
}

/// 64-bit value as `0x` + 16 uppercase hex digits
#[derive(Clone, Copy)]
pub struct Hex(pub u64);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

/// Formatted write to a diagnostic sink
#[macro_export]
macro_rules! diag {
    ($sink:expr, $($arg:tt)*) => {{
        use core::fmt::Write as _;
        let _ = write!($crate::diag::DiagWriter::new(&mut *$sink), $($arg)*);
    }};
}

/// Same as `diag!`, newline-terminated
#[macro_export]
macro_rules! diagln {
    ($sink:expr) => ($crate::diag!($sink, "\n"));
    ($sink:expr, $($arg:tt)*) => ($crate::diag!($sink, "{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Capture(Vec<u8>);

    impl DiagnosticSink for Capture {
        fn put_byte(&mut self, byte: u8) {
            self.0.push(byte);
        }
    }

    #[test]
    fn test_newline_translation() {
        let mut out = Capture(Vec::new());
        diagln!(&mut out, "EC={}", 0x25);
        assert_eq!(out.0, b"EC=37\r\n");
    }

    #[test]
    fn test_hex_format() {
        let mut out = Capture(Vec::new());
        diag!(&mut out, "{}", Hex(0xDEAD_BEEF));
        assert_eq!(out.0, b"0x00000000DEADBEEF");
    }
}
