//! PL011 UART Driver for ARM
//!
//! Serial console for the QEMU virt machine. `UART` is the locked console
//! used by `uart_println!` and the logger; `putc_direct` bypasses the lock
//! for trap handlers and the panic path.

use core::fmt;

use lazy_static::lazy_static;
use volatile::{ReadOnly, Volatile};

use crate::diag::DiagnosticSink;

/// PL011 UART base address (QEMU virt machine)
const UART_BASE: usize = 0x0900_0000;

/// Flag register bits
const UART_FR_TXFF: u32 = 1 << 5; // Transmit FIFO full

/// Control register bits
const UART_CR_UARTEN: u32 = 1 << 0;
const UART_CR_TXE: u32 = 1 << 8;

/// PL011 register block, up to the control register
#[repr(C)]
struct Registers {
    dr: Volatile<u32>,      // 0x00 Data
    _rsr: [u32; 5],         // 0x04..0x18
    fr: ReadOnly<u32>,      // 0x18 Flags
    _reserved: [u32; 2],    // 0x1C..0x24
    ibrd: Volatile<u32>,    // 0x24
    fbrd: Volatile<u32>,    // 0x28
    lcr_h: Volatile<u32>,   // 0x2C
    cr: Volatile<u32>,      // 0x30 Control
}

/// PL011 UART driver
pub struct Uart {
    base: usize,
}

impl Uart {
    pub const fn new() -> Self {
        Uart { base: UART_BASE }
    }

    fn registers(&self) -> &'static mut Registers {
        unsafe { &mut *(self.base as *mut Registers) }
    }

    /// Make sure the transmitter is on.
    ///
    /// QEMU leaves the PL011 enabled, so this only touches CR when firmware
    /// did not.
    pub fn init(&self) {
        let regs = self.registers();
        let cr = regs.cr.read();
        if cr & (UART_CR_UARTEN | UART_CR_TXE) != (UART_CR_UARTEN | UART_CR_TXE) {
            regs.cr.write(0);
            regs.ibrd.write(13); // 115200 baud at 24 MHz
            regs.fbrd.write(1);
            regs.lcr_h.write(0b11 << 5 | 1 << 4); // 8N1, FIFO on
            regs.cr.write(UART_CR_UARTEN | UART_CR_TXE);
        }
    }

    fn write_byte(&self, byte: u8) {
        let regs = self.registers();
        while regs.fr.read() & UART_FR_TXFF != 0 {
            core::hint::spin_loop();
        }
        regs.dr.write(byte as u32);
    }

    fn write_string(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl fmt::Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

lazy_static! {
    /// Global console; the transmitter is brought up on first use
    pub static ref UART: spin::Mutex<Uart> = {
        let uart = Uart::new();
        uart.init();
        spin::Mutex::new(uart)
    };
}

pub fn init() {
    lazy_static::initialize(&UART);
}

/// Lock-free byte output, for contexts that may have interrupted a lock holder
pub fn putc_direct(byte: u8) {
    Uart::new().write_byte(byte);
}

/// Diagnostic sink over `putc_direct`
pub struct DirectConsole;

impl DiagnosticSink for DirectConsole {
    fn put_byte(&mut self, byte: u8) {
        putc_direct(byte);
    }
}

impl fmt::Write for DirectConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Uart::new().write_string(s);
        Ok(())
    }
}

/// Print macro for ARM
#[macro_export]
macro_rules! uart_print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::arch::aarch64::uart::UART.lock(), $($arg)*);
    }};
}

/// Println macro for ARM
#[macro_export]
macro_rules! uart_println {
    () => ($crate::uart_print!("\n"));
    ($($arg:tt)*) => ($crate::uart_print!("{}\n", format_args!($($arg)*)));
}
