//! `Platform` for the QEMU virt machine

use core::arch::asm;
use core::ptr;

use crate::bootparams::PhysReader;
use crate::config::{AddressRange, PAGE_SIZE};
use crate::diag::DiagnosticSink;
use crate::error::MapError;
use crate::platform::{AddressSpace, FrameMemory, Platform, SavedContext};

use super::mmu::{self, PageTables};
use super::{context, gic, timer, uart};

/// ID_AA64ISAR0_EL1.RNDR, bits [63:60]
const ISAR0_RNDR_SHIFT: u64 = 60;

pub struct QemuVirt {
    tables: PageTables,
    has_rndr: bool,
}

impl QemuVirt {
    /// Build the boot translation tables in `page_tables`; translation stays
    /// off until `enable_paging`
    pub fn new(page_tables: AddressRange) -> Result<Self, MapError> {
        let isar0: u64;
        unsafe { asm!("mrs {}, id_aa64isar0_el1", out(reg) isar0) };
        let has_rndr = (isar0 >> ISAR0_RNDR_SHIFT) & 0xF != 0;
        Ok(QemuVirt {
            tables: PageTables::new(page_tables)?,
            has_rndr,
        })
    }

    pub fn enable_paging(&mut self) {
        mmu::enable(&self.tables);
    }

    fn rndr() -> Option<u64> {
        let value: u64;
        let ok: u64;
        unsafe {
            // RNDR clears Z on success
            asm!(
                "mrs {v}, s3_3_c2_c4_0",
                "cset {ok}, ne",
                v = out(reg) value,
                ok = out(reg) ok,
                options(nomem, nostack)
            );
        }
        (ok != 0).then_some(value)
    }
}

impl DiagnosticSink for QemuVirt {
    fn put_byte(&mut self, byte: u8) {
        uart::putc_direct(byte);
    }
}

impl FrameMemory for QemuVirt {
    fn zero_frame(&mut self, frame: u64) {
        // frames sit in identity-mapped RAM
        unsafe { ptr::write_bytes(frame as *mut u8, 0, PAGE_SIZE as usize) };
    }
}

impl AddressSpace for QemuVirt {
    fn paging_enabled(&self) -> bool {
        mmu::is_enabled()
    }

    fn translate(&self, va: u64) -> Option<u64> {
        self.tables.translate(va)
    }

    fn map_page(&mut self, va: u64, frame: u64) -> Result<(), MapError> {
        self.tables.map_page(va, frame)
    }
}

impl Platform for QemuVirt {
    fn timer_rearm(&mut self) {
        timer::rearm();
    }

    fn end_of_interrupt(&mut self, irq: u32) {
        gic::end_of_interrupt(irq);
    }

    fn now_ns(&self) -> u64 {
        timer::now_ns()
    }

    fn hardware_entropy(&mut self, buf: &mut [u8]) -> usize {
        if !self.has_rndr {
            return 0;
        }
        let mut filled = 0;
        for chunk in buf.chunks_mut(8) {
            match Self::rndr() {
                Some(value) => {
                    chunk.copy_from_slice(&value.to_le_bytes()[..chunk.len()]);
                    filled += chunk.len();
                }
                None => break,
            }
        }
        filled
    }

    fn write_bytes(&mut self, addr: u64, bytes: &[u8]) {
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
    }

    unsafe fn run_on_stack(&mut self, saved: &mut SavedContext, stack_top: u64, entry: &mut dyn FnMut()) {
        context::run_on_stack(saved, stack_top, entry);
    }
}

/// Boot-parameter blob read straight from physical memory
pub struct BootMemory;

impl PhysReader for BootMemory {
    fn read_u8(&self, addr: u64) -> u8 {
        unsafe { ptr::read_volatile(addr as *const u8) }
    }
}
