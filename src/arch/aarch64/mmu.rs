/*
 * ARM64 Memory Management Unit (MMU)
 *
 * 4-level translation, 4KB granule, 48-bit VA through TTBR0_EL1:
 * - Level 0: 512 GB per entry
 * - Level 1: 1 GB per entry (device space is one block here)
 * - Level 2: 2 MB per entry (RAM below the page-table area is identity
 *   mapped with blocks)
 * - Level 3: 4 KB pages, installed one at a time by demand paging
 *
 * Tables are carved from the reserved page-table area and never freed.
 */

use core::arch::asm;
use core::ptr;

use bitflags::bitflags;

use crate::config::{AddressRange, PAGE_SIZE};
use crate::error::MapError;

const TABLE_ENTRIES: usize = 512;

const BLOCK_SIZE_1GB: u64 = 1 << 30;
const BLOCK_SIZE_2MB: u64 = 2 << 20;

/// Output address bits [47:12] of a descriptor
const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// Highest translatable VA + 1 (T0SZ = 16)
const VA_LIMIT: u64 = 1 << 48;

/// Start of RAM on QEMU virt
const RAM_BASE: u64 = 0x4000_0000;

bitflags! {
    /// Stage 1 descriptor bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Descriptor: u64 {
        const VALID = 1 << 0;
        /// Table at levels 0-2, page at level 3
        const TABLE_OR_PAGE = 1 << 1;
        const ATTR_DEVICE = 1 << 2; // MAIR index 1
        const SH_INNER = 3 << 8;
        const AF = 1 << 10;
        const PXN = 1 << 53;
        const UXN = 1 << 54;
    }
}

/// MAIR_EL1 index 0: normal write-back; index 1: device nGnRnE
const MAIR: u64 = 0x00 << 8 | 0xFF;

const TCR_T0SZ: u64 = 16;
const TCR_IRGN0_WBWA: u64 = 1 << 8;
const TCR_ORGN0_WBWA: u64 = 1 << 10;
const TCR_SH0_INNER: u64 = 3 << 12;
const TCR_TG0_4K: u64 = 0 << 14;
const TCR_EPD1: u64 = 1 << 23;
const TCR_IPS_40BIT: u64 = 2 << 32;

const SCTLR_M: u64 = 1 << 0;
const SCTLR_C: u64 = 1 << 2;
const SCTLR_I: u64 = 1 << 12;

fn normal_memory() -> Descriptor {
    Descriptor::VALID | Descriptor::AF | Descriptor::SH_INNER
}

fn device_memory() -> Descriptor {
    Descriptor::VALID | Descriptor::AF | Descriptor::ATTR_DEVICE | Descriptor::PXN | Descriptor::UXN
}

fn index(va: u64, level: u32) -> usize {
    ((va >> (39 - 9 * level)) & 0x1FF) as usize
}

/// Translation tables rooted in the page-table area.
///
/// Tables are addressed physically; the identity map keeps that valid
/// after translation is switched on.
pub struct PageTables {
    root: u64,
    next: u64,
    end: u64,
}

impl PageTables {
    /// Build the boot identity map: device space as one device block, RAM
    /// up to the end of `area` as 2 MB normal blocks.
    pub fn new(area: AddressRange) -> Result<Self, MapError> {
        let mut tables = PageTables {
            root: 0,
            next: area.start,
            end: area.end,
        };
        tables.root = tables.alloc_table()?;

        let l1 = tables.alloc_table()?;
        write_entry(tables.root, 0, l1 | (Descriptor::VALID | Descriptor::TABLE_OR_PAGE).bits());
        write_entry(l1, 0, device_memory().bits());

        let mut block = RAM_BASE;
        while block < area.end {
            let l2 = tables.next_table(l1, index(block, 1))?;
            write_entry(l2, index(block, 2), block | normal_memory().bits());
            block += BLOCK_SIZE_2MB;
        }

        log::info!(
            "[MMU] identity map {:#x}..{:#x}, tables from {:#x}",
            RAM_BASE,
            area.end,
            area.start
        );
        Ok(tables)
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// Zeroed table from the area
    fn alloc_table(&mut self) -> Result<u64, MapError> {
        if self.next + PAGE_SIZE > self.end {
            return Err(MapError::NoTableMemory);
        }
        let table = self.next;
        self.next += PAGE_SIZE;
        unsafe { ptr::write_bytes(table as *mut u8, 0, PAGE_SIZE as usize) };
        Ok(table)
    }

    /// Table behind entry `slot` of `table`, created if missing
    fn next_table(&mut self, table: u64, slot: usize) -> Result<u64, MapError> {
        let entry = Descriptor::from_bits_retain(read_entry(table, slot));
        if !entry.contains(Descriptor::VALID) {
            let fresh = self.alloc_table()?;
            write_entry(table, slot, fresh | (Descriptor::VALID | Descriptor::TABLE_OR_PAGE).bits());
            return Ok(fresh);
        }
        if !entry.contains(Descriptor::TABLE_OR_PAGE) {
            // covered by a block
            return Err(MapError::AlreadyMapped);
        }
        Ok(entry.bits() & ADDR_MASK)
    }

    /// Install a 4 KB normal read-write page
    pub fn map_page(&mut self, va: u64, frame: u64) -> Result<(), MapError> {
        if va >= VA_LIMIT {
            return Err(MapError::AddressOutOfRange);
        }
        let mut table = self.root;
        for level in 0..3 {
            table = self.next_table(table, index(va, level))?;
        }
        let slot = index(va, 3);
        if read_entry(table, slot) & Descriptor::VALID.bits() != 0 {
            return Err(MapError::AlreadyMapped);
        }
        let page = (frame & ADDR_MASK) | (normal_memory() | Descriptor::TABLE_OR_PAGE).bits();
        write_entry(table, slot, page);
        unsafe { asm!("dsb ishst", "isb", options(nostack)) };
        Ok(())
    }

    /// Physical address `va` translates to
    pub fn translate(&self, va: u64) -> Option<u64> {
        if va >= VA_LIMIT {
            return None;
        }
        let mut table = self.root;
        for level in 0..4 {
            let entry = Descriptor::from_bits_retain(read_entry(table, index(va, level)));
            if !entry.contains(Descriptor::VALID) {
                return None;
            }
            let base = entry.bits() & ADDR_MASK;
            match (level, entry.contains(Descriptor::TABLE_OR_PAGE)) {
                (3, _) => return Some(base | (va & (PAGE_SIZE - 1))),
                (1, false) => return Some((base & !(BLOCK_SIZE_1GB - 1)) | (va & (BLOCK_SIZE_1GB - 1))),
                (2, false) => return Some((base & !(BLOCK_SIZE_2MB - 1)) | (va & (BLOCK_SIZE_2MB - 1))),
                (_, true) => table = base,
                (_, false) => return None,
            }
        }
        None
    }
}

fn read_entry(table: u64, slot: usize) -> u64 {
    debug_assert!(slot < TABLE_ENTRIES);
    unsafe { ptr::read_volatile((table as *const u64).add(slot)) }
}

fn write_entry(table: u64, slot: usize, value: u64) {
    debug_assert!(slot < TABLE_ENTRIES);
    unsafe { ptr::write_volatile((table as *mut u64).add(slot), value) }
}

/// Load `tables` into TTBR0_EL1 and switch on translation and caches
pub fn enable(tables: &PageTables) {
    let tcr = TCR_T0SZ | TCR_IRGN0_WBWA | TCR_ORGN0_WBWA | TCR_SH0_INNER | TCR_TG0_4K | TCR_EPD1 | TCR_IPS_40BIT;
    unsafe {
        asm!("msr mair_el1, {}", in(reg) MAIR);
        asm!("msr tcr_el1, {}", in(reg) tcr);
        asm!("msr ttbr0_el1, {}", in(reg) tables.root());
        asm!("dsb sy", "tlbi vmalle1", "dsb sy", "isb");

        let mut sctlr: u64;
        asm!("mrs {}, sctlr_el1", out(reg) sctlr);
        sctlr |= SCTLR_M | SCTLR_C | SCTLR_I;
        asm!("msr sctlr_el1, {}", "isb", in(reg) sctlr);
    }
    log::info!("[MMU] translation enabled, TTBR0={:#x}", tables.root());
}

/// Check if MMU is enabled
pub fn is_enabled() -> bool {
    let sctlr: u64;
    unsafe {
        asm!("mrs {}, sctlr_el1", out(reg) sctlr);
    }
    (sctlr & SCTLR_M) != 0
}
