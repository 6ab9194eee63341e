//! Demand-paged region
//!
//! A virtual window `[base, end)` handed out by a bump cursor. Reserving
//! address space never commits memory: a physical frame is bound to a page
//! only when the hosted runtime first touches it and the access faults.
//!
//! Besides the bump window the region tracks a small table of fixed spans
//! (`MAP_FIXED` requests and honored hints), which are demand-paged the same
//! way.

use heapless::Vec as FixedVec;

use crate::config::{page_align_down, page_align_up, AddressRange};
use crate::diag::Hex;
use crate::error::{FaultError, ReserveError};
use crate::page::PageAllocator;
use crate::platform::Platform;
use crate::diagln;

/// Fixed spans tracked outside the bump window
pub const MAX_SPANS: usize = 32;

/// Highest virtual address a fixed span may reach (48-bit VA)
pub const MAX_USER_VA: u64 = 1 << 48;

/// Faults on the same address beyond this count are an exception loop
pub const FAULT_REPEAT_LIMIT: u32 = 3;

/// DFSC: alignment fault
pub const DFSC_ALIGNMENT: u64 = 0x21;

/// Counters for diagnostics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FaultStats {
    pub faults: u64,
    /// Frames bound to pages
    pub committed: u64,
    /// Faults on pages that were already mapped
    pub duplicates: u64,
}

pub struct DemandRegion {
    window: AddressRange,
    cursor: u64,
    spans: FixedVec<AddressRange, MAX_SPANS>,
    /// Frames must never come from here
    page_tables: AddressRange,
    last_fault: u64,
    repeat: u32,
    stats: FaultStats,
}

impl DemandRegion {
    /// Empty region over `window`; the cursor starts at `window.start`
    pub fn new(window: AddressRange, page_tables: AddressRange) -> Self {
        log::info!(
            "[REGION] demand-paged window {:#x}..{:#x}",
            window.start,
            window.end
        );
        DemandRegion {
            window,
            cursor: window.start,
            spans: FixedVec::new(),
            page_tables,
            last_fault: u64::MAX,
            repeat: 0,
            stats: FaultStats::default(),
        }
    }

    /// Reserve `length` bytes (rounded up to whole pages) from the bump
    /// cursor. Touches no physical memory. On failure the cursor is left
    /// where it was.
    pub fn reserve(&mut self, length: u64) -> Result<u64, ReserveError> {
        let rounded = page_align_up(length).ok_or(ReserveError::OutOfMemory)?;
        let new_cursor = self
            .cursor
            .checked_add(rounded)
            .ok_or(ReserveError::OutOfMemory)?;
        if new_cursor > self.window.end {
            return Err(ReserveError::OutOfMemory);
        }

        let base = self.cursor;
        self.cursor = new_cursor;
        Ok(base)
    }

    /// Record `[addr, addr + length)` as a demand-paged span at a caller
    /// chosen address. `addr` must be page aligned, at or above the window
    /// base, and the span must stay below `MAX_USER_VA`.
    pub fn reserve_fixed(&mut self, addr: u64, length: u64) -> Result<u64, ReserveError> {
        if addr & 0xFFF != 0 || addr < self.window.start {
            return Err(ReserveError::InvalidAddress);
        }
        let rounded = page_align_up(length).ok_or(ReserveError::OutOfMemory)?;
        let end = addr.checked_add(rounded).ok_or(ReserveError::OutOfMemory)?;
        if end > MAX_USER_VA {
            return Err(ReserveError::OutOfMemory);
        }

        let span = AddressRange::new(addr, end);
        if self.spans.iter().any(|s| s.start <= span.start && span.end <= s.end) {
            return Ok(addr);
        }
        self.spans.push(span).map_err(|_| ReserveError::SpansExhausted)?;
        Ok(addr)
    }

    /// True if `va` lies in reserved bump space or in a fixed span
    pub fn contains(&self, va: u64) -> bool {
        (va >= self.window.start && va < self.cursor) || self.spans.iter().any(|s| s.contains(va))
    }

    /// Service a translation fault at `far`.
    ///
    /// Inside reserved space, bind a fresh zeroed frame to the faulting page
    /// (or, with translation off, just validate the address). Outside it, or
    /// when no frame is left, the fault is not ours to fix and the caller
    /// reports and halts.
    pub fn handle_fault<P: Platform + ?Sized>(
        &mut self,
        far: u64,
        dfsc: u64,
        pages: &mut PageAllocator,
        platform: &mut P,
    ) -> Result<(), FaultError> {
        self.stats.faults += 1;

        if far == self.last_fault {
            self.repeat += 1;
            if self.repeat > FAULT_REPEAT_LIMIT {
                diagln!(platform, "!EXCEPTION LOOP! VA={} count={}", Hex(far), self.repeat);
                return Err(FaultError::FaultLoop { count: self.repeat });
            }
        } else {
            self.last_fault = far;
            self.repeat = 1;
        }

        if dfsc & 0x3F == DFSC_ALIGNMENT {
            return Err(FaultError::AlignmentFault);
        }
        if !self.contains(far) {
            diagln!(platform, "!FAULT outside demand-paged memory: VA={}", Hex(far));
            return Err(FaultError::OutsideRegion);
        }
        if !platform.paging_enabled() {
            return Ok(());
        }

        let page = page_align_down(far);
        if let Some(existing) = platform.translate(page) {
            diagln!(platform, "!DUPLICATE FAULT at VA={} (mapped to PA={})", Hex(page), Hex(existing));
            self.stats.duplicates += 1;
            return Ok(());
        }

        let frame = match pages.allocate(platform) {
            Some(frame) => frame,
            None => {
                diagln!(platform, "DEMAND PAGE OOM at VA={}", Hex(far));
                return Err(FaultError::OutOfFrames);
            }
        };
        if self.page_tables.contains(frame) {
            pages.free(frame);
            return Err(FaultError::FrameOutOfRange { frame });
        }

        if let Err(e) = platform.map_page(page, frame) {
            pages.free(frame);
            return Err(FaultError::MapFailed(e));
        }

        self.stats.committed += 1;
        Ok(())
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn window(&self) -> AddressRange {
        self.window
    }

    /// Bytes still available to `reserve`
    pub fn remaining(&self) -> u64 {
        self.window.end - self.cursor
    }

    pub fn spans(&self) -> &[AddressRange] {
        &self.spans
    }

    pub fn stats(&self) -> FaultStats {
        self.stats
    }
}
