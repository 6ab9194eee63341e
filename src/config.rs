//! Kernel configuration
//!
//! Memory layout and policy knobs for the QEMU `virt` machine. Everything the
//! core needs to know about where things live is collected here so subsystems
//! take a `&KernelConfig` instead of reaching for scattered constants.

use log::LevelFilter;

/// Page / frame size (4 KB)
pub const PAGE_SIZE: u64 = 4096;

/// log2(PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Round `value` up to the next page boundary. `None` on overflow.
pub const fn page_align_up(value: u64) -> Option<u64> {
    match value.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// Round `value` down to its page boundary.
pub const fn page_align_down(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

/// Half-open address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    pub const fn new(start: u64, end: u64) -> Self {
        AddressRange { start, end }
    }

    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// True if the two ranges share at least one byte.
    pub const fn overlaps(&self, other: &AddressRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// What `getrandom` hands back to the hosted runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyPolicy {
    /// Report zero bytes written (the runtime falls back on its own seed)
    ZeroBytes,
    /// Fill the buffer, from hardware entropy when present, otherwise from
    /// the deterministic fallback generator. NOT a secure source.
    PseudoRandom,
}

/// Kernel-wide configuration
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Physical start of RAM
    pub ram_base: u64,
    /// RAM size assumed when discovery fails or looks implausible
    pub default_ram_size: u64,
    /// Hard ceiling on managed RAM (bounds descriptor-array size)
    pub ram_size_ceiling: u64,
    /// Kernel heap reserved right after the kernel image
    pub kernel_heap_size: u64,
    /// Place at most this many pages on the free list at boot
    pub free_list_cap: Option<usize>,
    /// Demand-paged virtual window
    pub region: AddressRange,
    /// Physical area translation tables are carved from
    pub page_tables: AddressRange,
    /// Fixed stack of the system task (trap handling runs here)
    pub system_stack: AddressRange,
    /// Address of the per-core allocation cache
    pub alloc_cache_addr: u64,
    /// GIC interrupt id of the scheduler tick
    pub timer_irq: u32,
    pub tick_period_ms: u32,
    /// Stack size used by `spawn_and_run`
    pub default_task_stack: usize,
    pub entropy: EntropyPolicy,
    pub log_level: LevelFilter,
}

impl KernelConfig {
    /// Layout for QEMU `virt` (run with at least 2 GB of RAM so the fixed
    /// system stack and page-table area exist)
    pub const fn qemu_virt() -> Self {
        KernelConfig {
            ram_base: 0x4000_0000,
            default_ram_size: 128 * MIB,
            ram_size_ceiling: 128 * MIB,
            kernel_heap_size: 16 * MIB,
            free_list_cap: None,
            region: AddressRange::new(0x6000_0000, 0x2_0000_0000),
            page_tables: AddressRange::new(0x5F10_0000, 0x6000_0000),
            system_stack: AddressRange::new(0x5EFF_0000, 0x5F00_0000),
            alloc_cache_addr: 0x4102_0000,
            timer_irq: 27, // virtual timer PPI
            tick_period_ms: 10,
            default_task_stack: 32 * KIB as usize,
            entropy: EntropyPolicy::ZeroBytes,
            log_level: LevelFilter::Info,
        }
    }

    /// Kernel heap placement for a kernel image ending at `kernel_end`
    pub const fn heap_range(&self, kernel_end: u64) -> AddressRange {
        let start = match page_align_up(kernel_end) {
            Some(start) => start,
            None => kernel_end,
        };
        AddressRange::new(start, start.saturating_add(self.kernel_heap_size))
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::qemu_virt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment() {
        assert_eq!(page_align_up(0), Some(0));
        assert_eq!(page_align_up(1), Some(PAGE_SIZE));
        assert_eq!(page_align_up(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(page_align_up(u64::MAX), None);
        assert_eq!(page_align_down(PAGE_SIZE + 17), PAGE_SIZE);
    }

    #[test]
    fn test_range_queries() {
        let r = AddressRange::new(0x1000, 0x3000);
        assert!(r.contains(0x1000));
        assert!(r.contains(0x2FFF));
        assert!(!r.contains(0x3000));
        assert_eq!(r.len(), 0x2000);
        assert!(r.overlaps(&AddressRange::new(0x2000, 0x8000)));
        assert!(!r.overlaps(&AddressRange::new(0x3000, 0x8000)));
    }

    #[test]
    fn test_qemu_layout_is_consistent() {
        let cfg = KernelConfig::qemu_virt();
        // region sits above the page-table area, stack below it
        assert!(cfg.page_tables.end <= cfg.region.start);
        assert!(cfg.system_stack.end <= cfg.page_tables.start);
        assert_eq!(cfg.system_stack.len(), 64 * KIB);

        let heap = cfg.heap_range(cfg.ram_base + 2 * MIB + 1);
        assert_eq!(heap.start, cfg.ram_base + 2 * MIB + PAGE_SIZE);
        assert_eq!(heap.len(), cfg.kernel_heap_size);
    }
}
