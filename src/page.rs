//! Physical page allocator
//!
//! One `PageDescriptor` per 4 KB frame of managed RAM, kept in an arena
//! indexed by frame number. Free frames are threaded into a doubly linked
//! list through the arena, so allocate, free and removal from the middle of
//! the list are all O(1). Nothing here allocates after `initialize`, which is
//! what makes `allocate`/`free` callable from trap context.

use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::config::{page_align_down, page_align_up, AddressRange, KernelConfig, MIB, PAGE_SHIFT, PAGE_SIZE};
use crate::platform::FrameMemory;

/// Discovered RAM sizes below this are treated as corrupt
pub const MIN_PLAUSIBLE_RAM: u64 = 16 * MIB;

bitflags! {
    /// Packed per-frame state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u32 {
        /// Not on the free list
        const ALLOCATED = 1 << 0;
        /// Kernel image or kernel heap
        const KERNEL = 1 << 1;
        /// Withheld from the free list (boot data, bring-up cap)
        const RESERVED = 1 << 2;
    }
}

/// Index of a frame within managed RAM
pub type FrameIndex = u32;

/// Metadata for one physical frame
#[derive(Debug, Clone, Copy, Default)]
pub struct PageDescriptor {
    /// Identity-mapped virtual address of the frame
    pub vaddr: u64,
    pub flags: PageFlags,
    next: Option<FrameIndex>,
    prev: Option<FrameIndex>,
}

impl PageDescriptor {
    pub fn is_allocated(&self) -> bool {
        self.flags.contains(PageFlags::ALLOCATED)
    }
}

/// Pick the RAM size to manage: the discovered size when plausible,
/// otherwise the configured default, clamped to the ceiling.
pub fn resolve_ram_size(discovered: Option<u64>, config: &KernelConfig) -> u64 {
    let size = match discovered {
        Some(size) if size >= MIN_PLAUSIBLE_RAM => size,
        _ => config.default_ram_size,
    };
    page_align_down(size.min(config.ram_size_ceiling))
}

/// Free-list page allocator over a fixed range of physical RAM
pub struct PageAllocator {
    ram: AddressRange,
    pages: Vec<PageDescriptor>,
    free_head: Option<FrameIndex>,
    free_count: usize,
}

impl PageAllocator {
    /// Build the descriptor arena for `ram`.
    ///
    /// Frames overlapping `kernel_image` or `kernel_heap` are marked
    /// allocated and kernel-owned. The rest go on the free list in address
    /// order, lowest first. With `free_list_cap` set, frames past the cap are
    /// marked allocated+reserved instead, so every frame is still either
    /// allocated or free.
    pub fn initialize(
        ram: AddressRange,
        kernel_image: AddressRange,
        kernel_heap: AddressRange,
        free_list_cap: Option<usize>,
    ) -> Self {
        let ram = AddressRange::new(ram.start, ram.start + page_align_down(ram.len()));
        let num_pages = (ram.len() >> PAGE_SHIFT) as usize;

        let mut allocator = PageAllocator {
            ram,
            pages: vec![PageDescriptor::default(); num_pages],
            free_head: None,
            free_count: 0,
        };

        for (i, page) in allocator.pages.iter_mut().enumerate() {
            page.vaddr = ram.start + ((i as u64) << PAGE_SHIFT);
        }

        let kernel_pages = allocator.mark_range(kernel_image, PageFlags::ALLOCATED | PageFlags::KERNEL);
        let heap_pages = allocator.mark_range(kernel_heap, PageFlags::ALLOCATED | PageFlags::KERNEL);

        let cap = free_list_cap.unwrap_or(usize::MAX);
        let mut tail: Option<FrameIndex> = None;
        for i in 0..num_pages {
            let page = &mut allocator.pages[i];
            if page.is_allocated() {
                continue;
            }
            if allocator.free_count >= cap {
                page.flags = PageFlags::ALLOCATED | PageFlags::RESERVED;
                continue;
            }

            let idx = i as FrameIndex;
            page.prev = tail;
            page.next = None;
            match tail {
                Some(t) => allocator.pages[t as usize].next = Some(idx),
                None => allocator.free_head = Some(idx),
            }
            tail = Some(idx);
            allocator.free_count += 1;
        }

        log::info!(
            "[PAGE] {} frames at {:#x}: {} kernel, {} heap, {} free",
            num_pages,
            ram.start,
            kernel_pages,
            heap_pages,
            allocator.free_count
        );

        allocator
    }

    /// Flag every frame overlapping `range` (before the free list exists)
    fn mark_range(&mut self, range: AddressRange, flags: PageFlags) -> usize {
        let mut marked = 0;
        for idx in self.indices_in(range) {
            self.pages[idx].flags |= flags;
            marked += 1;
        }
        marked
    }

    /// Frame indices overlapping `range`, clipped to managed RAM
    fn indices_in(&self, range: AddressRange) -> core::ops::Range<usize> {
        let start = page_align_down(range.start.max(self.ram.start));
        let end = page_align_up(range.end)
            .unwrap_or(u64::MAX)
            .min(self.ram.end);
        if start >= end {
            return 0..0;
        }
        let first = ((start - self.ram.start) >> PAGE_SHIFT) as usize;
        let last = ((end - self.ram.start) >> PAGE_SHIFT) as usize;
        first..last
    }

    /// Physical address → arena index
    #[inline]
    pub fn index_of(&self, addr: u64) -> Option<usize> {
        if !self.ram.contains(addr) {
            return None;
        }
        Some(((addr - self.ram.start) >> PAGE_SHIFT) as usize)
    }

    /// Arena index → physical address
    #[inline]
    pub fn address_of(&self, index: usize) -> u64 {
        self.ram.start + ((index as u64) << PAGE_SHIFT)
    }

    /// Take the head of the free list, zero it, and return its address.
    /// `None` when no frames are left.
    pub fn allocate<M: FrameMemory + ?Sized>(&mut self, memory: &mut M) -> Option<u64> {
        let idx = self.free_head?;
        self.unlink(idx);
        self.pages[idx as usize].flags.insert(PageFlags::ALLOCATED);

        let addr = self.address_of(idx as usize);
        memory.zero_frame(addr);
        Some(addr)
    }

    /// Return a frame obtained from `allocate` to the head of the free list.
    ///
    /// The address is not validated beyond a bounds check; passing a frame
    /// that was not handed out by `allocate` breaks the free list.
    pub fn free(&mut self, addr: u64) {
        let Some(idx) = self.index_of(addr) else {
            debug_assert!(false, "free of untracked frame {:#x}", addr);
            return;
        };
        debug_assert!(self.pages[idx].is_allocated(), "double free of frame {:#x}", addr);

        self.pages[idx].flags.remove(PageFlags::ALLOCATED | PageFlags::KERNEL);
        self.push_front(idx as FrameIndex);
    }

    /// Pull every free frame overlapping `range` off the free list and mark
    /// it reserved. Returns how many frames were withdrawn.
    pub fn reserve_range(&mut self, range: AddressRange) -> usize {
        let mut withdrawn = 0;
        for idx in self.indices_in(range) {
            if self.pages[idx].is_allocated() {
                continue;
            }
            self.unlink(idx as FrameIndex);
            self.pages[idx].flags = PageFlags::ALLOCATED | PageFlags::RESERVED;
            withdrawn += 1;
        }
        if withdrawn > 0 {
            log::debug!("[PAGE] reserved {} frames at {:#x}", withdrawn, range.start);
        }
        withdrawn
    }

    fn push_front(&mut self, idx: FrameIndex) {
        let old_head = self.free_head;
        {
            let page = &mut self.pages[idx as usize];
            page.prev = None;
            page.next = old_head;
        }
        if let Some(h) = old_head {
            self.pages[h as usize].prev = Some(idx);
        }
        self.free_head = Some(idx);
        self.free_count += 1;
    }

    fn unlink(&mut self, idx: FrameIndex) {
        let (prev, next) = {
            let page = &self.pages[idx as usize];
            (page.prev, page.next)
        };
        match prev {
            Some(p) => self.pages[p as usize].next = next,
            None => self.free_head = next,
        }
        if let Some(n) = next {
            self.pages[n as usize].prev = prev;
        }
        let page = &mut self.pages[idx as usize];
        page.prev = None;
        page.next = None;
        self.free_count -= 1;
    }

    /// Managed physical range
    pub fn ram(&self) -> AddressRange {
        self.ram
    }

    pub fn total_frames(&self) -> usize {
        self.pages.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn allocated_count(&self) -> usize {
        self.pages.len() - self.free_count
    }

    pub fn descriptor(&self, addr: u64) -> Option<&PageDescriptor> {
        self.index_of(addr).map(|idx| &self.pages[idx])
    }

    pub fn is_allocated(&self, addr: u64) -> bool {
        self.descriptor(addr).map_or(false, |page| page.is_allocated())
    }

    /// Walk the free list from its head
    pub fn free_frames(&self) -> FreeFrames<'_> {
        FreeFrames {
            allocator: self,
            cursor: self.free_head,
            remaining: self.pages.len(),
        }
    }
}

/// Iterator over free frame addresses, bounded by the arena size so a
/// corrupted list cannot spin forever
pub struct FreeFrames<'a> {
    allocator: &'a PageAllocator,
    cursor: Option<FrameIndex>,
    remaining: usize,
}

impl Iterator for FreeFrames<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.remaining == 0 {
            return None;
        }
        let idx = self.cursor?;
        self.remaining -= 1;
        self.cursor = self.allocator.pages[idx as usize].next;
        Some(self.allocator.address_of(idx as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPlatform;
    use std::collections::BTreeSet;

    const RAM_BASE: u64 = 0x4000_0000;

    fn allocator_128m(cap: Option<usize>) -> PageAllocator {
        PageAllocator::initialize(
            AddressRange::new(RAM_BASE, RAM_BASE + 128 * MIB),
            AddressRange::new(RAM_BASE, RAM_BASE + 2 * MIB),
            AddressRange::new(RAM_BASE + 2 * MIB, RAM_BASE + 18 * MIB),
            cap,
        )
    }

    fn small_allocator(frames: u64) -> PageAllocator {
        PageAllocator::initialize(
            AddressRange::new(RAM_BASE, RAM_BASE + frames * PAGE_SIZE),
            AddressRange::new(RAM_BASE, RAM_BASE + PAGE_SIZE),
            AddressRange::new(RAM_BASE + PAGE_SIZE, RAM_BASE + PAGE_SIZE),
            None,
        )
    }

    /// Every frame is allocated xor on the free list, and the list has no repeats
    fn assert_partition(pages: &PageAllocator) {
        let listed: Vec<u64> = pages.free_frames().collect();
        let unique: BTreeSet<u64> = listed.iter().copied().collect();
        assert_eq!(listed.len(), unique.len(), "duplicate on free list");
        assert_eq!(listed.len(), pages.free_count());

        for idx in 0..pages.total_frames() {
            let addr = pages.address_of(idx);
            assert_ne!(
                pages.is_allocated(addr),
                unique.contains(&addr),
                "frame {:#x} is both or neither",
                addr
            );
        }
    }

    #[test]
    fn test_128m_scenario() {
        let mut platform = MockPlatform::new();
        let mut pages = allocator_128m(None);
        let reserved_pages = (2 * MIB + 16 * MIB) / PAGE_SIZE;
        let expected = 32_768 - reserved_pages as usize;

        assert_eq!(pages.total_frames(), 32_768);
        assert_eq!(pages.free_count(), expected);

        let first = pages.allocate(&mut platform).unwrap();
        assert!(first >= RAM_BASE + 18 * MIB, "first frame {:#x} inside kernel+heap", first);

        let mut obtained = 1;
        while pages.allocate(&mut platform).is_some() {
            obtained += 1;
        }
        assert_eq!(obtained, expected);
        assert_eq!(pages.allocate(&mut platform), None);
        assert_eq!(pages.free_count(), 0);
    }

    #[test]
    fn test_allocation_zeroes_frame() {
        let mut platform = MockPlatform::new();
        let mut pages = small_allocator(8);

        let frame = pages.allocate(&mut platform).unwrap();
        assert_eq!(platform.zeroed_frames(), 1);
        platform.poke(frame + 100, 0xAB);
        platform.poke(frame + 4095, 0xCD);
        pages.free(frame);
        assert_eq!(platform.zeroed_frames(), 1, "free does not zero");

        let again = pages.allocate(&mut platform).unwrap();
        assert_eq!(again, frame, "free pushes to the head");
        assert_eq!(platform.zeroed_frames(), 2);
        assert_eq!(platform.peek(again + 100), 0);
        assert_eq!(platform.peek(again + 4095), 0);
    }

    #[test]
    fn test_free_list_partition_under_churn() {
        let mut platform = MockPlatform::new();
        let mut pages = small_allocator(64);
        let mut held: Vec<u64> = Vec::new();
        let mut seed: u32 = 0x1234_5678;

        for step in 0..2_000 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            if (seed >> 16) % 3 != 0 || held.is_empty() {
                if let Some(frame) = pages.allocate(&mut platform) {
                    assert!(!held.contains(&frame));
                    held.push(frame);
                }
            } else {
                let victim = held.swap_remove((seed as usize >> 8) % held.len());
                pages.free(victim);
            }
            if step % 97 == 0 {
                assert_partition(&pages);
            }
        }
        assert_partition(&pages);
    }

    #[test]
    fn test_free_list_cap_keeps_partition() {
        let pages = allocator_128m(Some(1000));
        assert_eq!(pages.free_count(), 1000);
        assert_partition(&pages);

        let past_cap = RAM_BASE + 18 * MIB + 1000 * PAGE_SIZE;
        let flags = pages.descriptor(past_cap).unwrap().flags;
        assert!(flags.contains(PageFlags::ALLOCATED | PageFlags::RESERVED));
    }

    #[test]
    fn test_kernel_frames_flagged() {
        let pages = allocator_128m(None);
        let flags = pages.descriptor(RAM_BASE).unwrap().flags;
        assert_eq!(flags, PageFlags::ALLOCATED | PageFlags::KERNEL);
        assert_eq!(pages.descriptor(RAM_BASE + 5 * PAGE_SIZE).unwrap().vaddr, RAM_BASE + 5 * PAGE_SIZE);
    }

    #[test]
    fn test_reserve_range_unlinks_middle() {
        let mut platform = MockPlatform::new();
        let mut pages = small_allocator(16);
        let before = pages.free_count();

        let withdrawn = pages.reserve_range(AddressRange::new(RAM_BASE + 4 * PAGE_SIZE, RAM_BASE + 6 * PAGE_SIZE));
        assert_eq!(withdrawn, 2);
        assert_eq!(pages.free_count(), before - 2);
        assert_partition(&pages);

        while let Some(frame) = pages.allocate(&mut platform) {
            assert!(frame != RAM_BASE + 4 * PAGE_SIZE && frame != RAM_BASE + 5 * PAGE_SIZE);
        }
    }

    #[test]
    fn test_resolve_ram_size() {
        let cfg = KernelConfig::qemu_virt();
        assert_eq!(resolve_ram_size(None, &cfg), 128 * MIB);
        assert_eq!(resolve_ram_size(Some(4096), &cfg), 128 * MIB);
        assert_eq!(resolve_ram_size(Some(64 * MIB), &cfg), 64 * MIB);
        assert_eq!(resolve_ram_size(Some(8 * 1024 * MIB), &cfg), 128 * MIB);
    }
}
