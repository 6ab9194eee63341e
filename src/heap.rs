//! Kernel heap
//!
//! Task descriptors and task stacks come from here, never from the physical
//! page allocator. Backed by `linked_list_allocator`, owned by the kernel
//! context rather than installed as a global, so tests can hand the
//! scheduler a heap of any size.

use core::alloc::Layout;
use core::ptr::NonNull;

use linked_list_allocator::Heap;

pub struct KernelHeap {
    inner: Heap,
}

impl KernelHeap {
    /// Heap with no memory behind it; every allocation fails until `init`
    pub const fn empty() -> Self {
        KernelHeap { inner: Heap::empty() }
    }

    /// Hand `size` bytes at `start` to the heap
    ///
    /// # Safety
    /// The memory must be valid, unused and live for as long as the heap.
    /// Must only be called once.
    pub unsafe fn init(&mut self, start: *mut u8, size: usize) {
        self.inner.init(start, size);
        log::info!("[HEAP] kernel heap {:p}, {} KB", start, size / 1024);
    }

    pub fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        self.inner.allocate_first_fit(layout).ok()
    }

    /// # Safety
    /// `ptr` must come from `allocate` on this heap with the same `layout`.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        self.inner.deallocate(ptr, layout);
    }

    /// Bytes currently handed out
    pub fn used(&self) -> usize {
        self.inner.used()
    }

    pub fn free(&self) -> usize {
        self.inner.free()
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }
}
