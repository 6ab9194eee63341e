//! Test doubles for the hardware seam

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::PAGE_SIZE;
use crate::diag::DiagnosticSink;
use crate::error::MapError;
use crate::heap::KernelHeap;
use crate::platform::{AddressSpace, FrameMemory, Platform, SavedContext};

/// Records everything the kernel core asks of the machine.
///
/// Physical memory is sparse: bytes never written read back as 0xFF unless
/// their frame was zeroed, so a frame that skipped zeroing is visible.
pub struct MockPlatform {
    diag: Vec<u8>,
    ram: BTreeMap<u64, u8>,
    zeroed: BTreeSet<u64>,
    zero_calls: usize,
    mappings: BTreeMap<u64, u64>,
    paging: bool,
    map_failure: Option<MapError>,
    eois: Vec<u32>,
    rearms: u32,
    now_ns: u64,
    entropy: Option<u8>,
    writes: Vec<(u64, Vec<u8>)>,
    stacks_run: Vec<u64>,
}

impl MockPlatform {
    pub fn new() -> Self {
        MockPlatform {
            diag: Vec::new(),
            ram: BTreeMap::new(),
            zeroed: BTreeSet::new(),
            zero_calls: 0,
            mappings: BTreeMap::new(),
            paging: true,
            map_failure: None,
            eois: Vec::new(),
            rearms: 0,
            now_ns: 0,
            entropy: None,
            writes: Vec::new(),
            stacks_run: Vec::new(),
        }
    }

    pub fn poke(&mut self, addr: u64, value: u8) {
        self.ram.insert(addr, value);
    }

    pub fn peek(&self, addr: u64) -> u8 {
        match self.ram.get(&addr) {
            Some(&value) => value,
            None if self.zeroed.contains(&(addr & !(PAGE_SIZE - 1))) => 0,
            None => 0xFF,
        }
    }

    pub fn translate(&self, va: u64) -> Option<u64> {
        self.mappings.get(&(va & !(PAGE_SIZE - 1))).copied()
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    /// Everything written to the diagnostic channel, `\r` stripped
    pub fn diag_output(&self) -> String {
        String::from_utf8_lossy(&self.diag).replace('\r', "")
    }

    /// Make every later `map_page` fail with `error`
    pub fn fail_maps(&mut self, error: MapError) {
        self.map_failure = Some(error);
    }

    pub fn set_paging(&mut self, enabled: bool) {
        self.paging = enabled;
    }

    /// Hardware entropy source filling every byte with `byte`, or none
    pub fn set_entropy(&mut self, byte: Option<u8>) {
        self.entropy = byte;
    }

    pub fn set_now_ns(&mut self, now: u64) {
        self.now_ns = now;
    }

    /// `zero_frame` calls so far, repeats included
    pub fn zeroed_frames(&self) -> usize {
        self.zero_calls
    }

    pub fn eois(&self) -> &[u32] {
        &self.eois
    }

    pub fn rearms(&self) -> u32 {
        self.rearms
    }

    /// `write_bytes` calls in order
    pub fn writes(&self) -> &[(u64, Vec<u8>)] {
        &self.writes
    }

    /// Stack tops passed to `run_on_stack`
    pub fn stacks_run(&self) -> &[u64] {
        &self.stacks_run
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticSink for MockPlatform {
    fn put_byte(&mut self, byte: u8) {
        self.diag.push(byte);
    }
}

impl FrameMemory for MockPlatform {
    fn zero_frame(&mut self, frame: u64) {
        let touched: Vec<u64> = self.ram.range(frame..frame + PAGE_SIZE).map(|(&addr, _)| addr).collect();
        for addr in touched {
            self.ram.remove(&addr);
        }
        self.zeroed.insert(frame);
        self.zero_calls += 1;
    }
}

impl AddressSpace for MockPlatform {
    fn paging_enabled(&self) -> bool {
        self.paging
    }

    fn translate(&self, va: u64) -> Option<u64> {
        MockPlatform::translate(self, va)
    }

    fn map_page(&mut self, va: u64, frame: u64) -> Result<(), MapError> {
        if let Some(error) = self.map_failure {
            return Err(error);
        }
        let page = va & !(PAGE_SIZE - 1);
        if self.mappings.contains_key(&page) {
            return Err(MapError::AlreadyMapped);
        }
        self.mappings.insert(page, frame);
        Ok(())
    }
}

impl Platform for MockPlatform {
    fn timer_rearm(&mut self) {
        self.rearms += 1;
    }

    fn end_of_interrupt(&mut self, irq: u32) {
        self.eois.push(irq);
    }

    fn now_ns(&self) -> u64 {
        self.now_ns
    }

    fn hardware_entropy(&mut self, buf: &mut [u8]) -> usize {
        match self.entropy {
            Some(byte) => {
                buf.fill(byte);
                buf.len()
            }
            None => 0,
        }
    }

    fn write_bytes(&mut self, addr: u64, bytes: &[u8]) {
        self.writes.push((addr, bytes.to_vec()));
    }

    unsafe fn run_on_stack(&mut self, _saved: &mut SavedContext, stack_top: u64, entry: &mut dyn FnMut()) {
        self.stacks_run.push(stack_top);
        entry();
    }
}

/// Owns backing memory for a `KernelHeap`
pub struct TestHeap {
    _backing: Vec<u64>,
    heap: KernelHeap,
}

impl TestHeap {
    pub fn new(size: usize) -> Self {
        let mut backing = vec![0u64; size / 8];
        let mut heap = KernelHeap::empty();
        unsafe { heap.init(backing.as_mut_ptr() as *mut u8, size) };
        TestHeap { _backing: backing, heap }
    }

    pub fn heap(&mut self) -> &mut KernelHeap {
        &mut self.heap
    }
}

/// A `KernelHeap` over leaked memory, for kernels that outlive the test body
pub fn leak_heap(size: usize) -> KernelHeap {
    let backing: &'static mut [u64] = Box::leak(vec![0u64; size / 8].into_boxed_slice());
    let mut heap = KernelHeap::empty();
    unsafe { heap.init(backing.as_mut_ptr() as *mut u8, size) };
    heap
}
