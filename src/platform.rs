//! Hardware seam
//!
//! The kernel core only touches the machine through these traits. On QEMU
//! `virt` they are implemented by `arch::aarch64::platform::QemuVirt`; unit
//! tests use a mock.

use crate::diag::DiagnosticSink;
use crate::error::MapError;

/// Physical memory the page allocator hands out
pub trait FrameMemory {
    /// Zero one 4 KB frame at physical address `frame`
    fn zero_frame(&mut self, frame: u64);
}

/// The translation regime demand paging installs mappings into
pub trait AddressSpace {
    /// True once translation is switched on
    fn paging_enabled(&self) -> bool;

    /// Physical frame backing page `va`, if mapped
    fn translate(&self, va: u64) -> Option<u64>;

    /// Map the 4 KB page at `va` to `frame` as normal read-write memory
    fn map_page(&mut self, va: u64, frame: u64) -> Result<(), MapError>;
}

/// Opaque callee-saved register image used by `Platform::run_on_stack`.
///
/// Only the context-switch primitive reads or writes it.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct SavedContext {
    regs: [u64; 13],
}

impl SavedContext {
    pub const fn new() -> Self {
        SavedContext { regs: [0; 13] }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u64 {
        self.regs.as_mut_ptr()
    }
}

/// Everything the kernel core needs from the machine
pub trait Platform: DiagnosticSink + FrameMemory + AddressSpace {
    /// Re-arm the scheduler tick
    fn timer_rearm(&mut self);

    /// Signal completion of interrupt `irq` to the interrupt controller
    fn end_of_interrupt(&mut self, irq: u32);

    /// Monotonic time since boot
    fn now_ns(&self) -> u64;

    /// Fill `buf` from a hardware entropy source; returns bytes produced
    /// (0 when no source is present or ready)
    fn hardware_entropy(&mut self, buf: &mut [u8]) -> usize;

    /// Copy `bytes` into hosted-runtime memory at `addr`
    fn write_bytes(&mut self, addr: u64, bytes: &[u8]);

    /// Save the caller's callee-saved state into `saved`, run `entry` on the
    /// stack whose top is `stack_top`, then restore and return.
    ///
    /// Switching happens only here, at a call boundary. Nothing preempts
    /// `entry` mid-expression.
    ///
    /// # Safety
    /// `stack_top` must be the 16-byte aligned top of a live stack that is
    /// not in use and stays allocated until this returns.
    unsafe fn run_on_stack(&mut self, saved: &mut SavedContext, stack_top: u64, entry: &mut dyn FnMut());
}
