//! bedrock - bare-metal AArch64 kernel core
//!
//! Hosts a managed-language runtime directly on a QEMU `virt` machine: the
//! trap dispatcher, physical page allocator, demand-paged region with Linux
//! syscall emulation, and the scheduler bootstrap / preemption controller
//! the runtime needs to run without an OS beneath it.
//!
//! Everything except `arch` is plain Rust over the `Platform` seam and is
//! unit tested on the build host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod diag;
pub mod bootparams;
pub mod config;
pub mod error;
pub mod heap;
pub mod interrupts;
pub mod kernel;
pub mod logger;
pub mod page;
pub mod platform;
pub mod random;
pub mod region;
pub mod scheduler;
pub mod syscall;
pub mod task;
pub mod tick;
pub mod trap;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub mod arch;

#[cfg(test)]
pub(crate) mod testing;

pub use config::KernelConfig;
pub use kernel::{BootInfo, Kernel};
pub use platform::Platform;
