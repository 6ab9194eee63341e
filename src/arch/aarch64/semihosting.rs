//! ARM semihosting, used to report the exit status to QEMU
//!
//! Needs `-semihosting` on the QEMU command line; without it the `hlt`
//! traps and the core halts instead.

use core::arch::asm;

const SYS_EXIT: u64 = 0x18;
const ADP_STOPPED_APPLICATION_EXIT: u64 = 0x2_0026;

/// Terminate the emulator with `code`
pub fn exit(code: u64) -> ! {
    let block = [ADP_STOPPED_APPLICATION_EXIT, code];
    unsafe {
        asm!(
            "hlt #0xf000",
            in("x0") SYS_EXIT,
            in("x1") block.as_ptr(),
            options(nostack)
        );
    }
    super::halt()
}
