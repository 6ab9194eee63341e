//! ARM Generic Timer
//!
//! The virtual timer (CNTV, PPI 27) drives the scheduler tick; the virtual
//! counter is the monotonic clock behind `clock_gettime`.

use core::arch::asm;
use core::sync::atomic::{AtomicU64, Ordering};

const CNTV_CTL_ENABLE: u64 = 1 << 0;

/// Counter ticks per scheduler tick, fixed by `init`
static INTERVAL: AtomicU64 = AtomicU64::new(0);

/// Read the virtual counter (CNTVCT_EL0)
#[inline]
pub fn read_counter() -> u64 {
    let count: u64;
    unsafe {
        asm!("isb", "mrs {0}, cntvct_el0", out(reg) count, options(nomem, nostack, preserves_flags));
    }
    count
}

/// Counter frequency in Hz (CNTFRQ_EL0)
#[inline]
pub fn read_counter_frequency() -> u64 {
    let freq: u64;
    unsafe {
        asm!("mrs {0}, cntfrq_el0", out(reg) freq, options(nomem, nostack, preserves_flags));
    }
    freq
}

pub fn ticks_to_ns(ticks: u64) -> u64 {
    match read_counter_frequency() {
        0 => 0,
        freq => (ticks as u128 * 1_000_000_000 / freq as u128) as u64,
    }
}

/// Nanoseconds since the counter started
pub fn now_ns() -> u64 {
    ticks_to_ns(read_counter())
}

fn write_tval(ticks: u64) {
    unsafe {
        asm!("msr cntv_tval_el0, {0}", in(reg) ticks, options(nomem, nostack));
    }
}

/// Start the virtual timer firing every `period_ms`
pub fn init(period_ms: u32) {
    let interval = read_counter_frequency() * period_ms as u64 / 1000;
    INTERVAL.store(interval, Ordering::Relaxed);
    write_tval(interval);
    unsafe {
        asm!("msr cntv_ctl_el0, {0}", "isb", in(reg) CNTV_CTL_ENABLE, options(nomem, nostack));
    }
    log::info!(
        "[TIMER] {} Hz counter, tick every {} ms",
        read_counter_frequency(),
        period_ms
    );
}

/// Schedule the next tick one interval from now; also clears the pending
/// timer condition
pub fn rearm() {
    write_tval(INTERVAL.load(Ordering::Relaxed));
}
