//! Timer tick channel
//!
//! Monitor tasks wait on these for scheduler ticks. Sending happens from the
//! timer interrupt, so the channel is a handful of atomics: no lock, no
//! allocation. Receiving spins; on a single bare-metal core there is nothing
//! to block on.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Ticks a channel holds before further sends are dropped
pub const TICK_CAPACITY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTick {
    /// Global tick count at send time
    pub count: u64,
    pub timestamp_ns: u64,
}

/// Bounded tick channel. Pending ticks are coalesced: a receive reports the
/// newest tick and consumes one pending slot.
pub struct TickChannel {
    pending: AtomicU32,
    dropped: AtomicU64,
    last_count: AtomicU64,
    last_timestamp: AtomicU64,
}

impl TickChannel {
    pub const fn new() -> Self {
        TickChannel {
            pending: AtomicU32::new(0),
            dropped: AtomicU64::new(0),
            last_count: AtomicU64::new(0),
            last_timestamp: AtomicU64::new(0),
        }
    }

    /// Post a tick. Returns false (and counts a drop) when the channel is full.
    pub fn send(&self, tick: TimerTick) -> bool {
        let queued = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < TICK_CAPACITY).then_some(n + 1)
            })
            .is_ok();
        if !queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.last_count.store(tick.count, Ordering::Relaxed);
        self.last_timestamp.store(tick.timestamp_ns, Ordering::Release);
        true
    }

    pub fn try_recv(&self) -> Option<TimerTick> {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()?;
        Some(TimerTick {
            count: self.last_count.load(Ordering::Relaxed),
            timestamp_ns: self.last_timestamp.load(Ordering::Acquire),
        })
    }

    /// Spin until a tick arrives
    pub fn recv(&self) -> TimerTick {
        loop {
            if let Some(tick) = self.try_recv() {
                return tick;
            }
            core::hint::spin_loop();
        }
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Sends lost to a full channel
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for TickChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(count: u64) -> TimerTick {
        TimerTick { count, timestamp_ns: count * 10_000_000 }
    }

    #[test]
    fn test_send_then_receive() {
        let ch = TickChannel::new();
        assert_eq!(ch.try_recv(), None);
        assert!(ch.send(tick(1)));
        assert_eq!(ch.recv(), tick(1));
        assert_eq!(ch.try_recv(), None);
    }

    #[test]
    fn test_bounded_drops_excess() {
        let ch = TickChannel::new();
        for n in 1..=TICK_CAPACITY as u64 {
            assert!(ch.send(tick(n)));
        }
        assert!(!ch.send(tick(99)));
        assert_eq!(ch.pending(), TICK_CAPACITY);
        assert_eq!(ch.dropped(), 1);

        // coalesced: newest accepted tick
        assert_eq!(ch.try_recv(), Some(tick(TICK_CAPACITY as u64)));
        assert_eq!(ch.pending(), TICK_CAPACITY - 1);
    }
}
