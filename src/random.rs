//! Entropy for `getrandom`
//!
//! When no hardware source is present (or it is not ready yet) bytes come
//! from a fixed-seed linear congruential generator. That output is fully
//! predictable across boots. It keeps the hosted runtime's start-up working
//! and must never be mistaken for a secure source.

use crate::platform::Platform;

/// Seed of the fallback generator
pub const FALLBACK_SEED: u32 = 0x1234_5678;

/// Deterministic fallback generator: `state = state * 1103515245 + 12345`,
/// each byte is `state >> 16`
#[derive(Debug, Clone)]
pub struct FallbackRng {
    state: u32,
}

impl FallbackRng {
    pub const fn new(seed: u32) -> Self {
        FallbackRng { state: seed }
    }

    pub fn next_byte(&mut self) -> u8 {
        self.state = self.state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (self.state >> 16) as u8
    }

    pub fn fill(&mut self, buf: &mut [u8]) {
        for byte in buf {
            *byte = self.next_byte();
        }
    }
}

impl Default for FallbackRng {
    fn default() -> Self {
        Self::new(FALLBACK_SEED)
    }
}

/// Hardware entropy first, fallback generator for whatever it could not supply
pub struct EntropyPool {
    fallback: FallbackRng,
    degraded: bool,
}

impl EntropyPool {
    pub const fn new() -> Self {
        EntropyPool {
            fallback: FallbackRng::new(FALLBACK_SEED),
            degraded: false,
        }
    }

    /// Fill `buf`. Returns true if any byte came from the fallback generator.
    pub fn fill<P: Platform + ?Sized>(&mut self, platform: &mut P, buf: &mut [u8]) -> bool {
        let produced = platform.hardware_entropy(buf).min(buf.len());
        if produced == buf.len() {
            return false;
        }
        self.fallback.fill(&mut buf[produced..]);
        self.degraded = true;
        true
    }

    /// True once the fallback generator has been used
    pub fn degraded(&self) -> bool {
        self.degraded
    }
}

impl Default for EntropyPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPlatform;

    #[test]
    fn test_fallback_sequence_is_fixed() {
        let mut a = FallbackRng::default();
        let mut b = FallbackRng::new(FALLBACK_SEED);
        let first: Vec<u8> = (0..16).map(|_| a.next_byte()).collect();
        let second: Vec<u8> = (0..16).map(|_| b.next_byte()).collect();
        assert_eq!(first, second);

        let state = FALLBACK_SEED.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        assert_eq!(first[0], (state >> 16) as u8);
    }

    #[test]
    fn test_pool_prefers_hardware() {
        let mut platform = MockPlatform::new();
        platform.set_entropy(Some(0x5A));
        let mut pool = EntropyPool::new();
        let mut buf = [0u8; 8];

        assert!(!pool.fill(&mut platform, &mut buf));
        assert_eq!(buf, [0x5A; 8]);
        assert!(!pool.degraded());
    }

    #[test]
    fn test_pool_falls_back() {
        let mut platform = MockPlatform::new();
        let mut pool = EntropyPool::new();
        let mut buf = [0u8; 8];

        assert!(pool.fill(&mut platform, &mut buf));
        assert!(pool.degraded());
        let mut expected = [0u8; 8];
        FallbackRng::default().fill(&mut expected);
        assert_eq!(buf, expected);
    }
}
