//! Linux syscall emulation
//!
//! The hosted runtime is built for Linux/AArch64 and issues `svc #0` with
//! the syscall number in x8 and arguments in x0..x5. There is no OS under
//! it, so this table answers just enough of the ABI to get the runtime
//! through initialization and steady state. Results are returned the Linux
//! way: a value, or `-errno` in two's complement.

use crate::config::{page_align_up, AddressRange, EntropyPolicy, PAGE_SIZE};
use crate::diag::Hex;
use crate::error::{Errno, ReserveError};
use crate::platform::Platform;
use crate::random::EntropyPool;
use crate::region::{DemandRegion, MAX_USER_VA};
use crate::{diag, diagln};

/// Linux AArch64 syscall numbers the runtime uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    Openat = 56,
    Close = 57,
    Read = 63,
    Write = 64,
    Exit = 93,
    ExitGroup = 94,
    Futex = 98,
    Nanosleep = 99,
    ClockGettime = 113,
    SchedGetaffinity = 123,
    Tgkill = 131,
    RtSigaction = 134,
    RtSigprocmask = 135,
    Gettid = 178,
    Brk = 214,
    Munmap = 215,
    Clone = 220,
    Mmap = 222,
    Mprotect = 226,
    Madvise = 233,
    Prlimit64 = 261,
    Getrandom = 278,
}

impl SyscallNumber {
    /// Convert from u64
    pub fn from_u64(n: u64) -> Option<Self> {
        use SyscallNumber::*;
        Some(match n {
            56 => Openat,
            57 => Close,
            63 => Read,
            64 => Write,
            93 => Exit,
            94 => ExitGroup,
            98 => Futex,
            99 => Nanosleep,
            113 => ClockGettime,
            123 => SchedGetaffinity,
            131 => Tgkill,
            134 => RtSigaction,
            135 => RtSigprocmask,
            178 => Gettid,
            214 => Brk,
            215 => Munmap,
            220 => Clone,
            222 => Mmap,
            226 => Mprotect,
            233 => Madvise,
            261 => Prlimit64,
            278 => Getrandom,
            _ => return None,
        })
    }
}

/// mmap flag: place the mapping exactly at `addr`
pub const MAP_FIXED: u64 = 0x10;

/// Address returned for zero-length mappings (never dereferenced)
pub const ZERO_LENGTH_MMAP: u64 = 0x1000;

/// Fixed program break reported by brk
pub const FIXED_BRK: u64 = 0x5000_0000;

/// Thread id reported by gettid (single thread)
pub const MAIN_TID: u64 = 1;

/// One trapped `svc`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRequest {
    /// x8
    pub number: u64,
    /// x0..x5
    pub args: [u64; 6],
    /// `svc` immediate (ESR.ISS[15:0])
    pub imm: u16,
}

impl SyscallRequest {
    pub fn new(number: u64, args: [u64; 6]) -> Self {
        SyscallRequest { number, args, imm: 0 }
    }
}

/// What the trap path does after a syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Write this into x0 and return to the caller
    Return(u64),
    /// Stop the machine with this exit code
    Exit(u64),
}

/// Per-outcome counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyscallStats {
    pub total: u64,
    pub errors: u64,
    pub unknown: u64,
}

/// Syscall table plus the little state it keeps
pub struct SyscallLayer {
    entropy_policy: EntropyPolicy,
    entropy: EntropyPool,
    stats: SyscallStats,
}

impl SyscallLayer {
    pub fn new(entropy_policy: EntropyPolicy) -> Self {
        SyscallLayer {
            entropy_policy,
            entropy: EntropyPool::new(),
            stats: SyscallStats::default(),
        }
    }

    /// Run one syscall.
    ///
    /// Called from trap context: no allocation, diagnostics only through the
    /// platform's polling channel.
    pub fn dispatch<P: Platform + ?Sized>(
        &mut self,
        request: &SyscallRequest,
        region: &mut DemandRegion,
        platform: &mut P,
    ) -> SyscallOutcome {
        self.stats.total += 1;
        let [a0, a1, a2, a3, _a4, _a5] = request.args;

        let Some(number) = SyscallNumber::from_u64(request.number) else {
            self.stats.unknown += 1;
            self.stats.errors += 1;
            diagln!(platform, "SYSCALL UNKNOWN: {}", Hex(request.number));
            return SyscallOutcome::Return(Errno::ENOSYS.to_return());
        };

        let result: Result<u64, Errno> = match number {
            // pretend the bytes went out
            SyscallNumber::Write => Ok(a2),
            // end of file
            SyscallNumber::Read => Ok(0),
            SyscallNumber::Openat => Err(Errno::ENOENT),
            SyscallNumber::Close => Ok(0),
            SyscallNumber::Exit | SyscallNumber::ExitGroup => {
                diagln!(platform, "\nEXIT:{}", Hex(a0));
                return SyscallOutcome::Exit(a0);
            }
            SyscallNumber::Futex
            | SyscallNumber::Nanosleep
            | SyscallNumber::Tgkill
            | SyscallNumber::RtSigaction
            | SyscallNumber::RtSigprocmask
            | SyscallNumber::Mprotect
            | SyscallNumber::Munmap
            | SyscallNumber::Madvise
            | SyscallNumber::Prlimit64 => Ok(0),
            // no second hardware thread to give out
            SyscallNumber::Clone => Err(Errno::EAGAIN),
            SyscallNumber::Mmap => self.sys_mmap(a0, a1, a3, region, platform),
            SyscallNumber::Brk => Ok(FIXED_BRK),
            SyscallNumber::Gettid => Ok(MAIN_TID),
            SyscallNumber::ClockGettime => self.sys_clock_gettime(a1, platform),
            SyscallNumber::SchedGetaffinity => self.sys_sched_getaffinity(a1, a2, platform),
            SyscallNumber::Getrandom => self.sys_getrandom(a0, a1, platform),
        };

        match result {
            Ok(value) => SyscallOutcome::Return(value),
            Err(errno) => {
                self.stats.errors += 1;
                SyscallOutcome::Return(errno.to_return())
            }
        }
    }

    /// mmap(addr, length, prot, flags, fd, offset)
    fn sys_mmap<P: Platform + ?Sized>(
        &mut self,
        addr: u64,
        length: u64,
        flags: u64,
        region: &mut DemandRegion,
        platform: &mut P,
    ) -> Result<u64, Errno> {
        if length == 0 {
            return Ok(ZERO_LENGTH_MMAP);
        }

        if flags & MAP_FIXED != 0 {
            if addr == 0 || addr & (PAGE_SIZE - 1) != 0 {
                return Err(Errno::EINVAL);
            }
            return region.reserve_fixed(addr, length).map_err(|e| {
                diagln!(platform, "mmap: MAP_FIXED {} rejected: {}", Hex(addr), e);
                Errno::ENOMEM
            });
        }

        // the runtime's arena allocator relies on hints being honored
        if addr != 0 && hint_is_usable(addr, length, region) {
            match region.reserve_fixed(addr, length) {
                Ok(base) => return Ok(base),
                Err(ReserveError::SpansExhausted) => return Err(Errno::ENOMEM),
                Err(_) => {}
            }
        }

        region.reserve(length).map_err(|_| {
            diag!(platform, "mmap: region exhausted, len={}\n", Hex(length));
            Errno::ENOMEM
        })
    }

    /// clock_gettime(clock_id, tp): monotonic time since boot for every clock
    fn sys_clock_gettime<P: Platform + ?Sized>(&mut self, tp: u64, platform: &mut P) -> Result<u64, Errno> {
        if tp == 0 {
            return Err(Errno::EINVAL);
        }
        let now = platform.now_ns();
        let mut timespec = [0u8; 16];
        timespec[..8].copy_from_slice(&(now / 1_000_000_000).to_le_bytes());
        timespec[8..].copy_from_slice(&(now % 1_000_000_000).to_le_bytes());
        platform.write_bytes(tp, &timespec);
        Ok(0)
    }

    /// sched_getaffinity(pid, cpusetsize, mask): one CPU
    fn sys_sched_getaffinity<P: Platform + ?Sized>(
        &mut self,
        size: u64,
        mask: u64,
        platform: &mut P,
    ) -> Result<u64, Errno> {
        if mask == 0 || size == 0 {
            return Err(Errno::EINVAL);
        }
        platform.write_bytes(mask, &[0x01]);
        Ok(8)
    }

    /// getrandom(buf, len, flags)
    fn sys_getrandom<P: Platform + ?Sized>(&mut self, buf: u64, len: u64, platform: &mut P) -> Result<u64, Errno> {
        if self.entropy_policy == EntropyPolicy::ZeroBytes || len == 0 {
            return Ok(0);
        }
        if buf == 0 {
            return Err(Errno::EINVAL);
        }

        let mut chunk = [0u8; 64];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(chunk.len() as u64) as usize;
            let was_degraded = self.entropy.degraded();
            if self.entropy.fill(platform, &mut chunk[..n]) && !was_degraded {
                diagln!(platform, "getrandom: no hardware entropy, using deterministic fallback");
            }
            platform.write_bytes(buf + done, &chunk[..n]);
            done += n as u64;
        }
        Ok(len)
    }

    pub fn stats(&self) -> SyscallStats {
        self.stats
    }
}

/// A hint is honored when it is page aligned, lies wholly above the bump
/// window (whose unreserved tail belongs to later plain mmaps), stays below
/// the top of the address space and overlaps no recorded span.
fn hint_is_usable(addr: u64, length: u64, region: &DemandRegion) -> bool {
    if addr & (PAGE_SIZE - 1) != 0 || addr < region.window().end {
        return false;
    }
    let Some(end) = page_align_up(length).and_then(|len| addr.checked_add(len)) else {
        return false;
    };
    let wanted = AddressRange::new(addr, end);
    end <= MAX_USER_VA && !region.spans().iter().any(|span| span.overlaps(&wanted))
}
