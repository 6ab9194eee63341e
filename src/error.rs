//! Error types shared across the kernel core
//!
//! Trap-time code never panics on these; it reports them on the diagnostic
//! channel. Everything else hands them back to the caller.

use core::fmt;

use crate::trap::ExceptionClass;

/// POSIX error numbers returned (negated) to the hosted runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Errno {
    /// No such file or directory
    ENOENT = 2,
    /// Resource temporarily unavailable
    EAGAIN = 11,
    /// Out of memory
    ENOMEM = 12,
    /// Invalid argument
    EINVAL = 22,
    /// Function not implemented
    ENOSYS = 38,
}

impl Errno {
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Register encoding of `-errno`
    pub fn to_return(self) -> u64 {
        (-self.code()) as u64
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::ENOENT => "no such entry",
            Errno::EAGAIN => "resource temporarily unavailable",
            Errno::ENOMEM => "out of memory",
            Errno::EINVAL => "invalid argument",
            Errno::ENOSYS => "function not implemented",
        };
        write!(f, "{} (-{})", name, self.code())
    }
}

/// Demand-paged region reservation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    /// Cursor would pass the end of the window
    OutOfMemory,
    /// No free slot left to record a fixed span
    SpansExhausted,
    /// Address is not usable for a fixed or hinted span
    InvalidAddress,
}

impl fmt::Display for ReserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReserveError::OutOfMemory => write!(f, "demand-paged region exhausted"),
            ReserveError::SpansExhausted => write!(f, "all fixed spans in use"),
            ReserveError::InvalidAddress => write!(f, "address outside the usable range"),
        }
    }
}

/// Page-table update failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Translation-table area is used up
    NoTableMemory,
    /// A block or page already covers the address
    AlreadyMapped,
    /// Address is beyond the translation regime
    AddressOutOfRange,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::NoTableMemory => write!(f, "no memory left for translation tables"),
            MapError::AlreadyMapped => write!(f, "address already mapped"),
            MapError::AddressOutOfRange => write!(f, "address outside translation range"),
        }
    }
}

/// Why a page fault could not be serviced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    OutsideRegion,
    AlignmentFault,
    OutOfFrames,
    MapFailed(MapError),
    /// Same address kept faulting after being serviced
    FaultLoop { count: u32 },
    /// Allocator returned a frame inside the translation-table area
    FrameOutOfRange { frame: u64 },
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::OutsideRegion => write!(f, "fault outside demand-paged memory"),
            FaultError::AlignmentFault => write!(f, "alignment fault"),
            FaultError::OutOfFrames => write!(f, "out of physical frames"),
            FaultError::MapFailed(e) => write!(f, "mapping failed: {}", e),
            FaultError::FaultLoop { count } => write!(f, "exception loop ({} faults)", count),
            FaultError::FrameOutOfRange { frame } => {
                write!(f, "frame {:#x} inside translation-table area", frame)
            }
        }
    }
}

/// Scheduler request failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Kernel heap could not hold the descriptor or stack
    OutOfMemory,
    UnknownTask,
    /// The system task is never freed
    SystemTask,
    /// Task is currently executing
    TaskRunning,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::OutOfMemory => write!(f, "kernel heap exhausted"),
            SchedError::UnknownTask => write!(f, "no such task"),
            SchedError::SystemTask => write!(f, "operation not allowed on the system task"),
            SchedError::TaskRunning => write!(f, "task is running"),
        }
    }
}

/// Interrupt table registration failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    InvalidIrq(u32),
    AlreadyRegistered(u32),
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrqError::InvalidIrq(irq) => write!(f, "interrupt id {} out of range", irq),
            IrqError::AlreadyRegistered(irq) => write!(f, "interrupt {} already has a handler", irq),
        }
    }
}

/// Fatal initialization errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// Exception vector base not 2 KB aligned
    MisalignedVectors { base: u64 },
    /// Kernel image plus heap do not fit in managed RAM
    RamTooSmall { needed: u64, available: u64 },
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::MisalignedVectors { base } => {
                write!(f, "exception vectors at {:#x} are not 2KB aligned", base)
            }
            InitError::RamTooSmall { needed, available } => write!(
                f,
                "kernel needs {:#x} bytes of RAM, only {:#x} managed",
                needed, available
            ),
        }
    }
}

/// Why the trap dispatcher stopped the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Synchronous class with no recovery path
    UnhandledException(ExceptionClass),
    UnservicedFault(FaultError),
    SystemError { esr: u64 },
    /// Trap arrived on a stack no task owns
    TrapStackOverflow { sp: u64 },
    /// Kernel state was already held when the trap arrived
    ReentrantTrap,
    /// Trap taken before the kernel context was installed
    EarlyTrap,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::UnhandledException(class) => {
                write!(f, "unhandled exception class {:#04x} ({})", class.code(), class.name())
            }
            HaltReason::UnservicedFault(e) => write!(f, "page fault not serviced: {}", e),
            HaltReason::SystemError { esr } => write!(f, "system error, ESR={:#018x}", esr),
            HaltReason::TrapStackOverflow { sp } => write!(f, "trap stack overflow, SP={:#018x}", sp),
            HaltReason::ReentrantTrap => write!(f, "trap re-entered kernel state"),
            HaltReason::EarlyTrap => write!(f, "trap before kernel initialization"),
        }
    }
}
