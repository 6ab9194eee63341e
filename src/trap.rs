//! Trap dispatcher
//!
//! Every CPU exception lands here as an `ExceptionRecord` built by the
//! assembly vectors. Each one resolves to exactly one path: demand paging,
//! syscall emulation, interrupt handling, or a diagnostic halt.
//!
//! Nothing on this path allocates, takes a lock, or logs through `log`.
//! Output goes through the platform's polling diagnostic channel.

use crate::diag::Hex;
use crate::error::{HaltReason, InitError};
use crate::interrupts::IrqDispatch;
use crate::kernel::Kernel;
use crate::platform::Platform;
use crate::syscall::{SyscallOutcome, SyscallRequest};
use crate::diagln;

/// Required alignment of the exception vector table
pub const VECTOR_ALIGN: u64 = 0x800;

/// Which vector the exception came through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionKind {
    #[default]
    Synchronous,
    Irq,
    Fiq,
    SystemError,
}

/// Syscall number and arguments as they were in x8 and x0..x5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyscallRegs {
    pub number: u64,
    pub args: [u64; 6],
}

/// One trap, as captured by the vector entry code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExceptionRecord {
    pub kind: ExceptionKind,
    /// ESR_EL1
    pub esr: u64,
    /// ELR_EL1
    pub elr: u64,
    /// SPSR_EL1
    pub spsr: u64,
    /// FAR_EL1
    pub far: u64,
    /// Stack pointer the handler runs on
    pub sp: u64,
    /// Acknowledged interrupt id (IRQ entries only)
    pub irq: u32,
    pub syscall: SyscallRegs,
}

/// Exception class, ESR_EL1[31:26]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Unknown,
    WfxTrap,
    FpAccess,
    IllegalState,
    Svc32,
    Svc64,
    SysRegTrap,
    InstrAbortLower,
    InstrAbortSame,
    PcAlignment,
    DataAbortLower,
    DataAbortSame,
    SpAlignment,
    FpException,
    SError,
    BreakpointLower,
    BreakpointSame,
    StepLower,
    StepSame,
    WatchpointLower,
    WatchpointSame,
    Brk64,
    /// Reserved or not handled here; carries the raw 6-bit code
    Other(u8),
}

/// Handling path for a synchronous exception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    PageFault,
    Syscall,
    Halt,
}

impl ExceptionClass {
    pub fn from_code(code: u8) -> Self {
        use ExceptionClass::*;
        match code & 0x3F {
            0x00 => Unknown,
            0x01 => WfxTrap,
            0x07 => FpAccess,
            0x0E => IllegalState,
            0x11 => Svc32,
            0x15 => Svc64,
            0x18 => SysRegTrap,
            0x20 => InstrAbortLower,
            0x21 => InstrAbortSame,
            0x22 => PcAlignment,
            0x24 => DataAbortLower,
            0x25 => DataAbortSame,
            0x26 => SpAlignment,
            0x2C => FpException,
            0x2F => SError,
            0x30 => BreakpointLower,
            0x31 => BreakpointSame,
            0x32 => StepLower,
            0x33 => StepSame,
            0x34 => WatchpointLower,
            0x35 => WatchpointSame,
            0x3C => Brk64,
            other => Other(other),
        }
    }

    pub fn from_esr(esr: u64) -> Self {
        Self::from_code(((esr >> 26) & 0x3F) as u8)
    }

    pub fn code(&self) -> u8 {
        use ExceptionClass::*;
        match self {
            Unknown => 0x00,
            WfxTrap => 0x01,
            FpAccess => 0x07,
            IllegalState => 0x0E,
            Svc32 => 0x11,
            Svc64 => 0x15,
            SysRegTrap => 0x18,
            InstrAbortLower => 0x20,
            InstrAbortSame => 0x21,
            PcAlignment => 0x22,
            DataAbortLower => 0x24,
            DataAbortSame => 0x25,
            SpAlignment => 0x26,
            FpException => 0x2C,
            SError => 0x2F,
            BreakpointLower => 0x30,
            BreakpointSame => 0x31,
            StepLower => 0x32,
            StepSame => 0x33,
            WatchpointLower => 0x34,
            WatchpointSame => 0x35,
            Brk64 => 0x3C,
            Other(code) => *code,
        }
    }

    pub fn name(&self) -> &'static str {
        use ExceptionClass::*;
        match self {
            Unknown => "unknown reason",
            WfxTrap => "WFI/WFE trapped",
            FpAccess => "SIMD/FP access trapped",
            IllegalState => "illegal execution state",
            Svc32 => "SVC (AArch32)",
            Svc64 => "SVC (AArch64)",
            SysRegTrap => "MSR/MRS/system instruction trapped",
            InstrAbortLower => "instruction abort, lower EL",
            InstrAbortSame => "instruction abort, current EL",
            PcAlignment => "PC alignment fault",
            DataAbortLower => "data abort, lower EL",
            DataAbortSame => "data abort, current EL",
            SpAlignment => "SP alignment fault",
            FpException => "floating-point exception",
            SError => "SError",
            BreakpointLower | BreakpointSame => "breakpoint",
            StepLower | StepSame => "software step",
            WatchpointLower | WatchpointSame => "watchpoint",
            Brk64 => "BRK instruction",
            Other(_) => "reserved/unhandled",
        }
    }

    pub fn route(&self) -> Route {
        match self {
            ExceptionClass::InstrAbortSame | ExceptionClass::DataAbortSame => Route::PageFault,
            ExceptionClass::Svc64 | ExceptionClass::Svc32 => Route::Syscall,
            _ => Route::Halt,
        }
    }
}

/// What the vector code does on return from the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Return to the interrupted code
    Resume,
    /// Write the value into x0, then resume after the `svc`
    SyscallReturn(u64),
    /// Hosted program exited; stop the machine with this code
    Exit(u64),
    /// Terminal: report was printed, loop forever
    Halt(HaltReason),
}

/// Per-trap counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrapStats {
    pub traps: u64,
    pub irqs: u64,
    pub syscalls: u64,
    pub page_faults: u64,
}

/// Accept the vector table base only if it is 2 KB aligned
pub fn validate_vector_base(base: u64) -> Result<(), InitError> {
    if base & (VECTOR_ALIGN - 1) != 0 {
        return Err(InitError::MisalignedVectors { base });
    }
    Ok(())
}

/// Print the halt report for `record` on the diagnostic channel
pub fn report<S: crate::diag::DiagnosticSink + ?Sized>(sink: &mut S, reason: &HaltReason, record: &ExceptionRecord) {
    let class = ExceptionClass::from_esr(record.esr);
    diagln!(sink, "\n!TRAP: {}", reason);
    diagln!(sink, "  EC:   {} ({})", Hex(class.code() as u64), class.name());
    diagln!(sink, "  ELR:  {}", Hex(record.elr));
    diagln!(sink, "  ESR:  {}", Hex(record.esr));
    diagln!(sink, "  FAR:  {}", Hex(record.far));
    diagln!(sink, "  SPSR: {}", Hex(record.spsr));
    diagln!(sink, "  SP:   {}", Hex(record.sp));
    diagln!(sink, "System halted.");
}

impl<P: Platform> Kernel<P> {
    /// Resolve one trap to its handling path
    pub fn handle_trap(&mut self, record: &ExceptionRecord) -> TrapOutcome {
        self.stats.traps += 1;

        if !self.scheduler.owns_stack(record.sp) {
            return self.halt(HaltReason::TrapStackOverflow { sp: record.sp }, record);
        }

        match record.kind {
            ExceptionKind::Synchronous => self.handle_sync(record),
            ExceptionKind::Irq => {
                self.handle_irq(record.irq);
                TrapOutcome::Resume
            }
            ExceptionKind::Fiq => {
                diagln!(&mut self.platform, "[FIQ] at ELR={}", Hex(record.elr));
                TrapOutcome::Resume
            }
            ExceptionKind::SystemError => self.halt(HaltReason::SystemError { esr: record.esr }, record),
        }
    }

    fn handle_sync(&mut self, record: &ExceptionRecord) -> TrapOutcome {
        let class = ExceptionClass::from_esr(record.esr);
        match class.route() {
            Route::PageFault => {
                self.stats.page_faults += 1;
                let dfsc = record.esr & 0x3F;
                match self
                    .region
                    .handle_fault(record.far, dfsc, &mut self.pages, &mut self.platform)
                {
                    Ok(()) => TrapOutcome::Resume,
                    Err(e) => self.halt(HaltReason::UnservicedFault(e), record),
                }
            }
            Route::Syscall => {
                self.stats.syscalls += 1;
                let request = SyscallRequest {
                    number: record.syscall.number,
                    args: record.syscall.args,
                    imm: (record.esr & 0xFFFF) as u16,
                };
                match self.syscalls.dispatch(&request, &mut self.region, &mut self.platform) {
                    SyscallOutcome::Return(value) => TrapOutcome::SyscallReturn(value),
                    SyscallOutcome::Exit(code) => TrapOutcome::Exit(code),
                }
            }
            Route::Halt => self.halt(HaltReason::UnhandledException(class), record),
        }
    }

    /// Route an acknowledged interrupt. The scheduler tick re-arms the timer
    /// and runs the preemption controller; other ids go through the table.
    pub fn handle_irq(&mut self, irq: u32) -> IrqDispatch {
        self.stats.irqs += 1;

        let outcome = if irq == self.config.timer_irq {
            self.platform.timer_rearm();
            let now = self.platform.now_ns();
            self.scheduler.preempt_tick(now);
            IrqDispatch::Handled
        } else {
            self.interrupts.dispatch(irq)
        };

        if outcome.needs_eoi() {
            self.platform.end_of_interrupt(irq);
        }
        outcome
    }

    fn halt(&mut self, reason: HaltReason, record: &ExceptionRecord) -> TrapOutcome {
        report(&mut self.platform, &reason, record);
        TrapOutcome::Halt(reason)
    }

    pub fn trap_stats(&self) -> TrapStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, PAGE_SIZE};
    use crate::error::FaultError;
    use crate::kernel::tests::{test_kernel, SYSTEM_SP};
    use crate::task::STACK_PREEMPT;

    fn sync(ec: u8, far: u64) -> ExceptionRecord {
        ExceptionRecord {
            kind: ExceptionKind::Synchronous,
            esr: ((ec as u64) << 26) | (1 << 25) | 0x07,
            elr: 0x4008_1234,
            far,
            sp: SYSTEM_SP,
            ..Default::default()
        }
    }

    fn svc(number: u64, args: [u64; 6]) -> ExceptionRecord {
        ExceptionRecord {
            esr: (0x15 << 26) | (1 << 25),
            sp: SYSTEM_SP,
            syscall: SyscallRegs { number, args },
            ..Default::default()
        }
    }

    #[test]
    fn test_classification_is_total() {
        for code in 0u8..64 {
            let class = ExceptionClass::from_code(code);
            assert_eq!(class.code(), code);
            let route = class.route();
            let expected = match code {
                0x21 | 0x25 => Route::PageFault,
                0x11 | 0x15 => Route::Syscall,
                _ => Route::Halt,
            };
            assert_eq!(route, expected, "class {:#x}", code);
        }
    }

    #[test]
    fn test_vector_alignment() {
        assert!(validate_vector_base(0x4008_0800).is_ok());
        assert_eq!(
            validate_vector_base(0x4008_0400),
            Err(InitError::MisalignedVectors { base: 0x4008_0400 })
        );
    }

    #[test]
    fn test_syscall_path() {
        let mut kernel = test_kernel();
        let out = kernel.handle_trap(&svc(64, [1, 0x1000, 37, 0, 0, 0]));
        assert_eq!(out, TrapOutcome::SyscallReturn(37));
        assert_eq!(kernel.handle_trap(&svc(93, [7, 0, 0, 0, 0, 0])), TrapOutcome::Exit(7));
        assert_eq!(kernel.trap_stats().syscalls, 2);
    }

    #[test]
    fn test_page_fault_path() {
        let mut kernel = test_kernel();
        let base = kernel.region.reserve(4 * PAGE_SIZE).unwrap();

        assert_eq!(kernel.handle_trap(&sync(0x25, base + 8)), TrapOutcome::Resume);
        assert!(kernel.platform.translate(base).is_some());
        assert_eq!(kernel.handle_trap(&sync(0x21, base + PAGE_SIZE)), TrapOutcome::Resume);
        assert_eq!(kernel.trap_stats().page_faults, 2);
    }

    #[test]
    fn test_unserviced_fault_halts_with_report() {
        let mut kernel = test_kernel();
        let out = kernel.handle_trap(&sync(0x25, 0x10));
        assert_eq!(out, TrapOutcome::Halt(HaltReason::UnservicedFault(FaultError::OutsideRegion)));

        let text = kernel.platform.diag_output();
        assert!(text.contains("ELR:  0x0000000040081234"));
        assert!(text.contains("FAR:  0x0000000000000010"));
        assert!(text.contains("System halted."));
    }

    #[test]
    fn test_halt_classes() {
        for ec in [0x00u8, 0x01, 0x0E, 0x18, 0x20, 0x24, 0x3C, 0x3F] {
            let mut kernel = test_kernel();
            let out = kernel.handle_trap(&sync(ec, 0));
            assert_eq!(
                out,
                TrapOutcome::Halt(HaltReason::UnhandledException(ExceptionClass::from_code(ec)))
            );
        }
    }

    #[test]
    fn test_trap_on_foreign_stack_halts() {
        let mut kernel = test_kernel();
        let mut record = svc(64, [0; 6]);
        record.sp = 0x1234_0000;
        assert_eq!(
            kernel.handle_trap(&record),
            TrapOutcome::Halt(HaltReason::TrapStackOverflow { sp: 0x1234_0000 })
        );
    }

    #[test]
    fn test_system_error_is_fatal_fiq_is_not() {
        let mut kernel = test_kernel();
        let fiq = ExceptionRecord { kind: ExceptionKind::Fiq, sp: SYSTEM_SP, ..Default::default() };
        assert_eq!(kernel.handle_trap(&fiq), TrapOutcome::Resume);

        let serror = ExceptionRecord {
            kind: ExceptionKind::SystemError,
            esr: 0xBE00_0000,
            sp: SYSTEM_SP,
            ..Default::default()
        };
        assert_eq!(
            kernel.handle_trap(&serror),
            TrapOutcome::Halt(HaltReason::SystemError { esr: 0xBE00_0000 })
        );
    }

    #[test]
    fn test_timer_irq_rearms_and_ticks() {
        let mut kernel = test_kernel();
        let timer = KernelConfig::qemu_virt().timer_irq;
        let irq = ExceptionRecord { kind: ExceptionKind::Irq, irq: timer, sp: SYSTEM_SP, ..Default::default() };

        assert_eq!(kernel.handle_trap(&irq), TrapOutcome::Resume);
        assert_eq!(kernel.platform.rearms(), 1);
        assert_eq!(kernel.platform.eois(), &[timer]);
        assert_eq!(kernel.scheduler.ticks(), 1);
    }

    #[test]
    fn test_timer_irq_marks_running_task() {
        fn idle() {}
        let mut kernel = test_kernel();
        let t = kernel.scheduler.create_task(&mut kernel.heap, idle, 8192).unwrap();
        kernel.scheduler.prepare_run(t).unwrap();

        kernel.handle_irq(27);
        assert_eq!(kernel.scheduler.task(t).unwrap().stackguard0, STACK_PREEMPT);
    }

    #[test]
    fn test_other_irqs() {
        let mut kernel = test_kernel();
        assert_eq!(kernel.handle_irq(40), IrqDispatch::Unhandled);
        assert_eq!(kernel.handle_irq(1023), IrqDispatch::Spurious);
        assert_eq!(kernel.platform.eois(), &[40]);
    }
}
