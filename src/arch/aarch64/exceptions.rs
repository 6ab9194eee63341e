/*
 * ARM64 exception entry
 *
 * The assembly vectors in exceptions.S save an ExceptionFrame and call
 * bedrock_trap_entry. This turns the frame and syndrome registers into an
 * ExceptionRecord, hands it to the kernel context, and applies the outcome
 * to the frame before the vector returns.
 */

use core::arch::asm;

use crate::error::HaltReason;
use crate::trap::{report, ExceptionKind, ExceptionRecord, SyscallRegs, TrapOutcome};

use super::uart::DirectConsole;
use super::{gic, semihosting, KERNEL};

/// Exception frame saved by the assembly vectors
#[repr(C)]
pub struct ExceptionFrame {
    /// x0-x30
    pub x: [u64; 31],
    pub elr_el1: u64,
    pub spsr_el1: u64,
    _pad: u64,
}

/// Address of the vector table in exceptions.S
pub fn vector_base() -> u64 {
    let base: u64;
    unsafe {
        asm!(
            "adrp {0}, exception_vector_table",
            "add {0}, {0}, :lo12:exception_vector_table",
            out(reg) base,
        );
    }
    base
}

/// Point VBAR_EL1 at `base`
pub fn install(base: u64) {
    unsafe {
        asm!("msr vbar_el1, {0}", "isb", in(reg) base);
    }
    log::info!("[EXCEPTIONS] Vector table at {:#x}", base);
}

fn syndrome() -> (u64, u64) {
    let esr: u64;
    let far: u64;
    unsafe {
        asm!("mrs {0}, esr_el1", out(reg) esr);
        asm!("mrs {0}, far_el1", out(reg) far);
    }
    (esr, far)
}

fn record_for(frame: &ExceptionFrame, kind: ExceptionKind) -> ExceptionRecord {
    let (esr, far) = match kind {
        ExceptionKind::Synchronous | ExceptionKind::SystemError => syndrome(),
        _ => (0, 0),
    };
    let irq = match kind {
        // acknowledged first so the id is known before anything else runs
        ExceptionKind::Irq => gic::acknowledge(),
        _ => 0,
    };
    let mut args = [0u64; 6];
    args.copy_from_slice(&frame.x[..6]);

    ExceptionRecord {
        kind,
        esr,
        elr: frame.elr_el1,
        spsr: frame.spsr_el1,
        far,
        sp: frame as *const ExceptionFrame as u64,
        irq,
        syscall: SyscallRegs { number: frame.x[8], args },
    }
}

#[no_mangle]
extern "C" fn bedrock_trap_entry(frame: &mut ExceptionFrame, kind: u64) {
    let kind = match kind {
        0 => ExceptionKind::Synchronous,
        1 => ExceptionKind::Irq,
        2 => ExceptionKind::Fiq,
        _ => ExceptionKind::SystemError,
    };
    let record = record_for(frame, kind);

    // a trap while kernel state is held cannot be serviced
    let outcome = match KERNEL.try_lock() {
        Some(mut guard) => match guard.as_mut() {
            Some(kernel) => kernel.handle_trap(&record),
            None => early_halt(HaltReason::EarlyTrap, &record),
        },
        None => early_halt(HaltReason::ReentrantTrap, &record),
    };

    match outcome {
        TrapOutcome::Resume => {}
        TrapOutcome::SyscallReturn(value) => frame.x[0] = value,
        TrapOutcome::Exit(code) => semihosting::exit(code),
        TrapOutcome::Halt(_) => super::halt(),
    }
}

fn early_halt(reason: HaltReason, record: &ExceptionRecord) -> TrapOutcome {
    report(&mut DirectConsole, &reason, record);
    TrapOutcome::Halt(reason)
}
