//! AArch64 (ARM64) Architecture Support
//!
//! QEMU virt bring-up, the exception vectors, and the locked kernel context
//! the trap entry resolves against.

pub mod context;
pub mod exceptions;
pub mod gic;
pub mod mmu;
pub mod platform;
pub mod semihosting;
pub mod timer;
pub mod uart;

use core::arch::{asm, global_asm};

use crate::config::KernelConfig;
use crate::error::{InitError, SchedError};
use crate::kernel::Kernel;
use crate::scheduler::StackCheck;
use crate::task::TaskId;
use crate::trap::validate_vector_base;

use platform::QemuVirt;

// Include boot assembly
global_asm!(include_str!("boot.S"));

// Include exception vector table
global_asm!(include_str!("exceptions.S"));

/// The kernel context. Traps take it with `try_lock`; everything else goes
/// through `with_kernel`, which keeps IRQs masked while it is held.
pub static KERNEL: spin::Mutex<Option<Kernel<QemuVirt>>> = spin::Mutex::new(None);

/// Install the vectors, then bring up the GIC and the tick timer.
/// Interrupts stay masked until `enable_interrupts`.
pub fn init(config: &KernelConfig) -> Result<(), InitError> {
    let base = exceptions::vector_base();
    validate_vector_base(base)?;
    exceptions::install(base);

    gic::init();
    timer::init(config.tick_period_ms);
    gic::enable(config.timer_irq);
    Ok(())
}

pub fn enable_interrupts() {
    unsafe { asm!("msr daifclr, #2", options(nomem, nostack)) };
}

/// Run `f` on the installed kernel with IRQs masked
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel<QemuVirt>) -> R) -> Option<R> {
    let daif: u64;
    unsafe {
        asm!("mrs {}, daif", "msr daifset, #2", out(reg) daif, options(nomem, nostack));
    }
    let result = KERNEL.lock().as_mut().map(f);
    unsafe { asm!("msr daif, {}", in(reg) daif, options(nomem, nostack)) };
    result
}

/// Create a task for `function`, run it to completion and release it.
///
/// The kernel lock is dropped while the task runs so its syscalls and
/// faults can be serviced.
pub fn spawn(function: fn()) -> Result<(), SchedError> {
    let id = with_kernel(|kernel| {
        let stack = kernel.config().default_task_stack;
        kernel.create_task(function, stack).ok_or(SchedError::OutOfMemory)
    })
    .ok_or(SchedError::UnknownTask)??;

    let run = run_task(TaskId::SYSTEM, id);
    if run.is_err() {
        // release it if the switch left it behind
        let _ = with_kernel(|kernel| kernel.free_task(id));
    }
    run
}

/// Prologue check for the calling task. If a tick marked it and another
/// task is waiting, that task runs to completion first.
pub fn preempt_point() -> Result<StackCheck, SchedError> {
    let sp: u64;
    unsafe { asm!("mov {}, sp", out(reg) sp, options(nomem, nostack)) };

    let check = with_kernel(|kernel| kernel.scheduler_mut().stack_check(sp)).ok_or(SchedError::UnknownTask)?;
    if let StackCheck::Preempted { task, next: Some(next) } = check {
        if let Err(e) = run_task(task, next) {
            let _ = with_kernel(|kernel| kernel.scheduler_mut().resume(task));
            return Err(e);
        }
    }
    Ok(check)
}

/// Take a pending reschedule request and run the fresh tasks it was for.
/// Called from the system task's idle loop.
pub fn run_pending() -> Result<usize, SchedError> {
    if !with_kernel(|kernel| kernel.scheduler_mut().take_resched()).unwrap_or(false) {
        return Ok(0);
    }
    let mut ran = 0;
    while let Some(id) = with_kernel(|kernel| kernel.scheduler_mut().schedule()).flatten() {
        run_task(TaskId::SYSTEM, id)?;
        ran += 1;
    }
    Ok(ran)
}

/// Switch from `caller` to fresh task `id` and back, then release `id`
fn run_task(caller: TaskId, id: TaskId) -> Result<(), SchedError> {
    let (target, saved) =
        with_kernel(|kernel| kernel.scheduler_mut().begin_switch(caller, id)).ok_or(SchedError::UnknownTask)??;

    // the slot sits in the KERNEL static or a heap descriptor; neither moves
    // while `caller` is parked
    let mut entry = || (target.entry)();
    unsafe { context::run_on_stack(&mut *saved.as_ptr(), target.stack_top, &mut entry) };

    with_kernel(|kernel| kernel.complete_switch(caller, id)).ok_or(SchedError::UnknownTask)?
}

/// Park the core for good
pub fn halt() -> ! {
    loop {
        unsafe { asm!("wfe", options(nomem, nostack)) };
    }
}
