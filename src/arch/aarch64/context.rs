//! Stack switch used to run a task to completion
//!
//! `bedrock_run_on_stack` stores x19-x30 and sp in the `SavedContext`,
//! moves to the task stack, calls the trampoline, then restores everything
//! from the same slot and returns to the caller.

use core::arch::global_asm;
use core::ffi::c_void;

use crate::platform::SavedContext;

global_asm!(
    r#"
.section .text
.global bedrock_run_on_stack
.balign 4
// x0 = saved context, x1 = stack top, x2 = closure, x3 = trampoline
bedrock_run_on_stack:
    stp x19, x20, [x0, #0]
    stp x21, x22, [x0, #16]
    stp x23, x24, [x0, #32]
    stp x25, x26, [x0, #48]
    stp x27, x28, [x0, #64]
    stp x29, x30, [x0, #80]
    mov x9, sp
    str x9, [x0, #96]

    mov x19, x0
    mov sp, x1
    mov x29, xzr
    mov x0, x2
    blr x3

    mov x0, x19
    ldr x9, [x0, #96]
    mov sp, x9
    ldp x19, x20, [x0, #0]
    ldp x21, x22, [x0, #16]
    ldp x23, x24, [x0, #32]
    ldp x25, x26, [x0, #48]
    ldp x27, x28, [x0, #64]
    ldp x29, x30, [x0, #80]
    ret
"#
);

extern "C" {
    fn bedrock_run_on_stack(
        saved: *mut u64,
        stack_top: u64,
        closure: *mut c_void,
        trampoline: extern "C" fn(*mut c_void),
    );
}

extern "C" fn trampoline(closure: *mut c_void) {
    let entry = unsafe { &mut *(closure as *mut &mut dyn FnMut()) };
    entry();
}

/// Run `entry` on the stack topped at `stack_top`.
///
/// # Safety
/// `stack_top` must be a 16-byte aligned top of an unused stack that stays
/// allocated until this returns.
pub unsafe fn run_on_stack(saved: &mut SavedContext, stack_top: u64, entry: &mut dyn FnMut()) {
    let mut entry = entry;
    bedrock_run_on_stack(
        saved.as_mut_ptr(),
        stack_top,
        &mut entry as *mut &mut dyn FnMut() as *mut c_void,
        trampoline,
    );
}
