//! Task descriptors
//!
//! The bookkeeping a cooperative runtime needs for one lightweight execution
//! context: stack bounds, the two guard thresholds its function prologues
//! compare against, a saved context and a run state.

use crate::platform::SavedContext;
use crate::scheduler::MachineId;

/// Distance from the low end of a stack to the ordinary growth guard
pub const STACK_GUARD: u64 = 928;

/// Guard value that makes every prologue check fail, forcing the task into
/// the scheduler at its next call boundary
pub const STACK_PREEMPT: u64 = 0xffff_ffff_ffff_fade;

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// The privileged task traps and scheduling run on
    pub const SYSTEM: TaskId = TaskId(0);

    /// First id handed to a created task
    pub const FIRST_USER: u64 = 2;

    pub const fn new(id: u64) -> Self {
        TaskId(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Task run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskState {
    /// Just allocated, not yet initialized
    Idle = 0,
    /// Ready to run, waiting for the CPU
    Runnable = 1,
    Running = 2,
    /// Blocked in a syscall
    Syscall = 3,
    /// Waiting on an event (channel receive, timer)
    Waiting = 4,
    /// Finished; resources released by an explicit free
    Dead = 5,
    /// Stack being moved
    CopyStack = 6,
    /// Stopped at a preemption point
    Preempted = 7,
    ScanRunnable = 0x1001,
    ScanRunning = 0x1002,
    ScanSyscall = 0x1003,
    ScanWaiting = 0x1004,
}

impl TaskState {
    /// True for the "being scanned" variants
    pub fn is_scan(&self) -> bool {
        (*self as u32) & 0x1000 != 0
    }

    /// The state with the scan bit removed
    pub fn without_scan(&self) -> TaskState {
        match self {
            TaskState::ScanRunnable => TaskState::Runnable,
            TaskState::ScanRunning => TaskState::Running,
            TaskState::ScanSyscall => TaskState::Syscall,
            TaskState::ScanWaiting => TaskState::Waiting,
            other => *other,
        }
    }

    /// Scanned variant, for the states that have one
    pub fn with_scan(&self) -> Option<TaskState> {
        match self.without_scan() {
            TaskState::Runnable => Some(TaskState::ScanRunnable),
            TaskState::Running => Some(TaskState::ScanRunning),
            TaskState::Syscall => Some(TaskState::ScanSyscall),
            TaskState::Waiting => Some(TaskState::ScanWaiting),
            _ => None,
        }
    }
}

/// Stack bounds `[lo, hi)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub lo: u64,
    pub hi: u64,
}

impl StackBounds {
    pub fn contains(&self, sp: u64) -> bool {
        sp >= self.lo && sp < self.hi
    }

    pub fn size(&self) -> u64 {
        self.hi - self.lo
    }
}

/// Saved context of a task that is not running
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    pub sp: u64,
    pub pc: u64,
    /// Owning task
    pub task: TaskId,
}

/// One schedulable execution context
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub stack: StackBounds,
    /// Compared against SP by ordinary function prologues
    pub stackguard0: u64,
    /// Compared against SP by system-stack code
    pub stackguard1: u64,
    pub context: TaskContext,
    /// Machine the task is bound to
    pub machine: MachineId,
    pub state: TaskState,
    pub id: TaskId,
    /// Set by the preemption controller, cleared by the stack check
    pub preempt: bool,
    /// Callee-saved registers parked while a task this one switched to runs
    pub saved: SavedContext,
}

impl TaskDescriptor {
    /// Fresh runnable task over `stack` starting at `entry`
    pub fn new(id: TaskId, stack: StackBounds, entry: u64, machine: MachineId) -> Self {
        TaskDescriptor {
            stack,
            stackguard0: stack.lo + STACK_GUARD,
            stackguard1: u64::MAX,
            context: TaskContext {
                // leave room for the first frame record, keep 16-byte alignment
                sp: (stack.hi - 64) & !15,
                pc: entry,
                task: id,
            },
            machine,
            state: TaskState::Runnable,
            id,
            preempt: false,
            saved: SavedContext::new(),
        }
    }

    /// Ordinary growth guard for this stack
    pub fn default_guard(&self) -> u64 {
        self.stack.lo + STACK_GUARD
    }

    /// True while the preempt sentinel is installed
    pub fn preempt_requested(&self) -> bool {
        self.stackguard0 == STACK_PREEMPT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_layout() {
        let stack = StackBounds { lo: 0x1000_0000, hi: 0x1000_8000 };
        let t = TaskDescriptor::new(TaskId::new(2), stack, 0xDEAD_0000, MachineId(0));

        assert_eq!(t.state, TaskState::Runnable);
        assert_eq!(t.stackguard0, stack.lo + STACK_GUARD);
        assert_eq!(t.context.sp % 16, 0);
        assert!(stack.contains(t.context.sp));
        assert_eq!(t.context.pc, 0xDEAD_0000);
        assert!(!t.preempt_requested());
    }

    #[test]
    fn test_scan_variants() {
        assert!(TaskState::ScanWaiting.is_scan());
        assert!(!TaskState::Preempted.is_scan());
        assert_eq!(TaskState::ScanSyscall.without_scan(), TaskState::Syscall);
        assert_eq!(TaskState::Running.with_scan(), Some(TaskState::ScanRunning));
        assert_eq!(TaskState::Dead.with_scan(), None);
        assert_eq!(TaskState::CopyStack as u32, 6);
    }
}
