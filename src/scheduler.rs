// scheduler bootstrap + preemption controller
// one machine, one processor, FIFO run queue. the hosted runtime does the
// real scheduling, we just keep enough state for it to believe it has a core

use alloc::collections::{BTreeMap, VecDeque};
use core::alloc::Layout;
use core::ptr::NonNull;

use heapless::Vec as FixedVec;

use crate::config::AddressRange;
use crate::error::SchedError;
use crate::heap::KernelHeap;
use crate::platform::{Platform, SavedContext};
use crate::task::{StackBounds, TaskDescriptor, TaskId, TaskState, STACK_GUARD, STACK_PREEMPT};
use crate::tick::{TickChannel, TimerTick};

/// Entries in the write-barrier staging buffer
pub const WB_BUF_ENTRIES: usize = 512;

/// Tick monitors that can be registered
pub const MAX_MONITORS: usize = 8;

/// Smallest stack `create_task` hands out
pub const MIN_TASK_STACK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorId(pub u32);

/// Processor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessorStatus {
    Idle = 0,
    Running = 1,
    Syscall = 2,
    /// Stopped for collection; where a processor starts before the runtime
    /// takes it over
    GcStop = 3,
    Dead = 4,
}

/// Write-barrier staging buffer: `buf[next..end]` is free space
pub struct WriteBarrierBuffer {
    next: usize,
    end: usize,
    buf: [u64; WB_BUF_ENTRIES],
}

impl WriteBarrierBuffer {
    pub const fn new() -> Self {
        WriteBarrierBuffer {
            next: 0,
            end: WB_BUF_ENTRIES,
            buf: [0; WB_BUF_ENTRIES],
        }
    }

    /// Back to empty
    pub fn reset(&mut self) {
        self.next = 0;
        self.end = WB_BUF_ENTRIES;
    }

    /// Stage one pointer. False when the buffer is full.
    pub fn push(&mut self, value: u64) -> bool {
        if self.next == self.end {
            return false;
        }
        self.buf[self.next] = value;
        self.next += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.next
    }

    pub fn is_empty(&self) -> bool {
        self.next == 0
    }

    pub fn is_full(&self) -> bool {
        self.next == self.end
    }

    /// Hand the staged entries to `sink`, then reset
    pub fn flush<F: FnMut(&[u64])>(&mut self, mut sink: F) {
        if !self.is_empty() {
            sink(&self.buf[..self.next]);
        }
        self.reset();
    }
}

impl Default for WriteBarrierBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Execution state of the (single) physical core
pub struct Machine {
    pub id: MachineId,
    /// Task currently executing
    pub bound: TaskId,
    /// Task traps and scheduling run on
    pub system_task: TaskId,
    /// Running non-system task; `None` whenever the system task executes
    pub user_task: Option<TaskId>,
    pub processor: Option<ProcessorId>,
    saved: SavedContext,
}

/// Scheduling slot the machine must hold to run tasks
pub struct Processor {
    pub id: ProcessorId,
    pub status: ProcessorStatus,
    pub machine: Option<MachineId>,
    /// Per-core allocation cache
    pub alloc_cache: Option<u64>,
    pub wb_buf: WriteBarrierBuffer,
}

/// Where a created task starts
#[derive(Debug, Clone, Copy)]
pub struct RunTarget {
    pub stack_top: u64,
    pub entry: fn(),
}

/// Result of the prologue stack check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCheck {
    /// Stack is fine, carry on
    Ok,
    /// The preempt sentinel fired and `task` gave up the CPU. With `next`
    /// set, `task` is queued and `next` must be switched to before `task`
    /// resumes. Without one, `task` is already running again.
    Preempted { task: TaskId, next: Option<TaskId> },
    /// Genuine stack overflow
    Overflow { task: TaskId, sp: u64, guard: u64 },
}

/// What one timer tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptTick {
    pub count: u64,
    /// Task the sentinel was installed on
    pub marked: Option<TaskId>,
}

/// Heap memory backing one created task
struct TaskSlot {
    descriptor: NonNull<TaskDescriptor>,
    stack: NonNull<u8>,
    stack_layout: Layout,
    entry: fn(),
    /// Set once the task got the CPU; from then on it can only be resumed
    started: bool,
}

pub struct Scheduler {
    /// System task descriptor; lives as long as the scheduler
    system: TaskDescriptor,
    machine: Machine,
    processor: Processor,
    tasks: BTreeMap<TaskId, TaskSlot>,
    run_queue: VecDeque<TaskId>,
    next_id: u64,
    ticks: u64,
    monitors: FixedVec<&'static TickChannel, MAX_MONITORS>,
    resched: bool,
}

// descriptors and stacks are owned through the slots; nothing else aliases them
unsafe impl Send for Scheduler {}

impl Scheduler {
    /// Stand up the system task, the machine and the processor and link them.
    ///
    /// Allocates nothing: this runs before any heap exists.
    pub fn bootstrap(system_stack: AddressRange, alloc_cache: u64) -> Self {
        let machine_id = MachineId(0);
        let processor_id = ProcessorId(0);

        let stack = StackBounds {
            lo: system_stack.start,
            hi: system_stack.end,
        };
        let mut system = TaskDescriptor::new(TaskId::SYSTEM, stack, 0, machine_id);
        system.stackguard1 = system.stackguard0;
        system.state = TaskState::Running;

        log::info!(
            "[SCHED] bootstrap: system task stack {:#x}..{:#x}, guard {:#x}",
            stack.lo,
            stack.hi,
            stack.lo + STACK_GUARD
        );

        Scheduler {
            system,
            machine: Machine {
                id: machine_id,
                bound: TaskId::SYSTEM,
                system_task: TaskId::SYSTEM,
                user_task: None,
                processor: Some(processor_id),
                saved: SavedContext::new(),
            },
            processor: Processor {
                id: processor_id,
                status: ProcessorStatus::GcStop,
                machine: Some(machine_id),
                alloc_cache: Some(alloc_cache),
                wb_buf: WriteBarrierBuffer::new(),
            },
            tasks: BTreeMap::new(),
            run_queue: VecDeque::new(),
            next_id: TaskId::FIRST_USER,
            ticks: 0,
            monitors: FixedVec::new(),
            resched: false,
        }
    }

    /// Create a runnable task with a `stack_size` stack (rounded up to a power
    /// of two). `None` if the heap cannot hold it; nothing is left allocated.
    pub fn create_task(&mut self, heap: &mut KernelHeap, entry: fn(), stack_size: usize) -> Option<TaskId> {
        let stack_size = stack_size.max(MIN_TASK_STACK).checked_next_power_of_two()?;
        let descriptor_layout = Layout::new::<TaskDescriptor>();
        let stack_layout = Layout::from_size_align(stack_size, 16).ok()?;

        let descriptor = heap.allocate(descriptor_layout)?.cast::<TaskDescriptor>();
        let stack = match heap.allocate(stack_layout) {
            Some(stack) => stack,
            None => {
                unsafe { heap.deallocate(descriptor.cast(), descriptor_layout) };
                log::warn!("[SCHED] no heap for a {} byte stack", stack_size);
                return None;
            }
        };

        let id = TaskId::new(self.next_id);
        self.next_id += 1;

        let lo = stack.as_ptr() as u64;
        let bounds = StackBounds {
            lo,
            hi: lo + stack_size as u64,
        };
        unsafe {
            descriptor
                .as_ptr()
                .write(TaskDescriptor::new(id, bounds, entry as usize as u64, self.machine.id));
        }

        self.tasks.insert(
            id,
            TaskSlot {
                descriptor,
                stack,
                stack_layout,
                entry,
                started: false,
            },
        );
        self.run_queue.push_back(id);

        log::debug!("[SCHED] created task {} stack {:#x}..{:#x}", id.value(), bounds.lo, bounds.hi);
        Some(id)
    }

    /// Release a task's stack and descriptor
    pub fn free_task(&mut self, heap: &mut KernelHeap, id: TaskId) -> Result<(), SchedError> {
        if id == TaskId::SYSTEM {
            return Err(SchedError::SystemTask);
        }
        if self.machine.user_task == Some(id) {
            return Err(SchedError::TaskRunning);
        }
        let slot = self.tasks.remove(&id).ok_or(SchedError::UnknownTask)?;
        self.run_queue.retain(|&queued| queued != id);

        unsafe {
            heap.deallocate(slot.stack, slot.stack_layout);
            heap.deallocate(slot.descriptor.cast(), Layout::new::<TaskDescriptor>());
        }
        log::debug!("[SCHED] freed task {}", id.value());
        Ok(())
    }

    /// Bind task `id` to the machine as the running task and return where it
    /// starts. The caller performs the actual stack switch. A task that
    /// already started is refused with `TaskRunning`; see `resume`.
    pub fn prepare_run(&mut self, id: TaskId) -> Result<RunTarget, SchedError> {
        if id == TaskId::SYSTEM {
            return Err(SchedError::SystemTask);
        }
        if self.machine.user_task.is_some() {
            return Err(SchedError::TaskRunning);
        }
        let slot = self.tasks.get_mut(&id).ok_or(SchedError::UnknownTask)?;
        if slot.started {
            return Err(SchedError::TaskRunning);
        }
        slot.started = true;
        let entry = slot.entry;
        let task = unsafe { slot.descriptor.as_mut() };
        task.state = TaskState::Running;
        let stack_top = task.context.sp;

        self.bind(id);
        Ok(RunTarget { stack_top, entry })
    }

    /// Put a started task that gave up the CPU back on it. Its stack frame is
    /// still live; the caller returns into it rather than switching.
    pub fn resume(&mut self, id: TaskId) -> Result<(), SchedError> {
        if id == TaskId::SYSTEM {
            return Err(SchedError::SystemTask);
        }
        if self.machine.user_task.is_some() {
            return Err(SchedError::TaskRunning);
        }
        let slot = self.tasks.get_mut(&id).ok_or(SchedError::UnknownTask)?;
        let task = unsafe { slot.descriptor.as_mut() };
        if !slot.started || task.state != TaskState::Runnable {
            return Err(SchedError::UnknownTask);
        }
        task.state = TaskState::Running;

        self.bind(id);
        Ok(())
    }

    fn bind(&mut self, id: TaskId) {
        self.run_queue.retain(|&queued| queued != id);
        self.machine.user_task = Some(id);
        self.machine.bound = id;
        self.system.state = TaskState::Waiting;
        self.processor.status = ProcessorStatus::Running;
    }

    /// Task `id` returned to the system task: mark it dead and unbind it
    pub fn finish_run(&mut self, id: TaskId) {
        if let Some(task) = self.task_mut(id) {
            task.state = TaskState::Dead;
            task.preempt = false;
        }
        if self.machine.user_task == Some(id) {
            self.machine.user_task = None;
        }
        self.machine.bound = self.machine.system_task;
        self.system.state = TaskState::Running;
    }

    /// Where `caller` parks its registers while a task it switched to runs.
    /// The system task uses the machine's slot; the pointer stays valid until
    /// `caller` is freed.
    pub fn saved_context(&mut self, caller: TaskId) -> Option<NonNull<SavedContext>> {
        if caller == TaskId::SYSTEM {
            return Some(NonNull::from(&mut self.machine.saved));
        }
        let slot = self.tasks.get_mut(&caller)?;
        Some(NonNull::from(&mut unsafe { slot.descriptor.as_mut() }.saved))
    }

    /// First half of a switch from `caller` to the fresh task `id`: bind `id`
    /// and hand back its start point and `caller`'s save slot
    pub fn begin_switch(&mut self, caller: TaskId, id: TaskId) -> Result<(RunTarget, NonNull<SavedContext>), SchedError> {
        let saved = self.saved_context(caller).ok_or(SchedError::UnknownTask)?;
        let target = self.prepare_run(id)?;
        Ok((target, saved))
    }

    /// Second half: `id` returned, so release it and give the CPU back to
    /// `caller`
    pub fn complete_switch(&mut self, heap: &mut KernelHeap, caller: TaskId, id: TaskId) -> Result<(), SchedError> {
        self.finish_run(id);
        self.free_task(heap, id)?;
        if caller != TaskId::SYSTEM {
            self.resume(caller)?;
        }
        Ok(())
    }

    /// Run fresh task `id` on its own stack until it returns, with `caller`
    /// parked, then free it
    fn switch<P: Platform + ?Sized>(
        &mut self,
        heap: &mut KernelHeap,
        platform: &mut P,
        caller: TaskId,
        id: TaskId,
    ) -> Result<(), SchedError> {
        let (target, mut saved) = self.begin_switch(caller, id)?;

        let mut entry = || (target.entry)();
        unsafe { platform.run_on_stack(saved.as_mut(), target.stack_top, &mut entry) };

        self.complete_switch(heap, caller, id)
    }

    /// Create a task for `function`, run it to completion on its own stack,
    /// then free it. Cooperative: the only switches are the call into the
    /// new stack and the return from it.
    pub fn spawn_and_run<P: Platform + ?Sized>(
        &mut self,
        heap: &mut KernelHeap,
        platform: &mut P,
        function: fn(),
        stack_size: usize,
    ) -> Result<(), SchedError> {
        let id = self
            .create_task(heap, function, stack_size)
            .ok_or(SchedError::OutOfMemory)?;
        if self.machine.user_task.is_some() {
            self.free_task(heap, id)?;
            return Err(SchedError::TaskRunning);
        }
        self.switch(heap, platform, TaskId::SYSTEM, id)
    }

    /// Give up the CPU: the running task goes to the back of the run queue
    /// and the machine falls back to the system task. Returns the next task
    /// that has never run, still queued; the caller starts it with
    /// `prepare_run` (or `begin_switch`).
    pub fn yield_now(&mut self) -> Option<TaskId> {
        if let Some(current) = self.machine.user_task.take() {
            if let Some(task) = self.task_mut(current) {
                task.state = TaskState::Runnable;
            }
            self.run_queue.push_back(current);
            self.machine.bound = self.machine.system_task;
            self.system.state = TaskState::Running;
        }
        self.resched = false;
        self.schedule()
    }

    /// Next queued task that has never run. Stale queue entries are dropped;
    /// started tasks stay queued until whoever switched away resumes them.
    pub fn schedule(&mut self) -> Option<TaskId> {
        let tasks = &self.tasks;
        self.run_queue.retain(|id| {
            tasks
                .get(id)
                .is_some_and(|slot| unsafe { slot.descriptor.as_ref() }.state == TaskState::Runnable)
        });
        self.run_queue
            .iter()
            .copied()
            .find(|id| self.tasks.get(id).is_some_and(|slot| !slot.started))
    }

    /// Prologue check plus the switch it may ask for. When the running task
    /// was preempted and another task is waiting, that task runs to
    /// completion here and the preempted one is resumed afterwards.
    pub fn preempt_point<P: Platform + ?Sized>(
        &mut self,
        heap: &mut KernelHeap,
        platform: &mut P,
        sp: u64,
    ) -> Result<StackCheck, SchedError> {
        let check = self.stack_check(sp);
        if let StackCheck::Preempted { task, next: Some(next) } = check {
            if let Err(e) = self.switch(heap, platform, task, next) {
                // whatever happened to `next`, `task` keeps the CPU
                let _ = self.resume(task);
                return Err(e);
            }
        }
        Ok(check)
    }

    /// Consume a pending reschedule request by running every fresh task to
    /// completion from the system task. Returns how many ran.
    pub fn run_pending<P: Platform + ?Sized>(
        &mut self,
        heap: &mut KernelHeap,
        platform: &mut P,
    ) -> Result<usize, SchedError> {
        if !self.take_resched() {
            return Ok(0);
        }
        let mut ran = 0;
        while let Some(id) = self.schedule() {
            self.switch(heap, platform, TaskId::SYSTEM, id)?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Timer tick: wake tick monitors, then force the running task toward the
    /// scheduler by installing the preempt sentinel as its stack guard. The
    /// task does not choose to yield; its next function prologue trips over
    /// the sentinel. With only the system task on the CPU a reschedule is
    /// requested instead.
    pub fn preempt_tick(&mut self, now_ns: u64) -> PreemptTick {
        self.ticks += 1;
        let tick = TimerTick {
            count: self.ticks,
            timestamp_ns: now_ns,
        };
        for monitor in self.monitors.iter() {
            monitor.send(tick);
        }

        let running = self.machine.user_task;
        let marked = match running {
            Some(id) => self.task_mut(id).map(|task| {
                task.preempt = true;
                task.stackguard0 = STACK_PREEMPT;
                id
            }),
            None => {
                self.resched = self.schedule().is_some();
                None
            }
        };

        PreemptTick {
            count: self.ticks,
            marked,
        }
    }

    /// Function-prologue check for the executing task at stack pointer `sp`
    pub fn stack_check(&mut self, sp: u64) -> StackCheck {
        let current = self.machine.bound;
        let Some(task) = self.task_mut(current) else {
            return StackCheck::Ok;
        };
        if sp >= task.stackguard0 {
            return StackCheck::Ok;
        }

        if task.stackguard0 == STACK_PREEMPT {
            task.preempt = false;
            task.stackguard0 = task.default_guard();
            if current == TaskId::SYSTEM {
                return StackCheck::Ok;
            }
            let next = self.yield_now();
            if next.is_none() && self.resume(current).is_err() {
                log::warn!("[SCHED] task {} could not be resumed", current.value());
            }
            return StackCheck::Preempted { task: current, next };
        }

        StackCheck::Overflow {
            task: current,
            sp,
            guard: task.stackguard0,
        }
    }

    /// Register a tick monitor. False when all slots are taken.
    pub fn register_monitor(&mut self, channel: &'static TickChannel) -> bool {
        self.monitors.push(channel).is_ok()
    }

    /// Take the pending reschedule request
    pub fn take_resched(&mut self) -> bool {
        core::mem::replace(&mut self.resched, false)
    }

    /// True if `sp` lies on the system stack or on a live task's stack
    pub fn owns_stack(&self, sp: u64) -> bool {
        self.system.stack.contains(sp)
            || self
                .tasks
                .values()
                .any(|slot| unsafe { slot.descriptor.as_ref() }.stack.contains(sp))
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskDescriptor> {
        if id == TaskId::SYSTEM {
            return Some(&self.system);
        }
        self.tasks.get(&id).map(|slot| unsafe { slot.descriptor.as_ref() })
    }

    fn task_mut(&mut self, id: TaskId) -> Option<&mut TaskDescriptor> {
        if id == TaskId::SYSTEM {
            return Some(&mut self.system);
        }
        self.tasks.get_mut(&id).map(|slot| unsafe { slot.descriptor.as_mut() })
    }

    /// Task executing on the machine
    pub fn current(&self) -> TaskId {
        self.machine.bound
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut Processor {
        &mut self.processor
    }

    /// Created tasks not yet freed
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn runnable_count(&self) -> usize {
        self.run_queue.len()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPlatform, TestHeap};
    use core::sync::atomic::{AtomicUsize, Ordering};

    const SYSTEM_STACK: AddressRange = AddressRange::new(0x5EFF_0000, 0x5F00_0000);

    fn scheduler() -> Scheduler {
        Scheduler::bootstrap(SYSTEM_STACK, 0x4102_0000)
    }

    fn nothing() {}

    #[test]
    fn test_bootstrap_links() {
        let s = scheduler();
        let m = s.machine();
        let p = s.processor();

        assert_eq!(m.bound, TaskId::SYSTEM);
        assert_eq!(m.system_task, TaskId::SYSTEM);
        assert_eq!(m.user_task, None);
        assert_eq!(m.processor, Some(p.id));
        assert_eq!(p.machine, Some(m.id));
        assert_eq!(p.alloc_cache, Some(0x4102_0000));
        assert_eq!(p.status, ProcessorStatus::GcStop);
        assert!(p.wb_buf.is_empty());

        let sys = s.task(TaskId::SYSTEM).unwrap();
        assert_eq!(sys.stack.lo, SYSTEM_STACK.start);
        assert_eq!(sys.stack.hi, SYSTEM_STACK.end);
        assert_eq!(sys.stackguard0, SYSTEM_STACK.start + STACK_GUARD);
        assert_eq!(sys.state, TaskState::Running);
    }

    #[test]
    fn test_create_task() {
        let mut backing = TestHeap::new(256 * 1024);
        let mut s = scheduler();

        let a = s.create_task(backing.heap(), nothing, 20_000).unwrap();
        let b = s.create_task(backing.heap(), nothing, 4096).unwrap();
        assert_eq!(a.value(), 2);
        assert_eq!(b.value(), 3);

        let t = s.task(a).unwrap();
        assert_eq!(t.stack.size(), 32 * 1024);
        assert_eq!(t.stackguard0, t.stack.lo + STACK_GUARD);
        assert_eq!(t.state, TaskState::Runnable);
        assert_eq!(t.machine, s.machine().id);
        assert_eq!(s.runnable_count(), 2);
    }

    #[test]
    fn test_create_task_failure_leaves_nothing() {
        let mut backing = TestHeap::new(16 * 1024);
        let mut s = scheduler();
        let used = backing.heap().used();

        assert_eq!(s.create_task(backing.heap(), nothing, 64 * 1024), None);
        assert_eq!(backing.heap().used(), used);
        assert_eq!(s.task_count(), 0);

        // the failed attempt consumed no id
        let id = s.create_task(backing.heap(), nothing, 4096).unwrap();
        assert_eq!(id.value(), 2);
    }

    #[test]
    fn test_free_task() {
        let mut backing = TestHeap::new(64 * 1024);
        let mut s = scheduler();
        let id = s.create_task(backing.heap(), nothing, 4096).unwrap();

        assert_eq!(s.free_task(backing.heap(), TaskId::SYSTEM), Err(SchedError::SystemTask));
        assert_eq!(s.free_task(backing.heap(), id), Ok(()));
        assert_eq!(backing.heap().used(), 0);
        assert_eq!(s.runnable_count(), 0);
        assert_eq!(s.free_task(backing.heap(), id), Err(SchedError::UnknownTask));
    }

    #[test]
    fn test_spawn_and_run() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        fn body() {
            RUNS.fetch_add(1, Ordering::SeqCst);
        }

        let mut backing = TestHeap::new(128 * 1024);
        let mut platform = MockPlatform::new();
        let mut s = scheduler();

        s.spawn_and_run(backing.heap(), &mut platform, body, 8192).unwrap();
        s.spawn_and_run(backing.heap(), &mut platform, body, 8192).unwrap();

        assert_eq!(RUNS.load(Ordering::SeqCst), 2);
        assert_eq!(platform.stacks_run().len(), 2);
        assert_eq!(platform.stacks_run()[0] % 16, 0);
        assert_eq!(s.task_count(), 0);
        assert_eq!(backing.heap().used(), 0);
        assert_eq!(s.current(), TaskId::SYSTEM);
        assert_eq!(s.machine().user_task, None);
    }

    #[test]
    fn test_spawn_out_of_memory() {
        let mut backing = TestHeap::new(8 * 1024);
        let mut platform = MockPlatform::new();
        let mut s = scheduler();
        assert_eq!(
            s.spawn_and_run(backing.heap(), &mut platform, nothing, 64 * 1024),
            Err(SchedError::OutOfMemory)
        );
        assert!(platform.stacks_run().is_empty());
    }

    #[test]
    fn test_preempt_forces_yield_at_next_check() {
        let mut backing = TestHeap::new(128 * 1024);
        let mut s = scheduler();
        let t = s.create_task(backing.heap(), nothing, 8192).unwrap();
        let u = s.create_task(backing.heap(), nothing, 8192).unwrap();

        s.prepare_run(t).unwrap();
        let sp = s.task(t).unwrap().context.sp - 256;
        assert_eq!(s.stack_check(sp), StackCheck::Ok);

        let tick = s.preempt_tick(1_000);
        assert_eq!(tick.marked, Some(t));
        assert!(s.task(t).unwrap().preempt);
        assert!(s.task(t).unwrap().preempt_requested());

        assert_eq!(s.stack_check(sp), StackCheck::Preempted { task: t, next: Some(u) });
        let task = s.task(t).unwrap();
        assert_eq!(task.state, TaskState::Runnable);
        assert!(!task.preempt);
        assert_eq!(task.stackguard0, task.stack.lo + STACK_GUARD);
        assert_eq!(s.current(), TaskId::SYSTEM);
        assert_eq!(s.machine().user_task, None);

        // next is startable, the preempted task can only be resumed
        let u_top = s.task(u).unwrap().context.sp;
        assert_eq!(s.prepare_run(u).unwrap().stack_top, u_top);
        assert_eq!(s.current(), u);
        s.finish_run(u);
        s.free_task(backing.heap(), u).unwrap();

        assert_eq!(s.prepare_run(t).map(|_| ()), Err(SchedError::TaskRunning));
        s.resume(t).unwrap();
        assert_eq!(s.current(), t);
        assert_eq!(s.task(t).unwrap().state, TaskState::Running);
        assert_eq!(s.runnable_count(), 0);
    }

    #[test]
    fn test_preempt_point_runs_next_then_resumes() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        fn body() {
            RAN.fetch_add(1, Ordering::SeqCst);
        }

        let mut backing = TestHeap::new(128 * 1024);
        let mut platform = MockPlatform::new();
        let mut s = scheduler();
        let t = s.create_task(backing.heap(), nothing, 8192).unwrap();
        let u = s.create_task(backing.heap(), body, 8192).unwrap();
        let u_top = s.task(u).unwrap().context.sp;

        s.prepare_run(t).unwrap();
        let sp = s.task(t).unwrap().context.sp - 256;
        assert_eq!(s.preempt_point(backing.heap(), &mut platform, sp), Ok(StackCheck::Ok));
        assert!(platform.stacks_run().is_empty());

        s.preempt_tick(1_000);
        assert_eq!(
            s.preempt_point(backing.heap(), &mut platform, sp),
            Ok(StackCheck::Preempted { task: t, next: Some(u) })
        );
        assert_eq!(RAN.load(Ordering::SeqCst), 1);
        assert_eq!(platform.stacks_run(), &[u_top]);
        assert!(s.task(u).is_none());

        assert_eq!(s.current(), t);
        assert_eq!(s.machine().user_task, Some(t));
        assert_eq!(s.task(t).unwrap().state, TaskState::Running);
        assert_eq!(s.task(t).unwrap().stackguard0, s.task(t).unwrap().default_guard());

        s.finish_run(t);
        s.free_task(backing.heap(), t).unwrap();
        assert_eq!(backing.heap().used(), 0);
    }

    #[test]
    fn test_preempt_with_empty_queue_keeps_running() {
        let mut backing = TestHeap::new(64 * 1024);
        let mut platform = MockPlatform::new();
        let mut s = scheduler();
        let t = s.create_task(backing.heap(), nothing, 8192).unwrap();
        s.prepare_run(t).unwrap();
        let sp = s.task(t).unwrap().context.sp - 64;

        s.preempt_tick(5);
        assert_eq!(
            s.preempt_point(backing.heap(), &mut platform, sp),
            Ok(StackCheck::Preempted { task: t, next: None })
        );
        assert!(platform.stacks_run().is_empty());
        assert_eq!(s.current(), t);
        assert_eq!(s.task(t).unwrap().state, TaskState::Running);
        assert_eq!(s.stack_check(sp), StackCheck::Ok);
    }

    #[test]
    fn test_saved_context_slots_differ() {
        let mut backing = TestHeap::new(64 * 1024);
        let mut s = scheduler();
        let t = s.create_task(backing.heap(), nothing, 4096).unwrap();

        let system = s.saved_context(TaskId::SYSTEM).unwrap();
        let task = s.saved_context(t).unwrap();
        assert_ne!(system, task);
        assert_eq!(s.saved_context(TaskId::SYSTEM), Some(system));
        assert_eq!(s.saved_context(TaskId::new(99)), None);
    }

    #[test]
    fn test_stack_overflow_detected() {
        let mut backing = TestHeap::new(64 * 1024);
        let mut s = scheduler();
        let t = s.create_task(backing.heap(), nothing, 4096).unwrap();
        s.prepare_run(t).unwrap();

        let guard = s.task(t).unwrap().stackguard0;
        assert_eq!(
            s.stack_check(guard - 8),
            StackCheck::Overflow { task: t, sp: guard - 8, guard }
        );
    }

    #[test]
    fn test_tick_monitors() {
        static MONITOR: TickChannel = TickChannel::new();
        let mut s = scheduler();
        assert!(s.register_monitor(&MONITOR));

        s.preempt_tick(10);
        s.preempt_tick(20);
        assert_eq!(s.ticks(), 2);
        assert_eq!(MONITOR.try_recv(), Some(TimerTick { count: 2, timestamp_ns: 20 }));
    }

    #[test]
    fn test_tick_on_system_task_requests_resched() {
        let mut backing = TestHeap::new(64 * 1024);
        let mut s = scheduler();
        assert_eq!(s.preempt_tick(1).marked, None);
        assert!(!s.take_resched());

        s.create_task(backing.heap(), nothing, 4096).unwrap();
        s.preempt_tick(2);
        assert!(s.take_resched());
        assert!(!s.take_resched());
    }

    #[test]
    fn test_run_pending_consumes_resched() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        fn body() {
            RAN.fetch_add(1, Ordering::SeqCst);
        }

        let mut backing = TestHeap::new(128 * 1024);
        let mut platform = MockPlatform::new();
        let mut s = scheduler();
        s.create_task(backing.heap(), body, 4096).unwrap();
        s.create_task(backing.heap(), body, 4096).unwrap();

        // nothing requested yet
        assert_eq!(s.run_pending(backing.heap(), &mut platform), Ok(0));
        assert_eq!(RAN.load(Ordering::SeqCst), 0);

        s.preempt_tick(1);
        assert_eq!(s.run_pending(backing.heap(), &mut platform), Ok(2));
        assert_eq!(RAN.load(Ordering::SeqCst), 2);
        assert_eq!(s.task_count(), 0);
        assert_eq!(s.current(), TaskId::SYSTEM);
        assert!(!s.take_resched());
    }

    #[test]
    fn test_cannot_free_running_task() {
        let mut backing = TestHeap::new(64 * 1024);
        let mut s = scheduler();
        let t = s.create_task(backing.heap(), nothing, 4096).unwrap();
        s.prepare_run(t).unwrap();
        assert_eq!(s.free_task(backing.heap(), t), Err(SchedError::TaskRunning));
        assert!(s.owns_stack(s.task(t).unwrap().context.sp));

        s.finish_run(t);
        assert_eq!(s.task(t).unwrap().state, TaskState::Dead);
        assert_eq!(s.free_task(backing.heap(), t), Ok(()));
    }

    #[test]
    fn test_write_barrier_buffer() {
        let mut wb = WriteBarrierBuffer::new();
        for i in 0..WB_BUF_ENTRIES as u64 {
            assert!(wb.push(i));
        }
        assert!(wb.is_full());
        assert!(!wb.push(1));

        let mut drained = 0;
        wb.flush(|entries| drained = entries.len());
        assert_eq!(drained, WB_BUF_ENTRIES);
        assert!(wb.is_empty());
    }
}
