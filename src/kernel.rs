//! Kernel context
//!
//! All mutable kernel state lives in one `Kernel` value: the page allocator,
//! the demand-paged region, the syscall layer, the scheduler, the interrupt
//! table and the platform they run on. The binary keeps it behind a lock;
//! tests build one directly over a mock platform.

use crate::config::{AddressRange, KernelConfig};
use crate::error::{InitError, SchedError};
use crate::heap::KernelHeap;
use crate::interrupts::InterruptTable;
use crate::page::{resolve_ram_size, PageAllocator};
use crate::platform::Platform;
use crate::region::DemandRegion;
use crate::scheduler::{Scheduler, StackCheck};
use crate::syscall::SyscallLayer;
use crate::task::TaskId;
use crate::trap::TrapStats;

/// What the boot code found out before the kernel context exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    /// First byte past the kernel image
    pub kernel_end: u64,
    /// RAM size from the device tree or ATAG list
    pub discovered_ram: Option<u64>,
    /// Where the boot-parameter blob sits, so its frames are never handed out
    pub boot_params: Option<AddressRange>,
}

pub struct Kernel<P: Platform> {
    pub(crate) config: KernelConfig,
    pub(crate) platform: P,
    pub(crate) pages: PageAllocator,
    pub(crate) region: DemandRegion,
    pub(crate) syscalls: SyscallLayer,
    pub(crate) heap: KernelHeap,
    pub(crate) scheduler: Scheduler,
    pub(crate) interrupts: InterruptTable,
    pub(crate) stats: TrapStats,
}

impl<P: Platform> Kernel<P> {
    /// Bring up the kernel core.
    ///
    /// The scheduler is bootstrapped first; nothing before it allocates.
    /// Fails if the kernel image plus its heap do not fit in managed RAM.
    pub fn new(config: KernelConfig, platform: P, boot: BootInfo, heap: KernelHeap) -> Result<Self, InitError> {
        let scheduler = Scheduler::bootstrap(config.system_stack, config.alloc_cache_addr);

        let ram_size = resolve_ram_size(boot.discovered_ram, &config);
        let ram = AddressRange::new(config.ram_base, config.ram_base + ram_size);
        let kernel_image = AddressRange::new(config.ram_base, boot.kernel_end);
        let kernel_heap = config.heap_range(boot.kernel_end);
        if kernel_heap.end > ram.end {
            return Err(InitError::RamTooSmall {
                needed: kernel_heap.end - ram.start,
                available: ram_size,
            });
        }

        let mut pages = PageAllocator::initialize(ram, kernel_image, kernel_heap, config.free_list_cap);
        if let Some(params) = boot.boot_params {
            pages.reserve_range(params);
        }
        // only matter when RAM reaches up to them
        pages.reserve_range(config.system_stack);
        pages.reserve_range(config.page_tables);

        let region = DemandRegion::new(config.region, config.page_tables);
        let syscalls = SyscallLayer::new(config.entropy);

        log::info!(
            "[KERNEL] RAM {:#x}..{:#x} ({} MB), {} frames free",
            ram.start,
            ram.end,
            ram_size >> 20,
            pages.free_count()
        );

        Ok(Kernel {
            config,
            platform,
            pages,
            region,
            syscalls,
            heap,
            scheduler,
            interrupts: InterruptTable::new(),
            stats: TrapStats::default(),
        })
    }

    /// Run `function` to completion on a fresh task stack
    pub fn spawn_and_run(&mut self, function: fn()) -> Result<(), SchedError> {
        let stack_size = self.config.default_task_stack;
        self.scheduler
            .spawn_and_run(&mut self.heap, &mut self.platform, function, stack_size)
    }

    pub fn create_task(&mut self, entry: fn(), stack_size: usize) -> Option<TaskId> {
        self.scheduler.create_task(&mut self.heap, entry, stack_size)
    }

    pub fn free_task(&mut self, id: TaskId) -> Result<(), SchedError> {
        self.scheduler.free_task(&mut self.heap, id)
    }

    /// Prologue check for the running task, switching away if it was
    /// preempted and another task is waiting
    pub fn preempt_point(&mut self, sp: u64) -> Result<StackCheck, SchedError> {
        self.scheduler.preempt_point(&mut self.heap, &mut self.platform, sp)
    }

    /// Run whatever a tick on the system task asked for
    pub fn run_pending(&mut self) -> Result<usize, SchedError> {
        self.scheduler.run_pending(&mut self.heap, &mut self.platform)
    }

    /// Release task `id` after it returned and hand the CPU back to `caller`
    pub fn complete_switch(&mut self, caller: TaskId, id: TaskId) -> Result<(), SchedError> {
        self.scheduler.complete_switch(&mut self.heap, caller, id)
    }

    /// One zeroed physical frame
    pub fn allocate_frame(&mut self) -> Option<u64> {
        self.pages.allocate(&mut self.platform)
    }

    pub fn free_frame(&mut self, frame: u64) {
        self.pages.free(frame)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn pages(&self) -> &PageAllocator {
        &self.pages
    }

    pub fn region(&self) -> &DemandRegion {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut DemandRegion {
        &mut self.region
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn interrupts_mut(&mut self) -> &mut InterruptTable {
        &mut self.interrupts
    }

    pub fn heap(&self) -> &KernelHeap {
        &self.heap
    }
}
