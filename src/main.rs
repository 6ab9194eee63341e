//! bedrock - QEMU virt kernel image
//!
//! Boots the kernel core, then runs tasks that exercise the syscall layer
//! and demand paging the way a hosted runtime would. Run with
//! `-M virt -cpu max -m 2G -semihosting`.

#![no_std] // Don't link Rust standard library
#![no_main] // Entry is _start in boot.S

extern crate alloc;

use core::arch::asm;
use core::panic::PanicInfo;

use linked_list_allocator::LockedHeap;

use bedrock::arch::aarch64::{self as arch, platform::BootMemory, platform::QemuVirt};
use bedrock::bootparams::discover_ram_size;
use bedrock::config::{page_align_down, AddressRange, KIB, PAGE_SIZE};
use bedrock::heap::KernelHeap;
use bedrock::{logger, uart_println, BootInfo, Kernel, KernelConfig};

/// Backs `alloc` collections inside the kernel core. Task stacks come from
/// the separate `KernelHeap` in the upper half of the heap range.
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Device tree blobs QEMU builds are well under this
const BOOT_PARAMS_SPAN: u64 = 64 * KIB;

/// Ticks to wait before shutting down
const IDLE_TICKS: u64 = 10;

extern "C" {
    static __kernel_end: u8;
}

/// Kernel entry point, called from boot.S with the boot-parameter pointer
#[no_mangle]
pub extern "C" fn kernel_main(boot_params: u64) -> ! {
    arch::uart::init();
    uart_println!("\n[BOOT] bedrock v0.1.0 starting");

    let config = KernelConfig::qemu_virt();
    if logger::init(config.log_level).is_err() {
        uart_println!("[BOOT] logger already installed");
    }

    let kernel_end = unsafe { &__kernel_end as *const u8 as u64 };
    let heap_range = config.heap_range(kernel_end);
    let half = page_align_down(heap_range.len() / 2);
    let mut task_heap = KernelHeap::empty();
    unsafe {
        ALLOCATOR.lock().init(heap_range.start as *mut u8, half as usize);
        task_heap.init((heap_range.start + half) as *mut u8, (heap_range.len() - half) as usize);
    }

    let discovered = discover_ram_size(&BootMemory, boot_params);
    if let Some((size, source)) = discovered {
        log::info!("[BOOT] {} MB of RAM from {:?}", size >> 20, source);
    }
    let boot = BootInfo {
        kernel_end,
        discovered_ram: discovered.map(|(size, _)| size),
        boot_params: (boot_params != 0).then(|| {
            let start = page_align_down(boot_params);
            AddressRange::new(start, start + BOOT_PARAMS_SPAN)
        }),
    };

    if let Err(e) = arch::init(&config) {
        fatal(format_args!("{}", e));
    }

    let mut platform = match QemuVirt::new(config.page_tables) {
        Ok(platform) => platform,
        Err(e) => fatal(format_args!("page tables: {}", e)),
    };
    platform.enable_paging();

    match Kernel::new(config, platform, boot, task_heap) {
        Ok(kernel) => *arch::KERNEL.lock() = Some(kernel),
        Err(e) => fatal(format_args!("{}", e)),
    }

    arch::enable_interrupts();
    log::info!("[BOOT] kernel core up, interrupts on");

    // queued behind the runtime task: it runs when that task is preempted,
    // or from the idle loop otherwise
    let queued = arch::with_kernel(|kernel| {
        let stack = kernel.config().default_task_stack;
        kernel.create_task(report_clock, stack)
    });
    if queued.flatten().is_none() {
        log::warn!("[BOOT] no memory for the clock task");
    }

    if let Err(e) = arch::spawn(exercise_runtime) {
        log::error!("[BOOT] runtime task failed: {}", e);
    }

    let start = arch::with_kernel(|kernel| kernel.scheduler().ticks()).unwrap_or(0);
    while arch::with_kernel(|kernel| kernel.scheduler().ticks()).unwrap_or(0) < start + IDLE_TICKS {
        match arch::run_pending() {
            Ok(0) => unsafe { asm!("wfi") },
            Ok(ran) => log::info!("[SCHED] ran {} queued task(s)", ran),
            Err(e) => log::error!("[SCHED] queued task failed: {}", e),
        }
    }

    if let Some((faults, stats)) = arch::with_kernel(|kernel| (kernel.region().stats(), kernel.trap_stats())) {
        log::info!(
            "[BOOT] {} traps, {} irqs, {} syscalls, {} page faults ({} frames committed)",
            stats.traps,
            stats.irqs,
            stats.syscalls,
            stats.page_faults,
            faults.committed
        );
    }

    syscall(93, [0; 6]);
    arch::halt()
}

/// Issue a Linux-style syscall the way the hosted runtime does
fn syscall(number: u64, args: [u64; 6]) -> u64 {
    let ret: u64;
    unsafe {
        asm!(
            "svc #0",
            inlateout("x0") args[0] => ret,
            in("x1") args[1],
            in("x2") args[2],
            in("x3") args[3],
            in("x4") args[4],
            in("x5") args[5],
            in("x8") number,
        );
    }
    ret
}

/// Reserve memory, fault it in and draw entropy
fn exercise_runtime() {
    const PROT_RW: u64 = 0x3;
    const MAP_PRIVATE_ANON: u64 = 0x22;
    let length = 64 * KIB;

    let base = syscall(222, [0, length, PROT_RW, MAP_PRIVATE_ANON, u64::MAX, 0]);
    if (base as i64) < 0 {
        log::error!("[RUNTIME] mmap failed: {}", base as i64);
        return;
    }
    for page in (0..length).step_by(PAGE_SIZE as usize) {
        unsafe { core::ptr::write_volatile((base + page) as *mut u64, page) };
        if let Err(e) = arch::preempt_point() {
            log::error!("[RUNTIME] switch failed: {}", e);
        }
    }
    log::info!("[RUNTIME] touched {} pages at {:#x}", length / PAGE_SIZE, base);

    let mut random = [0u8; 16];
    let got = syscall(278, [random.as_mut_ptr() as u64, random.len() as u64, 0, 0, 0, 0]);
    log::info!("[RUNTIME] getrandom returned {} bytes: {:02x?}", got, random);
}

/// Read the monotonic clock
fn report_clock() {
    let mut timespec = [0u64; 2];
    syscall(113, [1, timespec.as_mut_ptr() as u64, 0, 0, 0, 0]);
    log::info!("[RUNTIME] monotonic {}.{:09}s", timespec[0], timespec[1]);
}

fn fatal(args: core::fmt::Arguments) -> ! {
    uart_println!("[FATAL] {}", args);
    arch::halt()
}

/// Panic handler - called on kernel panic
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    use core::fmt::Write;
    // the console lock may be held by whoever panicked
    let _ = writeln!(arch::uart::DirectConsole, "[PANIC] {}", info);
    arch::halt()
}
