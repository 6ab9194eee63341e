//! GICv2 interrupt controller (QEMU virt)

use volatile::Volatile;

const GICD_BASE: usize = 0x0800_0000;
const GICC_BASE: usize = 0x0801_0000;

const GICD_CTLR: usize = 0x000;
const GICD_TYPER: usize = 0x004;
const GICD_ISENABLER: usize = 0x100;
const GICD_ICENABLER: usize = 0x180;
const GICD_ICPENDR: usize = 0x280;
const GICD_IPRIORITYR: usize = 0x400;
const GICD_ITARGETSR: usize = 0x800;

const GICC_CTLR: usize = 0x000;
const GICC_PMR: usize = 0x004;
const GICC_IAR: usize = 0x00C;
const GICC_EOIR: usize = 0x010;

const DEFAULT_PRIORITY: u32 = 0x80;

fn reg(base: usize, offset: usize) -> &'static mut Volatile<u32> {
    unsafe { &mut *((base + offset) as *mut Volatile<u32>) }
}

/// Number of interrupt lines the distributor implements
fn line_count() -> u32 {
    ((reg(GICD_BASE, GICD_TYPER).read() & 0x1F) + 1) * 32
}

/// Reset the distributor and CPU interface: everything disabled and cleared,
/// medium priority, routed to CPU 0, priority mask fully open.
pub fn init() {
    reg(GICD_BASE, GICD_CTLR).write(0);
    reg(GICC_BASE, GICC_CTLR).write(0);

    let lines = line_count() as usize;
    for word in 0..lines / 32 {
        reg(GICD_BASE, GICD_ICENABLER + word * 4).write(0xFFFF_FFFF);
        reg(GICD_BASE, GICD_ICPENDR + word * 4).write(0xFFFF_FFFF);
    }
    for word in 0..lines / 4 {
        reg(GICD_BASE, GICD_IPRIORITYR + word * 4).write(DEFAULT_PRIORITY * 0x0101_0101);
        // SGIs and PPIs have read-only targets
        if word >= 8 {
            reg(GICD_BASE, GICD_ITARGETSR + word * 4).write(0x0101_0101);
        }
    }

    reg(GICC_BASE, GICC_PMR).write(0xFF);
    reg(GICD_BASE, GICD_CTLR).write(1);
    reg(GICC_BASE, GICC_CTLR).write(1);

    log::info!("[GIC] {} interrupt lines", lines);
}

pub fn enable(irq: u32) {
    let word = (irq / 32) as usize;
    reg(GICD_BASE, GICD_ISENABLER + word * 4).write(1 << (irq % 32));
}

/// Read IAR: the pending interrupt id, 1023 when spurious
pub fn acknowledge() -> u32 {
    reg(GICC_BASE, GICC_IAR).read() & 0x3FF
}

pub fn end_of_interrupt(irq: u32) {
    reg(GICC_BASE, GICC_EOIR).write(irq);
}
