//! Interrupt handler table
//!
//! GICv2 interrupt ids 0..1020 map to handler slots; 1020..1023 are special
//! (1023 is the "no pending interrupt" id) and never reach a handler. The
//! scheduler tick is not in here: the trap dispatcher handles it directly.

use crate::error::IrqError;

/// Interrupt ids with a handler slot
pub const MAX_IRQS: usize = 1020;

/// Id the GIC reports when nothing is pending
pub const SPURIOUS_IRQ: u32 = 1023;

/// Interrupt handler, called with the interrupt id
pub type IrqHandler = fn(u32);

/// Outcome of routing one interrupt id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqDispatch {
    Handled,
    /// Valid id without a handler
    Unhandled,
    /// Special id, must not be completed
    Spurious,
}

impl IrqDispatch {
    /// True if the interrupt controller expects an end-of-interrupt
    pub fn needs_eoi(&self) -> bool {
        !matches!(self, IrqDispatch::Spurious)
    }
}

pub struct InterruptTable {
    handlers: [Option<IrqHandler>; MAX_IRQS],
    unhandled: u64,
}

impl InterruptTable {
    pub const fn new() -> Self {
        InterruptTable {
            handlers: [None; MAX_IRQS],
            unhandled: 0,
        }
    }

    pub fn register(&mut self, irq: u32, handler: IrqHandler) -> Result<(), IrqError> {
        let slot = self
            .handlers
            .get_mut(irq as usize)
            .ok_or(IrqError::InvalidIrq(irq))?;
        if slot.is_some() {
            return Err(IrqError::AlreadyRegistered(irq));
        }
        *slot = Some(handler);
        log::info!("[IRQ] handler registered for interrupt {}", irq);
        Ok(())
    }

    pub fn unregister(&mut self, irq: u32) -> Option<IrqHandler> {
        self.handlers.get_mut(irq as usize)?.take()
    }

    pub fn is_registered(&self, irq: u32) -> bool {
        matches!(self.handlers.get(irq as usize), Some(Some(_)))
    }

    /// Run the handler for `irq`. Called from trap context.
    pub fn dispatch(&mut self, irq: u32) -> IrqDispatch {
        if irq as usize >= MAX_IRQS {
            return IrqDispatch::Spurious;
        }
        match self.handlers[irq as usize] {
            Some(handler) => {
                handler(irq);
                IrqDispatch::Handled
            }
            None => {
                self.unhandled += 1;
                IrqDispatch::Unhandled
            }
        }
    }

    /// Interrupts that arrived with no handler
    pub fn unhandled_count(&self) -> u64 {
        self.unhandled
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}
