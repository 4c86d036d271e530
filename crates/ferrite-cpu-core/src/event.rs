use std::cell::Cell;
use std::rc::Rc;

/// Single-consumer, read-and-clear boolean shared between a producer and the run loop.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct EventFlag {
    pending: Rc<Cell<bool>>,
}

impl EventFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.pending.set(true);
    }

    /// Returns the flag without clearing it.
    pub fn peek(&self) -> bool {
        self.pending.get()
    }

    /// Returns the flag and clears it.
    pub fn take(&self) -> bool {
        self.pending.replace(false)
    }

    pub fn clear(&self) {
        self.pending.set(false);
    }
}

/// Latch a collaborator sets to stop the run loop at the next instruction boundary, e.g. for
/// single-stepping.
#[derive(Debug, Clone, Default)]
pub struct TraceTrap {
    active: EventFlag,
}

impl TraceTrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.active.set();
    }

    pub fn is_active(&self) -> bool {
        self.active.peek()
    }

    pub fn get_and_clear_trap_active(&self) -> bool {
        self.active.take()
    }

    pub fn reset(&self) {
        self.active.clear();
    }
}
