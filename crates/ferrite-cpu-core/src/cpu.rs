use ferrite_memory::{ExecError, PhysicalAddressSpace};
use thiserror::Error;

use crate::exceptions::ProcessorException;
use crate::mode::CpuMode;

/// Why a block of execution stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuExit {
    /// Exception delivery failed while a double fault was in flight. The machine must reset.
    #[error("triple fault")]
    TripleFault,
    /// The block changed CR0.PE or EFLAGS.VM; the caller must re-derive the mode.
    #[error("processor mode switch")]
    ModeSwitch,
    #[error(transparent)]
    Exception(#[from] ProcessorException),
    #[error(transparent)]
    Unconnected(#[from] ExecError),
}

/// External interrupt controller interface.
pub trait InterruptController {
    /// Acknowledge the highest priority pending request and return its vector.
    fn cpu_get_interrupt(&mut self) -> u8;
}

/// The instruction engine driven by the run loop.
///
/// Decoding and executing instructions is entirely the implementor's business. The run loop only
/// asks for mode flags, hands over control for one block at a time, and routes interrupts,
/// exceptions and resets.
pub trait Processor {
    /// Linear address of the next instruction (CS base + IP).
    fn instruction_pointer(&self) -> u32;

    /// CR0.PE.
    fn is_protected_mode(&self) -> bool;

    /// EFLAGS.VM.
    fn is_virtual8086_mode(&self) -> bool;

    /// CR0.PG.
    fn is_paging_enabled(&self) -> bool {
        false
    }

    /// Translate a linear address through the page tables. Only called with paging enabled.
    fn translate_linear(
        &mut self,
        _memory: &PhysicalAddressSpace,
        linear: u32,
    ) -> Result<u32, ProcessorException> {
        Ok(linear)
    }

    /// Execute one block starting at `physical_addr` and return how many instructions retired.
    fn execute_block(
        &mut self,
        mode: CpuMode,
        memory: &mut PhysicalAddressSpace,
        physical_addr: u32,
    ) -> Result<u32, CpuExit>;

    /// Deliver pending external interrupts, if the processor currently accepts them.
    fn process_interrupts(
        &mut self,
        mode: CpuMode,
        instructions: u32,
        pic: &mut dyn InterruptController,
    );

    /// Vector `exception` through the mode's interrupt table. Returns
    /// [`CpuExit::TripleFault`] if delivery escalates past a double fault.
    fn handle_exception(
        &mut self,
        mode: CpuMode,
        exception: ProcessorException,
    ) -> Result<(), CpuExit>;

    /// Assert the INTR pin.
    fn raise_interrupt(&mut self);

    /// Deassert the INTR pin.
    fn clear_interrupt(&mut self);

    fn reset(&mut self);

    fn mode(&self) -> CpuMode {
        CpuMode::from_flags(self.is_protected_mode(), self.is_virtual8086_mode())
    }
}
