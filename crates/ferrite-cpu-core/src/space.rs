use ferrite_memory::PhysicalAddressSpace;

use crate::cpu::{CpuExit, Processor};
use crate::mode::CpuMode;

/// Address space an instruction block can be fetched from.
///
/// Real mode fetches straight from the physical bus; protected and virtual-8086 mode go
/// through [`LinearAddressSpace`].
pub trait ExecutionSpace {
    fn physical(&mut self) -> &mut PhysicalAddressSpace;

    fn translate<P: Processor + ?Sized>(&mut self, cpu: &mut P, addr: u32) -> Result<u32, CpuExit>;

    /// Run one block at the processor's current instruction pointer.
    fn execute_in_mode<P: Processor + ?Sized>(
        &mut self,
        cpu: &mut P,
        mode: CpuMode,
    ) -> Result<u32, CpuExit> {
        let ip = cpu.instruction_pointer();
        let addr = self.translate(cpu, ip)?;
        let memory = self.physical();
        memory.code_block_at(addr)?;
        cpu.execute_block(mode, memory, addr)
    }
}

impl ExecutionSpace for PhysicalAddressSpace {
    fn physical(&mut self) -> &mut PhysicalAddressSpace {
        self
    }

    fn translate<P: Processor + ?Sized>(&mut self, _cpu: &mut P, addr: u32) -> Result<u32, CpuExit> {
        Ok(addr)
    }
}

/// Paged view of the physical bus used outside real mode.
#[derive(Debug)]
pub struct LinearAddressSpace<'a> {
    memory: &'a mut PhysicalAddressSpace,
}

impl<'a> LinearAddressSpace<'a> {
    pub fn new(memory: &'a mut PhysicalAddressSpace) -> Self {
        Self { memory }
    }
}

impl ExecutionSpace for LinearAddressSpace<'_> {
    fn physical(&mut self) -> &mut PhysicalAddressSpace {
        &mut *self.memory
    }

    fn translate<P: Processor + ?Sized>(&mut self, cpu: &mut P, addr: u32) -> Result<u32, CpuExit> {
        if !cpu.is_paging_enabled() {
            return Ok(addr);
        }
        cpu.translate_linear(&*self.memory, addr)
            .map_err(CpuExit::Exception)
    }
}
