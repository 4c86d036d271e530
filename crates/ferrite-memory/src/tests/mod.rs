mod proptest_a20;

use crate::{MemoryBlock, PhysicalAddressSpace, BLOCK_SIZE};

/// Bus with RAM pages over `[0, ram_size)`.
pub(crate) fn ram_bus(ram_size: u32) -> PhysicalAddressSpace {
    let mut bus = PhysicalAddressSpace::new(ram_size);
    for addr in (0..ram_size).step_by(BLOCK_SIZE) {
        bus.allocate_memory(addr, MemoryBlock::ram()).unwrap();
    }
    bus
}
