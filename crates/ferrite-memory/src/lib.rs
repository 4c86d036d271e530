//! Physical memory fabric of the emulated PC: 4 KiB blocks, the two-level block index, A20
//! aliasing and the device region mapping operations.

#![forbid(unsafe_code)]

mod address_space;
mod block;
mod code;
mod error;
mod index;
mod phys;

#[cfg(test)]
mod tests;

pub use address_space::{PhysicalAddressSpace, SYSTEM_BIOS_END};
pub use block::{
    BlockId, BlockKind, CodePage, MapWrapper, MemoryBlock, BLOCK_MASK, BLOCK_SHIFT, BLOCK_SIZE,
};
pub use code::{CodeRegistrationHook, NoopCodeHook};
pub use error::{ExecError, MapError};
pub use index::A20_MASK;
pub use phys::{DenseMemory, GuestMemory, GuestMemoryError, GuestMemoryResult, SharedGuestMemory};
