use thiserror::Error;

/// Rejected index mutation. The index is left untouched whenever one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("region start {start:#x} is not block aligned")]
    Misaligned { start: u32 },

    #[error("region length {length:#x} is not a whole number of blocks")]
    PartialBlock { length: u64 },

    #[error("region length {length:#x} exceeds underlying memory size {size:#x}")]
    UnderlyingTooShort { length: u64, size: u64 },

    #[error("allocated block is {size} bytes, expected one 4 KiB block")]
    WrongBlockSize { size: usize },

    #[error("the unconnected sentinel cannot replace an installed block")]
    UnconnectedReplacement,

    #[error("region {start:#x}+{length:#x} extends past the 4 GiB address space")]
    RangeOverflow { start: u32, length: u64 },

    #[error("system BIOS image of {len} bytes does not fit below 1 MiB")]
    InvalidRomImage { len: usize },
}

/// Failure to start execution at a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("attempted to execute unconnected memory at {addr:#010x}")]
    Unconnected { addr: u32 },
}
