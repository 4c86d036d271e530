//! Machine composition: the execution dispatcher, the I/O port bus with the interrupt
//! controller wired in, and machine configuration.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod exec;
pub mod io;
mod machine;
pub mod pic_port;

pub use config::MachineConfig;
pub use error::MachineError;
pub use exec::{
    ExecDispatcher, Slice, SliceExit, DEFAULT_MAX_BLOCKS_PER_SLICE, INSTRUCTIONS_BETWEEN_INTERRUPTS,
};
pub use machine::Machine;
