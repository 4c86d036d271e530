//! CPU-facing surface of the machine: the processor collaborator trait, execution modes and
//! address spaces, the exception taxonomy with its escalation rules, and run-loop event flags.

#![forbid(unsafe_code)]

mod cpu;
mod event;
pub mod exceptions;
mod mode;
mod space;

pub use cpu::{CpuExit, InterruptController, Processor};
pub use event::{EventFlag, TraceTrap};
pub use exceptions::{
    combines_to_double_fault, ExceptionKind, FaultChain, FaultStep, ProcessorException,
};
pub use mode::CpuMode;
pub use space::{ExecutionSpace, LinearAddressSpace};
