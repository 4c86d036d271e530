#![allow(dead_code)]

use std::collections::VecDeque;

use ferrite_cpu_core::{
    CpuExit, CpuMode, InterruptController, Processor, ProcessorException, TraceTrap,
};
use ferrite_memory::PhysicalAddressSpace;
use ferrite_platform::{Machine, MachineConfig};

pub const RESET_IP: u32 = 0x7C00;

/// What the next `execute_block` call does.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Retire(u32),
    /// Retire one instruction that transfers control to the given address.
    Jump(u32),
    Exit(CpuExit),
    /// Set CR0.PE and report a mode switch.
    EnterProtectedMode,
}

/// Processor double that follows a script and records what the run loop asked of it.
#[derive(Debug)]
pub struct ScriptedCpu {
    pub ip: u32,
    pub protected: bool,
    pub virtual8086: bool,
    pub script: VecDeque<Step>,
    pub escalate_exceptions: bool,
    pub trap_after: Option<(u32, TraceTrap)>,

    pub blocks: Vec<(CpuMode, u32)>,
    pub interrupt_polls: Vec<(CpuMode, u32)>,
    pub vectors: Vec<u8>,
    pub exceptions: Vec<(CpuMode, ProcessorException)>,
    pub intr: bool,
    pub resets: u32,
}

impl Default for ScriptedCpu {
    fn default() -> Self {
        Self {
            ip: RESET_IP,
            protected: false,
            virtual8086: false,
            script: VecDeque::new(),
            escalate_exceptions: false,
            trap_after: None,
            blocks: Vec::new(),
            interrupt_polls: Vec::new(),
            vectors: Vec::new(),
            exceptions: Vec::new(),
            intr: false,
            resets: 0,
        }
    }
}

impl ScriptedCpu {
    pub fn with_script(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: steps.into_iter().collect(),
            ..Self::default()
        }
    }
}

impl Processor for ScriptedCpu {
    fn instruction_pointer(&self) -> u32 {
        self.ip
    }

    fn is_protected_mode(&self) -> bool {
        self.protected
    }

    fn is_virtual8086_mode(&self) -> bool {
        self.virtual8086
    }

    fn execute_block(
        &mut self,
        mode: CpuMode,
        _memory: &mut PhysicalAddressSpace,
        physical_addr: u32,
    ) -> Result<u32, CpuExit> {
        self.blocks.push((mode, physical_addr));
        if let Some((after, trap)) = &self.trap_after {
            if self.blocks.len() as u32 == *after {
                trap.trigger();
            }
        }
        match self.script.pop_front().unwrap_or(Step::Retire(1)) {
            Step::Retire(count) => {
                self.ip += count;
                Ok(count)
            }
            Step::Jump(target) => {
                self.ip = target;
                Ok(1)
            }
            Step::Exit(exit) => Err(exit),
            Step::EnterProtectedMode => {
                self.protected = true;
                Err(CpuExit::ModeSwitch)
            }
        }
    }

    fn process_interrupts(
        &mut self,
        mode: CpuMode,
        instructions: u32,
        pic: &mut dyn InterruptController,
    ) {
        self.interrupt_polls.push((mode, instructions));
        if std::mem::take(&mut self.intr) {
            self.vectors.push(pic.cpu_get_interrupt());
        }
    }

    fn handle_exception(
        &mut self,
        mode: CpuMode,
        exception: ProcessorException,
    ) -> Result<(), CpuExit> {
        self.exceptions.push((mode, exception));
        if self.escalate_exceptions {
            Err(CpuExit::TripleFault)
        } else {
            Ok(())
        }
    }

    fn raise_interrupt(&mut self) {
        self.intr = true;
    }

    fn clear_interrupt(&mut self) {
        self.intr = false;
    }

    fn reset(&mut self) {
        self.ip = RESET_IP;
        self.protected = false;
        self.virtual8086 = false;
        self.intr = false;
        self.resets += 1;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// 1 MiB machine: RAM below the legacy hole, default PIC bases.
pub fn small_config() -> MachineConfig {
    MachineConfig {
        ram_size_bytes: 0x10_0000,
        ..MachineConfig::default()
    }
}

pub fn machine(cpu: ScriptedCpu) -> Machine<ScriptedCpu> {
    init_tracing();
    Machine::new(small_config(), cpu).unwrap()
}
