use std::cell::RefCell;
use std::rc::Rc;

use ferrite_cpu_core::{Processor, TraceTrap};
use ferrite_interrupts::DualPic8259;
use ferrite_memory::{MemoryBlock, PhysicalAddressSpace, BLOCK_SIZE};
use ferrite_snapshot::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use tracing::{debug, info, warn};

use crate::config::MachineConfig;
use crate::error::MachineError;
use crate::exec::{forward_intr, ExecDispatcher, Slice, SliceExit};
use crate::io::IoPortBus;
use crate::pic_port::{register_pic, SharedPic};

/// A PC built around a caller-supplied [`Processor`]: physical memory, the dual PIC on the I/O
/// bus, and the execution dispatcher.
pub struct Machine<P: Processor> {
    config: MachineConfig,
    memory: PhysicalAddressSpace,
    pic: SharedPic,
    cpu: P,
    io: IoPortBus,
    dispatcher: ExecDispatcher,
    bios: Option<Vec<u8>>,
}

impl<P: Processor> Machine<P> {
    pub fn new(config: MachineConfig, cpu: P) -> Result<Self, MachineError> {
        config.validate()?;

        let pic: SharedPic = Rc::new(RefCell::new(DualPic8259::new()));
        let mut io = IoPortBus::new();
        register_pic(&mut io, &pic);

        let mut machine = Self {
            memory: PhysicalAddressSpace::new(config.ram_size_bytes),
            dispatcher: ExecDispatcher::new(
                config.max_blocks_per_slice,
                config.instructions_between_interrupts,
            ),
            config,
            pic,
            cpu,
            io,
            bios: None,
        };
        machine.configure()?;
        Ok(machine)
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn memory(&self) -> &PhysicalAddressSpace {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut PhysicalAddressSpace {
        &mut self.memory
    }

    pub fn cpu(&self) -> &P {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut P {
        &mut self.cpu
    }

    pub fn pic(&self) -> SharedPic {
        self.pic.clone()
    }

    pub fn io_mut(&mut self) -> &mut IoPortBus {
        &mut self.io
    }

    pub fn trace_trap(&self) -> TraceTrap {
        self.dispatcher.trace_trap()
    }

    /// Install a system BIOS image ending at 1 MiB. The image is re-mapped on every reset.
    pub fn set_system_bios(&mut self, image: Vec<u8>) -> Result<(), MachineError> {
        self.memory.load_system_bios(&image)?;
        self.bios = Some(image);
        Ok(())
    }

    /// Reset every part in construction order, then re-apply the configuration.
    pub fn reset(&mut self) -> Result<(), MachineError> {
        info!("machine reset");
        self.memory.reset();
        self.pic.borrow_mut().reset();
        self.cpu.reset();
        self.io.reset();
        self.dispatcher.reset();
        self.configure()
    }

    fn configure(&mut self) -> Result<(), MachineError> {
        for (start, end) in self.config.ram_ranges() {
            for addr in (start..end).step_by(BLOCK_SIZE) {
                self.memory.allocate_memory(addr, MemoryBlock::ram())?;
            }
        }
        if let Some(image) = &self.bios {
            self.memory.load_system_bios(image)?;
        }
        self.memory.set_gate_a20_state(self.config.a20_enabled_at_reset);

        let mut pic = self.pic.borrow_mut();
        pic.init_legacy(self.config.master_vector_base, self.config.slave_vector_base);
        forward_intr(&pic, &mut self.cpu);
        debug!(
            ram = self.config.ram_size_bytes,
            a20 = self.config.a20_enabled_at_reset,
            "machine configured"
        );
        Ok(())
    }

    /// Run one slice and return the number of instructions retired. A triple fault resets the
    /// whole machine before returning.
    ///
    /// A fetch from unconnected memory is an [`MachineError::Exec`] error. Use
    /// [`Machine::execute_slice`] to also get the instructions retired before it.
    pub fn execute(&mut self) -> Result<u32, MachineError> {
        let slice = self.execute_slice()?;
        match slice.exit {
            SliceExit::Unconnected(err) => Err(err.into()),
            _ => Ok(slice.executed),
        }
    }

    /// [`Machine::execute`], reporting why the slice ended.
    pub fn execute_slice(&mut self) -> Result<Slice, MachineError> {
        let slice = {
            let mut pic = self.pic.borrow_mut();
            self.dispatcher.run_slice(&mut self.cpu, &mut self.memory, &mut pic)
        };
        if slice.exit == SliceExit::TripleFault {
            warn!(executed = slice.executed, "resetting machine after triple fault");
            self.reset()?;
        }
        Ok(slice)
    }

    pub fn get_and_clear_triple_faulted(&self) -> bool {
        self.dispatcher.get_and_clear_triple_faulted()
    }

    pub fn get_and_clear_trace_trap(&self) -> bool {
        self.dispatcher.get_and_clear_trace_trap()
    }

    /// Drive interrupt input `line` (0-15).
    pub fn set_irq(&mut self, line: u8, level: bool) {
        let mut pic = self.pic.borrow_mut();
        pic.set_irq(line, level);
        forward_intr(&pic, &mut self.cpu);
    }

    /// Acknowledge the highest priority interrupt and return its vector.
    pub fn cpu_get_interrupt(&mut self) -> u8 {
        let mut pic = self.pic.borrow_mut();
        let vector = pic.cpu_get_interrupt();
        forward_intr(&pic, &mut self.cpu);
        vector
    }

    pub fn io_read(&mut self, port: u16, size: u8) -> u32 {
        let value = self.io.read(port, size);
        forward_intr(&self.pic.borrow(), &mut self.cpu);
        value
    }

    pub fn io_write(&mut self, port: u16, size: u8, value: u32) {
        self.io.write(port, size, value);
        forward_intr(&self.pic.borrow(), &mut self.cpu);
    }
}

const TAG_MEMORY: u16 = 1;
const TAG_PIC: u16 = 2;
const TAG_EXEC: u16 = 3;

impl<P: Processor> IoSnapshot for Machine<P> {
    const DEVICE_ID: [u8; 4] = *b"MACH";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    /// Processor state is owned by the caller and not included.
    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_MEMORY, self.memory.save_state());
        w.field_bytes(TAG_PIC, self.pic.borrow().save_state());
        w.field_bytes(TAG_EXEC, self.dispatcher.save_state());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        let memory = r
            .bytes(TAG_MEMORY)
            .ok_or(SnapshotError::InvalidFieldEncoding("missing address space"))?;
        let pic_bytes = r
            .bytes(TAG_PIC)
            .ok_or(SnapshotError::InvalidFieldEncoding("missing interrupt controller"))?;

        // Decode the small parts first. The address space restore is all-or-nothing and runs
        // last.
        let mut pic = DualPic8259::new();
        pic.load_state(pic_bytes)?;
        if let Some(exec) = r.bytes(TAG_EXEC) {
            let mut staged = ExecDispatcher::default();
            staged.load_state(exec)?;
        }
        self.memory.load_state(memory)?;

        *self.pic.borrow_mut() = pic;
        if let Some(exec) = r.bytes(TAG_EXEC) {
            self.dispatcher.load_state(exec)?;
        }
        Ok(())
    }
}

impl<P: Processor> Machine<P> {
    /// [`IoSnapshot::load_state`] with the machine's error type. The processor's INTR input is
    /// re-driven from the restored controller state.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), MachineError> {
        self.load_state(bytes)?;
        let pic = self.pic.borrow();
        // Latched requests were consumed before the save; derive the level instead.
        pic.take_intr_clear();
        pic.take_intr_raise();
        if pic.get_irq().is_some() {
            self.cpu.raise_interrupt();
        } else {
            self.cpu.clear_interrupt();
        }
        Ok(())
    }
}
