//! Bounded execution slices: block dispatch by CPU mode, interrupt cadence and fault exits.

use ferrite_cpu_core::{
    CpuExit, CpuMode, EventFlag, ExecutionSpace, LinearAddressSpace, Processor,
    ProcessorException, TraceTrap,
};
use ferrite_interrupts::DualPic8259;
use ferrite_memory::{ExecError, PhysicalAddressSpace};
use ferrite_snapshot::{IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter};
use tracing::{debug, warn};

/// Instruction blocks run by one slice unless configured otherwise.
pub const DEFAULT_MAX_BLOCKS_PER_SLICE: u32 = 100;

/// Interrupts are offered to the processor after every instruction by default.
pub const INSTRUCTIONS_BETWEEN_INTERRUPTS: u32 = 1;

/// Why a slice returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceExit {
    /// The block budget was used up.
    Completed,
    /// A collaborator armed the trace trap.
    TraceTrap,
    /// The processor changed mode; the next slice re-derives it.
    ModeSwitch,
    /// An exception was raised and handed to the processor's handler.
    Exception(ProcessorException),
    /// Exception delivery escalated past a double fault. The machine must be reset.
    TripleFault,
    /// The next block would have been fetched from unconnected memory.
    Unconnected(ExecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub executed: u32,
    pub exit: SliceExit,
}

/// Forward the controller's INTR pin requests to the processor.
pub(crate) fn forward_intr<P: Processor + ?Sized>(pic: &DualPic8259, cpu: &mut P) {
    if pic.take_intr_clear() {
        cpu.clear_interrupt();
    }
    if pic.take_intr_raise() {
        cpu.raise_interrupt();
    }
}

/// Drives the processor in bounded slices.
///
/// The triple fault and trace trap hit flags are sticky: they survive [`ExecDispatcher::reset`]
/// and are only cleared by their take accessors.
#[derive(Debug)]
pub struct ExecDispatcher {
    max_blocks: u32,
    cadence: u32,
    since_delivery: u32,
    trace_trap: TraceTrap,
    trace_hit: EventFlag,
    triple_faulted: EventFlag,
}

impl Default for ExecDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BLOCKS_PER_SLICE, INSTRUCTIONS_BETWEEN_INTERRUPTS)
    }
}

impl ExecDispatcher {
    pub fn new(max_blocks: u32, cadence: u32) -> Self {
        Self {
            max_blocks: max_blocks.max(1),
            cadence: cadence.max(1),
            since_delivery: 0,
            trace_trap: TraceTrap::new(),
            trace_hit: EventFlag::new(),
            triple_faulted: EventFlag::new(),
        }
    }

    pub fn max_blocks(&self) -> u32 {
        self.max_blocks
    }

    /// Handle for collaborators that stop the run loop, e.g. a single-step debugger.
    pub fn trace_trap(&self) -> TraceTrap {
        self.trace_trap.clone()
    }

    pub fn get_and_clear_trace_trap(&self) -> bool {
        self.trace_hit.take()
    }

    pub fn get_and_clear_triple_faulted(&self) -> bool {
        self.triple_faulted.take()
    }

    pub fn reset(&mut self) {
        self.since_delivery = 0;
        self.trace_trap.reset();
    }

    /// Run at most `max_blocks` instruction blocks.
    ///
    /// On [`SliceExit::TripleFault`] the dispatcher has latched its flags; resetting the machine
    /// is the caller's job.
    pub fn run_slice<P: Processor + ?Sized>(
        &mut self,
        cpu: &mut P,
        memory: &mut PhysicalAddressSpace,
        pic: &mut DualPic8259,
    ) -> Slice {
        let mode = cpu.mode();
        memory.set_paging_active(cpu.is_paging_enabled());

        let mut executed = 0u32;
        for _ in 0..self.max_blocks {
            let step = if mode.uses_linear_space() {
                LinearAddressSpace::new(memory).execute_in_mode(cpu, mode)
            } else {
                memory.execute_in_mode(cpu, mode)
            };

            let exit = match step {
                Ok(count) => {
                    executed = executed.saturating_add(count);
                    self.since_delivery = self.since_delivery.saturating_add(count);
                    if self.since_delivery >= self.cadence {
                        cpu.process_interrupts(mode, self.since_delivery, pic);
                        forward_intr(pic, cpu);
                        self.since_delivery = 0;
                    }
                    if self.trace_trap.get_and_clear_trap_active() {
                        self.trace_hit.set();
                        Some(SliceExit::TraceTrap)
                    } else {
                        None
                    }
                }
                Err(CpuExit::ModeSwitch) => {
                    debug!(?mode, executed, "mode switch ends slice");
                    Some(SliceExit::ModeSwitch)
                }
                Err(CpuExit::Exception(exception)) => Some(self.deliver(cpu, mode, exception)),
                Err(CpuExit::TripleFault) => Some(self.triple_fault(mode)),
                Err(CpuExit::Unconnected(err)) => {
                    debug!(?mode, executed, %err, "fetch from unconnected memory ends slice");
                    Some(SliceExit::Unconnected(err))
                }
            };

            if let Some(exit) = exit {
                return Slice { executed, exit };
            }
        }

        Slice {
            executed,
            exit: SliceExit::Completed,
        }
    }

    fn deliver<P: Processor + ?Sized>(
        &mut self,
        cpu: &mut P,
        mode: CpuMode,
        exception: ProcessorException,
    ) -> SliceExit {
        debug!(?mode, %exception, "delivering exception");
        match cpu.handle_exception(mode, exception) {
            Ok(()) => SliceExit::Exception(exception),
            Err(CpuExit::TripleFault) => self.triple_fault(mode),
            Err(CpuExit::ModeSwitch) => SliceExit::ModeSwitch,
            Err(other) => {
                warn!(%exception, %other, "exception handler failed");
                SliceExit::Exception(exception)
            }
        }
    }

    fn triple_fault(&mut self, mode: CpuMode) -> SliceExit {
        warn!(?mode, "triple fault");
        self.triple_faulted.set();
        self.trace_hit.set();
        SliceExit::TripleFault
    }
}

const TAG_SINCE_DELIVERY: u16 = 1;
const TAG_TRACE_ARMED: u16 = 2;
const TAG_TRACE_HIT: u16 = 3;
const TAG_TRIPLE_FAULTED: u16 = 4;

impl IoSnapshot for ExecDispatcher {
    const DEVICE_ID: [u8; 4] = *b"EXEC";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u32(TAG_SINCE_DELIVERY, self.since_delivery);
        w.field_bool(TAG_TRACE_ARMED, self.trace_trap.is_active());
        w.field_bool(TAG_TRACE_HIT, self.trace_hit.peek());
        w.field_bool(TAG_TRIPLE_FAULTED, self.triple_faulted.peek());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        let since_delivery = r.u32(TAG_SINCE_DELIVERY)?.unwrap_or(0);
        let armed = r.bool(TAG_TRACE_ARMED)?.unwrap_or(false);
        let hit = r.bool(TAG_TRACE_HIT)?.unwrap_or(false);
        let triple = r.bool(TAG_TRIPLE_FAULTED)?.unwrap_or(false);

        // Flags are updated in place; collaborators hold clones of the trace trap.
        self.since_delivery = since_delivery;
        self.trace_trap.reset();
        if armed {
            self.trace_trap.trigger();
        }
        set_flag(&self.trace_hit, hit);
        set_flag(&self.triple_faulted, triple);
        Ok(())
    }
}

fn set_flag(flag: &EventFlag, value: bool) {
    if value {
        flag.set();
    } else {
        flag.clear();
    }
}
