//! Processor exception taxonomy and the double/triple fault escalation rules.

use std::fmt;

use tracing::{debug, warn};

/// Architectural exception kinds, plus the emulator-internal `TraceStop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    DivideError,
    Debug,
    Breakpoint,
    Overflow,
    BoundRange,
    Undefined,
    NoFpu,
    DoubleFault,
    FpuSegmentOverrun,
    TaskSwitch,
    NotPresent,
    StackSegment,
    GeneralProtection,
    PageFault,
    FloatingPoint,
    AlignmentCheck,
    MachineCheck,
    SimdFloatingPoint,
    /// Raised by the trace machinery to stop execution at an instruction boundary.
    TraceStop,
}

impl ExceptionKind {
    pub const ALL: [ExceptionKind; 19] = [
        ExceptionKind::DivideError,
        ExceptionKind::Debug,
        ExceptionKind::Breakpoint,
        ExceptionKind::Overflow,
        ExceptionKind::BoundRange,
        ExceptionKind::Undefined,
        ExceptionKind::NoFpu,
        ExceptionKind::DoubleFault,
        ExceptionKind::FpuSegmentOverrun,
        ExceptionKind::TaskSwitch,
        ExceptionKind::NotPresent,
        ExceptionKind::StackSegment,
        ExceptionKind::GeneralProtection,
        ExceptionKind::PageFault,
        ExceptionKind::FloatingPoint,
        ExceptionKind::AlignmentCheck,
        ExceptionKind::MachineCheck,
        ExceptionKind::SimdFloatingPoint,
        ExceptionKind::TraceStop,
    ];

    pub const fn vector(self) -> u8 {
        match self {
            ExceptionKind::DivideError => 0x00,
            ExceptionKind::Debug => 0x01,
            ExceptionKind::Breakpoint => 0x03,
            ExceptionKind::Overflow => 0x04,
            ExceptionKind::BoundRange => 0x05,
            ExceptionKind::Undefined => 0x06,
            ExceptionKind::NoFpu => 0x07,
            ExceptionKind::DoubleFault => 0x08,
            ExceptionKind::FpuSegmentOverrun => 0x09,
            ExceptionKind::TaskSwitch => 0x0A,
            ExceptionKind::NotPresent => 0x0B,
            ExceptionKind::StackSegment => 0x0C,
            ExceptionKind::GeneralProtection => 0x0D,
            ExceptionKind::PageFault => 0x0E,
            ExceptionKind::FloatingPoint => 0x10,
            ExceptionKind::AlignmentCheck => 0x11,
            ExceptionKind::MachineCheck => 0x12,
            ExceptionKind::SimdFloatingPoint => 0x13,
            ExceptionKind::TraceStop => 0x14,
        }
    }

    pub fn from_vector(vector: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.vector() == vector)
    }

    /// Saved-state encoding: `vector + 1`, so that zero never names a kind.
    pub const fn to_numeric(self) -> u8 {
        self.vector() + 1
    }

    pub fn from_numeric(id: u8) -> Option<Self> {
        id.checked_sub(1).and_then(Self::from_vector)
    }

    pub const fn name(self) -> &'static str {
        match self {
            ExceptionKind::DivideError => "DIVIDE_ERROR",
            ExceptionKind::Debug => "DEBUG",
            ExceptionKind::Breakpoint => "BREAKPOINT",
            ExceptionKind::Overflow => "OVERFLOW",
            ExceptionKind::BoundRange => "BOUND_RANGE",
            ExceptionKind::Undefined => "UNDEFINED",
            ExceptionKind::NoFpu => "NO_FPU",
            ExceptionKind::DoubleFault => "DOUBLE_FAULT",
            ExceptionKind::FpuSegmentOverrun => "FPU_SEGMENT_OVERRUN",
            ExceptionKind::TaskSwitch => "TASK_SWITCH",
            ExceptionKind::NotPresent => "NOT_PRESENT",
            ExceptionKind::StackSegment => "STACK_SEGMENT",
            ExceptionKind::GeneralProtection => "GENERAL_PROTECTION",
            ExceptionKind::PageFault => "PAGE_FAULT",
            ExceptionKind::FloatingPoint => "FLOATING_POINT",
            ExceptionKind::AlignmentCheck => "ALIGNMENT_CHECK",
            ExceptionKind::MachineCheck => "MACHINE_CHECK",
            ExceptionKind::SimdFloatingPoint => "SIMD_FLOATING_POINT",
            ExceptionKind::TraceStop => "TRACESTOP",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
}

impl ExceptionClass {
    fn of(kind: ExceptionKind) -> Self {
        match kind {
            ExceptionKind::PageFault => Self::PageFault,
            ExceptionKind::DivideError
            | ExceptionKind::TaskSwitch
            | ExceptionKind::NotPresent
            | ExceptionKind::StackSegment
            | ExceptionKind::GeneralProtection => Self::Contributory,
            _ => Self::Benign,
        }
    }
}

/// Whether raising `new` while `in_delivery` is being delivered escalates to a double fault.
pub fn combines_to_double_fault(in_delivery: ExceptionKind, new: ExceptionKind) -> bool {
    use ExceptionClass as C;
    matches!(
        (C::of(in_delivery), C::of(new)),
        (C::Contributory, C::Contributory | C::PageFault) | (C::PageFault, C::PageFault)
    )
}

/// A raised processor exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorException {
    kind: ExceptionKind,
    error_code: Option<u32>,
    points_to_self: bool,
}

impl ProcessorException {
    pub const DIVIDE_ERROR: Self = Self::new(ExceptionKind::DivideError, true);
    pub const BOUND_RANGE: Self = Self::new(ExceptionKind::BoundRange, true);
    pub const UNDEFINED: Self = Self::new(ExceptionKind::Undefined, true);
    pub const DOUBLE_FAULT_0: Self = Self::with_error_code(ExceptionKind::DoubleFault, 0, true);
    pub const STACK_SEGMENT_0: Self = Self::with_error_code(ExceptionKind::StackSegment, 0, true);
    pub const GENERAL_PROTECTION_0: Self =
        Self::with_error_code(ExceptionKind::GeneralProtection, 0, true);
    pub const FLOATING_POINT: Self = Self::new(ExceptionKind::FloatingPoint, true);
    pub const ALIGNMENT_CHECK_0: Self =
        Self::with_error_code(ExceptionKind::AlignmentCheck, 0, true);
    pub const TRACESTOP: Self = Self::new(ExceptionKind::TraceStop, true);

    /// `points_to_self` means the saved instruction pointer refers to the faulting instruction
    /// rather than the next one.
    pub const fn new(kind: ExceptionKind, points_to_self: bool) -> Self {
        Self {
            kind,
            error_code: None,
            points_to_self,
        }
    }

    pub const fn with_error_code(kind: ExceptionKind, error_code: u32, points_to_self: bool) -> Self {
        Self {
            kind,
            error_code: Some(error_code),
            points_to_self,
        }
    }

    pub fn kind(&self) -> ExceptionKind {
        self.kind
    }

    pub fn vector(&self) -> u8 {
        self.kind.vector()
    }

    pub fn error_code(&self) -> Option<u32> {
        self.error_code
    }

    pub fn points_to_self(&self) -> bool {
        self.points_to_self
    }

    pub fn combines_to_double_fault(&self, in_delivery: &ProcessorException) -> bool {
        combines_to_double_fault(in_delivery.kind, self.kind)
    }
}

impl fmt::Display for ProcessorException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_code {
            Some(code) => write!(f, "Processor Exception: {} [errorcode:{code:#x}]", self.kind),
            None => write!(f, "Processor Exception: {}", self.kind),
        }
    }
}

impl std::error::Error for ProcessorException {}

/// What a collaborator must do with a newly raised exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStep {
    Deliver(ProcessorException),
    DoubleFault,
    TripleFault,
}

/// Tracks the exception currently being delivered so that nested faults escalate correctly.
///
/// Collaborators call [`FaultChain::raise`] when an exception occurs and [`FaultChain::complete`]
/// once the handler has been entered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultChain {
    in_delivery: Option<ProcessorException>,
}

impl FaultChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_delivery(&self) -> Option<&ProcessorException> {
        self.in_delivery.as_ref()
    }

    pub fn raise(&mut self, new: ProcessorException) -> FaultStep {
        let step = match self.in_delivery {
            None => FaultStep::Deliver(new),
            Some(prev) if prev.kind == ExceptionKind::DoubleFault => FaultStep::TripleFault,
            Some(prev) if new.combines_to_double_fault(&prev) => FaultStep::DoubleFault,
            Some(_) => FaultStep::Deliver(new),
        };
        match step {
            FaultStep::DoubleFault => debug!(%new, "escalating to double fault"),
            FaultStep::TripleFault => warn!(%new, "fault during double fault delivery"),
            FaultStep::Deliver(_) => {}
        }
        self.in_delivery = match step {
            FaultStep::Deliver(exc) => Some(exc),
            FaultStep::DoubleFault => Some(ProcessorException::DOUBLE_FAULT_0),
            FaultStep::TripleFault => None,
        };
        step
    }

    pub fn complete(&mut self) {
        self.in_delivery = None;
    }
}
