/// Execution mode, derived from live processor flags before every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuMode {
    Real,
    Protected,
    Virtual8086,
}

impl CpuMode {
    /// `virtual8086` (EFLAGS.VM) only matters once protection (CR0.PE) is enabled.
    pub const fn from_flags(protected: bool, virtual8086: bool) -> Self {
        match (protected, virtual8086) {
            (false, _) => CpuMode::Real,
            (true, false) => CpuMode::Protected,
            (true, true) => CpuMode::Virtual8086,
        }
    }

    /// Whether instruction fetches go through linear address translation.
    pub const fn uses_linear_space(self) -> bool {
        !matches!(self, CpuMode::Real)
    }
}
