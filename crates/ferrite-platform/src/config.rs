use ferrite_memory::BLOCK_SIZE;
use serde::{Deserialize, Serialize};

use crate::error::MachineError;
use crate::exec::{DEFAULT_MAX_BLOCKS_PER_SLICE, INSTRUCTIONS_BETWEEN_INTERRUPTS};

/// Start of the legacy video/option ROM hole left out of system RAM.
pub const LEGACY_HOLE_START: u32 = 0x000A_0000;
/// End (exclusive) of the legacy hole.
pub const LEGACY_HOLE_END: u32 = 0x0010_0000;

/// Configuration for [`crate::Machine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    /// Guest RAM size in bytes. Must be a non-zero multiple of the 4 KiB block size.
    pub ram_size_bytes: u32,
    /// A20 gate state after every reset.
    pub a20_enabled_at_reset: bool,
    /// Upper bound on instruction blocks run by one `execute` call.
    pub max_blocks_per_slice: u32,
    /// Instructions retired between interrupt delivery attempts.
    pub instructions_between_interrupts: u32,
    /// ICW2 programmed into the master controller at reset.
    pub master_vector_base: u8,
    /// ICW2 programmed into the slave controller at reset.
    pub slave_vector_base: u8,
    /// Back `[0, ram_size_bytes)` with RAM at reset, except the `0xA0000..0x100000` hole.
    pub map_system_ram: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size_bytes: 16 * 1024 * 1024,
            a20_enabled_at_reset: false,
            max_blocks_per_slice: DEFAULT_MAX_BLOCKS_PER_SLICE,
            instructions_between_interrupts: INSTRUCTIONS_BETWEEN_INTERRUPTS,
            master_vector_base: 0x08,
            slave_vector_base: 0x70,
            map_system_ram: true,
        }
    }
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), MachineError> {
        let invalid = |msg: String| Err(MachineError::InvalidConfig(msg));

        if self.ram_size_bytes == 0 || self.ram_size_bytes as usize % BLOCK_SIZE != 0 {
            return invalid(format!(
                "ram_size_bytes={:#x} must be a non-zero multiple of {BLOCK_SIZE:#x}",
                self.ram_size_bytes
            ));
        }
        if self.max_blocks_per_slice == 0 {
            return invalid("max_blocks_per_slice must be >= 1".into());
        }
        if self.instructions_between_interrupts == 0 {
            return invalid("instructions_between_interrupts must be >= 1".into());
        }
        for (name, base) in [
            ("master_vector_base", self.master_vector_base),
            ("slave_vector_base", self.slave_vector_base),
        ] {
            if base & 0x07 != 0 {
                return invalid(format!("{name}={base:#04x} must be a multiple of 8"));
            }
        }
        Ok(())
    }

    /// Block-aligned RAM ranges allocated at reset.
    pub(crate) fn ram_ranges(&self) -> impl Iterator<Item = (u32, u32)> {
        let end = self.ram_size_bytes;
        let enabled = self.map_system_ram;
        let low = (0, end.min(LEGACY_HOLE_START));
        let high = (LEGACY_HOLE_END, end);
        [low, high]
            .into_iter()
            .filter(move |&(start, stop)| enabled && start < stop)
    }
}
