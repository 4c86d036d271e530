use ferrite_memory::{ExecError, MapError};
use ferrite_snapshot::SnapshotError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("invalid machine configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("snapshot restore failed: {0}")]
    Snapshot(#[from] SnapshotError),
}
