#![forbid(unsafe_code)]

//! Deterministic save/restore encoding shared by every emulated component.

pub mod state;

pub use state::{
    codec, IoSnapshot, SnapshotError, SnapshotHeader, SnapshotReader, SnapshotResult,
    SnapshotVersion, SnapshotWriter,
};
