//! Filesystem abstractions for the CP/M emulator.
//!
//! - `DriveFS`: low-level drive interface (A..P), with `HostDriveFS` and
//!   `MemoryDriveFS` implementations.
//! - `UnionDriveFS`: a host directory layered over the embedded read-only
//!   volume (`virtual_volume`).

mod drive_fs;
mod memory_drive;
mod union_drive;
pub mod virtual_volume;

pub use drive_fs::{to_8_3, DriveFS, HostDriveFS};
pub use memory_drive::MemoryDriveFS;
pub use union_drive::UnionDriveFS;
pub use virtual_volume::VirtualVolumeFS;
