//! CP/M 2.2 user-space emulator core.
//!
//! - `emulator::CpmEmulator`: drives a `z80emu` CPU over a flat 64 KiB
//!   address space, trapping BDOS calls at `CALL 0x0005` and BIOS calls
//!   through a synthetic jump table.
//! - `bdos`: FCB codec, BDOS function table, open-file/find-state caches.
//! - `fs::DriveFS`: per-drive filesystem abstraction (host directories, an
//!   in-memory backend for tests, and the embedded read-only volume).
//! - `console`: character I/O and keystroke-source abstractions.

pub mod bdos;
pub mod console;
pub mod emulator;
pub mod error;
pub mod fs;
pub mod memory;
pub mod printer;

pub use bdos::{Fcb, FileHandleCache, FindState};
pub use console::{CpmConsole, HeadlessConsole};
pub use emulator::CpmEmulator;
pub use error::{CpmError, CpmResult};
pub use fs::{to_8_3, DriveFS, HostDriveFS, MemoryDriveFS, UnionDriveFS};
pub use memory::Memory;
pub use printer::PrinterSink;

/// Reason for program exit.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// Guest requested P_TERMCPM (BDOS function 0)
    Exit,
    /// Cold/warm boot, or a trap at PC=0
    Boot,
    /// CPU halted without a prior explicit exit
    Halt,
    /// Unknown BDOS/BIOS function number
    Unimplemented(u8),
    /// Host-driven cancellation
    Timeout,
    /// Ctrl-C threshold hit in the line editor (converted to `Boot` by the run loop)
    Interrupted,
    /// Host-command escape produced output to print before re-entering input
    ShowOutput(String),
    /// Unrecoverable error
    Error(String),
}

/// Information about program exit.
#[derive(Debug, Clone)]
pub struct CpmExitInfo {
    pub reason: ExitReason,
    pub t_states: u64,
    pub pc: u16,
}
