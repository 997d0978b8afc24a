//! Error types for CP/M emulator.

use thiserror::Error;

/// Errors that can occur during CP/M emulation.
#[derive(Error, Debug)]
pub enum CpmError {
    #[error("Read-only filesystem")]
    ReadOnly,

    #[error("End of file")]
    Eof,

    #[error("Unimplemented BDOS function {0}")]
    Unimplemented(u8),

    #[error("Run cancelled")]
    Timeout,

    #[error("Interrupted by Ctrl-C")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for CP/M operations.
pub type CpmResult<T> = Result<T, CpmError>;
