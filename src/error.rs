//! Error types for PTY operations

use std::io;
use thiserror::Error;

/// PTY host error type
#[derive(Error, Debug)]
pub enum Error {
    /// A required spawn option was missing or out of range.
    /// Raised synchronously, before any OS resource is touched.
    #[error("invalid spawn options: {0}")]
    InvalidArguments(&'static str),

    /// The host OS cannot provide a PTY (Windows before 10 1809 lacks ConPTY)
    #[error("platform not supported: {0}")]
    PlatformNotSupported(&'static str),

    /// The native spawn failed before the child was running
    #[error("failed to spawn child (os error {os_error}): {message}")]
    SpawnFailed { os_error: i32, message: String },

    /// CreatePseudoConsole or ResizePseudoConsole returned a failure HRESULT
    #[error("pseudoconsole call failed (hresult {hresult:#010x})")]
    PseudoConsoleFailed { hresult: i32 },

    /// The window-size ioctl or pseudoconsole resize failed
    #[error("failed to resize PTY (os error {os_error})")]
    ResizeFailed { os_error: i32 },

    /// Operation on a connection whose resources were already released
    #[error("PTY connection already disposed")]
    AlreadyDisposed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for PTY operations
pub type Result<T> = std::result::Result<T, Error>;
