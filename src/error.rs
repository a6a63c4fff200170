//! Error types for shimproxy.

use thiserror::Error;

use crate::port::ConnKind;

/// Result type alias using shimproxy's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving POSIX calls.
#[derive(Error, Debug)]
pub enum Error {
    // Dispatch errors
    #[error("unknown error name: {0}")]
    UnknownErrorName(String),

    #[error("the call '{0}' could not be recognized")]
    UnrecognizedCall(String),

    /// A failure from the syscall layer that is neither "unimplemented"
    /// nor a named POSIX condition.
    #[error("{call} failed: {message}")]
    Syscall { call: &'static str, message: String },

    // Port allocation errors
    #[error("conn kind must be udp or tcp, got '{0}'")]
    InvalidConnKind(String),

    #[error("no local {0} ports available")]
    NoPortsAvailable(ConnKind),

    // Configuration errors
    #[error("invalid shim configuration: {0}")]
    InvalidShim(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Wire errors
    #[error("malformed frame: {0}")]
    Frame(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
