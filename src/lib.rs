//! # shimproxy
//!
//! Translation proxy for a shimmed libc: a client library forwards its
//! POSIX network calls over a TCP connection, the proxy performs each call
//! against a pluggable syscall layer and sends back an errno code plus the
//! raw result.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(unix)]
//! # fn main() -> shimproxy::Result<()> {
//! use std::sync::Arc;
//! use shimproxy::{HostSyscalls, ProxyConfig, Server};
//!
//! let config = ProxyConfig::new().shim("(CompressionShim)");
//! let server = Server::bind(config, Arc::new(HostSyscalls::new()))?;
//! server.serve()
//! # }
//! # #[cfg(not(unix))]
//! # fn main() {}
//! ```
//!
//! ## Wire format
//!
//! Requests carry a 19-byte NUL-padded call name followed by a
//! comma-separated argument field. Responses carry a 4-byte signed errno
//! (`-1` on success) followed by the call's result bytes.

pub mod call;
pub mod config;
pub mod connection;
pub mod errno;
mod error;
pub mod handlers;
pub mod port;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod shim;
pub mod syscalls;

#[cfg(unix)]
pub mod host;

// Re-exports
pub use call::{dispatch, Call};
pub use config::{ProxyConfig, DEFAULT_PORT, DEFAULT_TIMEOUT};
pub use connection::ConnectionHandler;
pub use error::{Error, Result};
pub use port::{get_available_port, ConnKind, StaticResources};
pub use protocol::{ByteOrder, RequestFrame, ResponseFrame};
pub use retry::block_call;
pub use server::Server;
pub use shim::{ShimListener, ShimLayer, ShimStack, ShimStream};
pub use syscalls::{
    NetSyscalls, ResourceAccounting, Resources, SyscallError, SyscallFailure, SyscallResult,
};

#[cfg(unix)]
pub use host::HostSyscalls;
