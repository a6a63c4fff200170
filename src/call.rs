//! The closed set of POSIX calls the proxy understands.

use std::fmt;

use crate::error::{Error, Result};
use crate::handlers::{self, Handler};
use crate::protocol::ResponseFrame;
use crate::syscalls::NetSyscalls;

/// A POSIX call recognized on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Socket,
    Bind,
    Accept,
    Connect,
    Listen,
    Close,
    Shutdown,
    Setsockopt,
    Getsockopt,
    Getpeername,
    Getsockname,
    Send,
    Sendto,
    Write,
    Recv,
    Recvfrom,
    Read,
    Ioctl,
    Fcntl,
    Select,
}

impl Call {
    pub const ALL: [Call; 20] = [
        Call::Socket,
        Call::Bind,
        Call::Accept,
        Call::Connect,
        Call::Listen,
        Call::Close,
        Call::Shutdown,
        Call::Setsockopt,
        Call::Getsockopt,
        Call::Getpeername,
        Call::Getsockname,
        Call::Send,
        Call::Sendto,
        Call::Write,
        Call::Recv,
        Call::Recvfrom,
        Call::Read,
        Call::Ioctl,
        Call::Fcntl,
        Call::Select,
    ];

    /// The name used in the call-name field.
    pub fn name(self) -> &'static str {
        match self {
            Call::Socket => "socket",
            Call::Bind => "bind",
            Call::Accept => "accept",
            Call::Connect => "connect",
            Call::Listen => "listen",
            Call::Close => "close",
            Call::Shutdown => "shutdown",
            Call::Setsockopt => "setsockopt",
            Call::Getsockopt => "getsockopt",
            Call::Getpeername => "getpeername",
            Call::Getsockname => "getsockname",
            Call::Send => "send",
            Call::Sendto => "sendto",
            Call::Write => "write",
            Call::Recv => "recv",
            Call::Recvfrom => "recvfrom",
            Call::Read => "read",
            Call::Ioctl => "ioctl",
            Call::Fcntl => "fcntl",
            Call::Select => "select",
        }
    }

    /// Resolve a wire name, failing with `UnrecognizedCall`.
    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|call| call.name() == name)
            .ok_or_else(|| Error::UnrecognizedCall(name.to_string()))
    }

    /// The handler serving this call.
    pub fn handler(self) -> Handler {
        match self {
            Call::Socket => handlers::call_socket,
            Call::Bind => handlers::call_bind,
            Call::Accept => handlers::call_accept,
            Call::Connect => handlers::call_connect,
            Call::Listen => handlers::call_listen,
            Call::Close => handlers::call_close,
            Call::Shutdown => handlers::call_shutdown,
            Call::Setsockopt => handlers::call_setsockopt,
            Call::Getsockopt => handlers::call_getsockopt,
            Call::Getpeername => handlers::call_getpeername,
            Call::Getsockname => handlers::call_getsockname,
            Call::Send => handlers::call_send,
            Call::Sendto => handlers::call_sendto,
            Call::Write => handlers::call_write,
            Call::Recv => handlers::call_recv,
            Call::Recvfrom => handlers::call_recvfrom,
            Call::Read => handlers::call_read,
            Call::Ioctl => handlers::call_ioctl,
            Call::Fcntl => handlers::call_fcntl,
            Call::Select => handlers::call_select,
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Call {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

/// Run `call` with its raw argument field against the syscall layer.
pub fn dispatch(call: Call, net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    (call.handler())(net, args)
}
