//! Contract of the sandboxed network layer the proxy dispatches into.
//!
//! The proxy never implements socket semantics itself. Every POSIX call is
//! forwarded to a [`NetSyscalls`] implementation, and port accounting is
//! read from a [`ResourceAccounting`] service.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

/// A failure carrying the symbolic POSIX name of the condition, e.g.
/// `EBADF`. The name is translated through the error table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{call}: {name} ({message})")]
pub struct SyscallError {
    pub call: &'static str,
    pub name: String,
    pub message: String,
}

/// How a syscall can fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyscallFailure {
    /// The layer has no implementation for this call or these arguments.
    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    /// A specific POSIX condition.
    #[error(transparent)]
    Named(SyscallError),

    /// Anything else. Handlers do not translate these.
    #[error("{call} failed: {message}")]
    Other { call: &'static str, message: String },
}

impl SyscallFailure {
    pub fn named(call: &'static str, name: impl Into<String>, message: impl Into<String>) -> Self {
        SyscallFailure::Named(SyscallError {
            call,
            name: name.into(),
            message: message.into(),
        })
    }
}

pub type SyscallResult<T> = std::result::Result<T, SyscallFailure>;

/// Socket primitives of the sandboxed network stack.
///
/// Descriptors are the layer's own handles, not host file descriptors.
/// Implementations are shared by every connection thread.
pub trait NetSyscalls: Send + Sync {
    fn socket_syscall(&self, domain: i32, socktype: i32, protocol: i32) -> SyscallResult<i32>;

    fn bind_syscall(&self, fd: i32, ip: &str, port: u16) -> SyscallResult<i32>;

    /// Returns `(remote_ip, remote_port, new_fd)`.
    fn accept_syscall(&self, fd: i32) -> SyscallResult<(String, u16, i32)>;

    fn connect_syscall(&self, fd: i32, ip: &str, port: u16) -> SyscallResult<i32>;

    fn listen_syscall(&self, fd: i32, backlog: i32) -> SyscallResult<i32>;

    /// Returns the number of bytes sent.
    fn send_syscall(&self, fd: i32, message: &[u8], flags: i32) -> SyscallResult<usize>;

    fn recv_syscall(&self, fd: i32, length: usize, flags: i32) -> SyscallResult<Vec<u8>>;

    fn sendto_syscall(
        &self,
        fd: i32,
        message: &[u8],
        ip: &str,
        port: u16,
        flags: i32,
    ) -> SyscallResult<usize>;

    /// Returns `(remote_ip, remote_port, payload)`.
    fn recvfrom_syscall(
        &self,
        fd: i32,
        length: usize,
        flags: i32,
    ) -> SyscallResult<(String, u16, Vec<u8>)>;

    fn close_syscall(&self, fd: i32) -> SyscallResult<i32>;

    fn setshutdown_syscall(&self, fd: i32, how: i32) -> SyscallResult<i32>;

    fn setsockopt_syscall(&self, fd: i32, level: i32, optname: i32, optval: i32)
        -> SyscallResult<i32>;

    fn getsockopt_syscall(&self, fd: i32, level: i32, optname: i32) -> SyscallResult<i32>;

    /// Returns `(remote_ip, remote_port)`.
    fn getpeername_syscall(&self, fd: i32) -> SyscallResult<(String, u16)>;

    /// Returns `(local_ip, local_port)`.
    fn getsockname_syscall(&self, fd: i32) -> SyscallResult<(String, u16)>;

    /// `args` are the variadic integer arguments following `cmd`.
    fn fcntl_syscall(&self, fd: i32, cmd: i32, args: &[i32]) -> SyscallResult<i32>;
}

/// Resource class holding TCP ports.
pub const CONN_PORT: &str = "connport";
/// Resource class holding UDP ports.
pub const MESS_PORT: &str = "messport";

/// Port limits and current usage, keyed by resource class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub limits: HashMap<String, BTreeSet<u16>>,
    pub usage: HashMap<String, BTreeSet<u16>>,
}

/// The resource-accounting service of the sandbox.
pub trait ResourceAccounting: Send + Sync {
    fn getresources(&self) -> SyscallResult<Resources>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording syscall layer for unit tests.

    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    pub struct MockSyscalls {
        pub calls: Mutex<Vec<String>>,
        pub failure: Mutex<Option<SyscallFailure>>,
        pub recv_payload: Mutex<Vec<u8>>,
        next_fd: AtomicI32,
    }

    impl MockSyscalls {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failure: Mutex::new(None),
                recv_payload: Mutex::new(b"hello, proxy".to_vec()),
                next_fd: AtomicI32::new(3),
            }
        }

        pub fn failing(failure: SyscallFailure) -> Self {
            let mock = Self::new();
            *mock.failure.lock().unwrap() = Some(failure);
            mock
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, entry: String) -> SyscallResult<()> {
            self.calls.lock().unwrap().push(entry);
            match self.failure.lock().unwrap().clone() {
                Some(failure) => Err(failure),
                None => Ok(()),
            }
        }
    }

    impl NetSyscalls for MockSyscalls {
        fn socket_syscall(&self, domain: i32, socktype: i32, protocol: i32) -> SyscallResult<i32> {
            self.record(format!("socket({},{},{})", domain, socktype, protocol))?;
            Ok(self.next_fd.fetch_add(1, Ordering::SeqCst))
        }

        fn bind_syscall(&self, fd: i32, ip: &str, port: u16) -> SyscallResult<i32> {
            self.record(format!("bind({},{},{})", fd, ip, port))?;
            Ok(0)
        }

        fn accept_syscall(&self, fd: i32) -> SyscallResult<(String, u16, i32)> {
            self.record(format!("accept({})", fd))?;
            let new_fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
            Ok(("10.0.0.2".to_string(), 40000, new_fd))
        }

        fn connect_syscall(&self, fd: i32, ip: &str, port: u16) -> SyscallResult<i32> {
            self.record(format!("connect({},{},{})", fd, ip, port))?;
            Ok(0)
        }

        fn listen_syscall(&self, fd: i32, backlog: i32) -> SyscallResult<i32> {
            self.record(format!("listen({},{})", fd, backlog))?;
            Ok(0)
        }

        fn send_syscall(&self, fd: i32, message: &[u8], flags: i32) -> SyscallResult<usize> {
            self.record(format!(
                "send({},{},{})",
                fd,
                String::from_utf8_lossy(message),
                flags
            ))?;
            Ok(message.len())
        }

        fn recv_syscall(&self, fd: i32, length: usize, flags: i32) -> SyscallResult<Vec<u8>> {
            self.record(format!("recv({},{},{})", fd, length, flags))?;
            let payload = self.recv_payload.lock().unwrap();
            Ok(payload[..payload.len().min(length)].to_vec())
        }

        fn sendto_syscall(
            &self,
            fd: i32,
            message: &[u8],
            ip: &str,
            port: u16,
            flags: i32,
        ) -> SyscallResult<usize> {
            self.record(format!(
                "sendto({},{},{},{},{})",
                fd,
                String::from_utf8_lossy(message),
                ip,
                port,
                flags
            ))?;
            Ok(message.len())
        }

        fn recvfrom_syscall(
            &self,
            fd: i32,
            length: usize,
            flags: i32,
        ) -> SyscallResult<(String, u16, Vec<u8>)> {
            self.record(format!("recvfrom({},{},{})", fd, length, flags))?;
            let payload = self.recv_payload.lock().unwrap();
            Ok((
                "10.0.0.9".to_string(),
                5353,
                payload[..payload.len().min(length)].to_vec(),
            ))
        }

        fn close_syscall(&self, fd: i32) -> SyscallResult<i32> {
            self.record(format!("close({})", fd))?;
            Ok(0)
        }

        fn setshutdown_syscall(&self, fd: i32, how: i32) -> SyscallResult<i32> {
            self.record(format!("shutdown({},{})", fd, how))?;
            Ok(0)
        }

        fn setsockopt_syscall(
            &self,
            fd: i32,
            level: i32,
            optname: i32,
            optval: i32,
        ) -> SyscallResult<i32> {
            self.record(format!("setsockopt({},{},{},{})", fd, level, optname, optval))?;
            Ok(0)
        }

        fn getsockopt_syscall(&self, fd: i32, level: i32, optname: i32) -> SyscallResult<i32> {
            self.record(format!("getsockopt({},{},{})", fd, level, optname))?;
            Ok(1)
        }

        fn getpeername_syscall(&self, fd: i32) -> SyscallResult<(String, u16)> {
            self.record(format!("getpeername({})", fd))?;
            Ok(("10.0.0.2".to_string(), 40000))
        }

        fn getsockname_syscall(&self, fd: i32) -> SyscallResult<(String, u16)> {
            self.record(format!("getsockname({})", fd))?;
            Ok(("127.0.0.1".to_string(), 8080))
        }

        fn fcntl_syscall(&self, fd: i32, cmd: i32, args: &[i32]) -> SyscallResult<i32> {
            self.record(format!("fcntl({},{},{:?})", fd, cmd, args))?;
            Ok(0)
        }
    }
}
