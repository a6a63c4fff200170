//! Passthrough syscall layer backed by the host kernel.
//!
//! Lets the proxy run without a sandbox: every call is forwarded through
//! `libc` on IPv4 sockets and a failing `errno` is reported by its symbolic
//! name. Only descriptors created through this layer can be used, so a
//! client cannot reach the proxy's own sockets.
//!
//! When a port pool is attached, `bind` to port 0 draws a port from it
//! instead of letting the kernel choose.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::port::{get_available_port, ConnKind, StaticResources};
use crate::syscalls::{NetSyscalls, SyscallFailure, SyscallResult};

/// Lock a mutex, recovering the data if another thread panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Symbolic name of a host `errno`, for the names the proxy can report.
fn errno_name(code: i32) -> Option<&'static str> {
    let name = match code {
        libc::EPERM => "EPERM",
        libc::ENOENT => "ENOENT",
        libc::EIO => "EIO",
        libc::ENXIO => "ENXIO",
        libc::EBADF => "EBADF",
        libc::EAGAIN => "EAGAIN",
        libc::EFAULT => "EFAULT",
        libc::ENOTBLK => "ENOTBLK",
        libc::EBUSY => "EBUSY",
        libc::EINVAL => "EINVAL",
        libc::EMFILE => "EMFIL",
        libc::ENOMSG => "ENOMSG",
        libc::EPROTO => "EPROTO",
        libc::EBADMSG => "EBADMSG",
        libc::ENOTSOCK => "ENOTSOCK",
        libc::EDESTADDRREQ => "EDESTADDRREQ",
        libc::EMSGSIZE => "EMSGSIZE",
        libc::EPROTOTYPE => "EPROTOTYPE",
        libc::EPROTONOSUPPORT => "EPROTONOSUPPORT",
        libc::ESOCKTNOSUPPORT => "ESOCKTNOSUPPORT",
        libc::EOPNOTSUPP => "EOPNOTSUPP",
        libc::EPFNOSUPPORT => "EPFNOSUPPORT",
        libc::EAFNOSUPPORT => "EAFNOSUPPORT",
        libc::EADDRINUSE => "EADDRINUSE",
        libc::EADDRNOTAVAIL => "EADDRNOTAVAIL",
        libc::ENETDOWN => "ENETDOWN",
        libc::ENETUNREACH => "ENETUNREACH",
        libc::ENETRESET => "ENETRESET",
        libc::ECONNRESET => "ECONNRESET",
        libc::ENOBUFS => "ENOBUFS",
        libc::EISCONN => "EISCONN",
        libc::ENOTCONN => "ENOTCONN",
        libc::ESHUTDOWN => "ESHUTDOWN",
        libc::ETIMEDOUT => "ETIMEDOUT",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::EHOSTDOWN => "EHOSTDOWN",
        libc::EHOSTUNREACH => "EHOSTUNREACH",
        _ => return None,
    };
    Some(name)
}

/// Translate the current `errno` into a syscall failure.
fn last_error(call: &'static str) -> SyscallFailure {
    let err = io::Error::last_os_error();
    match err.raw_os_error().and_then(errno_name) {
        Some(name) => SyscallFailure::named(call, name, err.to_string()),
        None => SyscallFailure::Other {
            call,
            message: err.to_string(),
        },
    }
}

fn cvt(call: &'static str, ret: libc::c_int) -> SyscallResult<i32> {
    if ret < 0 {
        Err(last_error(call))
    } else {
        Ok(ret)
    }
}

fn cvt_size(call: &'static str, ret: libc::ssize_t) -> SyscallResult<usize> {
    if ret < 0 {
        Err(last_error(call))
    } else {
        Ok(ret as usize)
    }
}

fn sockaddr_in(call: &'static str, ip: &str, port: u16) -> SyscallResult<libc::sockaddr_in> {
    let addr: Ipv4Addr = ip.parse().map_err(|_| {
        SyscallFailure::named(call, "EINVAL", format!("'{}' is not an IPv4 address", ip))
    })?;

    // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = port.to_be();
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    };
    Ok(sa)
}

fn not_open(call: &'static str, fd: i32) -> SyscallFailure {
    SyscallFailure::named(call, "EBADF", format!("descriptor {} is not open", fd))
}

fn from_sockaddr_in(sa: &libc::sockaddr_in) -> (String, u16) {
    let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
    (ip.to_string(), u16::from_be(sa.sin_port))
}

const SOCKADDR_IN_LEN: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

/// Largest buffer handed to `recv`/`recvfrom`; longer requests read at most
/// this much, like a short read.
pub const MAX_RECV: usize = 64 * 1024;

/// Host kernel sockets exposed through the [`NetSyscalls`] contract.
#[derive(Default)]
pub struct HostSyscalls {
    /// Descriptors created through this layer, with any pool port bound.
    owned: Mutex<HashMap<i32, Option<(ConnKind, u16)>>>,
    ports: Option<Arc<StaticResources>>,
}

impl HostSyscalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw ports for `bind(fd, ip, 0)` from `pool`.
    pub fn with_port_pool(mut self, pool: Arc<StaticResources>) -> Self {
        self.ports = Some(pool);
        self
    }

    fn check_owned(&self, call: &'static str, fd: i32) -> SyscallResult<()> {
        if lock(&self.owned).contains_key(&fd) {
            Ok(())
        } else {
            Err(not_open(call, fd))
        }
    }

    fn adopt(&self, fd: i32) {
        lock(&self.owned).insert(fd, None);
    }

    fn socket_kind(&self, fd: i32) -> SyscallResult<ConnKind> {
        match self.getsockopt_syscall(fd, libc::SOL_SOCKET, libc::SO_TYPE)? {
            libc::SOCK_STREAM => Ok(ConnKind::Tcp),
            libc::SOCK_DGRAM => Ok(ConnKind::Udp),
            _ => Err(SyscallFailure::Unimplemented("bind")),
        }
    }

    /// Pick a pool port for `fd` when one was requested and a pool exists.
    fn resolve_port(&self, fd: i32, port: u16) -> SyscallResult<Option<(ConnKind, u16)>> {
        let pool = match (&self.ports, port) {
            (Some(pool), 0) => pool,
            _ => return Ok(None),
        };

        let kind = self.socket_kind(fd)?;
        let chosen = get_available_port(&kind.to_string(), pool.as_ref(), &mut rand::thread_rng())
            .map_err(|err| SyscallFailure::named("bind", "EADDRINUSE", err.to_string()))?;
        Ok(Some((kind, chosen)))
    }
}

impl NetSyscalls for HostSyscalls {
    fn socket_syscall(&self, domain: i32, socktype: i32, protocol: i32) -> SyscallResult<i32> {
        // SAFETY: plain syscall with integer arguments.
        let fd = cvt("socket", unsafe { libc::socket(domain, socktype, protocol) })?;
        self.adopt(fd);
        Ok(fd)
    }

    fn bind_syscall(&self, fd: i32, ip: &str, port: u16) -> SyscallResult<i32> {
        self.check_owned("bind", fd)?;
        let pooled = self.resolve_port(fd, port)?;
        let port = pooled.map(|(_, p)| p).unwrap_or(port);
        let sa = sockaddr_in("bind", ip, port)?;

        // SAFETY: `sa` outlives the call and the length matches its type.
        let ret = cvt("bind", unsafe {
            libc::bind(
                fd,
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                SOCKADDR_IN_LEN,
            )
        })?;

        if let (Some((kind, port)), Some(pool)) = (pooled, &self.ports) {
            pool.mark_used(kind, port);
            lock(&self.owned).insert(fd, Some((kind, port)));
        }
        Ok(ret)
    }

    fn accept_syscall(&self, fd: i32) -> SyscallResult<(String, u16, i32)> {
        self.check_owned("accept", fd)?;
        // SAFETY: zeroed sockaddr_in is valid; accept fills at most `len` bytes.
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = SOCKADDR_IN_LEN;
        let new_fd = cvt("accept", unsafe {
            libc::accept(fd, &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr, &mut len)
        })?;
        self.adopt(new_fd);

        let (ip, port) = from_sockaddr_in(&sa);
        Ok((ip, port, new_fd))
    }

    fn connect_syscall(&self, fd: i32, ip: &str, port: u16) -> SyscallResult<i32> {
        self.check_owned("connect", fd)?;
        let sa = sockaddr_in("connect", ip, port)?;
        // SAFETY: `sa` outlives the call and the length matches its type.
        cvt("connect", unsafe {
            libc::connect(
                fd,
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                SOCKADDR_IN_LEN,
            )
        })
    }

    fn listen_syscall(&self, fd: i32, backlog: i32) -> SyscallResult<i32> {
        self.check_owned("listen", fd)?;
        // SAFETY: plain syscall with integer arguments.
        cvt("listen", unsafe { libc::listen(fd, backlog) })
    }

    fn send_syscall(&self, fd: i32, message: &[u8], flags: i32) -> SyscallResult<usize> {
        self.check_owned("send", fd)?;
        // SAFETY: the pointer and length describe `message`.
        cvt_size("send", unsafe {
            libc::send(fd, message.as_ptr() as *const libc::c_void, message.len(), flags)
        })
    }

    fn recv_syscall(&self, fd: i32, length: usize, flags: i32) -> SyscallResult<Vec<u8>> {
        self.check_owned("recv", fd)?;
        let mut buf = vec![0u8; length.min(MAX_RECV)];
        // SAFETY: the pointer and length describe `buf`.
        let n = cvt_size("recv", unsafe {
            libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
        })?;
        buf.truncate(n);
        Ok(buf)
    }

    fn sendto_syscall(
        &self,
        fd: i32,
        message: &[u8],
        ip: &str,
        port: u16,
        flags: i32,
    ) -> SyscallResult<usize> {
        self.check_owned("sendto", fd)?;
        let sa = sockaddr_in("sendto", ip, port)?;
        // SAFETY: `message` and `sa` outlive the call; lengths match.
        cvt_size("sendto", unsafe {
            libc::sendto(
                fd,
                message.as_ptr() as *const libc::c_void,
                message.len(),
                flags,
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                SOCKADDR_IN_LEN,
            )
        })
    }

    fn recvfrom_syscall(
        &self,
        fd: i32,
        length: usize,
        flags: i32,
    ) -> SyscallResult<(String, u16, Vec<u8>)> {
        self.check_owned("recvfrom", fd)?;
        let mut buf = vec![0u8; length.min(MAX_RECV)];
        // SAFETY: zeroed sockaddr_in is valid; buffers and lengths match.
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = SOCKADDR_IN_LEN;
        let n = cvt_size("recvfrom", unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        buf.truncate(n);

        let (ip, port) = from_sockaddr_in(&sa);
        Ok((ip, port, buf))
    }

    fn close_syscall(&self, fd: i32) -> SyscallResult<i32> {
        let binding = lock(&self.owned)
            .remove(&fd)
            .ok_or_else(|| not_open("close", fd))?;

        if let (Some((kind, port)), Some(pool)) = (binding, &self.ports) {
            pool.release(kind, port);
        }
        // SAFETY: `fd` was created by this layer and is closed once.
        cvt("close", unsafe { libc::close(fd) })
    }

    fn setshutdown_syscall(&self, fd: i32, how: i32) -> SyscallResult<i32> {
        self.check_owned("shutdown", fd)?;
        // SAFETY: plain syscall with integer arguments.
        cvt("shutdown", unsafe { libc::shutdown(fd, how) })
    }

    fn setsockopt_syscall(
        &self,
        fd: i32,
        level: i32,
        optname: i32,
        optval: i32,
    ) -> SyscallResult<i32> {
        self.check_owned("setsockopt", fd)?;
        let value: libc::c_int = optval;
        // SAFETY: `value` outlives the call and the length matches its type.
        cvt("setsockopt", unsafe {
            libc::setsockopt(
                fd,
                level,
                optname,
                &value as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })
    }

    fn getsockopt_syscall(&self, fd: i32, level: i32, optname: i32) -> SyscallResult<i32> {
        self.check_owned("getsockopt", fd)?;
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: the kernel writes at most `len` bytes into `value`.
        cvt("getsockopt", unsafe {
            libc::getsockopt(
                fd,
                level,
                optname,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        })?;
        Ok(value)
    }

    fn getpeername_syscall(&self, fd: i32) -> SyscallResult<(String, u16)> {
        self.check_owned("getpeername", fd)?;
        // SAFETY: zeroed sockaddr_in is valid; the kernel fills at most `len` bytes.
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = SOCKADDR_IN_LEN;
        cvt("getpeername", unsafe {
            libc::getpeername(
                fd,
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        Ok(from_sockaddr_in(&sa))
    }

    fn getsockname_syscall(&self, fd: i32) -> SyscallResult<(String, u16)> {
        self.check_owned("getsockname", fd)?;
        // SAFETY: zeroed sockaddr_in is valid; the kernel fills at most `len` bytes.
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = SOCKADDR_IN_LEN;
        cvt("getsockname", unsafe {
            libc::getsockname(
                fd,
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        Ok(from_sockaddr_in(&sa))
    }

    fn fcntl_syscall(&self, fd: i32, cmd: i32, args: &[i32]) -> SyscallResult<i32> {
        self.check_owned("fcntl", fd)?;
        // SAFETY: integer-argument fcntl commands only; pointer commands
        // cannot be expressed on the wire.
        match *args {
            [] => cvt("fcntl", unsafe { libc::fcntl(fd, cmd) }),
            [arg] => cvt("fcntl", unsafe { libc::fcntl(fd, cmd, arg) }),
            _ => Err(SyscallFailure::Unimplemented("fcntl")),
        }
    }
}
