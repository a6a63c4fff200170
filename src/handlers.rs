//! One handler per POSIX call.
//!
//! A handler receives the raw argument field of a request frame, splits it
//! on `,`, converts the fields and calls into the [`NetSyscalls`] layer.
//! Malformed arguments are answered with `EINVAL` without touching the
//! layer. Payload-bearing calls split a bounded number of times so that a
//! message containing commas arrives intact in the last field.

use std::str::FromStr;

use crate::errno::{self, EINVAL, EPROTONOSUPPORT};
use crate::error::{Error, Result};
use crate::protocol::ResponseFrame;
use crate::syscalls::{NetSyscalls, SyscallFailure, SyscallResult};

/// Signature shared by every call handler.
pub type Handler = fn(&dyn NetSyscalls, &[u8]) -> Result<ResponseFrame>;

/// Unwrap parsed arguments or answer `EINVAL`.
macro_rules! args {
    ($parsed:expr) => {
        match $parsed {
            Some(value) => value,
            None => return Ok(ResponseFrame::failure(EINVAL)),
        }
    };
}

/// Split into exactly `N` comma-separated fields.
fn split_exact<const N: usize>(args: &[u8]) -> Option<[&[u8]; N]> {
    let fields: Vec<&[u8]> = args.split(|&b| b == b',').collect();
    fields.try_into().ok()
}

/// Split at most `N - 1` times; the last field keeps any remaining commas.
fn split_payload<const N: usize>(args: &[u8]) -> Option<[&[u8]; N]> {
    let fields: Vec<&[u8]> = args.splitn(N, |&b| b == b',').collect();
    fields.try_into().ok()
}

fn int<T: FromStr>(field: &[u8]) -> Option<T> {
    std::str::from_utf8(field).ok()?.trim().parse().ok()
}

fn text(field: &[u8]) -> Option<&str> {
    std::str::from_utf8(field).ok()
}

/// Translate a syscall outcome into a response frame.
///
/// `Other` failures are not translated and surface to the connection loop.
fn complete<T>(
    result: SyscallResult<T>,
    encode: impl FnOnce(T) -> Vec<u8>,
) -> Result<ResponseFrame> {
    match result {
        Ok(value) => Ok(ResponseFrame::success(encode(value))),
        Err(SyscallFailure::Unimplemented(_)) => Ok(ResponseFrame::failure(EPROTONOSUPPORT)),
        Err(SyscallFailure::Named(err)) => Ok(ResponseFrame::failure(errno::lookup(&err.name)?)),
        Err(SyscallFailure::Other { call, message }) => Err(Error::Syscall { call, message }),
    }
}

fn decimal<T: ToString>(value: T) -> Vec<u8> {
    value.to_string().into_bytes()
}

fn address_triple(ip: &str, port: u16, tail: &[u8]) -> Vec<u8> {
    let mut out = format!("{},{},", ip, port).into_bytes();
    out.extend_from_slice(tail);
    out
}

pub fn call_socket(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [domain, socktype, protocol] = args!(split_exact(args));
    let domain = args!(int(domain));
    let socktype = args!(int(socktype));
    let protocol = args!(int(protocol));

    complete(net.socket_syscall(domain, socktype, protocol), decimal)
}

pub fn call_bind(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [fd, ip, port] = args!(split_exact(args));
    let fd = args!(int(fd));
    let ip = args!(text(ip));
    let port = args!(int(port));

    complete(net.bind_syscall(fd, ip, port), decimal)
}

pub fn call_accept(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let fd = args!(int(args));

    complete(net.accept_syscall(fd), |(ip, port, new_fd)| {
        address_triple(&ip, port, new_fd.to_string().as_bytes())
    })
}

pub fn call_connect(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [fd, ip, port] = args!(split_exact(args));
    let fd = args!(int(fd));
    let ip = args!(text(ip));
    let port = args!(int(port));

    complete(net.connect_syscall(fd, ip, port), decimal)
}

pub fn call_listen(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [fd, backlog] = args!(split_exact(args));
    let fd = args!(int(fd));
    let backlog = args!(int(backlog));

    complete(net.listen_syscall(fd, backlog), decimal)
}

pub fn call_close(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let fd = args!(int(args));

    complete(net.close_syscall(fd), decimal)
}

pub fn call_shutdown(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [fd, how] = args!(split_exact(args));
    let fd = args!(int(fd));
    let how = args!(int(how));

    complete(net.setshutdown_syscall(fd, how), decimal)
}

pub fn call_setsockopt(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [fd, level, optname, optval] = args!(split_exact(args));
    let fd = args!(int(fd));
    let level = args!(int(level));
    let optname = args!(int(optname));
    let optval = args!(int(optval));

    complete(net.setsockopt_syscall(fd, level, optname, optval), decimal)
}

/// Get-only: `fd,level,optname`.
pub fn call_getsockopt(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [fd, level, optname] = args!(split_exact(args));
    let fd = args!(int(fd));
    let level = args!(int(level));
    let optname = args!(int(optname));

    complete(net.getsockopt_syscall(fd, level, optname), decimal)
}

// The trailing 0 fills the third slot the shim libc parses.
pub fn call_getpeername(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let fd = args!(int(args));

    complete(net.getpeername_syscall(fd), |(ip, port)| address_triple(&ip, port, b"0"))
}

pub fn call_getsockname(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let fd = args!(int(args));

    complete(net.getsockname_syscall(fd), |(ip, port)| address_triple(&ip, port, b"0"))
}

/// `fd,flags,message`
pub fn call_send(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [fd, flags, message] = args!(split_payload(args));
    let fd = args!(int(fd));
    let flags = args!(int(flags));

    complete(net.send_syscall(fd, message, flags), decimal)
}

/// `fd,flags,ip,port,message`
pub fn call_sendto(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [fd, flags, ip, port, message] = args!(split_payload(args));
    let fd = args!(int(fd));
    let flags = args!(int(flags));
    let ip = args!(text(ip));
    let port = args!(int(port));

    complete(net.sendto_syscall(fd, message, ip, port, flags), decimal)
}

/// `fd,message`; a `send` with no flags.
pub fn call_write(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [fd, message] = args!(split_payload(args));
    let fd = args!(int(fd));

    complete(net.send_syscall(fd, message, 0), decimal)
}

/// `fd,length,flags`
pub fn call_recv(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [fd, length, flags] = args!(split_exact(args));
    let fd = args!(int(fd));
    let length = args!(int(length));
    let flags = args!(int(flags));

    complete(net.recv_syscall(fd, length, flags), |payload| payload)
}

pub fn call_recvfrom(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [fd, length, flags] = args!(split_exact(args));
    let fd = args!(int(fd));
    let length = args!(int(length));
    let flags = args!(int(flags));

    complete(net.recvfrom_syscall(fd, length, flags), |(ip, port, payload)| {
        address_triple(&ip, port, &payload)
    })
}

/// `fd,length`; a `recv` with no flags.
pub fn call_read(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let [fd, length] = args!(split_exact(args));
    let fd = args!(int(fd));
    let length = args!(int(length));

    complete(net.recv_syscall(fd, length, 0), |payload| payload)
}

/// `fd,cmd[,arg...]`, every argument an integer.
pub fn call_fcntl(net: &dyn NetSyscalls, args: &[u8]) -> Result<ResponseFrame> {
    let fields: Option<Vec<i32>> = args.split(|&b| b == b',').map(int).collect();
    let fields = args!(fields);
    let (fd, cmd, rest) = match fields.as_slice() {
        [fd, cmd, rest @ ..] => (*fd, *cmd, rest),
        _ => return Ok(ResponseFrame::failure(EINVAL)),
    };

    complete(net.fcntl_syscall(fd, cmd, rest), decimal)
}

/// Not supported. Answered without reaching the syscall layer.
pub fn call_ioctl(_net: &dyn NetSyscalls, _args: &[u8]) -> Result<ResponseFrame> {
    Ok(ResponseFrame::failure(EPROTONOSUPPORT))
}

/// Not supported. Answered without reaching the syscall layer.
pub fn call_select(_net: &dyn NetSyscalls, _args: &[u8]) -> Result<ResponseFrame> {
    Ok(ResponseFrame::failure(EPROTONOSUPPORT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno::NO_ERROR;
    use crate::syscalls::mock::MockSyscalls;

    fn ok(frame: &ResponseFrame) -> &[u8] {
        assert_eq!(frame.errno, NO_ERROR, "unexpected failure {:?}", frame);
        &frame.result
    }

    #[test]
    fn test_split_exact() {
        let [a, b, c] = split_exact::<3>(b"2,1,0").unwrap();
        assert_eq!((a, b, c), (&b"2"[..], &b"1"[..], &b"0"[..]));
        assert!(split_exact::<3>(b"2,1").is_none());
        assert!(split_exact::<3>(b"2,1,0,9").is_none());
    }

    #[test]
    fn test_split_payload_keeps_commas() {
        let [fd, flags, msg] = split_payload::<3>(b"7,0,hello,world").unwrap();
        assert_eq!(fd, b"7");
        assert_eq!(flags, b"0");
        assert_eq!(msg, b"hello,world");
        assert!(split_payload::<3>(b"7,0").is_none());
    }

    #[test]
    fn test_socket() {
        let net = MockSyscalls::new();
        let frame = call_socket(&net, b"2,1,0").unwrap();
        assert_eq!(ok(&frame), b"3");
        assert_eq!(net.calls(), vec!["socket(2,1,0)"]);
    }

    #[test]
    fn test_bind_connect_listen() {
        let net = MockSyscalls::new();
        assert_eq!(ok(&call_bind(&net, b"3,127.0.0.1,8080").unwrap()), b"0");
        assert_eq!(ok(&call_connect(&net, b"3,10.0.0.1,80").unwrap()), b"0");
        assert_eq!(ok(&call_listen(&net, b"3,5").unwrap()), b"0");
        assert_eq!(
            net.calls(),
            vec!["bind(3,127.0.0.1,8080)", "connect(3,10.0.0.1,80)", "listen(3,5)"]
        );
    }

    #[test]
    fn test_accept_formats_triple() {
        let net = MockSyscalls::new();
        let frame = call_accept(&net, b"3").unwrap();
        assert_eq!(ok(&frame), b"10.0.0.2,40000,3");
    }

    #[test]
    fn test_names_have_trailing_zero() {
        let net = MockSyscalls::new();
        assert_eq!(ok(&call_getpeername(&net, b"4").unwrap()), b"10.0.0.2,40000,0");
        assert_eq!(ok(&call_getsockname(&net, b"4").unwrap()), b"127.0.0.1,8080,0");
    }

    #[test]
    fn test_send_preserves_payload() {
        let net = MockSyscalls::new();
        let frame = call_send(&net, b"7,0,hello,world").unwrap();
        assert_eq!(ok(&frame), b"11");
        assert_eq!(net.calls(), vec!["send(7,hello,world,0)"]);
    }

    #[test]
    fn test_sendto_and_write() {
        let net = MockSyscalls::new();
        assert_eq!(ok(&call_sendto(&net, b"5,0,10.0.0.3,53,a,b").unwrap()), b"3");
        assert_eq!(ok(&call_write(&net, b"5,x,y,z").unwrap()), b"5");
        assert_eq!(
            net.calls(),
            vec!["sendto(5,a,b,10.0.0.3,53,0)", "send(5,x,y,z,0)"]
        );
    }

    #[test]
    fn test_recv_read_recvfrom() {
        let net = MockSyscalls::new();
        assert_eq!(ok(&call_recv(&net, b"3,5,0").unwrap()), b"hello");
        assert_eq!(ok(&call_read(&net, b"3,100").unwrap()), b"hello, proxy");
        assert_eq!(
            ok(&call_recvfrom(&net, b"3,100,0").unwrap()),
            b"10.0.0.9,5353,hello, proxy"
        );
        assert_eq!(net.calls(), vec!["recv(3,5,0)", "recv(3,100,0)", "recvfrom(3,100,0)"]);
    }

    #[test]
    fn test_fcntl_forwards_variadic() {
        let net = MockSyscalls::new();
        assert_eq!(ok(&call_fcntl(&net, b"3,4,2048").unwrap()), b"0");
        assert_eq!(ok(&call_fcntl(&net, b"3,1").unwrap()), b"0");
        assert_eq!(net.calls(), vec!["fcntl(3,4,[2048])", "fcntl(3,1,[])"]);
    }

    #[test]
    fn test_socket_options_and_shutdown() {
        let net = MockSyscalls::new();
        assert_eq!(ok(&call_setsockopt(&net, b"3,1,2,1").unwrap()), b"0");
        assert_eq!(ok(&call_getsockopt(&net, b"3,1,2").unwrap()), b"1");
        assert_eq!(ok(&call_shutdown(&net, b"3,2").unwrap()), b"0");
        assert_eq!(ok(&call_close(&net, b"3").unwrap()), b"0");
    }

    #[test]
    fn test_too_few_fields_is_einval() {
        let cases: &[(Handler, &[u8])] = &[
            (call_socket, b"2,1"),
            (call_bind, b"3,127.0.0.1"),
            (call_accept, b""),
            (call_connect, b"3"),
            (call_listen, b"3"),
            (call_close, b""),
            (call_shutdown, b"3"),
            (call_setsockopt, b"3,1,2"),
            (call_getsockopt, b"3,1"),
            (call_getpeername, b""),
            (call_getsockname, b""),
            (call_send, b"3,0"),
            (call_sendto, b"3,0,10.0.0.1,53"),
            (call_write, b"3"),
            (call_recv, b"3,10"),
            (call_recvfrom, b"3,10"),
            (call_read, b"3"),
            (call_fcntl, b"3"),
        ];

        for &(handler, args) in cases {
            let net = MockSyscalls::new();
            let frame = handler(&net, args).unwrap();
            assert_eq!(frame.errno, EINVAL, "args {:?}", String::from_utf8_lossy(args));
            assert!(frame.result.is_empty());
            assert!(net.calls().is_empty());
        }
    }

    #[test]
    fn test_non_integer_is_einval() {
        let net = MockSyscalls::new();
        assert_eq!(call_socket(&net, b"two,1,0").unwrap().errno, EINVAL);
        assert_eq!(call_bind(&net, b"3,127.0.0.1,99999").unwrap().errno, EINVAL);
        assert_eq!(call_send(&net, b"x,0,data").unwrap().errno, EINVAL);
        assert!(net.calls().is_empty());
    }

    #[test]
    fn test_unimplemented_is_eprotonosupport() {
        let net = MockSyscalls::failing(SyscallFailure::Unimplemented("socket"));
        let frame = call_socket(&net, b"2,1,0").unwrap();
        assert_eq!(frame.errno, EPROTONOSUPPORT);
        assert!(frame.result.is_empty());
    }

    #[test]
    fn test_named_failure_uses_table() {
        let refused = SyscallFailure::named("connect", "ECONNREFUSED", "refused");
        let net = MockSyscalls::failing(refused);
        let frame = call_connect(&net, b"3,10.0.0.1,80").unwrap();
        assert_eq!(frame.errno, 111);

        let net = MockSyscalls::failing(SyscallFailure::named("recv", "EWOULDBLOCK", "no data"));
        assert_eq!(call_recv(&net, b"3,10,0").unwrap().errno, 22);
    }

    #[test]
    fn test_other_failure_propagates() {
        let net = MockSyscalls::failing(SyscallFailure::Other {
            call: "listen",
            message: "layer crashed".into(),
        });
        match call_listen(&net, b"3,5") {
            Err(Error::Syscall { call, .. }) => assert_eq!(call, "listen"),
            other => panic!("Expected Syscall error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_errno_name_propagates() {
        let net = MockSyscalls::failing(SyscallFailure::named("close", "EMYSTERY", "?"));
        assert!(matches!(
            call_close(&net, b"3"),
            Err(Error::UnknownErrorName(_))
        ));
    }

    #[test]
    fn test_stubs_do_not_call_layer() {
        let net = MockSyscalls::new();
        assert_eq!(call_ioctl(&net, b"3,21537,1").unwrap().errno, EPROTONOSUPPORT);
        assert_eq!(call_select(&net, b"").unwrap().errno, EPROTONOSUPPORT);
        assert!(net.calls().is_empty());
    }
}
