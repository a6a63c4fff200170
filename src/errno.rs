//! Symbolic POSIX error names and their Linux errno values.
//!
//! The table is what the shim libc expects in the response frame. Numbers
//! follow `asm-generic/errno-base.h` and `asm-generic/errno.h`, with one
//! quirk kept for wire compatibility: `EWOULDBLOCK` is reported as 22, the
//! same value as `EINVAL`.

use crate::error::{Error, Result};

/// Error code sent when a call succeeded. Never a valid errno.
pub const NO_ERROR: i32 = -1;

/// Name to errno mapping. Duplicated values are allowed; the first entry
/// for a value is its canonical name for [`name_of`].
pub static ERROR_TABLE: &[(&str, i32)] = &[
    ("EPERM", 1),
    ("ENOENT", 2),
    ("EIO", 5),
    ("ENXIO", 6),
    ("EBADF", 9),
    ("EAGAIN", 11),
    ("EFAULT", 14),
    ("ENOTBLK", 15),
    ("EBUSY", 16),
    ("EINVAL", 22),
    ("EWOULDBLOCK", 22),
    ("EMFIL", 24),
    ("ENOMSG", 42),
    ("ECOMM", 70),
    ("EPROTO", 71),
    ("EBADMSG", 74),
    ("EREMCHG", 78),
    ("ENOTSOCK", 88),
    ("EDESTADDRREQ", 89),
    ("EMSGSIZE", 90),
    ("EPROTOTYPE", 91),
    ("EPROTONOSUPPORT", 93),
    ("ESOCKTNOSUPPORT", 94),
    ("EOPNOTSUPP", 95),
    ("EPFNOSUPPORT", 96),
    ("EAFNOSUPPORT", 97),
    ("EADDRINUSE", 98),
    ("EADDRNOTAVAIL", 99),
    ("ENETDOWN", 100),
    ("ENETUNREACH", 101),
    ("ENETRESET", 102),
    ("ECONNRESET", 104),
    ("ENOBUFS", 105),
    ("EISCONN", 106),
    ("ENOTCONN", 107),
    ("ESHUTDOWN", 108),
    ("ETIMEDOUT", 110),
    ("ECONNREFUSED", 111),
    ("EHOSTDOWN", 112),
    ("EHOSTUNREACH", 113),
];

/// `EINVAL`, used for malformed requests.
pub const EINVAL: i32 = 22;

/// `EPROTONOSUPPORT`, used when the syscall layer has no implementation.
pub const EPROTONOSUPPORT: i32 = 93;

/// Look up the errno value for a symbolic name.
pub fn lookup(name: &str) -> Result<i32> {
    ERROR_TABLE
        .iter()
        .find(|(entry, _)| *entry == name)
        .map(|&(_, code)| code)
        .ok_or_else(|| Error::UnknownErrorName(name.to_string()))
}

/// Canonical symbolic name for an errno value, if the table knows it.
pub fn name_of(code: i32) -> Option<&'static str> {
    ERROR_TABLE
        .iter()
        .find(|&&(_, value)| value == code)
        .map(|&(name, _)| name)
}
