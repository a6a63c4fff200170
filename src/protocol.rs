//! Wire framing between the shim libc and the proxy.
//!
//! ## Request (client → proxy)
//! ```text
//! | call name (19, NUL-padded) | arguments (rest of the read, NUL-padded) |
//! ```
//!
//! ## Response (proxy → client)
//! ```text
//! | errno (4, signed) | result (rest of the write) |
//! ```
//! The errno field is `-1` on success. The result carries no length
//! prefix; its length is implied by the size of the single write.

use crate::error::{Error, Result};
use crate::errno::NO_ERROR;

/// Width of the call-name field.
pub const CALL_NAME_LEN: usize = 19;

/// Largest request read in one go.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Width of the errno field in a response.
pub const ERRNO_LEN: usize = 4;

/// Byte order of the response errno field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    fn encode(self, value: i32) -> [u8; ERRNO_LEN] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }

    fn decode(self, bytes: [u8; ERRNO_LEN]) -> i32 {
        match self {
            ByteOrder::Little => i32::from_le_bytes(bytes),
            ByteOrder::Big => i32::from_be_bytes(bytes),
        }
    }
}

/// Strip the NUL padding on both ends of a field.
fn trim_nul(mut field: &[u8]) -> &[u8] {
    while let [0, rest @ ..] = field {
        field = rest;
    }
    while let [rest @ .., 0] = field {
        field = rest;
    }
    field
}

/// A POSIX call sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub call: String,
    pub args: Vec<u8>,
}

impl RequestFrame {
    pub fn new(call: impl Into<String>, args: impl Into<Vec<u8>>) -> Self {
        Self {
            call: call.into(),
            args: args.into(),
        }
    }

    /// Encode the request as the shim libc lays it out.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.call.as_bytes();
        if name.len() > CALL_NAME_LEN {
            return Err(Error::Frame(format!(
                "call name '{}' exceeds {} bytes",
                self.call, CALL_NAME_LEN
            )));
        }

        let mut buf = Vec::with_capacity(CALL_NAME_LEN + self.args.len());
        buf.extend_from_slice(name);
        buf.resize(CALL_NAME_LEN, 0);
        buf.extend_from_slice(&self.args);
        Ok(buf)
    }

    /// Decode a request from one transport read.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < CALL_NAME_LEN {
            return Err(Error::Frame(format!(
                "request of {} bytes is shorter than the call-name field",
                data.len()
            )));
        }

        let (name, args) = data.split_at(CALL_NAME_LEN);
        let call = std::str::from_utf8(trim_nul(name))
            .map_err(|_| Error::Frame("call name is not valid UTF-8".to_string()))?
            .to_string();

        Ok(Self {
            call,
            args: trim_nul(args).to_vec(),
        })
    }
}

/// The `(errno, result)` pair returned for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub errno: i32,
    pub result: Vec<u8>,
}

impl ResponseFrame {
    pub fn success(result: impl Into<Vec<u8>>) -> Self {
        Self {
            errno: NO_ERROR,
            result: result.into(),
        }
    }

    pub fn failure(errno: i32) -> Self {
        Self {
            errno,
            result: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.errno == NO_ERROR
    }

    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ERRNO_LEN + self.result.len());
        buf.extend_from_slice(&order.encode(self.errno));
        buf.extend_from_slice(&self.result);
        buf
    }

    pub fn decode(data: &[u8], order: ByteOrder) -> Result<Self> {
        if data.len() < ERRNO_LEN {
            return Err(Error::Frame("response too short".to_string()));
        }
        let mut errno = [0u8; ERRNO_LEN];
        errno.copy_from_slice(&data[..ERRNO_LEN]);

        Ok(Self {
            errno: order.decode(errno),
            result: data[ERRNO_LEN..].to_vec(),
        })
    }
}
