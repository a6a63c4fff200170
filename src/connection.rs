//! Per-connection request loop.
//!
//! ```text
//! AWAIT_FRAME ──▶ DISPATCH ──▶ RESPOND ──▶ AWAIT_FRAME
//!      │                          │
//!      └──── peer/local close ────┴──▶ CLOSED
//! ```
//!
//! Requests on one connection are served strictly in order. The descriptor
//! returned by the last successful `socket` call is remembered and closed
//! on the syscall layer when the connection goes away.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::call::{dispatch, Call};
use crate::errno;
use crate::error::Result;
use crate::protocol::{ByteOrder, RequestFrame};
use crate::retry::block_call;
use crate::shim::{is_closed, send_all, ShimStream};
use crate::syscalls::NetSyscalls;

/// Outcome of serving one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Closed,
}

/// Serves POSIX calls arriving on one client connection.
pub struct ConnectionHandler {
    stream: Box<dyn ShimStream>,
    net: Arc<dyn NetSyscalls>,
    max_frame_size: usize,
    byte_order: ByteOrder,
    /// Descriptor from the last successful `socket` call.
    sockfd: Option<i32>,
}

impl ConnectionHandler {
    pub fn new(
        stream: Box<dyn ShimStream>,
        net: Arc<dyn NetSyscalls>,
        max_frame_size: usize,
        byte_order: ByteOrder,
    ) -> Self {
        Self {
            stream,
            net,
            max_frame_size,
            byte_order,
            sockfd: None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Serve requests until the connection closes.
    ///
    /// Returns `Err` for an unrecognized call, a malformed frame or a
    /// syscall failure the handlers do not translate. The tracked
    /// descriptor is closed on every exit path.
    pub fn run(mut self) -> Result<()> {
        let outcome = loop {
            match self.serve_one() {
                Ok(Step::Continue) => continue,
                Ok(Step::Closed) => {
                    info!(sockfd = ?self.sockfd, "socket closed");
                    break Ok(());
                }
                Err(err) => break Err(err),
            }
        };

        self.release_descriptor();
        outcome
    }

    fn serve_one(&mut self) -> Result<Step> {
        let max = self.max_frame_size;
        let data = match block_call(|| self.stream.recv(max)) {
            Ok(data) if data.is_empty() => return Ok(Step::Closed),
            Ok(data) => data,
            Err(ref e) if is_closed(e) => return Ok(Step::Closed),
            Err(e) => return Err(e.into()),
        };

        let request = RequestFrame::decode(&data)?;
        debug!(
            call = %request.call,
            sockfd = ?self.sockfd,
            args = %String::from_utf8_lossy(&request.args),
            "request"
        );

        let call = Call::from_name(&request.call).map_err(|err| {
            warn!(call = %request.call, "unrecognized call");
            err
        })?;
        let response = dispatch(call, self.net.as_ref(), &request.args)?;

        if response.is_success() {
            match call {
                Call::Socket => self.sockfd = parse_fd(&response.result),
                // The number is free for reuse by other connections now.
                Call::Close if parse_fd(&request.args) == self.sockfd => self.sockfd = None,
                _ => {}
            }
        }

        debug!(
            %call,
            sockfd = ?self.sockfd,
            errno = response.errno,
            name = errno::name_of(response.errno).unwrap_or("-"),
            len = response.result.len(),
            "reply"
        );

        match send_all(self.stream.as_mut(), &response.encode(self.byte_order)) {
            Ok(()) => Ok(Step::Continue),
            Err(ref e) if is_closed(e) => Ok(Step::Closed),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort close of the tracked descriptor; failures are ignored.
    fn release_descriptor(&mut self) {
        if let Some(fd) = self.sockfd.take() {
            if let Err(err) = self.net.close_syscall(fd) {
                debug!(fd, %err, "cleanup close failed");
            }
        }
    }
}

fn parse_fd(field: &[u8]) -> Option<i32> {
    std::str::from_utf8(field).ok()?.trim().parse().ok()
}
