//! Pluggable transforms applied to the proxy's TCP streams.
//!
//! A shim stack is selected by one configuration string made of
//! parenthesised entries, outermost first:
//!
//! ```text
//! ""                               raw TCP
//! "(NoopShim)"                     raw TCP
//! "(CompressionShim)"              zlib-compressed frames
//! "(LogShim,proxy.log)"            log every buffer to proxy.log
//! "(LogShim)(CompressionShim)"     log the plain bytes, compress on the wire
//! ```
//!
//! Both endpoints must run the same stack.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::debug;

use crate::error::{Error, Result};
use crate::retry::block_call;

/// A bidirectional byte stream, possibly transformed.
pub trait ShimStream: Send {
    /// Read up to `max` bytes. An empty buffer means the peer closed.
    fn recv(&mut self, max: usize) -> io::Result<Vec<u8>>;

    /// Write some prefix of `data`, returning how much was taken.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Address of the remote endpoint.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Whether an I/O error means the connection is gone, on either side.
pub fn is_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

/// Write all of `data`, retrying would-block.
pub fn send_all(stream: &mut dyn ShimStream, data: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    while sent < data.len() {
        let n = block_call(|| stream.send(&data[sent..]))?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "connection closed during send",
            ));
        }
        sent += n;
    }
    Ok(())
}

/// Plain TCP, the bottom of every stack.
pub struct TcpShim {
    stream: TcpStream,
}

impl TcpShim {
    pub fn new(stream: TcpStream, timeout: Option<Duration>) -> io::Result<Self> {
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl ShimStream for TcpShim {
    fn recv(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = self.stream.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write(data)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

/// Where a [`LogShim`] writes.
#[derive(Clone)]
enum LogSink {
    Tracing,
    File(Arc<Mutex<File>>),
}

/// Records every buffer passing through.
pub struct LogShim {
    inner: Box<dyn ShimStream>,
    sink: LogSink,
}

impl LogShim {
    fn log(&self, direction: &str, data: &[u8]) {
        let peer = self
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        match &self.sink {
            LogSink::Tracing => {
                debug!(
                    target: "shimproxy::shim",
                    %peer,
                    direction,
                    len = data.len(),
                    "shim traffic"
                );
            }
            LogSink::File(file) => {
                if let Ok(mut file) = file.lock() {
                    let written = writeln!(
                        file,
                        "{} {} {} bytes: {:?}",
                        peer,
                        direction,
                        data.len(),
                        String::from_utf8_lossy(data)
                    );
                    if let Err(err) = written {
                        debug!(target: "shimproxy::shim", %peer, %err, "shim log write failed");
                    }
                }
            }
        }
    }
}

impl ShimStream for LogShim {
    fn recv(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let data = self.inner.recv(max)?;
        self.log("recv", &data);
        Ok(data)
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.inner.send(data)?;
        self.log("send", &data[..n]);
        Ok(n)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
}

/// Deflates each write into a length-prefixed frame and inflates one
/// frame per read:
///
/// ```text
/// | length (4, big-endian) | zlib data (length) |
/// ```
pub struct CompressionShim {
    inner: Box<dyn ShimStream>,
    /// Raw bytes read but not yet forming a complete frame.
    wire: Vec<u8>,
    /// Inflated bytes not yet handed to the caller.
    pending: Vec<u8>,
}

impl CompressionShim {
    const HEADER_LEN: usize = 4;
    /// Upper bound on a single frame, compressed or inflated.
    const MAX_FRAME: usize = 16 * 1024 * 1024;

    fn new(inner: Box<dyn ShimStream>) -> Self {
        Self {
            inner,
            wire: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Pull one complete frame out of `wire`, if present.
    fn take_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.wire.len() < Self::HEADER_LEN {
            return Ok(None);
        }
        let header = [self.wire[0], self.wire[1], self.wire[2], self.wire[3]];
        let len = u32::from_be_bytes(header) as usize;
        if len > Self::MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "compressed frame too large",
            ));
        }
        if self.wire.len() < Self::HEADER_LEN + len {
            return Ok(None);
        }

        let frame: Vec<u8> = self
            .wire
            .drain(..Self::HEADER_LEN + len)
            .skip(Self::HEADER_LEN)
            .collect();

        let mut plain = Vec::new();
        ZlibDecoder::new(frame.as_slice())
            .take(Self::MAX_FRAME as u64 + 1)
            .read_to_end(&mut plain)?;
        if plain.len() > Self::MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "inflated frame too large",
            ));
        }
        Ok(Some(plain))
    }

    fn hand_out(&mut self, max: usize) -> Vec<u8> {
        let n = self.pending.len().min(max);
        self.pending.drain(..n).collect()
    }
}

impl ShimStream for CompressionShim {
    fn recv(&mut self, max: usize) -> io::Result<Vec<u8>> {
        if !self.pending.is_empty() {
            return Ok(self.hand_out(max));
        }

        loop {
            if let Some(plain) = self.take_frame()? {
                self.pending = plain;
                return Ok(self.hand_out(max));
            }

            let chunk = self.inner.recv(max.max(Self::HEADER_LEN))?;
            if chunk.is_empty() {
                if self.wire.is_empty() {
                    return Ok(chunk);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a compressed frame",
                ));
            }
            self.wire.extend_from_slice(&chunk);
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;

        let mut frame = Vec::with_capacity(Self::HEADER_LEN + compressed.len());
        frame.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        frame.extend_from_slice(&compressed);
        send_all(self.inner.as_mut(), &frame)?;
        Ok(data.len())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
}

/// One entry of a shim configuration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShimLayer {
    Noop,
    Log(Option<PathBuf>),
    Compression,
}

impl fmt::Display for ShimLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShimLayer::Noop => write!(f, "(NoopShim)"),
            ShimLayer::Log(None) => write!(f, "(LogShim)"),
            ShimLayer::Log(Some(path)) => write!(f, "(LogShim,{})", path.display()),
            ShimLayer::Compression => write!(f, "(CompressionShim)"),
        }
    }
}

/// An ordered list of shims, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShimStack {
    layers: Vec<ShimLayer>,
}

impl FromStr for ShimStack {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut layers = Vec::new();
        let mut rest = s.trim();

        while !rest.is_empty() {
            let body = rest
                .strip_prefix('(')
                .ok_or_else(|| Error::InvalidShim(format!("expected '(' in '{}'", s)))?;
            let end = body
                .find(')')
                .ok_or_else(|| Error::InvalidShim(format!("unterminated entry in '{}'", s)))?;

            let mut parts = body[..end].split(',').map(str::trim);
            let name = parts.next().unwrap_or_default();
            let params: Vec<&str> = parts.collect();

            let layer = match (name, params.as_slice()) {
                ("NoopShim", []) => ShimLayer::Noop,
                ("CompressionShim", []) => ShimLayer::Compression,
                ("LogShim", []) => ShimLayer::Log(None),
                ("LogShim", [path]) => ShimLayer::Log(Some(PathBuf::from(*path))),
                _ => return Err(Error::InvalidShim(format!("unknown shim '{}'", &body[..end]))),
            };
            layers.push(layer);
            rest = body[end + 1..].trim_start();
        }

        Ok(Self { layers })
    }
}

impl fmt::Display for ShimStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for layer in &self.layers {
            write!(f, "{}", layer)?;
        }
        Ok(())
    }
}

impl ShimStack {
    pub fn layers(&self) -> &[ShimLayer] {
        &self.layers
    }

    /// Resolve log file paths once so every connection shares the handle.
    fn sinks(&self) -> io::Result<Vec<Option<LogSink>>> {
        self.layers
            .iter()
            .map(|layer| match layer {
                ShimLayer::Log(None) => Ok(Some(LogSink::Tracing)),
                ShimLayer::Log(Some(path)) => {
                    let file = OpenOptions::new().create(true).append(true).open(path)?;
                    Ok(Some(LogSink::File(Arc::new(Mutex::new(file)))))
                }
                _ => Ok(None),
            })
            .collect()
    }

    fn wrap(
        layers: &[ShimLayer],
        sinks: &[Option<LogSink>],
        stream: TcpStream,
        timeout: Option<Duration>,
    ) -> io::Result<Box<dyn ShimStream>> {
        let mut wrapped: Box<dyn ShimStream> = Box::new(TcpShim::new(stream, timeout)?);
        for (layer, sink) in layers.iter().zip(sinks).rev() {
            wrapped = match (layer, sink) {
                (ShimLayer::Noop, _) => wrapped,
                (ShimLayer::Compression, _) => Box::new(CompressionShim::new(wrapped)),
                (ShimLayer::Log(_), Some(sink)) => Box::new(LogShim {
                    inner: wrapped,
                    sink: sink.clone(),
                }),
                (ShimLayer::Log(_), None) => wrapped,
            };
        }
        Ok(wrapped)
    }

    /// Listen on `addr`, wrapping every accepted stream in this stack.
    pub fn listen<A: ToSocketAddrs>(
        &self,
        addr: A,
        timeout: Option<Duration>,
    ) -> io::Result<ShimListener> {
        let listener = TcpListener::bind(addr)?;
        Ok(ShimListener {
            listener,
            layers: self.layers.clone(),
            sinks: self.sinks()?,
            timeout,
        })
    }

    /// Open a client connection wrapped in this stack.
    pub fn connect<A: ToSocketAddrs>(
        &self,
        addr: A,
        timeout: Option<Duration>,
    ) -> io::Result<Box<dyn ShimStream>> {
        let stream = TcpStream::connect(addr)?;
        Self::wrap(&self.layers, &self.sinks()?, stream, timeout)
    }
}

/// A listening socket producing shim-wrapped connections.
pub struct ShimListener {
    listener: TcpListener,
    layers: Vec<ShimLayer>,
    sinks: Vec<Option<LogSink>>,
    timeout: Option<Duration>,
}

impl ShimListener {
    pub fn accept(&self) -> io::Result<(Box<dyn ShimStream>, SocketAddr)> {
        let (stream, peer) = self.listener.accept()?;
        let wrapped = ShimStack::wrap(&self.layers, &self.sinks, stream, self.timeout)?;
        Ok((wrapped, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
