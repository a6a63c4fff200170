//! Proxy configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{ByteOrder, CALL_NAME_LEN, MAX_FRAME_SIZE};
use crate::shim::ShimStack;

/// Port the shim libc connects to by default.
pub const DEFAULT_PORT: u16 = 53678;

/// Transport timeout applied to every proxied connection.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for a proxy [`Server`](crate::Server).
///
/// # Example
///
/// ```rust
/// use shimproxy::ProxyConfig;
///
/// let config = ProxyConfig::new()
///     .listen_port(0)
///     .shim("(CompressionShim)");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address the master server listens on.
    pub listen_ip: IpAddr,
    /// Port the master server listens on.
    pub listen_port: u16,
    /// Shim stack configuration string, e.g. `(CompressionShim)`.
    pub shim: String,
    /// Read/write timeout handed to the transport. Zero disables it.
    pub timeout: Duration,
    /// Largest request read per frame.
    pub max_frame_size: usize,
    /// Byte order of the errno field in responses.
    pub byte_order: ByteOrder,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: DEFAULT_PORT,
            shim: String::new(),
            timeout: DEFAULT_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
            byte_order: ByteOrder::Little,
        }
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen_ip(mut self, ip: impl Into<IpAddr>) -> Self {
        self.listen_ip = ip.into();
        self
    }

    /// Port 0 picks an ephemeral port.
    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn shim(mut self, shim: impl Into<String>) -> Self {
        self.shim = shim.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    /// The timeout as the transport expects it.
    pub fn transport_timeout(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            None
        } else {
            Some(self.timeout)
        }
    }

    /// Check the configuration and parse the shim stack.
    pub fn validate(&self) -> Result<ShimStack> {
        if self.max_frame_size <= CALL_NAME_LEN {
            return Err(Error::InvalidConfig(format!(
                "max frame size {} leaves no room for arguments",
                self.max_frame_size
            )));
        }
        self.shim.parse()
    }
}
