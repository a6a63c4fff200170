//! Master server: accepts client connections and serves each on its own
//! thread.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{error, info, info_span, warn};

use crate::config::ProxyConfig;
use crate::connection::ConnectionHandler;
use crate::error::Result;
use crate::retry::{block_call, RETRY_DELAY};
use crate::shim::{ShimListener, ShimStack};
use crate::syscalls::NetSyscalls;

/// Connection ID counter.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Listens for shim libc clients and spawns a [`ConnectionHandler`] per
/// accepted connection.
pub struct Server {
    listener: ShimListener,
    net: Arc<dyn NetSyscalls>,
    config: ProxyConfig,
    stack: ShimStack,
}

impl Server {
    /// Bind the listening endpoint described by `config`.
    pub fn bind(config: ProxyConfig, net: Arc<dyn NetSyscalls>) -> Result<Self> {
        let stack = config.validate()?;
        let listener = stack.listen(config.listen_addr(), config.transport_timeout())?;

        Ok(Self {
            listener,
            net,
            config,
            stack,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    ///
    /// Handlers run independently; a handler that fails only ends its own
    /// connection.
    pub fn serve(&self) -> Result<()> {
        info!(
            addr = %self.local_addr()?,
            shim = %self.stack,
            "starting master server"
        );

        loop {
            let (stream, peer) = match block_call(|| self.listener.accept()) {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "accept failed");
                    thread::sleep(RETRY_DELAY);
                    continue;
                }
            };

            let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
            info!(id, %peer, "received connection");

            let handler = ConnectionHandler::new(
                stream,
                self.net.clone(),
                self.config.max_frame_size,
                self.config.byte_order,
            );

            let spawned = thread::Builder::new()
                .name(format!("shimproxy-conn-{}", id))
                .spawn(move || {
                    let _span = info_span!("connection", id, %peer).entered();
                    if let Err(err) = handler.run() {
                        error!(%err, "error handling call, dropping connection");
                    }
                });

            if let Err(err) = spawned {
                error!(id, %err, "failed to spawn connection thread");
            }
        }
    }

    /// Run [`serve`](Self::serve) on a background thread.
    pub fn spawn(self) -> thread::JoinHandle<Result<()>> {
        thread::spawn(move || self.serve())
    }
}
