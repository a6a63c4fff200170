//! shimproxy CLI tool
//!
//! Runs the translation proxy against the host kernel's sockets.

use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::process;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shimproxy::{ByteOrder, ProxyConfig, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "shimproxy")]
#[command(version)]
#[command(about = "Translation proxy for shimmed libc network calls", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "SHIMPROXY_LISTEN", default_value = "127.0.0.1")]
    listen: IpAddr,

    /// Port to listen on
    #[arg(long, env = "SHIMPROXY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Shim stack, e.g. "(CompressionShim)" or "(LogShim,calls.log)"
    #[arg(long, env = "SHIMPROXY_SHIM", default_value = "")]
    shim: String,

    /// Transport timeout in seconds (0 disables)
    #[arg(long, env = "SHIMPROXY_TIMEOUT_SECS", default_value_t = 10)]
    timeout_secs: u64,

    /// Largest request frame read at once
    #[arg(long, env = "SHIMPROXY_MAX_FRAME", default_value_t = shimproxy::protocol::MAX_FRAME_SIZE)]
    max_frame: usize,

    /// Encode the response errno big-endian
    #[arg(long, env = "SHIMPROXY_BIG_ENDIAN")]
    big_endian: bool,

    /// Ports handed out for bind(fd, ip, 0), e.g. 40000-40100
    #[arg(long, env = "SHIMPROXY_PORT_RANGE", value_parser = parse_port_range)]
    port_range: Option<RangeInclusive<u16>>,
}

impl Cli {
    fn config(&self) -> ProxyConfig {
        let order = if self.big_endian {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        };

        ProxyConfig::new()
            .listen_ip(self.listen)
            .listen_port(self.port)
            .shim(self.shim.clone())
            .timeout(Duration::from_secs(self.timeout_secs))
            .max_frame_size(self.max_frame)
            .byte_order(order)
    }
}

fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, String> {
    let (low, high) = s
        .split_once('-')
        .ok_or_else(|| format!("expected LOW-HIGH, got '{}'", s))?;
    let low: u16 = low.trim().parse().map_err(|e| format!("bad low port: {}", e))?;
    let high: u16 = high.trim().parse().map_err(|e| format!("bad high port: {}", e))?;
    if low == 0 || low > high {
        return Err(format!("invalid port range {}-{}", low, high));
    }
    Ok(low..=high)
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

#[cfg(unix)]
fn run(cli: Cli) -> shimproxy::Result<()> {
    use std::sync::Arc;

    use shimproxy::{ConnKind, HostSyscalls, Server, StaticResources};

    let mut net = HostSyscalls::new();
    if let Some(range) = &cli.port_range {
        let pool = StaticResources::new()
            .with_ports(ConnKind::Tcp, range.clone())
            .with_ports(ConnKind::Udp, range.clone());
        net = net.with_port_pool(Arc::new(pool));
    }

    let server = Server::bind(cli.config(), Arc::new(net))?;
    server.serve()
}

#[cfg(not(unix))]
fn run(_cli: Cli) -> shimproxy::Result<()> {
    Err(shimproxy::Error::InvalidConfig(
        "the host syscall layer needs a unix platform".into(),
    ))
}
