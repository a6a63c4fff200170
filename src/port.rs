//! Random selection of a free local port from the sandbox's port pool.
//!
//! The allocator reads limits and usage, then picks. Nothing is reserved:
//! two connections allocating at the same moment may be handed the same
//! port, and the later `bind` fails with `EADDRINUSE`. Accounting belongs
//! to the [`ResourceAccounting`] service.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use rand::seq::IteratorRandom;
use rand::Rng;

use crate::error::{Error, Result};
use crate::syscalls::{
    ResourceAccounting, Resources, SyscallFailure, SyscallResult, CONN_PORT, MESS_PORT,
};

/// Transport kind a port is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnKind {
    Tcp,
    Udp,
}

impl ConnKind {
    /// Resource class holding ports of this kind.
    pub fn resource(self) -> &'static str {
        match self {
            ConnKind::Tcp => CONN_PORT,
            ConnKind::Udp => MESS_PORT,
        }
    }
}

impl fmt::Display for ConnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnKind::Tcp => write!(f, "tcp"),
            ConnKind::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for ConnKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(ConnKind::Tcp),
            "udp" => Ok(ConnKind::Udp),
            other => Err(Error::InvalidConnKind(other.to_string())),
        }
    }
}

/// Pick a random available port of `kind`.
pub fn get_available_port<R: Rng + ?Sized>(
    kind: &str,
    resources: &dyn ResourceAccounting,
    rng: &mut R,
) -> Result<u16> {
    let kind: ConnKind = kind.parse()?;
    let Resources { limits, usage } = resources.getresources().map_err(|err| Error::Syscall {
        call: "getresources",
        message: err.to_string(),
    })?;

    let empty = BTreeSet::new();
    let limit = limits.get(kind.resource()).unwrap_or(&empty);
    let in_use = usage.get(kind.resource()).unwrap_or(&empty);

    limit
        .difference(in_use)
        .copied()
        .choose(rng)
        .ok_or(Error::NoPortsAvailable(kind))
}

/// A fixed port pool with usage tracked in memory.
#[derive(Debug, Default)]
pub struct StaticResources {
    limits: HashMap<String, BTreeSet<u16>>,
    usage: Mutex<HashMap<String, BTreeSet<u16>>>,
}

impl StaticResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `ports` for `kind`.
    pub fn with_ports(mut self, kind: ConnKind, ports: impl IntoIterator<Item = u16>) -> Self {
        self.limits
            .entry(kind.resource().to_string())
            .or_default()
            .extend(ports);
        self
    }

    /// Record `port` as in use.
    pub fn mark_used(&self, kind: ConnKind, port: u16) {
        if let Ok(mut usage) = self.usage.lock() {
            usage.entry(kind.resource().to_string()).or_default().insert(port);
        }
    }

    /// Return `port` to the pool.
    pub fn release(&self, kind: ConnKind, port: u16) {
        if let Ok(mut usage) = self.usage.lock() {
            if let Some(ports) = usage.get_mut(kind.resource()) {
                ports.remove(&port);
            }
        }
    }
}

impl ResourceAccounting for StaticResources {
    fn getresources(&self) -> SyscallResult<Resources> {
        let usage = self
            .usage
            .lock()
            .map_err(|_| SyscallFailure::Other {
                call: "getresources",
                message: "usage table poisoned".to_string(),
            })?
            .clone();

        Ok(Resources {
            limits: self.limits.clone(),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_picks_only_free_ports() {
        let pool = StaticResources::new().with_ports(ConnKind::Tcp, 12345..=12347);
        pool.mark_used(ConnKind::Tcp, 12345);
        pool.mark_used(ConnKind::Tcp, 12346);

        let mut rng = rng();
        for _ in 0..20 {
            assert_eq!(get_available_port("tcp", &pool, &mut rng).unwrap(), 12347);
        }
    }

    #[test]
    fn test_udp_uses_message_ports() {
        let pool = StaticResources::new()
            .with_ports(ConnKind::Tcp, [1000])
            .with_ports(ConnKind::Udp, [2000]);

        assert_eq!(get_available_port("udp", &pool, &mut rng()).unwrap(), 2000);
        assert_eq!(get_available_port("tcp", &pool, &mut rng()).unwrap(), 1000);
    }

    #[test]
    fn test_every_free_port_reachable() {
        let pool = StaticResources::new().with_ports(ConnKind::Tcp, 5000..5004);
        let mut rng = rng();
        let mut seen = BTreeSet::new();
        for _ in 0..200 {
            seen.insert(get_available_port("tcp", &pool, &mut rng).unwrap());
        }
        assert_eq!(seen, (5000..5004).collect::<BTreeSet<u16>>());
    }

    #[test]
    fn test_exhausted_pool() {
        let pool = StaticResources::new().with_ports(ConnKind::Udp, [53]);
        pool.mark_used(ConnKind::Udp, 53);

        assert!(matches!(
            get_available_port("udp", &pool, &mut rng()),
            Err(Error::NoPortsAvailable(ConnKind::Udp))
        ));

        pool.release(ConnKind::Udp, 53);
        assert_eq!(get_available_port("udp", &pool, &mut rng()).unwrap(), 53);
    }

    #[test]
    fn test_invalid_kind() {
        let pool = StaticResources::new();
        assert!(matches!(
            get_available_port("sctp", &pool, &mut rng()),
            Err(Error::InvalidConnKind(kind)) if kind == "sctp"
        ));
    }
}
