//! Per-bridge IP address pool. Grounded on the teacher's use of
//! `ipnetwork::Ipv4Network` (`crates/network`'s own dependency list) for
//! subnet arithmetic; allocation bookkeeping itself is new — the teacher
//! delegates addressing to an external CNI plugin (spec §1 Non-goals
//! exclude CNI-plugin protocol implementation, so this engine allocates
//! directly instead).

use anyhow::{Context, Result};
use common::EngineError;
use ipnetwork::Ipv4Network;
use std::{collections::HashSet, net::Ipv4Addr, str::FromStr};

/// Tracks which addresses in a bridge's subnet are currently handed out.
/// The network and broadcast addresses are never allocated; by
/// convention the first usable address is reserved for the bridge device
/// itself.
pub struct BridgePool {
    subnet: Ipv4Network,
    allocated: HashSet<Ipv4Addr>,
}

impl BridgePool {
    pub fn new(cidr: &str) -> Result<Self> {
        let subnet = Ipv4Network::from_str(cidr).with_context(|| format!("parse subnet {cidr}"))?;
        let mut allocated = HashSet::new();
        if let Some(bridge_addr) = subnet.iter().nth(1) {
            allocated.insert(bridge_addr);
        }
        Ok(Self { subnet, allocated })
    }

    /// Allocates the next free host address, or `ResourceExhausted` if the
    /// subnet's free-address pool is empty (spec §7/§9).
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        for addr in self.subnet.iter() {
            if addr == self.subnet.network() || addr == self.subnet.broadcast() {
                continue;
            }
            if !self.allocated.contains(&addr) {
                self.allocated.insert(addr);
                return Ok(addr);
            }
        }
        Err(EngineError::ResourceExhausted(format!(
            "bridge subnet {} has no free addresses",
            self.subnet
        ))
        .into())
    }

    pub fn release(&mut self, addr: Ipv4Addr) {
        self.allocated.remove(&addr);
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_addresses() -> Result<()> {
        let mut pool = BridgePool::new("10.88.0.0/30")?;
        // /30 has 4 addresses: network, bridge (reserved), one usable, broadcast.
        let a = pool.allocate()?;
        let err = pool.allocate().unwrap_err();
        assert!(err.to_string().contains("resource exhausted"));

        pool.release(a);
        let b = pool.allocate()?;
        assert_eq!(a, b);
        Ok(())
    }
}
