//! The Network Hook (spec §4.7, expanded SPEC_FULL.md §5): allocates a
//! bridge address and veth pair for a container's namespace, realizes
//! port mappings as host rules, and tears both down on stop.

use crate::netlink::Netlink;
use crate::pool::BridgePool;
use crate::port::PortForwarder;
use anyhow::Result;
use container::{NetworkConfig, PortMapping};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::Mutex;

/// What the caller (Lifecycle Controller, via the engine) should fold
/// into the container's `NetworkConfig` and the OCI spec's network
/// namespace entry before launch.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub ip_address: std::net::Ipv4Addr,
    /// The end moved into the container's network namespace.
    pub veth_name: String,
    /// The end that stays attached to the bridge in the host namespace;
    /// this is the name [`NetworkHook::detach`] tears down (deleting
    /// either end of a veth pair removes both).
    pub host_veth_name: String,
    /// Placeholder path the runtime is expected to populate the
    /// container's network namespace at (spec §4.1/§5).
    pub netns_path: PathBuf,
}

pub struct NetworkHook {
    bridge_name: String,
    pool: Arc<Mutex<BridgePool>>,
    netlink: Netlink,
    forwarder: PortForwarder,
}

impl NetworkHook {
    pub async fn new(bridge_name: String, subnet_cidr: &str, iptables_binary: PathBuf) -> Result<Self> {
        let pool = BridgePool::new(subnet_cidr)?;
        let netlink = Netlink::new().await?;
        netlink.ensure_bridge(&bridge_name).await?;
        Ok(Self {
            bridge_name,
            pool: Arc::new(Mutex::new(pool)),
            netlink,
            forwarder: PortForwarder::new(iptables_binary),
        })
    }

    /// Allocates an address and creates the veth pair for `container_id`,
    /// attaching the host end to the bridge. Does not yet install port
    /// mappings — call [`NetworkHook::install_ports`] once the mapping
    /// list is known (it is part of the container's own record).
    pub async fn attach(&self, container_id: &str) -> Result<Attachment> {
        let short = &container_id[..container_id.len().min(11)];
        let veth_name = format!("veth{short}");
        let host_veth_name = format!("veth{short}-br");

        let ip = {
            let mut pool = self.pool.lock().await;
            pool.allocate()?
        };

        let bridge_index = self.netlink.ensure_bridge(&self.bridge_name).await?;
        if let Err(e) = self
            .netlink
            .create_veth_pair(&host_veth_name, &veth_name, bridge_index)
            .await
        {
            self.pool.lock().await.release(ip);
            return Err(e);
        }

        Ok(Attachment {
            ip_address: ip,
            veth_name,
            host_veth_name,
            netns_path: oci::network_namespace_path(container_id),
        })
    }

    pub async fn install_ports(&self, ip: std::net::Ipv4Addr, mappings: &[PortMapping]) -> Result<()> {
        if mappings.is_empty() {
            return Ok(());
        }
        self.forwarder.install(ip, mappings).await
    }

    /// Releases the IP, tears down the veth pair, and removes port
    /// mapping rules (spec §4.7: "Cleanup on stop releases the IP and
    /// tears down the veth").
    pub async fn detach(&self, network: &NetworkConfig) -> Result<()> {
        if let Some(veth_peer_name) = &network.veth_name {
            let _ = self.netlink.delete_link(veth_peer_name).await;
        }
        if let Some(ip_str) = &network.ip_address {
            if let Ok(ip) = ip_str.parse::<std::net::Ipv4Addr>() {
                let _ = self.forwarder.remove(ip, &network.port_mappings).await;
                self.pool.lock().await.release(ip);
            }
        }
        Ok(())
    }
}
