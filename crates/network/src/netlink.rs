//! Netlink wiring for the Network Hook. Ported from the teacher's
//! `network::cni::netlink::Netlink` wrapper (a cloneable handle over
//! `rtnetlink::Handle`) and extended with the veth-pair and
//! bridge-attachment calls this engine needs to perform itself, since
//! spec.md is explicit that this engine is not CNI-plugin-based (§1
//! Non-goals) — it reuses the teacher's netlink approach for the actual
//! syscalls rather than shelling out to a CNI plugin binary.

use anyhow::{Context, Result};
use futures::stream::TryStreamExt;
use log::{debug, trace};
use netlink_packet_route::rtnl::link::nlas::Nla;
use std::net::Ipv4Addr;

#[derive(Clone)]
pub struct Netlink {
    handle: rtnetlink::Handle,
}

impl Netlink {
    pub async fn new() -> Result<Self> {
        debug!("creating new netlink connection");
        let (connection, handle, _) =
            rtnetlink::new_connection().context("create new netlink connection")?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    async fn link_index_by_name(&self, name: &str) -> Result<Option<u32>> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await.context("get link by name")? {
            Some(msg) => Ok(Some(msg.header.index)),
            None => Ok(None),
        }
    }

    /// Creates the bridge device if it does not already exist, bringing
    /// it up.
    pub async fn ensure_bridge(&self, name: &str) -> Result<u32> {
        if let Some(index) = self.link_index_by_name(name).await? {
            return Ok(index);
        }
        trace!("creating bridge {name}");
        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
            .with_context(|| format!("create bridge {name}"))?;
        let index = self
            .link_index_by_name(name)
            .await?
            .with_context(|| format!("bridge {name} not found after creation"))?;
        self.set_link_up(index).await?;
        Ok(index)
    }

    /// Creates a veth pair `name`/`peer_name` and attaches `name`'s end to
    /// the bridge `bridge_index`, bringing both ends up. `peer_name` is
    /// left for the caller to move into the container's network
    /// namespace before the runtime launches.
    pub async fn create_veth_pair(&self, name: &str, peer_name: &str, bridge_index: u32) -> Result<()> {
        trace!("creating veth pair {name}/{peer_name}");
        self.handle
            .link()
            .add()
            .veth(name.to_string(), peer_name.to_string())
            .execute()
            .await
            .with_context(|| format!("create veth pair {name}/{peer_name}"))?;

        let index = self
            .link_index_by_name(name)
            .await?
            .with_context(|| format!("veth {name} not found after creation"))?;
        self.handle
            .link()
            .set(index)
            .master(bridge_index)
            .execute()
            .await
            .with_context(|| format!("attach {name} to bridge"))?;
        self.set_link_up(index).await
    }

    pub async fn set_link_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .context("set link up")
    }

    /// Deletes a link by name; missing links are not an error (the other
    /// end of a veth pair disappears when its sibling is deleted, and a
    /// container's netns teardown may have already reaped it).
    pub async fn delete_link(&self, name: &str) -> Result<()> {
        let Some(index) = self.link_index_by_name(name).await? else {
            return Ok(());
        };
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .with_context(|| format!("delete link {name}"))
    }

    /// Assigns an address to a link, used for the bridge device's own
    /// gateway address.
    pub async fn add_address(&self, index: u32, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        self.handle
            .address()
            .add(index, addr.into(), prefix)
            .execute()
            .await
            .with_context(|| format!("add address {addr}/{prefix} to link"))
    }
}

/// Extracts the interface name from a link message's NLAs, used by tests
/// and diagnostics that already have a message in hand.
pub fn link_name(nlas: &[Nla]) -> Option<String> {
    nlas.iter().find_map(|nla| match nla {
        Nla::IfName(name) => Some(name.clone()),
        _ => None,
    })
}
