//! Host-level port-mapping rules. Grounded on the same `ExecCommand`
//! pattern as `runtime::adapter` and `image::builder`: rules are realized
//! by shelling out to the host's `iptables` binary rather than linking a
//! netfilter crate, mirroring the teacher's own `network::cni::iptables`
//! module's use of the `iptables` binary via command invocation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use container::{PortMapping, Protocol};
use dyn_clone::{clone_trait_object, DynClone};
use std::{fmt::Debug, net::Ipv4Addr, path::Path, process::Output};
use tokio::process::Command;

#[async_trait]
pub trait ExecCommand: Debug + DynClone + Send + Sync {
    async fn run_output(&self, binary: &Path, args: &[String]) -> Result<Output> {
        Command::new(binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("run {}", binary.display()))
    }
}

clone_trait_object!(ExecCommand);

#[derive(Clone, Default, Debug)]
pub struct DefaultExecCommand;

impl ExecCommand for DefaultExecCommand {}

fn proto_flag(proto: Protocol) -> &'static str {
    match proto {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
    }
}

/// `iptables -t nat -A PREROUTING -p <proto> --dport <host> -j DNAT
/// --to-destination <ip>:<container>` — installs one DNAT rule per
/// mapping.
fn dnat_args(action: &str, container_ip: Ipv4Addr, mapping: &PortMapping) -> Vec<String> {
    vec![
        "-t".into(),
        "nat".into(),
        action.into(),
        "PREROUTING".into(),
        "-p".into(),
        proto_flag(mapping.protocol).into(),
        "--dport".into(),
        mapping.host_port.to_string(),
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        format!("{container_ip}:{}", mapping.container_port),
    ]
}

pub struct PortForwarder {
    binary: std::path::PathBuf,
    exec: Box<dyn ExecCommand>,
}

impl PortForwarder {
    pub fn new(binary: std::path::PathBuf) -> Self {
        Self {
            binary,
            exec: Box::new(DefaultExecCommand),
        }
    }

    pub fn with_exec(mut self, exec: Box<dyn ExecCommand>) -> Self {
        self.exec = exec;
        self
    }

    pub async fn install(&self, container_ip: Ipv4Addr, mappings: &[PortMapping]) -> Result<()> {
        for mapping in mappings {
            self.run(&dnat_args("-A", container_ip, mapping)).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, container_ip: Ipv4Addr, mappings: &[PortMapping]) -> Result<()> {
        for mapping in mappings {
            // Best-effort: a rule that was never installed (e.g. install
            // failed partway through) is not an error to remove.
            let _ = self.run(&dnat_args("-D", container_ip, mapping)).await;
        }
        Ok(())
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        let output = self.exec.run_output(&self.binary, args).await?;
        if !output.status.success() {
            anyhow::bail!(
                "iptables {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnat_args_match_expected_shape() {
        let mapping = PortMapping {
            host_port: 8080,
            container_port: 80,
            protocol: Protocol::Tcp,
        };
        let args = dnat_args("-A", "10.88.0.2".parse().unwrap(), &mapping);
        assert_eq!(
            args,
            vec![
                "-t", "nat", "-A", "PREROUTING", "-p", "tcp", "--dport", "8080", "-j", "DNAT",
                "--to-destination", "10.88.0.2:80",
            ]
        );
    }
}
