//! Configuration related structures.

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use std::path::PathBuf;

#[derive(Builder, Clone, CopyGetters, Getters, Debug)]
#[builder(default, pattern = "owned", setter(into))]
/// Engine is the container lifecycle engine's full configuration surface.
pub struct Config {
    #[get_copy = "pub"]
    /// The logging level of the application.
    log_level: LevelFilter,

    #[get = "pub"]
    /// Root of the on-disk layout (images/, containers/, checkpoints/, runc-data/).
    storage_path: PathBuf,

    #[get_copy = "pub"]
    /// Whether to restart autostart-flagged containers at engine init.
    enable_autostart: bool,

    #[get_copy = "pub"]
    /// Stats collector period; 0 disables the collector.
    stats_interval_seconds: u64,

    #[get_copy = "pub"]
    /// Default retention fetch limit for log queries.
    max_logs: u64,

    #[get_copy = "pub"]
    /// Number of stats collector ticks between retention prunes.
    stats_retention_prune_every_ticks: u64,

    #[get_copy = "pub"]
    /// Number of ContainerStat samples retained per container by the pruner.
    stats_retention_count: u64,

    #[get_copy = "pub"]
    /// Default cpu-shares for containers that do not specify one.
    default_cpu_share: u64,

    #[get_copy = "pub"]
    /// Default memory limit (MiB) for containers that do not specify one.
    default_memory_mb: u64,

    #[get_copy = "pub"]
    /// Whether the Network Hook is active.
    enable_networking: bool,

    #[get = "pub"]
    /// Bridge device name used by the Network Hook.
    network_bridge: String,

    #[get = "pub"]
    /// CIDR of the bridge subnet the Network Hook allocates addresses from.
    network_subnet: String,

    #[get_copy = "pub"]
    /// Forces no-new-privileges=true in every emitted OCI spec.
    disable_privileged: bool,

    #[get_copy = "pub"]
    /// Health Monitor poll period.
    health_interval_seconds: u64,

    #[get_copy = "pub"]
    /// Maximum containers a single owner may create; 0 means unlimited.
    max_containers_per_owner: u64,

    #[get = "pub"]
    /// Path to the runc-compatible low level runtime binary.
    runtime_binary: PathBuf,

    #[get = "pub"]
    /// Path to the CRIU-compatible checkpoint/restore binary.
    checkpoint_binary: PathBuf,

    #[get = "pub"]
    /// Unprivileged host uid that container-root is mapped to.
    unprivileged_uid: u32,

    #[get = "pub"]
    /// Unprivileged host gid that container-root is mapped to.
    unprivileged_gid: u32,

    #[get = "pub"]
    /// External build-spec backend for the Image Service; `None` leaves
    /// `build-spec` sources inert (record created, nothing materialized).
    build_binary: Option<PathBuf>,

    #[get = "pub"]
    /// External registry-pull backend for the Image Service; `None`
    /// leaves `registry` sources inert.
    pull_binary: Option<PathBuf>,

    #[get = "pub"]
    /// `iptables`-compatible binary the Network Hook uses for port-mapping
    /// DNAT rules.
    iptables_binary: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            storage_path: PathBuf::from("/var/lib/containrs-lite"),
            enable_autostart: true,
            stats_interval_seconds: 5,
            max_logs: 1000,
            stats_retention_prune_every_ticks: 100,
            stats_retention_count: 0,
            default_cpu_share: 1024,
            default_memory_mb: 128,
            enable_networking: false,
            network_bridge: "cni0".into(),
            network_subnet: "10.88.0.0/16".into(),
            disable_privileged: true,
            health_interval_seconds: 30,
            max_containers_per_owner: 0,
            runtime_binary: PathBuf::from("runc"),
            checkpoint_binary: PathBuf::from("criu"),
            unprivileged_uid: 100000,
            unprivileged_gid: 100000,
            build_binary: None,
            pull_binary: None,
            iptables_binary: PathBuf::from("iptables"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = Config::default();
        assert_eq!(c.log_level(), LevelFilter::Info);
        assert!(c.enable_autostart());
        assert_eq!(c.max_containers_per_owner(), 0);
    }

    #[test]
    fn build_config() -> anyhow::Result<()> {
        let c = ConfigBuilder::default()
            .log_level(LevelFilter::Warn)
            .storage_path("/some/path")
            .build()?;

        assert_eq!(c.log_level(), LevelFilter::Warn);
        assert_eq!(&c.storage_path().display().to_string(), "/some/path");
        Ok(())
    }
}
