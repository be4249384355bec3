//! The `Container`, `ContainerLog` and `ContainerStat` entities (spec §3).
//! Plain data plus a builder; all behavior lives on [`crate::controller`].

use common::{now_millis, Record};
use derive_builder::Builder;
use getset::{CopyGetters, Getters, Setters};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};
use strum::{AsRefStr, Display};

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Exited,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Owner,
    Public,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
/// Cgroup resource constraints requested for a container. Recorded here
/// only — the Bundle Builder does not propagate these into the emitted
/// OCI spec in this version (spec §9).
pub struct ResourceLimits {
    pub cpu_shares: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub cpu_period: Option<u64>,
    pub cpu_quota: Option<i64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub enabled: bool,
    /// Host address allocated by the Network Hook out of the bridge subnet.
    pub ip_address: Option<String>,
    pub veth_name: Option<String>,
    pub port_mappings: Vec<PortMapping>,
    pub dns: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VolumeMountEntry {
    pub volume_id: String,
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

#[derive(Builder, Clone, CopyGetters, Debug, Getters, Serialize, Deserialize, Setters)]
#[builder(pattern = "owned", setter(into, strip_option))]
pub struct Container {
    #[getset(get = "pub")]
    #[builder(setter(custom))]
    id: String,

    #[getset(get = "pub")]
    owner: String,

    #[getset(get = "pub")]
    name: String,

    #[getset(get = "pub")]
    image_id: String,

    #[getset(get_copy = "pub", set = "pub")]
    visibility: Visibility,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    autostart: bool,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default = "ContainerStatus::Created")]
    status: ContainerStatus,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    created_at: i64,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    updated_at: i64,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    started_at: Option<i64>,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    stopped_at: Option<i64>,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    last_paused_at: Option<i64>,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    last_resumed_at: Option<i64>,

    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    bundle_path: Option<PathBuf>,

    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    checkpoint_path: Option<PathBuf>,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    resources: ResourceLimits,

    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    network: NetworkConfig,

    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    volumes: Vec<VolumeMountEntry>,

    #[getset(get = "pub")]
    #[builder(default)]
    command: Vec<String>,

    #[getset(get = "pub")]
    #[builder(default)]
    env: Vec<String>,

    #[getset(get = "pub")]
    #[builder(default = "\"/\".to_string()")]
    cwd: String,

    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    config: HashMap<String, String>,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    last_exit_code: Option<i32>,
}

impl ContainerBuilder {
    /// Every container gets a random opaque id; callers never choose one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl Container {
    pub fn new_id() -> String {
        format!("c-{}", uuid::Uuid::new_v4().simple())
    }

    /// Whether the container is visible to users other than its owner.
    pub fn is_public(&self) -> bool {
        matches!(self.visibility, Visibility::Public)
    }
}

impl Record for Container {
    fn id(&self) -> &str {
        &self.id
    }
    fn owner(&self) -> &str {
        &self.owner
    }
    fn created_at(&self) -> i64 {
        self.created_at
    }
    fn set_created_at(&mut self, ts: i64) {
        self.created_at = ts;
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
    fn set_updated_at(&mut self, ts: i64) {
        self.updated_at = ts;
    }
}

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    System,
    Stdout,
    Stderr,
}

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Log messages longer than this are truncated with a trailing marker
/// (spec §3: "message text <= 10 000 bytes").
pub const MAX_LOG_MESSAGE_BYTES: usize = 10_000;
const TRUNCATION_MARKER: &str = "...[truncated]";

#[derive(Builder, Clone, CopyGetters, Debug, Getters, Serialize, Deserialize)]
#[builder(pattern = "owned", setter(into, strip_option))]
pub struct ContainerLog {
    #[getset(get = "pub")]
    #[builder(setter(custom))]
    id: String,

    #[getset(get = "pub")]
    owner: String,

    #[getset(get = "pub")]
    container_id: String,

    #[getset(get_copy = "pub")]
    kind: LogKind,

    #[getset(get_copy = "pub")]
    level: LogLevel,

    #[getset(get = "pub")]
    #[builder(setter(custom))]
    message: String,

    #[getset(get_copy = "pub")]
    #[builder(default = "now_millis()")]
    timestamp: i64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    created_at: i64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    updated_at: i64,
}

impl ContainerLogBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        let truncated = if message.len() > MAX_LOG_MESSAGE_BYTES {
            let cut = floor_char_boundary(&message, MAX_LOG_MESSAGE_BYTES - TRUNCATION_MARKER.len());
            format!("{}{}", &message[..cut], TRUNCATION_MARKER)
        } else {
            message
        };
        self.message = Some(truncated);
        self
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

impl Record for ContainerLog {
    fn id(&self) -> &str {
        &self.id
    }
    fn owner(&self) -> &str {
        &self.owner
    }
    fn created_at(&self) -> i64 {
        self.created_at
    }
    fn set_created_at(&mut self, ts: i64) {
        self.created_at = ts;
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
    fn set_updated_at(&mut self, ts: i64) {
        self.updated_at = ts;
    }
}

#[derive(Builder, Clone, CopyGetters, Debug, Getters, Serialize, Deserialize)]
#[builder(pattern = "owned", setter(into, strip_option))]
pub struct ContainerStat {
    #[getset(get = "pub")]
    #[builder(setter(custom))]
    id: String,

    #[getset(get = "pub")]
    owner: String,

    #[getset(get = "pub")]
    container_id: String,

    #[getset(get_copy = "pub")]
    timestamp: i64,

    #[getset(get_copy = "pub")]
    memory_usage: u64,

    #[getset(get_copy = "pub")]
    memory_limit: u64,

    #[getset(get_copy = "pub")]
    cpu_usage_percent: f64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    network_rx_bytes: u64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    network_tx_bytes: u64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    block_read_bytes: u64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    block_write_bytes: u64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    pid_count: u64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    created_at: i64,

    #[getset(get_copy = "pub")]
    #[builder(default)]
    updated_at: i64,
}

impl ContainerStatBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl Record for ContainerStat {
    fn id(&self) -> &str {
        &self.id
    }
    fn owner(&self) -> &str {
        &self.owner
    }
    fn created_at(&self) -> i64 {
        self.created_at
    }
    fn set_created_at(&mut self, ts: i64) {
        self.created_at = ts;
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
    fn set_updated_at(&mut self, ts: i64) {
        self.updated_at = ts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_to_created() -> anyhow::Result<()> {
        let c = ContainerBuilder::default()
            .id("c-1")
            .owner("alice")
            .name("web")
            .image_id("img-1")
            .visibility(Visibility::Owner)
            .build()?;
        assert_eq!(c.status(), ContainerStatus::Created);
        assert_eq!(c.cwd(), "/");
        assert!(!c.is_public());
        Ok(())
    }

    #[test]
    fn log_message_is_truncated() -> anyhow::Result<()> {
        let long = "x".repeat(MAX_LOG_MESSAGE_BYTES + 500);
        let log = ContainerLogBuilder::default()
            .id("l-1")
            .owner("alice")
            .container_id("c-1")
            .kind(LogKind::System)
            .level(LogLevel::Error)
            .message(long)
            .build()?;
        assert!(log.message().len() <= MAX_LOG_MESSAGE_BYTES);
        assert!(log.message().ends_with(TRUNCATION_MARKER));
        Ok(())
    }
}
