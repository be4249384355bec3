//! OCI runtime specification (version 1.2.0), Linux platform only — this
//! engine targets a runc-compatible low level runtime exclusively, so the
//! Solaris/Windows/VM sections of the upstream spec are not modeled.
//!
//! Ported from the teacher's `oci_spec::runtime` module and trimmed to the
//! fields this engine actually emits or reads back; per-device resource
//! knobs (`weightDevice`, `throttle*Device`, hugepage limits, RDMA, seccomp,
//! Intel RDT, personality) are omitted because `linux.resources` is never
//! populated in this version (spec §9, resolved as non-propagation) — see
//! DESIGN.md.

use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
};

#[derive(PartialEq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Spec is the base configuration for the container.
pub struct Spec {
    #[getset(get = "pub")]
    #[serde(rename = "ociVersion")]
    /// Version of the Open Container Initiative Runtime Specification with
    /// which the bundle complies.
    version: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Process configures the container process.
    process: Option<Process>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Root configures the container's root filesystem.
    root: Option<Root>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Hostname configures the container's hostname.
    hostname: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Mounts configures additional mounts (on top of Root).
    mounts: Option<Vec<Mount>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Annotations contains arbitrary metadata for the container.
    annotations: Option<HashMap<String, String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Linux is platform-specific configuration for Linux based containers.
    linux: Option<Linux>,
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            version: "1.2.0".into(),
            process: None,
            root: None,
            hostname: None,
            mounts: None,
            annotations: None,
            linux: None,
        }
    }
}

impl Spec {
    /// Load a new spec from the provided file `Path`.
    pub fn from(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open file {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("deserialize OCI spec from file {}", path.display()))
    }

    /// Save the loaded spec into the provided file `Path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file =
            File::create(path).with_context(|| format!("create file {}", path.display()))?;
        serde_json::to_writer_pretty(&mut file, self)
            .with_context(|| format!("serialize OCI spec to file {}", path.display()))
    }
}

#[derive(PartialEq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Process contains information to start a specific application inside the
/// container.
pub struct Process {
    #[getset(get_copy = "pub")]
    /// Terminal creates an interactive terminal for the container.
    terminal: bool,

    /// User specifies user information for the process.
    #[getset(get = "pub")]
    user: User,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Args specifies the binary and arguments for the application to execute.
    args: Option<Vec<String>>,

    #[getset(get = "pub")]
    /// Cwd is the current working directory for the process, relative to
    /// the container's root.
    cwd: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Env populates the process environment for the process.
    env: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Capabilities are Linux capabilities that are kept for the process.
    capabilities: Option<LinuxCapabilities>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Rlimits specifies rlimit options to apply to the process.
    rlimits: Option<Vec<POSIXRlimit>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "noNewPrivileges"
    )]
    /// NoNewPrivileges controls whether additional privileges could be
    /// gained by processes in the container.
    no_new_privileges: Option<bool>,
}

impl Default for Process {
    fn default() -> Self {
        Self {
            terminal: false,
            user: User::default(),
            args: None,
            cwd: "/".into(),
            env: None,
            capabilities: None,
            rlimits: None,
            no_new_privileges: None,
        }
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxCapabilities specifies the list of allowed capabilities that are
/// kept for a process. http://man7.org/linux/man-pages/man7/capabilities.7.html
pub struct LinuxCapabilities {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Bounding is the set of capabilities checked by the kernel.
    bounding: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Effective is the set of capabilities checked by the kernel.
    effective: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Inheritable is the capabilities preserved across execve.
    inheritable: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Permitted is the limiting superset for effective capabilities.
    permitted: Option<Vec<String>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters)]
#[builder(pattern = "owned", setter(into))]
/// User specifies specific user (and group) information for the container
/// process.
pub struct User {
    #[getset(get_copy = "pub")]
    /// UID is the user id.
    uid: u32,

    #[getset(get_copy = "pub")]
    /// GID is the group id.
    gid: u32,
}

impl Default for User {
    fn default() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Root contains information about the container's root filesystem on the
/// host.
pub struct Root {
    #[getset(get = "pub")]
    /// Path is the path to the container's root filesystem, relative to the
    /// bundle.
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Readonly makes the root filesystem for the container readonly before
    /// the process is executed.
    readonly: Option<bool>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Mount specifies a mount for a container.
pub struct Mount {
    #[getset(get = "pub")]
    /// Destination is the absolute path where the mount will be placed in
    /// the container.
    destination: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    /// Type specifies the mount kind.
    typ: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Source specifies the source path of the mount.
    source: Option<PathBuf>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Options are fstab style mount options.
    options: Option<Vec<String>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Linux contains platform-specific configuration for Linux based
/// containers.
pub struct Linux {
    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "uidMappings"
    )]
    /// UIDMappings specifies user mappings for supporting user namespaces.
    uid_mappings: Option<Vec<LinuxIDMapping>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "gidMappings"
    )]
    /// GIDMappings specifies group mappings for supporting user namespaces.
    gid_mappings: Option<Vec<LinuxIDMapping>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Resources contain cgroup information for handling resource
    /// constraints for the container. Not populated by this engine (§9).
    resources: Option<LinuxResources>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Namespaces contains the namespaces that are created and/or joined by
    /// the container.
    namespaces: Option<Vec<LinuxNamespace>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "maskedPaths"
    )]
    /// MaskedPaths masks over the provided paths inside the container.
    masked_paths: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "readonlyPaths"
    )]
    /// ReadonlyPaths sets the provided paths as RO inside the container.
    readonly_paths: Option<Vec<String>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// LinuxNamespace is the configuration for a Linux namespace.
pub struct LinuxNamespace {
    #[getset(get_copy = "pub")]
    #[serde(rename = "type")]
    /// Type is the type of namespace.
    typ: LinuxNamespaceType,

    #[getset(get = "pub")]
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Path is a path to an existing namespace persisted on disk that can
    /// be joined and is of the same type.
    path: Option<PathBuf>,
}

impl LinuxNamespace {
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone, Copy)]
pub enum LinuxNamespaceType {
    #[serde(rename = "pid")]
    /// For isolating process IDs.
    Pid,

    #[serde(rename = "network")]
    /// For isolating network devices, stacks, ports, etc.
    Network,

    #[serde(rename = "mount")]
    /// For isolating mount points.
    Mount,

    #[serde(rename = "ipc")]
    /// For isolating System V IPC, POSIX message queues.
    Ipc,

    #[serde(rename = "uts")]
    /// For isolating hostname and NIS domain name.
    Uts,

    #[serde(rename = "user")]
    /// For isolating user and group IDs.
    User,

    #[serde(rename = "cgroup")]
    /// For isolating cgroup hierarchies.
    Cgroup,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters)]
#[builder(pattern = "owned", setter(into))]
/// LinuxIDMapping specifies UID/GID mappings.
pub struct LinuxIDMapping {
    #[getset(get_copy = "pub")]
    #[serde(rename = "containerID")]
    /// ContainerID is the starting UID/GID in the container.
    container_id: u32,

    #[getset(get_copy = "pub")]
    #[serde(rename = "hostID")]
    /// HostID is the starting UID/GID on the host mapped to `container_id`.
    host_id: u32,

    #[getset(get_copy = "pub")]
    /// Size is the number of IDs to be mapped.
    size: u32,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// POSIXRlimit type and restrictions.
pub struct POSIXRlimit {
    #[getset(get = "pub")]
    #[serde(rename = "type")]
    /// Type of the rlimit to set.
    typ: String,

    #[getset(get_copy = "pub")]
    /// Hard is the hard limit for the specified type.
    hard: u64,

    #[getset(get_copy = "pub")]
    /// Soft is the soft limit for the specified type.
    soft: u64,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxResources has container runtime resource constraints. Not
/// populated by the Bundle Builder in this version; carried on the
/// `Container` entity and kept here so a future version can propagate it
/// without changing the document shape.
pub struct LinuxResources {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memory: Option<LinuxMemory>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cpu: Option<LinuxCPU>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pids: Option<LinuxPids>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxMemory for Linux cgroup 'memory' resource management.
pub struct LinuxMemory {
    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Memory limit (in bytes).
    limit: Option<i64>,

    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Memory reservation or soft_limit (in bytes).
    reservation: Option<i64>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxCPU for Linux cgroup 'cpu' resource management.
pub struct LinuxCPU {
    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CPU shares (relative weight vs. other cgroups with cpu shares).
    shares: Option<u64>,

    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CPU hardcap limit (in usecs). Allowed cpu time in a given period.
    quota: Option<i64>,

    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CPU period to be used for hardcapping (in usecs).
    period: Option<u64>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// CPUs to use within the cpuset. Default is to use any CPU available.
    cpus: Option<String>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters)]
#[builder(pattern = "owned", setter(into))]
/// LinuxPids for Linux cgroup 'pids' resource management.
pub struct LinuxPids {
    #[getset(get_copy = "pub")]
    /// Maximum number of PIDs. Default is "no limit".
    limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_spec() -> Result<Spec> {
        Ok(SpecBuilder::default()
            .process(
                ProcessBuilder::default()
                    .user(UserBuilder::default().uid(0u32).gid(0u32).build()?)
                    .cwd("/")
                    .args(vec!["/entry".to_string()])
                    .build()?,
            )
            .root(RootBuilder::default().path("rootfs").readonly(true).build()?)
            .hostname("cid123")
            .build()?)
    }

    #[test]
    fn roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.json");

        let spec = sample_spec()?;
        spec.save(&path)?;

        let loaded = Spec::from(&path)?;
        assert_eq!(loaded, spec);
        Ok(())
    }

    #[test]
    fn omits_unset_fields() -> Result<()> {
        let spec = Spec::default();
        let json = serde_json::to_string(&spec)?;
        assert!(!json.contains("process"));
        assert!(!json.contains("linux"));
        Ok(())
    }
}
