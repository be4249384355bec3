//! Bundle Builder (spec §4.1): materializes `<bundle>/rootfs/` as an exact
//! copy of an image's rootfs tree and emits `<bundle>/scripts/config.json`,
//! the OCI runtime specification document.

use crate::runtime_spec::{
    LinuxBuilder, LinuxIDMappingBuilder, LinuxNamespace, LinuxNamespaceType, Mount as SpecMount,
    MountBuilder, ProcessBuilder, RootBuilder, Spec, SpecBuilder, UserBuilder,
};
use anyhow::{bail, Context, Result};
use common::EngineError;
use derive_builder::Builder;
use getset::Getters;
use std::{
    fs,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

/// A mount the requesting container wants materialized into the bundle;
/// produced by the Volume Service from the container's volume-mount list.
#[derive(Clone, Debug)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

#[derive(Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Everything the Bundle Builder needs to materialize one container bundle.
pub struct BundleRequest {
    #[get = "pub"]
    /// Container id; used as the bundle directory name and OCI hostname.
    container_id: String,

    #[get = "pub"]
    /// Absolute path to the image's materialized rootfs tree.
    image_rootfs: PathBuf,

    #[get = "pub"]
    /// Root of the on-disk bundle layout (`<storage-path>/containers`).
    containers_root: PathBuf,

    #[get = "pub"]
    #[builder(default)]
    /// argv for the container's init process.
    command: Vec<String>,

    #[get = "pub"]
    #[builder(default)]
    env: Vec<String>,

    #[get = "pub"]
    #[builder(default = "\"/\".to_string()")]
    cwd: String,

    #[get = "pub"]
    #[builder(default)]
    volumes: Vec<VolumeMount>,

    #[get = "pub"]
    #[builder(default = "true")]
    /// Mirrors `config.DisablePrivileged`.
    disable_privileged: bool,

    #[get = "pub"]
    #[builder(default = "true")]
    network_enabled: bool,

    #[get = "pub"]
    #[builder(default = "100000")]
    unprivileged_uid: u32,

    #[get = "pub"]
    #[builder(default = "100000")]
    unprivileged_gid: u32,
}

/// Default capability set granted to every container (spec §4.1).
const DEFAULT_CAPS: &[&str] = &["CAP_AUDIT_WRITE", "CAP_KILL", "CAP_NET_BIND_SERVICE"];

#[derive(Default)]
pub struct BundleBuilder;

impl BundleBuilder {
    /// Build the bundle directory for `req`, returning its path. Partial
    /// bundles are left on disk on failure — cleanup is the Lifecycle
    /// Controller's responsibility.
    pub fn build(&self, req: &BundleRequest) -> Result<PathBuf> {
        if !req.image_rootfs.is_dir() {
            return Err(EngineError::BundleSourceMissing(
                req.image_rootfs.display().to_string(),
            )
            .into());
        }

        let bundle_dir = req.containers_root.join(&req.container_id);
        let rootfs_dir = bundle_dir.join("rootfs");
        let scripts_dir = bundle_dir.join("scripts");
        fs::create_dir_all(&scripts_dir).context("create bundle scripts dir")?;
        fs::create_dir(&rootfs_dir).context("create bundle rootfs dir")?;
        fs::set_permissions(&rootfs_dir, fs::Permissions::from_mode(0o755))
            .context("set rootfs mode")?;

        copy_tree(&req.image_rootfs, &rootfs_dir)
            .with_context(|| format!("copy rootfs from {}", req.image_rootfs.display()))?;

        let spec = self.build_spec(req)?;
        spec.save(&scripts_dir.join("config.json"))
            .context("write OCI runtime spec")?;

        Ok(bundle_dir)
    }

    fn build_spec(&self, req: &BundleRequest) -> Result<Spec> {
        let process = ProcessBuilder::default()
            .terminal(false)
            .user(UserBuilder::default().uid(0u32).gid(0u32).build()?)
            .args(req.command.clone())
            .cwd(req.cwd.clone())
            .env(req.env.clone())
            .no_new_privileges(req.disable_privileged)
            .capabilities(
                crate::runtime_spec::LinuxCapabilitiesBuilder::default()
                    .bounding(caps())
                    .effective(caps())
                    .permitted(caps())
                    .build()?,
            )
            .rlimits(vec![crate::runtime_spec::POSIXRlimitBuilder::default()
                .typ("RLIMIT_NOFILE")
                .soft(1024u64)
                .hard(1024u64)
                .build()?])
            .build()?;

        let root = RootBuilder::default().path("rootfs").readonly(true).build()?;

        let mut namespaces = [
            LinuxNamespaceType::Pid,
            LinuxNamespaceType::Ipc,
            LinuxNamespaceType::Uts,
            LinuxNamespaceType::Mount,
            LinuxNamespaceType::Cgroup,
            LinuxNamespaceType::User,
            LinuxNamespaceType::Network,
        ]
        .iter()
        .map(|typ| -> Result<LinuxNamespace> {
            Ok(crate::runtime_spec::LinuxNamespaceBuilder::default()
                .typ(*typ)
                .build()?)
        })
        .collect::<Result<Vec<_>>>()?;

        if req.network_enabled {
            // Matches the Network Hook's own deterministic convention
            // (spec §4.7: "the path is filled in to the runtime spec's
            // network namespace entry before launch"); the hook joins
            // this same namespace rather than creating a fresh one.
            let ns = namespaces
                .iter_mut()
                .find(|ns| ns.typ() == LinuxNamespaceType::Network)
                .expect("network namespace always present");
            ns.set_path(network_namespace_path(&req.container_id));
        }

        let linux = LinuxBuilder::default()
            .uid_mappings(vec![LinuxIDMappingBuilder::default()
                .container_id(0u32)
                .host_id(req.unprivileged_uid)
                .size(1u32)
                .build()?])
            .gid_mappings(vec![LinuxIDMappingBuilder::default()
                .container_id(0u32)
                .host_id(req.unprivileged_gid)
                .size(1u32)
                .build()?])
            .namespaces(namespaces)
            .masked_paths(
                [
                    "/proc/acpi",
                    "/proc/asound",
                    "/proc/kcore",
                    "/proc/keys",
                    "/proc/latency_stats",
                    "/proc/timer_list",
                    "/proc/timer_stats",
                    "/proc/sched_debug",
                    "/sys/firmware",
                    "/proc/scsi",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            )
            .readonly_paths(
                [
                    "/proc/bus",
                    "/proc/fs",
                    "/proc/irq",
                    "/proc/sys",
                    "/proc/sysrq-trigger",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            )
            .build()?;

        let mounts = default_mounts(req)?;

        Ok(SpecBuilder::default()
            .version("1.2.0")
            .process(process)
            .root(root)
            .hostname(req.container_id.clone())
            .mounts(mounts)
            .linux(linux)
            .build()?)
    }
}

fn caps() -> Vec<String> {
    DEFAULT_CAPS.iter().map(|s| s.to_string()).collect()
}

/// The persisted network namespace path a container's bundle joins when
/// networking is enabled (spec §4.7). The Network Hook creates and
/// populates the namespace at this same path before launch; both sides
/// rely on this single naming convention rather than passing the path
/// through the bundle build.
pub fn network_namespace_path(container_id: &str) -> PathBuf {
    PathBuf::from(format!("/var/run/netns/{container_id}"))
}

fn default_mounts(req: &BundleRequest) -> Result<Vec<SpecMount>> {
    let mut mounts = vec![
        MountBuilder::default()
            .destination("/proc")
            .typ("proc")
            .source("proc")
            .options(Vec::<String>::new())
            .build()?,
        MountBuilder::default()
            .destination("/dev")
            .typ("tmpfs")
            .source("tmpfs")
            .options(vec!["nosuid".into(), "strictatime".into(), "mode=755".into(), "size=65536k".into()])
            .build()?,
        MountBuilder::default()
            .destination("/dev/pts")
            .typ("devpts")
            .source("devpts")
            .options(vec!["nosuid".into(), "noexec".into(), "newinstance".into(), "ptmxmode=0666".into(), "mode=0620".into()])
            .build()?,
        MountBuilder::default()
            .destination("/dev/shm")
            .typ("tmpfs")
            .source("shm")
            .options(vec!["nosuid".into(), "noexec".into(), "nodev".into(), "mode=1777".into(), "size=65536k".into()])
            .build()?,
        MountBuilder::default()
            .destination("/dev/mqueue")
            .typ("mqueue")
            .source("mqueue")
            .options(vec!["nosuid".into(), "noexec".into(), "nodev".into()])
            .build()?,
        MountBuilder::default()
            .destination("/sys")
            .typ("bind")
            .source("/sys")
            .options(vec!["rbind".into(), "nosuid".into(), "noexec".into(), "nodev".into(), "ro".into()])
            .build()?,
        MountBuilder::default()
            .destination("/sys/fs/cgroup")
            .typ("cgroup")
            .source("cgroup")
            .options(vec!["nosuid".into(), "noexec".into(), "nodev".into(), "relatime".into(), "ro".into()])
            .build()?,
    ];

    for v in &req.volumes {
        let ro_opt = if v.read_only { "ro" } else { "rw" };
        mounts.push(
            MountBuilder::default()
                .destination(v.container_path.clone())
                .typ("bind")
                .source(v.host_path.clone())
                .options(vec!["rbind".into(), ro_opt.into()])
                .build()?,
        );
    }

    Ok(mounts)
}

/// Recursively copy `src` into `dst`, preserving permissions, ownership,
/// symlinks and modification time. `dst` must already exist. Exposed so the
/// Image Service can reuse it when materializing an imported rootfs
/// (spec §5 "reusing the Bundle Builder's permission-preserving copy
/// routine").
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src).with_context(|| format!("read dir {}", src.display()))? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("symlink {}", dst_path.display()))?;
            let meta = entry.metadata()?;
            let times = filetime::FileTime::from_last_modification_time(&meta);
            let atime = filetime::FileTime::from_last_access_time(&meta);
            let _ = filetime::set_symlink_file_times(&dst_path, atime, times);
        } else if file_type.is_dir() {
            let meta = entry.metadata()?;
            fs::create_dir(&dst_path).with_context(|| format!("mkdir {}", dst_path.display()))?;
            fs::set_permissions(&dst_path, meta.permissions())?;
            copy_tree(&src_path, &dst_path)?;
            chown(&dst_path, meta.uid(), meta.gid())?;
            let atime = filetime::FileTime::from_last_access_time(&meta);
            let mtime = filetime::FileTime::from_last_modification_time(&meta);
            filetime::set_file_times(&dst_path, atime, mtime)
                .with_context(|| format!("set times {}", dst_path.display()))?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("copy {} -> {}", src_path.display(), dst_path.display()))?;
            let meta = entry.metadata()?;
            fs::set_permissions(&dst_path, meta.permissions())?;
            chown(&dst_path, meta.uid(), meta.gid())?;
            let atime = filetime::FileTime::from_last_access_time(&meta);
            let mtime = filetime::FileTime::from_last_modification_time(&meta);
            filetime::set_file_times(&dst_path, atime, mtime)
                .with_context(|| format!("set times {}", dst_path.display()))?;
        }
    }
    Ok(())
}

/// Best-effort: running as non-root the engine may not be able to chown to
/// arbitrary owners, so failures here are not fatal to bundle construction.
fn chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    use nix::unistd::{Gid, Uid};
    let _ = nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_image(root: &Path) -> Result<PathBuf> {
        let rootfs = root.join("image-rootfs");
        fs::create_dir_all(rootfs.join("bin"))?;
        fs::write(rootfs.join("bin").join("entry"), b"#!/bin/sh\n")?;
        fs::set_permissions(rootfs.join("bin").join("entry"), fs::Permissions::from_mode(0o755))?;
        Ok(rootfs)
    }

    #[test]
    fn builds_bundle_with_rootfs_and_config() -> Result<()> {
        let dir = TempDir::new()?;
        let rootfs = make_image(dir.path())?;
        let containers_root = dir.path().join("containers");
        fs::create_dir_all(&containers_root)?;

        let req = BundleRequestBuilder::default()
            .container_id("c1")
            .image_rootfs(rootfs)
            .containers_root(containers_root)
            .command(vec!["/bin/entry".to_string()])
            .build()?;

        let bundle = BundleBuilder::default().build(&req)?;
        assert!(bundle.join("rootfs/bin/entry").exists());
        assert!(bundle.join("scripts/config.json").exists());

        let spec = Spec::from(&bundle.join("scripts/config.json"))?;
        assert_eq!(spec.hostname().as_deref(), Some("c1"));
        assert_eq!(spec.root().as_ref().unwrap().path(), &PathBuf::from("rootfs"));
        Ok(())
    }

    #[test]
    fn copy_tree_preserves_mtime() -> Result<()> {
        let dir = TempDir::new()?;
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("sub"))?;
        fs::write(src.join("sub").join("file"), b"hello")?;
        std::os::unix::fs::symlink("file", src.join("sub").join("link"))?;

        let old = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_times(src.join("sub").join("file"), old, old)?;
        filetime::set_symlink_file_times(src.join("sub").join("link"), old, old)?;
        filetime::set_file_times(src.join("sub"), old, old)?;

        let dst = dir.path().join("dst");
        fs::create_dir_all(&dst)?;
        copy_tree(&src, &dst)?;

        let file_meta = fs::symlink_metadata(dst.join("sub").join("file"))?;
        assert_eq!(filetime::FileTime::from_last_modification_time(&file_meta), old);
        let link_meta = fs::symlink_metadata(dst.join("sub").join("link"))?;
        assert_eq!(filetime::FileTime::from_last_modification_time(&link_meta), old);
        let dir_meta = fs::symlink_metadata(dst.join("sub"))?;
        assert_eq!(filetime::FileTime::from_last_modification_time(&dir_meta), old);
        Ok(())
    }

    #[test]
    fn missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let req = BundleRequestBuilder::default()
            .container_id("c1")
            .image_rootfs(dir.path().join("does-not-exist"))
            .containers_root(dir.path().join("containers"))
            .build()
            .unwrap();

        let err = BundleBuilder::default().build(&req).unwrap_err();
        assert!(err.to_string().contains("bundle source missing"));
    }
}
