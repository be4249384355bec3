//! The engine entry point: the only crate that sees every entity and
//! service, so it is the one place cross-cutting wiring (network
//! attach/detach around lifecycle transitions, health registration,
//! coordinated shutdown) belongs (spec §5).

use anyhow::{Context, Result};
use common::{Config, EngineError, RecordStore};
use container::{
    Container, ContainerLog, ContainerStat, CreateRequest as ContainerCreateRequest,
    LifecycleController, NetworkConfig, ResourceLimits, Visibility, VolumeMountEntry,
};
use health::{HealthMonitor, RestartPolicy};
use image::Image;
use network::NetworkHook;
use runtime::RuntimeAdapterBuilder;
use stats::StatsCollector;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};
use tokio::sync::{oneshot, Mutex};
use volume::Volume;

/// One requested volume bind for [`CreateContainerRequest`].
pub struct VolumeRequest {
    pub volume_id: String,
    pub container_path: PathBuf,
    pub read_only: bool,
}

pub struct CreateContainerRequest {
    pub owner: String,
    pub name: String,
    pub image_id: String,
    pub visibility: Visibility,
    pub autostart: bool,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub cwd: Option<String>,
    pub resources: ResourceLimits,
    pub network_enabled: bool,
    pub volumes: Vec<VolumeRequest>,
}

/// Restart policy registered with the Health Monitor the first time a
/// container starts running; re-supplied by the caller on every
/// `start_container` call since it is not persisted on the entity
/// (spec §4.6 describes the registration map itself as in-memory).
#[derive(Clone, Copy, Debug)]
pub struct HealthPolicy {
    pub policy: RestartPolicy,
    pub max_retries: u32,
}

type LoopHandle = (tokio::task::JoinHandle<()>, oneshot::Sender<()>);

#[derive(Default)]
struct Loops {
    stats: Option<LoopHandle>,
    health: Option<LoopHandle>,
}

pub struct Engine {
    config: Arc<Config>,
    containers: Arc<LifecycleController>,
    images: Arc<image::ImageService>,
    volumes: Arc<volume::VolumeService>,
    network: OnceLock<Arc<NetworkHook>>,
    stats: Arc<StatsCollector>,
    health: Arc<HealthMonitor>,
    checkpoint_available: AtomicBool,
    loops: Mutex<Loops>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        container_store: Arc<dyn RecordStore<Container>>,
        log_store: Arc<dyn RecordStore<ContainerLog>>,
        stat_store: Arc<dyn RecordStore<ContainerStat>>,
        image_store: Arc<dyn RecordStore<Image>>,
        volume_store: Arc<dyn RecordStore<Volume>>,
    ) -> Result<Self> {
        Self::new_with_exec(
            config,
            container_store,
            log_store,
            stat_store,
            image_store,
            volume_store,
            Box::new(runtime::DefaultExecCommand),
        )
    }

    /// Same as [`Engine::new`] but with the external `runc`/`criu`
    /// invocations swapped out. The production path never calls this
    /// directly — but integration tests elsewhere in the workspace use it
    /// to drive the whole engine without real runtime binaries on `PATH`.
    pub fn new_with_exec(
        config: Arc<Config>,
        container_store: Arc<dyn RecordStore<Container>>,
        log_store: Arc<dyn RecordStore<ContainerLog>>,
        stat_store: Arc<dyn RecordStore<ContainerStat>>,
        image_store: Arc<dyn RecordStore<Image>>,
        volume_store: Arc<dyn RecordStore<Volume>>,
        exec: Box<dyn runtime::ExecCommand>,
    ) -> Result<Self> {
        let runtime_adapter = Arc::new(
            RuntimeAdapterBuilder::default()
                .runtime_binary(config.runtime_binary().clone())
                .checkpoint_binary(config.checkpoint_binary().clone())
                .state_dir(config.storage_path().join("runc-data"))
                .build()?
                .with_exec(exec),
        );

        let containers = Arc::new(LifecycleController::new(
            config.clone(),
            container_store.clone(),
            log_store,
            runtime_adapter,
        ));

        let images = Arc::new(image::ImageService::new(
            image_store,
            config.storage_path().join("images"),
            config.build_binary().clone(),
            config.pull_binary().clone(),
        ));

        let volumes = Arc::new(volume::VolumeService::new(volume_store));

        let stats = Arc::new(StatsCollector::new(
            container_store,
            stat_store,
            containers.clone(),
            Duration::from_secs(config.stats_interval_seconds()),
            config.stats_retention_count(),
            config.stats_retention_prune_every_ticks(),
        ));

        let health = Arc::new(HealthMonitor::new(
            containers.clone(),
            Duration::from_secs(config.health_interval_seconds()),
        ));

        Ok(Self {
            config,
            containers,
            images,
            volumes,
            network: OnceLock::new(),
            stats,
            health,
            checkpoint_available: AtomicBool::new(false),
            loops: Mutex::new(Loops::default()),
        })
    }

    pub fn containers(&self) -> &Arc<LifecycleController> {
        &self.containers
    }

    pub fn images(&self) -> &Arc<image::ImageService> {
        &self.images
    }

    pub fn volumes(&self) -> &Arc<volume::VolumeService> {
        &self.volumes
    }

    /// Verifies the external runtime binaries, brings up the bridge if
    /// networking is enabled, starts autostart-flagged containers, and
    /// spawns the stats/health background loops (spec §4.3/§6.2).
    pub async fn init(&self) -> Result<()> {
        std::fs::create_dir_all(self.config.storage_path())
            .context("storage path must be writable at init")?;

        if which::which(self.config.runtime_binary()).is_err() {
            log::warn!(
                "runtime binary {} not found on PATH; launch will fail",
                self.config.runtime_binary().display()
            );
        }
        self.checkpoint_available
            .store(which::which(self.config.checkpoint_binary()).is_ok(), Ordering::SeqCst);
        if !self.checkpoint_available.load(Ordering::SeqCst) {
            log::warn!(
                "checkpoint binary {} not found on PATH; pause/resume unavailable",
                self.config.checkpoint_binary().display()
            );
        }

        if self.config.enable_networking() {
            let hook = NetworkHook::new(
                self.config.network_bridge().to_string(),
                self.config.network_subnet(),
                self.config.iptables_binary().clone(),
            )
            .await
            .context("bring up bridge")?;
            let _ = self.network.set(Arc::new(hook));
        }

        if self.config.enable_autostart() {
            self.containers.autostart_all(None).await?;
        }

        let mut loops = self.loops.lock().await;
        loops.stats = self.stats.clone().spawn();
        loops.health = self.health.clone().spawn();
        Ok(())
    }

    pub async fn create_container(&self, req: CreateContainerRequest) -> Result<Container> {
        let image = self.images.get(&req.image_id, &req.owner)?;
        let image_rootfs = image
            .path()
            .clone()
            .ok_or_else(|| EngineError::BundleSourceMissing(req.image_id.clone()))?;

        let mut entries = Vec::with_capacity(req.volumes.len());
        for vr in &req.volumes {
            let volume = self.volumes.get(&vr.volume_id, &req.owner)?;
            entries.push(VolumeMountEntry {
                volume_id: vr.volume_id.clone(),
                host_path: volume.host_path().clone(),
                container_path: vr.container_path.clone(),
                read_only: vr.read_only,
            });
        }

        let container = self
            .containers
            .create(ContainerCreateRequest {
                owner: req.owner.clone(),
                name: req.name,
                image_id: req.image_id,
                image_rootfs,
                visibility: req.visibility,
                autostart: req.autostart,
                command: req.command,
                env: req.env,
                cwd: req.cwd,
                resources: req.resources,
                network_enabled: req.network_enabled,
                volumes: entries,
            })
            .await?;

        for vr in &req.volumes {
            self.volumes
                .mount(&vr.volume_id, container.id(), &req.owner, true, vr.container_path.clone(), vr.read_only)
                .await?;
        }

        Ok(container)
    }

    /// Attaches networking (first start only; a restored or crash-recovered
    /// container keeps its existing veth), launches the container, and
    /// registers it with the Health Monitor under `health_policy`.
    pub async fn start_container(
        &self,
        id: &str,
        caller: &str,
        health_policy: Option<HealthPolicy>,
    ) -> Result<Container> {
        let mut container = self
            .containers
            .containers()
            .find_by_id(id)?
            .ok_or_else(|| EngineError::NotFound(format!("container {id}")))?;

        if container.network().enabled && container.network().ip_address.is_none() {
            let hook = self
                .network
                .get()
                .ok_or_else(|| anyhow::anyhow!("networking requested but the Network Hook is disabled"))?;
            let attachment = hook.attach(id).await?;
            hook.install_ports(attachment.ip_address, &container.network().port_mappings)
                .await?;
            let updated = NetworkConfig {
                enabled: true,
                ip_address: Some(attachment.ip_address.to_string()),
                veth_name: Some(attachment.host_veth_name),
                port_mappings: container.network().port_mappings.clone(),
                dns: container.network().dns.clone(),
            };
            container.set_network(updated);
            self.containers.containers().save_record(&mut container)?;
        }

        let started = self.containers.start(id, caller).await?;
        if let Some(policy) = health_policy {
            self.health.register(id, policy.policy, policy.max_retries).await;
        }
        Ok(started)
    }

    pub async fn stop_container(&self, id: &str, caller: &str) -> Result<Container> {
        self.health.deregister(id).await;
        let mut container = self.containers.stop(id, caller).await?;
        self.release_network(&mut container).await?;
        Ok(container)
    }

    pub async fn pause_container(&self, id: &str, caller: &str) -> Result<Container> {
        if !self.checkpoint_available.load(Ordering::SeqCst) {
            return Err(EngineError::CheckpointUnavailable(id.to_string()).into());
        }
        self.containers.pause(id, caller).await
    }

    pub async fn resume_container(&self, id: &str, caller: &str) -> Result<Container> {
        self.containers.resume(id, caller).await
    }

    pub async fn delete_container(&self, id: &str, caller: &str) -> Result<()> {
        self.health.deregister(id).await;
        if let Some(mut container) = self.containers.containers().find_by_id(id)? {
            for entry in container.volumes().clone() {
                self.volumes.unmount(&entry.volume_id, id, caller).await?;
            }
            self.release_network(&mut container).await?;
        }
        self.containers.delete(id, caller).await
    }

    async fn release_network(&self, container: &mut Container) -> Result<()> {
        if !container.network().enabled || container.network().ip_address.is_none() {
            return Ok(());
        }
        if let Some(hook) = self.network.get() {
            hook.detach(container.network()).await?;
        }
        let cleared = NetworkConfig {
            enabled: true,
            ip_address: None,
            veth_name: None,
            port_mappings: container.network().port_mappings.clone(),
            dns: container.network().dns.clone(),
        };
        container.set_network(cleared);
        self.containers.containers().save_record(container)?;
        Ok(())
    }

    /// Stops the health and stats loops, then stops every running
    /// container (releasing its network attachment) with a grace period
    /// per container (spec §5 `ShutdownAll(deadline)`).
    pub async fn shutdown_all(&self, deadline: Duration) -> Result<()> {
        let loops = std::mem::take(&mut *self.loops.lock().await);
        if let Some((handle, stop)) = loops.stats {
            let _ = stop.send(());
            let _ = handle.await;
        }
        if let Some((handle, stop)) = loops.health {
            let _ = stop.send(());
            let _ = handle.await;
        }

        let running = self
            .containers
            .containers()
            .find_all_by_filter(&|c: &Container| c.status() == container::ContainerStatus::Running)?;
        for c in running {
            let id = c.id().to_string();
            let owner = c.owner().to_string();
            if tokio::time::timeout(deadline, self.stop_container(&id, &owner))
                .await
                .is_err()
            {
                log::error!("stop_container({id}) did not complete within shutdown grace period");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use container::ContainerStatus;
    use image::{ImageSource, Visibility as ImageVisibility};
    use std::{os::unix::process::ExitStatusExt, process::Output};
    use storage::{MemoryKeyValueStorage, TypedRecordStore};
    use tempfile::TempDir;
    use volume::Visibility as VolumeVisibility;

    #[derive(Clone, Debug, Default)]
    struct AlwaysSucceeds;

    #[async_trait]
    impl runtime::ExecCommand for AlwaysSucceeds {
        async fn run_output(&self, _binary: &std::path::Path, _args: &[String]) -> Result<Output> {
            Ok(Output {
                status: std::process::ExitStatus::from_raw(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    fn test_engine(dir: &TempDir) -> Engine {
        let config = Arc::new(
            common::ConfigBuilder::default()
                .storage_path(dir.path().to_path_buf())
                .enable_autostart(false)
                .enable_networking(false)
                .build()
                .unwrap(),
        );
        let container_store: Arc<dyn RecordStore<Container>> =
            Arc::new(TypedRecordStore::new(MemoryKeyValueStorage::default(), "container"));
        let log_store: Arc<dyn RecordStore<ContainerLog>> =
            Arc::new(TypedRecordStore::new(MemoryKeyValueStorage::default(), "container_log"));
        let stat_store: Arc<dyn RecordStore<ContainerStat>> =
            Arc::new(TypedRecordStore::new(MemoryKeyValueStorage::default(), "container_stat"));
        let image_store: Arc<dyn RecordStore<Image>> =
            Arc::new(TypedRecordStore::new(MemoryKeyValueStorage::default(), "image"));
        let volume_store: Arc<dyn RecordStore<Volume>> =
            Arc::new(TypedRecordStore::new(MemoryKeyValueStorage::default(), "volume"));

        Engine::new_with_exec(
            config,
            container_store,
            log_store,
            stat_store,
            image_store,
            volume_store,
            Box::new(AlwaysSucceeds),
        )
        .unwrap()
    }

    fn image_source_dir(dir: &TempDir) -> PathBuf {
        let src = dir.path().join("image-src");
        std::fs::create_dir_all(src.join("bin")).unwrap();
        std::fs::write(src.join("bin").join("entry"), b"#!/bin/sh\n").unwrap();
        src
    }

    async fn import_image(engine: &Engine, dir: &TempDir, owner: &str, name: &str) -> Image {
        engine
            .images()
            .create(image::CreateRequest {
                owner: owner.to_string(),
                name: name.to_string(),
                tag: "latest".to_string(),
                source: ImageSource::Import(image_source_dir(dir)),
                visibility: ImageVisibility::Owner,
                labels: Default::default(),
            })
            .await
            .unwrap()
    }

    fn base_request(owner: &str, name: &str, image_id: &str) -> CreateContainerRequest {
        CreateContainerRequest {
            owner: owner.to_string(),
            name: name.to_string(),
            image_id: image_id.to_string(),
            visibility: Visibility::Owner,
            autostart: false,
            command: vec!["/bin/entry".to_string()],
            env: vec![],
            cwd: None,
            resources: ResourceLimits::default(),
            network_enabled: false,
            volumes: vec![],
        }
    }

    #[tokio::test]
    async fn create_start_stop_delete_happy_path() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = test_engine(&dir);
        let image = import_image(&engine, &dir, "alice", "nginx").await;

        let container = engine
            .create_container(base_request("alice", "web", image.id()))
            .await?;
        assert_eq!(container.status(), ContainerStatus::Created);

        let started = engine.start_container(container.id(), "alice", None).await?;
        assert_eq!(started.status(), ContainerStatus::Running);

        let stopped = engine.stop_container(container.id(), "alice").await?;
        assert_eq!(stopped.status(), ContainerStatus::Stopped);

        engine.delete_container(container.id(), "alice").await?;
        assert!(engine.containers().containers().find_by_id(container.id())?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn create_container_mounts_requested_volumes() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = test_engine(&dir);
        let image = import_image(&engine, &dir, "alice", "nginx").await;

        let host_dir = dir.path().join("vol-data");
        std::fs::create_dir_all(&host_dir)?;
        let volume = engine
            .volumes()
            .create(volume::CreateRequest {
                owner: "alice".to_string(),
                name: "data".to_string(),
                host_path: host_dir,
                visibility: VolumeVisibility::Owner,
            })
            .await?;

        let mut req = base_request("alice", "web", image.id());
        req.volumes.push(VolumeRequest {
            volume_id: volume.id().to_string(),
            container_path: PathBuf::from("/data"),
            read_only: false,
        });

        let container = engine.create_container(req).await?;
        assert_eq!(container.volumes().len(), 1);

        let mounted = engine.volumes().get(volume.id(), "alice")?;
        assert_eq!(mounted.mounted_by(), &[container.id().to_string()]);

        engine.delete_container(container.id(), "alice").await?;
        let released = engine.volumes().get(volume.id(), "alice")?;
        assert!(released.mounted_by().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn create_container_rejects_unmaterialized_image() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = test_engine(&dir);
        let image = engine
            .images()
            .create(image::CreateRequest {
                owner: "alice".to_string(),
                name: "custom".to_string(),
                tag: "dev".to_string(),
                source: ImageSource::BuildSpec("FROM scratch".to_string()),
                visibility: ImageVisibility::Owner,
                labels: Default::default(),
            })
            .await?;

        let err = engine
            .create_container(base_request("alice", "web", image.id()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::BundleSourceMissing(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn pause_unavailable_before_init() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = test_engine(&dir);
        let image = import_image(&engine, &dir, "alice", "nginx").await;
        let container = engine
            .create_container(base_request("alice", "web", image.id()))
            .await?;
        engine.start_container(container.id(), "alice", None).await?;

        let err = engine.pause_container(container.id(), "alice").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::CheckpointUnavailable(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_all_stops_running_containers() -> Result<()> {
        let dir = TempDir::new()?;
        let engine = test_engine(&dir);
        let image = import_image(&engine, &dir, "alice", "nginx").await;
        let container = engine
            .create_container(base_request("alice", "web", image.id()))
            .await?;
        engine.start_container(container.id(), "alice", None).await?;

        engine.shutdown_all(Duration::from_secs(5)).await?;

        let reloaded = engine
            .containers()
            .containers()
            .find_by_id(container.id())?
            .unwrap();
        assert_eq!(reloaded.status(), ContainerStatus::Stopped);
        Ok(())
    }
}
