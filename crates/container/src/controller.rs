//! The Lifecycle Controller (spec §4.3) and, folded into it per design
//! note OQ-2, the Checkpoint/Restore Manager (spec §4.4): `pause`/`resume`
//! are ordinary methods sharing the controller's mutex and process-table
//! rather than a separate owned type, since the specification describes
//! the manager as a contract ("atomic with respect to the controller
//! mutex") and not a distinct resource.

use crate::entity::{
    Container, ContainerBuilder, ContainerLogBuilder, ContainerStatus, LogKind, LogLevel,
    ResourceLimits, Visibility, VolumeMountEntry,
};
use anyhow::{Context, Result};
use common::{now_millis, EngineError, LockMap, Record, RecordStore};
use oci::{BundleBuilder, BundleRequestBuilder, VolumeMount};
use runtime::{RuntimeAdapter, RuntimeState, RuntimeStatus};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{oneshot, Mutex};

/// Poll period for out-of-band exit detection (spec §4.3/§4.6 design note:
/// both fresh-start and restored supervision unify under polling).
const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// How long `stop` waits for the supervisor to observe exit before
/// re-issuing `kill` (spec §4.3).
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Everything needed to materialize a bundle and a `Container` record for
/// a new container. Resolving the image id to an on-disk rootfs and
/// resolving volume ids to host paths are the caller's job (the `image`
/// and `volume` crates) — this keeps the controller decoupled from them.
pub struct CreateRequest {
    pub owner: String,
    pub name: String,
    pub image_id: String,
    pub image_rootfs: PathBuf,
    pub visibility: Visibility,
    pub autostart: bool,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub cwd: Option<String>,
    pub resources: ResourceLimits,
    pub network_enabled: bool,
    pub volumes: Vec<VolumeMountEntry>,
}

struct ProcessTableEntry {
    supervisor: tokio::task::JoinHandle<()>,
    stop_tx: oneshot::Sender<()>,
}

pub struct LifecycleController {
    config: Arc<common::Config>,
    container_store: Arc<dyn RecordStore<Container>>,
    log_store: Arc<dyn RecordStore<crate::entity::ContainerLog>>,
    bundle_builder: BundleBuilder,
    runtime: Arc<RuntimeAdapter>,
    /// The process-table (spec §3), guarded by the same lock that
    /// serializes its own mutation — this is "engine.mu" (design note
    /// OQ-1: shared map, not an actor).
    process_table: Arc<Mutex<HashMap<String, ProcessTableEntry>>>,
    /// Containers currently draining a `stop` (spec §4.3 "BusyShuttingDown").
    draining: Arc<Mutex<HashSet<String>>>,
    /// Per-container-id serialization for the duration of one lifecycle
    /// operation; a distinct key namespace serializes `create` against
    /// the (owner, name) pair it must check uniqueness on.
    locks: LockMap<String>,
}

impl LifecycleController {
    pub fn new(
        config: Arc<common::Config>,
        container_store: Arc<dyn RecordStore<Container>>,
        log_store: Arc<dyn RecordStore<crate::entity::ContainerLog>>,
        runtime: Arc<RuntimeAdapter>,
    ) -> Self {
        Self {
            config,
            container_store,
            log_store,
            bundle_builder: BundleBuilder::default(),
            runtime,
            process_table: Arc::new(Mutex::new(HashMap::new())),
            draining: Arc::new(Mutex::new(HashSet::new())),
            locks: LockMap::default(),
        }
    }

    /// Number of containers currently supervised as running — used by
    /// integration tests asserting invariant 5 (process-table consistency).
    pub async fn process_table_len(&self) -> usize {
        self.process_table.lock().await.len()
    }

    /// Whether `id` has a live process-table entry. The Stats Collector
    /// (spec §4.5 step 2) and Health Monitor use this to cross-check a
    /// `running` record against actual supervision before sampling or
    /// polling it.
    pub async fn is_supervised(&self, id: &str) -> bool {
        self.process_table.lock().await.contains_key(id)
    }

    pub fn containers(&self) -> &Arc<dyn RecordStore<Container>> {
        &self.container_store
    }

    pub fn runtime(&self) -> &Arc<RuntimeAdapter> {
        &self.runtime
    }

    pub async fn create(&self, req: CreateRequest) -> Result<Container> {
        if self.config.max_containers_per_owner() > 0 {
            let owner = req.owner.clone();
            let count = self
                .container_store
                .count_records(&|c: &Container| c.owner() == owner)?;
            if count >= self.config.max_containers_per_owner() {
                return Err(EngineError::ResourceExhausted(format!(
                    "owner {} already has {} containers",
                    req.owner, count
                ))
                .into());
            }
        }

        let name_lock_key = format!("name:{}:{}", req.owner, req.name);
        let _guard = self.locks.lock(name_lock_key).await;

        let owner = req.owner.clone();
        let name = req.name.clone();
        if self
            .container_store
            .find_by_filter(&|c: &Container| c.owner() == owner && c.name() == name)?
            .is_some()
        {
            return Err(EngineError::Conflict(format!(
                "container {}/{} already exists",
                req.owner, req.name
            ))
            .into());
        }

        let id = Container::new_id();
        let containers_root = self.config.storage_path().join("containers");
        std::fs::create_dir_all(&containers_root).context("create containers root")?;

        let bundle_request = BundleRequestBuilder::default()
            .container_id(id.clone())
            .image_rootfs(req.image_rootfs)
            .containers_root(containers_root)
            .command(req.command.clone())
            .env(req.env.clone())
            .cwd(req.cwd.clone().unwrap_or_else(|| "/".to_string()))
            .volumes(
                req.volumes
                    .iter()
                    .map(|v| VolumeMount {
                        host_path: v.host_path.clone(),
                        container_path: v.container_path.clone(),
                        read_only: v.read_only,
                    })
                    .collect::<Vec<_>>(),
            )
            .disable_privileged(self.config.disable_privileged())
            .network_enabled(req.network_enabled)
            .unprivileged_uid(self.config.unprivileged_uid())
            .unprivileged_gid(self.config.unprivileged_gid())
            .build()?;

        let bundle_dir = self.bundle_builder.build(&bundle_request)?;

        let mut container = ContainerBuilder::default()
            .id(id)
            .owner(req.owner.clone())
            .name(req.name.clone())
            .image_id(req.image_id)
            .visibility(req.visibility)
            .autostart(req.autostart)
            .command(req.command)
            .env(req.env)
            .cwd(req.cwd.unwrap_or_else(|| "/".to_string()))
            .resources(req.resources)
            .volumes(req.volumes)
            .network(crate::entity::NetworkConfig {
                enabled: req.network_enabled,
                ..Default::default()
            })
            .bundle_path(bundle_dir)
            .build()?;

        self.container_store.save_record(&mut container)?;
        self.log_system(&container, LogLevel::Info, "container created").await;
        Ok(container)
    }

    pub async fn start(&self, id: &str, caller: &str) -> Result<Container> {
        // Checked before taking the per-id lock: `stop()` holds that same
        // lock for the whole time it has `id` marked draining, so a check
        // made after acquiring it would never observe the flag — it would
        // simply queue behind `stop()` and run once the flag is already
        // cleared (spec §4.3 "BusyShuttingDown").
        if self.draining.lock().await.contains(id) {
            return Err(EngineError::BusyShuttingDown(id.to_string()).into());
        }

        let _guard = self.locks.lock(id.to_string()).await;
        let mut container = self.get_owned(id, caller)?;

        if container.status() == ContainerStatus::Paused {
            return self.resume_locked(container, caller).await;
        }
        if !matches!(
            container.status(),
            ContainerStatus::Created | ContainerStatus::Exited | ContainerStatus::Stopped
        ) {
            return Err(EngineError::InvalidTransition(format!(
                "cannot start container in status {}",
                container.status()
            ))
            .into());
        }

        let bundle_path = container
            .bundle_path()
            .clone()
            .context("container has no bundle path")?;
        self.runtime.launch(id, &bundle_path).await?;

        container.set_started_at(Some(now_millis()));
        container.set_status(ContainerStatus::Running);
        container.set_last_exit_code(None);
        self.container_store.save_record(&mut container)?;

        self.spawn_supervisor(id.to_string()).await;
        self.log_system(&container, LogLevel::Info, "container started").await;
        Ok(container)
    }

    pub async fn stop(&self, id: &str, caller: &str) -> Result<Container> {
        let _guard = self.locks.lock(id.to_string()).await;
        let mut container = self.get_owned(id, caller)?;

        match container.status() {
            ContainerStatus::Stopped => return Ok(container),
            ContainerStatus::Exited => {
                let _ = self.runtime.delete(id).await;
                container.set_status(ContainerStatus::Stopped);
                container.set_stopped_at(Some(now_millis()));
                self.container_store.save_record(&mut container)?;
                return Ok(container);
            }
            ContainerStatus::Paused => {
                container = self.resume_locked(container, caller).await?;
            }
            ContainerStatus::Running => {}
            ContainerStatus::Created => {
                return Err(EngineError::InvalidTransition(
                    "cannot stop a container that was never started".to_string(),
                )
                .into())
            }
        }

        self.draining.lock().await.insert(id.to_string());
        let entry = self.process_table.lock().await.remove(id);
        if let Some(entry) = entry {
            let _ = entry.stop_tx.send(());
            if tokio::time::timeout(STOP_DRAIN_TIMEOUT, entry.supervisor)
                .await
                .is_err()
            {
                // Supervisor did not drain in time; re-issue kill (idempotent).
                let _ = self.runtime.kill(id).await;
            }
        }
        if let Err(e) = self.runtime.kill(id).await {
            log::warn!("kill during stop({id}) reported: {e}");
        }
        let _ = self.runtime.delete(id).await;
        self.draining.lock().await.remove(id);

        container.set_status(ContainerStatus::Stopped);
        container.set_stopped_at(Some(now_millis()));
        self.container_store.save_record(&mut container)?;
        self.log_system(&container, LogLevel::Info, "container stopped").await;
        Ok(container)
    }

    pub async fn pause(&self, id: &str, caller: &str) -> Result<Container> {
        let _guard = self.locks.lock(id.to_string()).await;
        let mut container = self.get_owned(id, caller)?;
        if container.status() != ContainerStatus::Running {
            return Err(EngineError::InvalidTransition(format!(
                "cannot pause container in status {}",
                container.status()
            ))
            .into());
        }

        let checkpoint_dir = self.config.storage_path().join("checkpoints").join(id);
        std::fs::create_dir_all(&checkpoint_dir).context("create checkpoint dir")?;

        if let Err(e) = self.runtime.checkpoint(id, &checkpoint_dir).await {
            let _ = std::fs::remove_dir_all(&checkpoint_dir);
            return Err(e);
        }
        let _ = self.runtime.kill(id).await;

        if let Some(entry) = self.process_table.lock().await.remove(id) {
            let _ = entry.stop_tx.send(());
        }

        container.set_status(ContainerStatus::Paused);
        container.set_checkpoint_path(Some(checkpoint_dir));
        container.set_last_paused_at(Some(now_millis()));
        self.container_store.save_record(&mut container)?;
        self.log_system(&container, LogLevel::Info, "container paused").await;
        Ok(container)
    }

    pub async fn resume(&self, id: &str, caller: &str) -> Result<Container> {
        let _guard = self.locks.lock(id.to_string()).await;
        let container = self.get_owned(id, caller)?;
        self.resume_locked(container, caller).await
    }

    /// Core of `resume`, callable while the per-id lock is already held
    /// (used by `start`/`stop` when redirecting from a paused container).
    async fn resume_locked(&self, mut container: Container, _caller: &str) -> Result<Container> {
        if container.status() != ContainerStatus::Paused {
            return Err(EngineError::InvalidTransition(format!(
                "cannot resume container in status {}",
                container.status()
            ))
            .into());
        }

        let checkpoint_path = container.checkpoint_path().clone();
        let bundle_path = container.bundle_path().clone();
        let id = container.id().to_string();

        let missing = match (&checkpoint_path, &bundle_path) {
            (Some(cp), Some(bp)) => {
                !cp.is_dir()
                    || std::fs::read_dir(cp).map(|mut d| d.next().is_none()).unwrap_or(true)
                    || !bp.join("scripts").join("config.json").is_file()
            }
            _ => true,
        };
        if missing {
            container.set_status(ContainerStatus::Stopped);
            self.container_store.save_record(&mut container)?;
            return Err(EngineError::BundleMissingOnResume(id).into());
        }

        let checkpoint_path = checkpoint_path.unwrap();
        let bundle_path = bundle_path.unwrap();
        self.runtime.restore(&id, &checkpoint_path, &bundle_path).await?;
        let _ = std::fs::remove_dir_all(&checkpoint_path);

        container.set_status(ContainerStatus::Running);
        container.set_checkpoint_path(None);
        container.set_last_resumed_at(Some(now_millis()));
        self.container_store.save_record(&mut container)?;

        self.spawn_supervisor(id).await;
        self.log_system(&container, LogLevel::Info, "container resumed").await;
        Ok(container)
    }

    pub async fn delete(&self, id: &str, caller: &str) -> Result<()> {
        let _guard = self.locks.lock(id.to_string()).await;
        let container = self.get_owned(id, caller)?;
        if matches!(
            container.status(),
            ContainerStatus::Running | ContainerStatus::Paused
        ) {
            return Err(EngineError::InvalidTransition(
                "cannot delete a running or paused container".to_string(),
            )
            .into());
        }

        if let Some(bundle_path) = container.bundle_path() {
            let _ = std::fs::remove_dir_all(bundle_path);
        }
        if let Some(checkpoint_path) = container.checkpoint_path() {
            let _ = std::fs::remove_dir_all(checkpoint_path);
        }
        self.container_store.delete_by_id(id)?;
        Ok(())
    }

    /// Starts every autostart-flagged container left in {running, stopped,
    /// exited} at engine init (spec §4.3; `created` containers were never
    /// proven to work and are skipped).
    pub async fn autostart_all(&self, system_owner_filter: Option<&str>) -> Result<()> {
        let candidates = self.container_store.find_all_by_filter(&|c: &Container| {
            c.autostart()
                && matches!(
                    c.status(),
                    ContainerStatus::Running | ContainerStatus::Stopped | ContainerStatus::Exited
                )
                && system_owner_filter.map(|o| o == c.owner()).unwrap_or(true)
        })?;
        for mut c in candidates {
            if c.status() == ContainerStatus::Running {
                // A persisted "running" record at boot means the previous
                // supervisor never got to observe its exit (engine crash or
                // kill -9); normalize to exited so `start` below accepts it
                // instead of rejecting it as an invalid transition.
                c.set_status(ContainerStatus::Exited);
                self.container_store.save_record(&mut c)?;
            }
            if let Err(e) = self.start(c.id(), c.owner()).await {
                log::error!("autostart of {} failed: {}", c.id(), common::chain(e));
            }
        }
        Ok(())
    }

    /// Stops health/stats loops is the caller's job; this stops every
    /// running container with a grace period (spec §5).
    pub async fn shutdown_all(&self) -> Result<()> {
        let running = self
            .container_store
            .find_all_by_filter(&|c: &Container| c.status() == ContainerStatus::Running)?;
        for c in running {
            let owner = c.owner().to_string();
            let id = c.id().to_string();
            if tokio::time::timeout(SHUTDOWN_GRACE, self.stop(&id, &owner))
                .await
                .is_err()
            {
                log::error!("stop({id}) did not complete within shutdown grace period");
            }
        }
        Ok(())
    }

    fn get_owned(&self, id: &str, caller: &str) -> Result<Container> {
        let container = self
            .container_store
            .find_by_id(id)?
            .ok_or_else(|| EngineError::NotFound(format!("container {id}")))?;
        if container.owner() != caller {
            return Err(EngineError::Forbidden(format!("container {id}")).into());
        }
        Ok(container)
    }

    async fn spawn_supervisor(&self, id: String) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let container_store = self.container_store.clone();
        let log_store = self.log_store.clone();
        let runtime = self.runtime.clone();
        let process_table = self.process_table.clone();
        let sup_id = id.clone();
        let handle = tokio::spawn(async move {
            supervise(container_store, log_store, runtime, process_table, sup_id, stop_rx).await;
        });
        self.process_table
            .lock()
            .await
            .insert(id, ProcessTableEntry { supervisor: handle, stop_tx });
    }

    async fn log_system(&self, container: &Container, level: LogLevel, message: &str) {
        let result = ContainerLogBuilder::default()
            .id(format!("log-{}", uuid::Uuid::new_v4().simple()))
            .owner(container.owner())
            .container_id(container.id())
            .kind(LogKind::System)
            .level(level)
            .message(message)
            .build();
        match result {
            Ok(mut log) => {
                if let Err(e) = self.log_store.save_record(&mut log) {
                    log::warn!("failed to persist container log: {e}");
                }
            }
            Err(e) => log::warn!("failed to build container log: {e}"),
        }
    }
}

async fn supervise(
    container_store: Arc<dyn RecordStore<Container>>,
    log_store: Arc<dyn RecordStore<crate::entity::ContainerLog>>,
    runtime: Arc<RuntimeAdapter>,
    process_table: Arc<Mutex<HashMap<String, ProcessTableEntry>>>,
    id: String,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(SUPERVISOR_POLL_INTERVAL);
    interval.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = &mut stop_rx => return,
            _ = interval.tick() => {
                let state = runtime.state(&id).await;
                if reconcile_exit(&container_store, &log_store, &state, &id).await {
                    process_table.lock().await.remove(&id);
                    return;
                }
            }
        }
    }
}

/// Given the latest `state <id>` result, marks the record `exited` (with
/// its exit code, when the runtime reported one) if the runtime no longer
/// considers the container running. Returns whether the supervisor should
/// stop polling (kept free of the polling loop so it is directly
/// unit-testable, mirroring the Stats Collector's `tick()`/`sample_one()`
/// split).
async fn reconcile_exit(
    container_store: &Arc<dyn RecordStore<Container>>,
    log_store: &Arc<dyn RecordStore<crate::entity::ContainerLog>>,
    state: &Result<RuntimeState>,
    id: &str,
) -> bool {
    let still_running = matches!(state, Ok(s) if s.status() == RuntimeStatus::Running);
    if still_running {
        return false;
    }

    let exit_code = state.as_ref().ok().and_then(|s| s.exit_code());
    if let Ok(Some(mut container)) = container_store.find_by_id(id) {
        if container.status() == ContainerStatus::Running {
            container.set_status(ContainerStatus::Exited);
            container.set_last_exit_code(exit_code);
            let _ = container_store.save_record(&mut container);
            let log = ContainerLogBuilder::default()
                .id(format!("log-{}", uuid::Uuid::new_v4().simple()))
                .owner(container.owner())
                .container_id(container.id())
                .kind(LogKind::System)
                .level(LogLevel::Error)
                .message("container exited out of band")
                .build();
            if let Ok(mut log) = log {
                let _ = log_store.save_record(&mut log);
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NetworkConfig;
    use async_trait::async_trait;
    use runtime::{ExecCommand, RuntimeAdapterBuilder};
    use std::{os::unix::process::ExitStatusExt, process::Output};
    use storage::{MemoryKeyValueStorage, TypedRecordStore};

    #[derive(Clone, Debug, Default)]
    struct AlwaysSucceeds;

    #[async_trait]
    impl ExecCommand for AlwaysSucceeds {
        async fn run_output(&self, _binary: &std::path::Path, _args: &[String]) -> Result<Output> {
            Ok(Output {
                status: std::process::ExitStatus::from_raw(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    fn test_controller(dir: &tempfile::TempDir) -> LifecycleController {
        let config = Arc::new(
            common::ConfigBuilder::default()
                .storage_path(dir.path().to_path_buf())
                .build()
                .unwrap(),
        );
        let container_store: Arc<dyn RecordStore<Container>> = Arc::new(TypedRecordStore::new(
            MemoryKeyValueStorage::default(),
            "container",
        ));
        let log_store: Arc<dyn RecordStore<crate::entity::ContainerLog>> = Arc::new(
            TypedRecordStore::new(MemoryKeyValueStorage::default(), "container_log"),
        );
        let runtime = Arc::new(
            RuntimeAdapterBuilder::default()
                .runtime_binary("runc")
                .checkpoint_binary("criu")
                .state_dir(dir.path().join("runc-data"))
                .build()
                .unwrap()
                .with_exec(Box::new(AlwaysSucceeds)),
        );
        LifecycleController::new(config, container_store, log_store, runtime)
    }

    fn image_rootfs(dir: &tempfile::TempDir) -> PathBuf {
        let rootfs = dir.path().join("image-rootfs");
        std::fs::create_dir_all(rootfs.join("bin")).unwrap();
        std::fs::write(rootfs.join("bin").join("entry"), b"#!/bin/sh\n").unwrap();
        rootfs
    }

    fn create_request(dir: &tempfile::TempDir, owner: &str, name: &str) -> CreateRequest {
        CreateRequest {
            owner: owner.to_string(),
            name: name.to_string(),
            image_id: "img-1".to_string(),
            image_rootfs: image_rootfs(dir),
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
    async fn happy_path_create_start_stop_delete() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let controller = test_controller(&dir);

        let created = controller.create(create_request(&dir, "alice", "web")).await?;
        assert_eq!(created.status(), ContainerStatus::Created);
        assert!(created.bundle_path().as_ref().unwrap().join("rootfs/bin/entry").exists());

        let started = controller.start(created.id(), "alice").await?;
        assert_eq!(started.status(), ContainerStatus::Running);
        assert!(started.started_at().is_some());
        assert_eq!(controller.process_table_len().await, 1);

        let stopped = controller.stop(created.id(), "alice").await?;
        assert_eq!(stopped.status(), ContainerStatus::Stopped);
        assert_eq!(controller.process_table_len().await, 0);

        controller.delete(created.id(), "alice").await?;
        assert!(controller.containers().find_by_id(created.id())?.is_none());
        assert!(!created.bundle_path().as_ref().unwrap().exists());
        Ok(())
    }

    #[derive(Clone, Debug)]
    struct ScriptedState {
        state_json: &'static str,
    }

    #[async_trait]
    impl ExecCommand for ScriptedState {
        async fn run_output(&self, _binary: &std::path::Path, _args: &[String]) -> Result<Output> {
            Ok(Output {
                status: std::process::ExitStatus::from_raw(0),
                stdout: self.state_json.as_bytes().to_vec(),
                stderr: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn reconcile_exit_captures_exit_code_and_marks_exited() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let container_store: Arc<dyn RecordStore<Container>> =
            Arc::new(TypedRecordStore::new(MemoryKeyValueStorage::default(), "container"));
        let log_store: Arc<dyn RecordStore<crate::entity::ContainerLog>> =
            Arc::new(TypedRecordStore::new(MemoryKeyValueStorage::default(), "container_log"));
        let controller = LifecycleController::new(
            Arc::new(
                common::ConfigBuilder::default()
                    .storage_path(dir.path().to_path_buf())
                    .build()?,
            ),
            container_store.clone(),
            log_store.clone(),
            Arc::new(
                RuntimeAdapterBuilder::default()
                    .runtime_binary("runc")
                    .checkpoint_binary("criu")
                    .state_dir(dir.path().join("runc-data"))
                    .build()?
                    .with_exec(Box::new(AlwaysSucceeds)),
            ),
        );

        let created = controller.create(create_request(&dir, "alice", "web")).await?;
        controller.start(created.id(), "alice").await?;

        let scripted_runtime = Arc::new(
            RuntimeAdapterBuilder::default()
                .runtime_binary("runc")
                .checkpoint_binary("criu")
                .state_dir(dir.path().join("runc-data"))
                .build()?
                .with_exec(Box::new(ScriptedState {
                    state_json: r#"{"status":"exited","exit_code":7}"#,
                })),
        );
        let state = scripted_runtime.state(created.id()).await;

        let stopped_polling = reconcile_exit(&container_store, &log_store, &state, created.id()).await;
        assert!(stopped_polling);

        let reloaded = container_store.find_by_id(created.id())?.unwrap();
        assert_eq!(reloaded.status(), ContainerStatus::Exited);
        assert_eq!(reloaded.last_exit_code(), Some(7));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let controller = test_controller(&dir);

        controller.create(create_request(&dir, "alice", "web")).await?;
        let err = controller
            .create(create_request(&dir, "alice", "web"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        Ok(())
    }

    #[tokio::test]
    async fn non_owner_cannot_start() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let controller = test_controller(&dir);
        let created = controller.create(create_request(&dir, "alice", "web")).await?;

        let err = controller.start(created.id(), "mallory").await.unwrap_err();
        assert!(err.to_string().contains("forbidden"));
        Ok(())
    }

    #[tokio::test]
    async fn pause_resume_round_trip() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let controller = test_controller(&dir);
        let created = controller.create(create_request(&dir, "alice", "web")).await?;
        controller.start(created.id(), "alice").await?;

        let paused = controller.pause(created.id(), "alice").await?;
        assert_eq!(paused.status(), ContainerStatus::Paused);
        assert!(paused.checkpoint_path().as_ref().unwrap().exists());
        assert_eq!(controller.process_table_len().await, 0);

        let resumed = controller.resume(created.id(), "alice").await?;
        assert_eq!(resumed.status(), ContainerStatus::Running);
        assert!(resumed.last_resumed_at().unwrap() >= paused.last_paused_at().unwrap());
        assert!(resumed.checkpoint_path().is_none());
        assert_eq!(controller.process_table_len().await, 1);
        Ok(())
    }

    #[derive(Clone, Debug)]
    struct BlockingKill {
        entered: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl ExecCommand for BlockingKill {
        async fn run_output(&self, _binary: &std::path::Path, args: &[String]) -> Result<Output> {
            if args.iter().any(|a| a == "kill") {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(Output {
                status: std::process::ExitStatus::from_raw(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn start_rejects_busy_shutting_down_while_stop_drains() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let config = Arc::new(
            common::ConfigBuilder::default()
                .storage_path(dir.path().to_path_buf())
                .build()?,
        );
        let container_store: Arc<dyn RecordStore<Container>> = Arc::new(TypedRecordStore::new(
            MemoryKeyValueStorage::default(),
            "container",
        ));
        let log_store: Arc<dyn RecordStore<crate::entity::ContainerLog>> = Arc::new(
            TypedRecordStore::new(MemoryKeyValueStorage::default(), "container_log"),
        );
        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let runtime = Arc::new(
            RuntimeAdapterBuilder::default()
                .runtime_binary("runc")
                .checkpoint_binary("criu")
                .state_dir(dir.path().join("runc-data"))
                .build()?
                .with_exec(Box::new(BlockingKill {
                    entered: entered.clone(),
                    release: release.clone(),
                })),
        );
        let controller = Arc::new(LifecycleController::new(config, container_store, log_store, runtime));

        let created = controller.create(create_request(&dir, "alice", "web")).await?;
        controller.start(created.id(), "alice").await?;

        let stopper = controller.clone();
        let id = created.id().to_string();
        let stop_task = tokio::spawn(async move { stopper.stop(&id, "alice").await });

        // Wait until stop() has reached the (blocked) kill call; the
        // draining flag is inserted before this point and is only cleared
        // after delete(), so a start() arriving now must observe it.
        entered.notified().await;

        let err = controller.start(created.id(), "alice").await.unwrap_err();
        assert!(err.to_string().contains("busy shutting down"));

        release.notify_one();
        let stopped = stop_task.await??;
        assert_eq!(stopped.status(), ContainerStatus::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn autostart_recovers_stale_running_record_after_crash() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let controller = test_controller(&dir);

        let mut req = create_request(&dir, "alice", "web");
        req.autostart = true;
        let created = controller.create(req).await?;
        let started = controller.start(created.id(), "alice").await?;
        let first_started_at = started.started_at().unwrap();

        // Simulate the engine having crashed: the persisted record still
        // says "running" even though this fresh controller has no
        // process-table entry for it.
        controller.autostart_all(None).await?;

        let recovered = controller.containers().find_by_id(created.id())?.unwrap();
        assert_eq!(recovered.status(), ContainerStatus::Running);
        assert!(recovered.started_at().unwrap() >= first_started_at);
        Ok(())
    }

    #[tokio::test]
    async fn resource_exhausted_on_quota() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let config = Arc::new(
            common::ConfigBuilder::default()
                .storage_path(dir.path().to_path_buf())
                .max_containers_per_owner(1u64)
                .build()?,
        );
        let container_store: Arc<dyn RecordStore<Container>> = Arc::new(TypedRecordStore::new(
            MemoryKeyValueStorage::default(),
            "container",
        ));
        let log_store: Arc<dyn RecordStore<crate::entity::ContainerLog>> = Arc::new(
            TypedRecordStore::new(MemoryKeyValueStorage::default(), "container_log"),
        );
        let runtime = Arc::new(
            RuntimeAdapterBuilder::default()
                .runtime_binary("runc")
                .checkpoint_binary("criu")
                .state_dir(dir.path().join("runc-data"))
                .build()?
                .with_exec(Box::new(AlwaysSucceeds)),
        );
        let controller = LifecycleController::new(config, container_store, log_store, runtime);

        controller.create(create_request(&dir, "alice", "web")).await?;
        let err = controller
            .create(create_request(&dir, "alice", "web2"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("resource exhausted"));
        Ok(())
    }
}
