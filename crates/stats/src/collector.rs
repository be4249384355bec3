//! The Stats Collector (spec §4.5): a single background loop sampling
//! cgroup counters for every `running` container every `stats-interval`
//! seconds, plus the rolling retention pruner SPEC_FULL.md §4.5/§9 adds.

use crate::cgroup;
use anyhow::Result;
use container::{Container, ContainerStat, ContainerStatBuilder, ContainerStatus, LifecycleController};
use common::RecordStore;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{oneshot, Mutex};

struct CpuSample {
    usage_ns: u64,
    at: Instant,
}

pub struct StatsCollector {
    container_store: Arc<dyn RecordStore<Container>>,
    stat_store: Arc<dyn RecordStore<ContainerStat>>,
    controller: Arc<LifecycleController>,
    interval: Duration,
    retention_count: u64,
    prune_every_ticks: u64,
    ncpu: u64,
    prev_cpu: Mutex<HashMap<String, CpuSample>>,
}

impl StatsCollector {
    pub fn new(
        container_store: Arc<dyn RecordStore<Container>>,
        stat_store: Arc<dyn RecordStore<ContainerStat>>,
        controller: Arc<LifecycleController>,
        interval: Duration,
        retention_count: u64,
        prune_every_ticks: u64,
    ) -> Self {
        Self {
            container_store,
            stat_store,
            controller,
            interval,
            retention_count,
            prune_every_ticks,
            ncpu: num_cpus(),
            prev_cpu: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the collector loop. `stats-interval-seconds=0` disables the
    /// collector entirely (spec §6.5); the returned handle/stop channel
    /// are `None` in that case.
    pub fn spawn(self: Arc<Self>) -> Option<(tokio::task::JoinHandle<()>, oneshot::Sender<()>)> {
        if self.interval.is_zero() {
            return None;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            let mut tick_count: u64 = 0;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = interval.tick() => {
                        tick_count += 1;
                        if let Err(e) = self.tick().await {
                            log::debug!("stats tick failed: {}", common::chain(e));
                        }
                        if self.prune_every_ticks > 0 && tick_count % self.prune_every_ticks == 0 {
                            if let Err(e) = self.prune().await {
                                log::debug!("stats retention prune failed: {}", common::chain(e));
                            }
                        }
                    }
                }
            }
        });
        Some((handle, stop_tx))
    }

    async fn tick(&self) -> Result<()> {
        let running = self
            .container_store
            .find_all_by_filter(&|c: &Container| c.status() == ContainerStatus::Running)?;

        for container in running {
            let id = container.id().to_string();
            if !self.controller.is_supervised(&id).await {
                let mut stale = container.clone();
                stale.set_status(ContainerStatus::Exited);
                self.container_store.save_record(&mut stale)?;
                continue;
            }

            if let Err(e) = self.sample_one(&container).await {
                log::debug!("sampling container {} failed: {}", id, common::chain(e));
            }
        }
        Ok(())
    }

    async fn sample_one(&self, container: &Container) -> Result<()> {
        let id = container.id();
        let memory_usage = cgroup::read_memory_usage(id).unwrap_or(0);
        let memory_limit = cgroup::read_memory_limit(id).unwrap_or(0);
        let pid_count = cgroup::read_pids_current(id).unwrap_or(0);
        let (block_read_bytes, block_write_bytes) = (
            cgroup::read_blkio_read_bytes(id).unwrap_or(0),
            cgroup::read_blkio_write_bytes(id).unwrap_or(0),
        );
        let (network_rx_bytes, network_tx_bytes) = match &container.network().veth_name {
            Some(iface) => {
                let (rx, tx) = cgroup::read_net_bytes(iface);
                (rx.unwrap_or(0), tx.unwrap_or(0))
            }
            None => (0, 0),
        };

        let cpu_usage_percent = self.cpu_percent(id).await;

        let mut stat = ContainerStatBuilder::default()
            .id(format!("stat-{}", uuid::Uuid::new_v4().simple()))
            .owner(container.owner().to_string())
            .container_id(id.to_string())
            .timestamp(common::now_millis())
            .memory_usage(memory_usage)
            .memory_limit(memory_limit)
            .cpu_usage_percent(cpu_usage_percent)
            .network_rx_bytes(network_rx_bytes)
            .network_tx_bytes(network_tx_bytes)
            .block_read_bytes(block_read_bytes)
            .block_write_bytes(block_write_bytes)
            .pid_count(pid_count)
            .build()?;
        self.stat_store.save_record(&mut stat)?;
        Ok(())
    }

    /// `cpu-usage (percent)` as the delta of `cpuacct.usage` (nanoseconds)
    /// divided by wall-clock delta, scaled to a percentage of one cpu and
    /// then normalized by the host's cpu count (spec §4.5).
    async fn cpu_percent(&self, id: &str) -> f64 {
        let Some(usage_ns) = cgroup::read_cpuacct_usage(id) else {
            return 0.0;
        };
        let now = Instant::now();

        let mut prev = self.prev_cpu.lock().await;
        let percent = match prev.get(id) {
            Some(sample) => {
                let elapsed = now.duration_since(sample.at).as_nanos() as f64;
                if elapsed <= 0.0 || usage_ns < sample.usage_ns {
                    0.0
                } else {
                    let delta_ns = (usage_ns - sample.usage_ns) as f64;
                    (delta_ns / elapsed) * 100.0 / self.ncpu.max(1) as f64
                }
            }
            None => 0.0,
        };
        prev.insert(id.to_string(), CpuSample { usage_ns, at: now });
        percent
    }

    /// Caps the number of `ContainerStat` rows retained per container
    /// (spec §9: "an implementation should add a rolling retention
    /// policy"); `retention_count=0` means unbounded.
    async fn prune(&self) -> Result<()> {
        if self.retention_count == 0 {
            return Ok(());
        }
        let containers = self.container_store.find_all_by_filter(&|_: &Container| true)?;
        for container in containers {
            let id = container.id().to_string();
            let mut samples = self
                .stat_store
                .find_all_by_filter(&|s: &ContainerStat| s.container_id().as_str() == id.as_str())?;
            if (samples.len() as u64) <= self.retention_count {
                continue;
            }
            samples.sort_by_key(|s| s.timestamp());
            let overflow = samples.len() - self.retention_count as usize;
            for stale in &samples[..overflow] {
                self.stat_store.delete_by_id(stale.id())?;
            }
        }
        Ok(())
    }
}

fn num_cpus() -> u64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use container::{CreateRequest, Visibility};
    use runtime::{ExecCommand, RuntimeAdapterBuilder};
    use async_trait::async_trait;
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

    async fn test_collector(dir: &tempfile::TempDir) -> (Arc<StatsCollector>, Arc<LifecycleController>) {
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
        let log_store: Arc<dyn RecordStore<container::ContainerLog>> = Arc::new(
            TypedRecordStore::new(MemoryKeyValueStorage::default(), "container_log"),
        );
        let stat_store: Arc<dyn RecordStore<ContainerStat>> = Arc::new(TypedRecordStore::new(
            MemoryKeyValueStorage::default(),
            "container_stat",
        ));
        let runtime_adapter = Arc::new(
            RuntimeAdapterBuilder::default()
                .runtime_binary("runc")
                .checkpoint_binary("criu")
                .state_dir(dir.path().join("runc-data"))
                .build()
                .unwrap()
                .with_exec(Box::new(AlwaysSucceeds)),
        );
        let controller = Arc::new(LifecycleController::new(
            config,
            container_store.clone(),
            log_store,
            runtime_adapter,
        ));
        let collector = Arc::new(StatsCollector::new(
            container_store,
            stat_store,
            controller.clone(),
            Duration::from_secs(5),
            0,
            100,
        ));
        (collector, controller)
    }

    fn image_rootfs(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let rootfs = dir.path().join("image-rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();
        rootfs
    }

    #[tokio::test]
    async fn unsupervised_running_record_marked_exited() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let (collector, controller) = test_collector(&dir).await;

        let created = controller
            .create(CreateRequest {
                owner: "alice".into(),
                name: "web".into(),
                image_id: "img-1".into(),
                image_rootfs: image_rootfs(&dir),
                visibility: Visibility::Owner,
                autostart: false,
                command: vec!["/bin/entry".into()],
                env: vec![],
                cwd: None,
                resources: Default::default(),
                network_enabled: false,
                volumes: vec![],
            })
            .await?;

        // Simulate a record that says "running" with no process-table entry
        // (e.g. after a crash) by mutating the record directly.
        let mut stale = controller.containers().find_by_id(created.id())?.unwrap();
        stale.set_status(ContainerStatus::Running);
        controller.containers().save_record(&mut stale)?;

        collector.tick().await?;

        let after = controller.containers().find_by_id(created.id())?.unwrap();
        assert_eq!(after.status(), ContainerStatus::Exited);
        Ok(())
    }
}
