//! The Health Monitor (spec §4.6): polls registered containers' runtime
//! state every `health-interval` and drives restarts through the
//! Lifecycle Controller according to each container's restart policy.

use crate::policy::{Registration, RestartPolicy};
use common::RecordStore;
use container::{ContainerStatus, LifecycleController};
use runtime::RuntimeStatus;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{oneshot, Mutex};

/// Exponential backoff base and cap, per container (spec §4.6).
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

fn backoff_for(retry_count: u32) -> Duration {
    let shift = retry_count.min(6); // 2^6 * 1s = 64s already exceeds the cap
    BACKOFF_BASE
        .checked_mul(1u32 << shift)
        .unwrap_or(BACKOFF_CAP)
        .min(BACKOFF_CAP)
}

struct Entry {
    registration: Registration,
    next_attempt_at: Option<Instant>,
}

pub struct HealthMonitor {
    controller: Arc<LifecycleController>,
    interval: Duration,
    registrations: Mutex<HashMap<String, Entry>>,
}

impl HealthMonitor {
    pub fn new(controller: Arc<LifecycleController>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, container_id: impl Into<String>, policy: RestartPolicy, max_retries: u32) {
        self.registrations.lock().await.insert(
            container_id.into(),
            Entry {
                registration: Registration::new(policy, max_retries),
                next_attempt_at: None,
            },
        );
    }

    pub async fn deregister(&self, container_id: &str) {
        self.registrations.lock().await.remove(container_id);
    }

    pub async fn registered_ids(&self) -> Vec<String> {
        self.registrations.lock().await.keys().cloned().collect()
    }

    /// Spawns the poll loop. `health-interval-seconds=0` disables the
    /// monitor; the returned handle/stop channel are `None` in that case.
    pub fn spawn(self: Arc<Self>) -> Option<(tokio::task::JoinHandle<()>, oneshot::Sender<()>)> {
        if self.interval.is_zero() {
            return None;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return,
                    _ = interval.tick() => self.tick().await,
                }
            }
        });
        Some((handle, stop_tx))
    }

    pub async fn tick(&self) {
        let ids = self.registered_ids().await;
        for id in ids {
            if let Err(e) = self.poll_one(&id).await {
                log::debug!("health poll for {} failed: {}", id, common::chain(e));
            }
        }
    }

    async fn poll_one(&self, id: &str) -> anyhow::Result<()> {
        let runtime_running = matches!(
            self.controller.runtime().state(id).await,
            Ok(state) if state.status() == RuntimeStatus::Running
        );

        if runtime_running {
            let mut regs = self.registrations.lock().await;
            if let Some(entry) = regs.get_mut(id) {
                entry.registration.retry_count = 0;
                entry.next_attempt_at = None;
            }
            return Ok(());
        }

        let Some(record) = self.controller.containers().find_by_id(id)? else {
            self.deregister(id).await;
            return Ok(());
        };

        let mut regs = self.registrations.lock().await;
        let Some(entry) = regs.get_mut(id) else {
            return Ok(());
        };

        let decision = decide(&entry.registration, record.status(), record.last_exit_code());
        match decision {
            Decision::MarkExitedAndDeregister => {
                drop(regs);
                let mut stale = record;
                stale.set_status(ContainerStatus::Exited);
                self.controller.containers().save_record(&mut stale)?;
                self.deregister(id).await;
            }
            Decision::Deregister => {
                drop(regs);
                self.deregister(id).await;
            }
            Decision::Restart => {
                let now = Instant::now();
                if let Some(at) = entry.next_attempt_at {
                    if now < at {
                        return Ok(());
                    }
                }
                entry.registration.retry_count += 1;
                let backoff = backoff_for(entry.registration.retry_count);
                entry.next_attempt_at = Some(now + backoff);
                let owner = record.owner().to_string();
                drop(regs);
                if record.status() == ContainerStatus::Running {
                    // The runtime process is gone but nothing has told the
                    // record yet (its own supervisor polls independently,
                    // on a separate interval) — normalize so `start` below
                    // accepts the transition instead of rejecting it as
                    // already running.
                    let mut stale = record;
                    stale.set_status(ContainerStatus::Exited);
                    self.controller.containers().save_record(&mut stale)?;
                }
                if let Err(e) = self.controller.start(id, &owner).await {
                    log::debug!("health restart of {} failed: {}", id, common::chain(e));
                }
            }
            Decision::Noop => {}
        }
        Ok(())
    }
}

enum Decision {
    Noop,
    Restart,
    Deregister,
    MarkExitedAndDeregister,
}

fn decide(reg: &Registration, status: ContainerStatus, last_exit_code: Option<i32>) -> Decision {
    match reg.policy {
        RestartPolicy::Never => Decision::MarkExitedAndDeregister,
        RestartPolicy::OnFailure => {
            let failed = last_exit_code.map(|c| c != 0).unwrap_or(true);
            if failed && reg.retry_count < reg.max_retries {
                Decision::Restart
            } else {
                Decision::Deregister
            }
        }
        RestartPolicy::UnlessStopped => {
            if status == ContainerStatus::Stopped {
                Decision::Deregister
            } else {
                Decision::Restart
            }
        }
        RestartPolicy::Always => {
            if reg.retry_count < reg.max_retries {
                Decision::Restart
            } else {
                Decision::Deregister
            }
        }
    }
}
