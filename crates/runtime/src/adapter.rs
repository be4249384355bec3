//! Wraps the external runc-compatible low level runtime binary and the
//! CRIU-compatible checkpoint/restore binary (spec §4.2). Grounded on the
//! teacher's `OCIRuntime`/`ExecCommand` pair: a builder-constructed struct
//! holding a swappable, clone-able executor plus the binary paths, and a
//! `Subcommand` enum whose variants build the exact argv the operations
//! table names. Unlike the teacher, checkpoint and restore run against a
//! second, independently-configured binary rather than the same one with
//! a `--criu` global flag — the container lifecycle engine this adapts
//! configures the CRIU-compatible tool separately (`Config::checkpoint_binary`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::EngineError;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::{CopyGetters, Getters};
use serde::Deserialize;
use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    process::Output,
    time::Duration,
};
use tokio::process::Command;

/// Stop/kill/delete/state/exec deadline (spec §4.2).
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(10);
/// Checkpoint/restore deadline.
pub const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(30);
/// Launch deadline.
pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
/// Executes an external command and returns its raw [`Output`]. Swappable
/// so tests never need a real `runc`/`criu` binary on `PATH`.
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

#[derive(Builder, Getters)]
#[builder(pattern = "owned", setter(into))]
/// The adapter the Lifecycle Controller drives. Holds no container state
/// of its own; every call is a single external invocation.
pub struct RuntimeAdapter {
    #[builder(private, default = "Box::new(DefaultExecCommand)")]
    exec: Box<dyn ExecCommand>,

    #[get = "pub"]
    /// Path to the runc-compatible low level runtime binary.
    runtime_binary: PathBuf,

    #[get = "pub"]
    /// Path to the CRIU-compatible checkpoint/restore binary.
    checkpoint_binary: PathBuf,

    #[get = "pub"]
    /// Passed as `--root` to every runtime invocation so multiple engines
    /// on one host do not collide over container bookkeeping.
    state_dir: PathBuf,
}

impl RuntimeAdapter {
    /// Swaps in a different executor. The production path never calls
    /// this — `RuntimeAdapterBuilder` defaults to [`DefaultExecCommand`] —
    /// but integration tests elsewhere in the workspace use it to drive
    /// the Lifecycle Controller without a real `runc`/`criu` binary.
    pub fn with_exec(mut self, exec: Box<dyn ExecCommand>) -> Self {
        self.exec = exec;
        self
    }

    /// `run -d --bundle <dir> <id>`.
    pub async fn launch(&self, container_id: &str, bundle: &Path) -> Result<()> {
        self.invoke(
            &self.runtime_binary,
            Subcommand::Run {
                container_id: container_id.to_string(),
                bundle: bundle.to_path_buf(),
            },
            LAUNCH_TIMEOUT,
            "launch",
        )
        .await?;
        Ok(())
    }

    /// `kill <id> KILL`.
    pub async fn kill(&self, container_id: &str) -> Result<()> {
        self.invoke(
            &self.runtime_binary,
            Subcommand::Kill {
                container_id: container_id.to_string(),
            },
            SHORT_TIMEOUT,
            "kill",
        )
        .await?;
        Ok(())
    }

    /// `delete <id>`.
    pub async fn delete(&self, container_id: &str) -> Result<()> {
        self.invoke(
            &self.runtime_binary,
            Subcommand::Delete {
                container_id: container_id.to_string(),
            },
            SHORT_TIMEOUT,
            "delete",
        )
        .await?;
        Ok(())
    }

    /// `state <id>`, decoded into a [`RuntimeState`].
    pub async fn state(&self, container_id: &str) -> Result<RuntimeState> {
        let output = self
            .invoke(
                &self.runtime_binary,
                Subcommand::State {
                    container_id: container_id.to_string(),
                },
                SHORT_TIMEOUT,
                "state",
            )
            .await?;
        serde_json::from_slice(&output.stdout).context("decode runtime state")
    }

    /// `exec <id> <argv…>`, used by the Stats Collector and diagnostics.
    pub async fn exec(&self, container_id: &str, argv: &[String]) -> Result<Output> {
        self.invoke(
            &self.runtime_binary,
            Subcommand::Exec {
                container_id: container_id.to_string(),
                argv: argv.to_vec(),
            },
            SHORT_TIMEOUT,
            "exec",
        )
        .await
    }

    /// `checkpoint --image-path <dir> <id>`.
    pub async fn checkpoint(&self, container_id: &str, image_path: &Path) -> Result<()> {
        self.invoke(
            &self.checkpoint_binary,
            Subcommand::Checkpoint {
                container_id: container_id.to_string(),
                image_path: image_path.to_path_buf(),
            },
            CHECKPOINT_TIMEOUT,
            "checkpoint",
        )
        .await?;
        Ok(())
    }

    /// `restore -d --image-path <dir> --bundle <dir> <id>`.
    pub async fn restore(&self, container_id: &str, image_path: &Path, bundle: &Path) -> Result<()> {
        self.invoke(
            &self.checkpoint_binary,
            Subcommand::Restore {
                container_id: container_id.to_string(),
                image_path: image_path.to_path_buf(),
                bundle: bundle.to_path_buf(),
            },
            CHECKPOINT_TIMEOUT,
            "restore",
        )
        .await?;
        Ok(())
    }

    async fn invoke(
        &self,
        binary: &Path,
        subcommand: Subcommand,
        deadline: Duration,
        op: &str,
    ) -> Result<Output> {
        let mut args = vec!["--root".to_string(), self.state_dir.display().to_string()];
        args.extend(subcommand.build_cmd());

        let result = tokio::time::timeout(deadline, self.exec.run_output(binary, &args)).await;
        let output = match result {
            Err(_) => return Err(EngineError::RuntimeTimeout(deadline, op.to_string()).into()),
            Ok(inner) => inner?,
        };

        if output.status.success() {
            Ok(output)
        } else {
            Err(EngineError::RuntimeError {
                code: output.status.code(),
                stderr_tail: stderr_tail(&output.stderr),
            }
            .into())
        }
    }
}

/// Last 4KiB of stderr, lossily decoded — enough to diagnose a runtime
/// failure without unbounded logging of a runaway process.
fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(4096);
    String::from_utf8_lossy(&stderr[start..]).into_owned()
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Subcommand {
    Run { container_id: String, bundle: PathBuf },
    Kill { container_id: String },
    Delete { container_id: String },
    State { container_id: String },
    Exec { container_id: String, argv: Vec<String> },
    Checkpoint { container_id: String, image_path: PathBuf },
    Restore { container_id: String, image_path: PathBuf, bundle: PathBuf },
}

impl Subcommand {
    fn build_cmd(&self) -> Vec<String> {
        match self {
            Subcommand::Run { container_id, bundle } => vec![
                "run".into(),
                "-d".into(),
                "--bundle".into(),
                bundle.display().to_string(),
                container_id.clone(),
            ],
            Subcommand::Kill { container_id } => {
                vec!["kill".into(), container_id.clone(), "KILL".into()]
            }
            Subcommand::Delete { container_id } => vec!["delete".into(), container_id.clone()],
            Subcommand::State { container_id } => vec!["state".into(), container_id.clone()],
            Subcommand::Exec { container_id, argv } => {
                let mut cmd = vec!["exec".into(), container_id.clone()];
                cmd.extend(argv.iter().cloned());
                cmd
            }
            Subcommand::Checkpoint {
                container_id,
                image_path,
            } => vec![
                "checkpoint".into(),
                "--image-path".into(),
                image_path.display().to_string(),
                container_id.clone(),
            ],
            Subcommand::Restore {
                container_id,
                image_path,
                bundle,
            } => vec![
                "restore".into(),
                "-d".into(),
                "--image-path".into(),
                image_path.display().to_string(),
                "--bundle".into(),
                bundle.display().to_string(),
                container_id.clone(),
            ],
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Dead,
}

#[derive(Clone, Debug, Deserialize, CopyGetters, Getters)]
/// Decoded `state <id>` output.
pub struct RuntimeState {
    #[getset(get_copy = "pub")]
    status: RuntimeStatus,

    #[getset(get_copy = "pub")]
    #[serde(default)]
    pid: Option<i32>,

    /// The init process's exit code, reported by the runtime once the
    /// container has stopped or exited. Absent while running, or if the
    /// runtime binary in use does not report it.
    #[getset(get_copy = "pub")]
    #[serde(default)]
    exit_code: Option<i32>,
}
