//! External build/pull invocation. Grounded on `runtime::adapter`'s
//! `ExecCommand` trait: an object-safe, `dyn-clone`able executor so tests
//! never need a real build/pull binary on `PATH`. The backend itself is
//! out of scope (spec §1 Non-goals: "building container images from a
//! declarative build file... the hook exists but the build backend is
//! external"); this module only shells out to whatever binary is
//! configured and adopts its output directory as the image tree.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dyn_clone::{clone_trait_object, DynClone};
use std::{fmt::Debug, path::Path, process::Output};
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

/// `build --spec <file> --output <dir>` against the configured build
/// binary, analogous to the Runtime Adapter's own argv construction.
pub fn build_args(spec_file: &Path, output_dir: &Path) -> Vec<String> {
    vec![
        "build".into(),
        "--spec".into(),
        spec_file.display().to_string(),
        "--output".into(),
        output_dir.display().to_string(),
    ]
}

/// `pull --ref <reference> --output <dir>` against the configured
/// registry-pull binary.
pub fn pull_args(reference: &str, output_dir: &Path) -> Vec<String> {
    vec![
        "pull".into(),
        "--ref".into(),
        reference.into(),
        "--output".into(),
        output_dir.display().to_string(),
    ]
}
