//! The `Volume` entity (spec §3): a named host directory bindable into
//! containers, plus the list of containers that currently mount it.

use common::Record;
use derive_builder::Builder;
use getset::{CopyGetters, Getters, Setters};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Owner,
    Public,
}

#[derive(Builder, Clone, CopyGetters, Debug, Getters, Serialize, Deserialize, Setters)]
#[builder(pattern = "owned", setter(into, strip_option))]
pub struct Volume {
    #[getset(get = "pub")]
    #[builder(setter(custom))]
    id: String,

    #[getset(get = "pub")]
    owner: String,

    #[getset(get = "pub")]
    name: String,

    #[getset(get = "pub")]
    host_path: PathBuf,

    #[getset(get_copy = "pub", set = "pub")]
    visibility: Visibility,

    /// Containers currently mounting this volume (spec §3: "mount list
    /// (which containers reference it)").
    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    mounted_by: Vec<String>,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    created_at: i64,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    updated_at: i64,
}

impl VolumeBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl Volume {
    pub fn new_id() -> String {
        format!("vol-{}", uuid::Uuid::new_v4().simple())
    }

    pub fn is_public(&self) -> bool {
        matches!(self.visibility, Visibility::Public)
    }
}

impl Record for Volume {
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
    fn builder_defaults() -> anyhow::Result<()> {
        let v = VolumeBuilder::default()
            .id("vol-1")
            .owner("alice")
            .name("data")
            .host_path("/srv/data")
            .visibility(Visibility::Owner)
            .build()?;
        assert!(v.mounted_by().is_empty());
        assert!(!v.is_public());
        Ok(())
    }
}
