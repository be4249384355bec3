//! The `Image` entity (spec §3): a materialized root filesystem plus
//! metadata. Plain data and a builder; behavior lives on
//! [`crate::service::ImageService`].

use common::Record;
use derive_builder::Builder;
use getset::{CopyGetters, Getters, Setters};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};
use strum::{AsRefStr, Display};

#[derive(AsRefStr, Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    BuildSpec,
    Registry,
    Import,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Owner,
    Public,
}

#[derive(Builder, Clone, CopyGetters, Debug, Getters, Serialize, Deserialize, Setters)]
#[builder(pattern = "owned", setter(into, strip_option))]
pub struct Image {
    #[getset(get = "pub")]
    #[builder(setter(custom))]
    id: String,

    #[getset(get = "pub")]
    owner: String,

    #[getset(get = "pub")]
    name: String,

    #[getset(get = "pub")]
    tag: String,

    #[getset(get_copy = "pub")]
    source: SourceKind,

    #[getset(get = "pub")]
    #[builder(default)]
    build_spec: Option<String>,

    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    path: Option<PathBuf>,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    size_bytes: u64,

    #[getset(get_copy = "pub", set = "pub")]
    visibility: Visibility,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    pull_count: u64,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    last_pulled_at: Option<i64>,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    built: bool,

    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    labels: HashMap<String, String>,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    created_at: i64,

    #[getset(get_copy = "pub", set = "pub")]
    #[builder(default)]
    updated_at: i64,
}

impl ImageBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl Image {
    pub fn new_id() -> String {
        format!("img-{}", uuid::Uuid::new_v4().simple())
    }

    pub fn is_public(&self) -> bool {
        matches!(self.visibility, Visibility::Public)
    }
}

impl Record for Image {
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
        let img = ImageBuilder::default()
            .id("img-1")
            .owner("alice")
            .name("nginx")
            .tag("latest")
            .source(SourceKind::Import)
            .visibility(Visibility::Owner)
            .build()?;
        assert!(!img.built());
        assert_eq!(img.pull_count(), 0);
        assert!(!img.is_public());
        Ok(())
    }
}
