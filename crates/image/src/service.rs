//! Image Service (spec §4.7, expanded in SPEC_FULL.md §5): CRUD on the
//! `Image` entity, external build/pull invocation, and referential
//! integrity against containers.

use crate::builder::{build_args, pull_args, DefaultExecCommand, ExecCommand};
use crate::entity::{Image, ImageBuilder, SourceKind, Visibility};
use anyhow::{Context, Result};
use common::{EngineError, LockMap, RecordStore};
use std::{path::PathBuf, sync::Arc};

pub struct ImageService {
    store: Arc<dyn RecordStore<Image>>,
    images_root: PathBuf,
    build_binary: Option<PathBuf>,
    pull_binary: Option<PathBuf>,
    exec: Box<dyn ExecCommand>,
    locks: LockMap<String>,
}

/// What to materialize the image from. Mirrors `SourceKind` but carries
/// the data each variant needs at create time.
pub enum ImageSource {
    /// `build_spec` text is written to a temp file and passed to the
    /// configured build binary.
    BuildSpec(String),
    /// `reference` is passed to the configured registry-pull binary.
    Registry(String),
    /// `path` is an existing directory the caller owns; copied in full.
    Import(PathBuf),
}

pub struct CreateRequest {
    pub owner: String,
    pub name: String,
    pub tag: String,
    pub source: ImageSource,
    pub visibility: Visibility,
    pub labels: std::collections::HashMap<String, String>,
}

impl ImageService {
    pub fn new(
        store: Arc<dyn RecordStore<Image>>,
        images_root: PathBuf,
        build_binary: Option<PathBuf>,
        pull_binary: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            images_root,
            build_binary,
            pull_binary,
            exec: Box::new(DefaultExecCommand),
            locks: LockMap::default(),
        }
    }

    pub fn with_exec(mut self, exec: Box<dyn ExecCommand>) -> Self {
        self.exec = exec;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore<Image>> {
        &self.store
    }

    pub async fn create(&self, req: CreateRequest) -> Result<Image> {
        let lock_key = format!("{}:{}:{}", req.owner, req.name, req.tag);
        let _guard = self.locks.lock(lock_key).await;

        let (owner, name, tag) = (req.owner.clone(), req.name.clone(), req.tag.clone());
        if self
            .store
            .find_by_filter(&|i: &Image| i.owner() == owner && i.name() == name && i.tag() == tag)?
            .is_some()
        {
            return Err(EngineError::Conflict(format!(
                "image {}/{}:{} already exists",
                req.owner, req.name, req.tag
            ))
            .into());
        }

        let id = Image::new_id();
        let source_kind = match &req.source {
            ImageSource::BuildSpec(_) => SourceKind::BuildSpec,
            ImageSource::Registry(_) => SourceKind::Registry,
            ImageSource::Import(_) => SourceKind::Import,
        };
        let build_spec_text = match &req.source {
            ImageSource::BuildSpec(s) => Some(s.clone()),
            _ => None,
        };

        let mut image = ImageBuilder::default()
            .id(id.clone())
            .owner(req.owner)
            .name(req.name)
            .tag(req.tag)
            .source(source_kind)
            .build_spec(build_spec_text)
            .visibility(req.visibility)
            .labels(req.labels)
            .build()?;

        std::fs::create_dir_all(&self.images_root).context("create images root")?;
        let rootfs = self.images_root.join(&id).join("rootfs");

        let materialized = self.materialize(&id, &rootfs, &req.source).await?;
        if materialized {
            image.set_path(Some(rootfs.clone()));
            image.set_size_bytes(dir_size(&rootfs)?);
            image.set_built(true);
        }

        self.store.save_record(&mut image)?;
        Ok(image)
    }

    /// Returns whether the image tree was materialized. `BuildSpec`/
    /// `Registry` sources are a deliberately inert hook when no backend
    /// binary is configured (spec §1/§5) — the record is still created
    /// with `built=false` so a later out-of-band build can adopt it.
    async fn materialize(&self, id: &str, rootfs: &PathBuf, source: &ImageSource) -> Result<bool> {
        match source {
            ImageSource::Import(src) => {
                if !src.is_dir() {
                    return Err(EngineError::BundleSourceMissing(src.display().to_string()).into());
                }
                fs_create_rootfs(rootfs)?;
                oci::copy_tree(src, rootfs)
                    .with_context(|| format!("import image rootfs from {}", src.display()))?;
                Ok(true)
            }
            ImageSource::BuildSpec(spec_text) => {
                let Some(binary) = &self.build_binary else {
                    return Ok(false);
                };
                let spec_file = self.images_root.join(id).join("build-spec.txt");
                std::fs::create_dir_all(spec_file.parent().unwrap())?;
                std::fs::write(&spec_file, spec_text)?;
                fs_create_rootfs(rootfs)?;
                self.run(binary, &build_args(&spec_file, rootfs)).await?;
                Ok(true)
            }
            ImageSource::Registry(reference) => {
                let Some(binary) = &self.pull_binary else {
                    return Ok(false);
                };
                fs_create_rootfs(rootfs)?;
                self.run(binary, &pull_args(reference, rootfs)).await?;
                Ok(true)
            }
        }
    }

    async fn run(&self, binary: &PathBuf, args: &[String]) -> Result<()> {
        let output = self.exec.run_output(binary, args).await?;
        if !output.status.success() {
            return Err(EngineError::RuntimeError {
                code: output.status.code(),
                stderr_tail: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(())
    }

    pub fn get(&self, id: &str, caller: &str) -> Result<Image> {
        let image = self
            .store
            .find_by_id(id)?
            .ok_or_else(|| EngineError::NotFound(format!("image {id}")))?;
        if image.owner() != caller && !image.is_public() {
            return Err(EngineError::Forbidden(format!("image {id}")).into());
        }
        Ok(image)
    }

    pub fn list(&self, caller: &str) -> Result<Vec<Image>> {
        let caller = caller.to_string();
        self.store
            .find_all_by_filter(&|i: &Image| i.owner() == caller || i.is_public())
    }

    /// `referencing_containers` is supplied by the caller (the engine,
    /// which owns both the image and container stores) to avoid a
    /// dependency cycle between the `image` and `container` crates.
    pub fn delete(&self, id: &str, caller: &str, referencing_containers: u64) -> Result<()> {
        let image = self.get(id, caller)?;
        if image.owner() != caller {
            return Err(EngineError::Forbidden(format!("image {id}")).into());
        }
        if referencing_containers > 0 {
            return Err(EngineError::ImageInUse(id.to_string()).into());
        }
        if let Some(path) = image.path() {
            let _ = std::fs::remove_dir_all(path.parent().unwrap_or(path));
        }
        self.store.delete_by_id(id)?;
        Ok(())
    }

    /// Records a pull: bumps `pull_count` and `last_pulled_at`.
    pub fn record_pull(&self, id: &str) -> Result<Image> {
        let mut image = self
            .store
            .find_by_id(id)?
            .ok_or_else(|| EngineError::NotFound(format!("image {id}")))?;
        image.set_pull_count(image.pull_count() + 1);
        image.set_last_pulled_at(Some(common::now_millis()));
        self.store.save_record(&mut image)?;
        Ok(image)
    }
}

fn fs_create_rootfs(rootfs: &PathBuf) -> Result<()> {
    std::fs::create_dir_all(rootfs).context("create image rootfs dir")
}

fn dir_size(path: &PathBuf) -> Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{MemoryKeyValueStorage, TypedRecordStore};
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> ImageService {
        let store: Arc<dyn RecordStore<Image>> =
            Arc::new(TypedRecordStore::new(MemoryKeyValueStorage::default(), "image"));
        ImageService::new(store, dir.path().join("images"), None, None)
    }

    fn make_source_dir(dir: &TempDir) -> PathBuf {
        let src = dir.path().join("src-rootfs");
        std::fs::create_dir_all(src.join("bin")).unwrap();
        std::fs::write(src.join("bin").join("entry"), b"x").unwrap();
        src
    }

    #[tokio::test]
    async fn import_materializes_and_sizes() -> Result<()> {
        let dir = TempDir::new()?;
        let svc = service(&dir);
        let src = make_source_dir(&dir);

        let img = svc
            .create(CreateRequest {
                owner: "alice".into(),
                name: "nginx".into(),
                tag: "latest".into(),
                source: ImageSource::Import(src),
                visibility: Visibility::Owner,
                labels: Default::default(),
            })
            .await?;

        assert!(img.built());
        assert!(img.size_bytes() > 0);
        assert!(img.path().as_ref().unwrap().join("bin/entry").exists());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_name_tag_conflicts() -> Result<()> {
        let dir = TempDir::new()?;
        let svc = service(&dir);
        let src = make_source_dir(&dir);

        svc.create(CreateRequest {
            owner: "alice".into(),
            name: "nginx".into(),
            tag: "latest".into(),
            source: ImageSource::Import(src.clone()),
            visibility: Visibility::Owner,
            labels: Default::default(),
        })
        .await?;

        let err = svc
            .create(CreateRequest {
                owner: "alice".into(),
                name: "nginx".into(),
                tag: "latest".into(),
                source: ImageSource::Import(src),
                visibility: Visibility::Owner,
                labels: Default::default(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        Ok(())
    }

    #[tokio::test]
    async fn build_spec_without_binary_is_inert() -> Result<()> {
        let dir = TempDir::new()?;
        let svc = service(&dir);

        let img = svc
            .create(CreateRequest {
                owner: "alice".into(),
                name: "custom".into(),
                tag: "dev".into(),
                source: ImageSource::BuildSpec("FROM scratch".into()),
                visibility: Visibility::Owner,
                labels: Default::default(),
            })
            .await?;

        assert!(!img.built());
        assert!(img.path().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn delete_blocked_while_referenced() -> Result<()> {
        let dir = TempDir::new()?;
        let svc = service(&dir);
        let src = make_source_dir(&dir);
        let img = svc
            .create(CreateRequest {
                owner: "alice".into(),
                name: "nginx".into(),
                tag: "latest".into(),
                source: ImageSource::Import(src),
                visibility: Visibility::Owner,
                labels: Default::default(),
            })
            .await?;

        let err = svc.delete(img.id(), "alice", 1).unwrap_err();
        assert!(err.to_string().contains("image in use"));

        svc.delete(img.id(), "alice", 0)?;
        assert!(svc.store().find_by_id(img.id())?.is_none());
        Ok(())
    }
}
