//! Volume Service (spec §4.7, expanded SPEC_FULL.md §5): CRUD plus
//! mount/unmount bookkeeping. The service owns only the `Volume` record's
//! `mounted_by` list; appending the corresponding entry to a `Container`'s
//! own volume-mount list is the caller's job (the engine, which is the
//! only crate that sees both the `volume` and `container` entities) —
//! this keeps `volume` and `container` from depending on each other.

use crate::entity::{Volume, VolumeBuilder, Visibility};
use anyhow::Result;
use common::{EngineError, LockMap, RecordStore};
use std::{path::PathBuf, sync::Arc};

pub struct CreateRequest {
    pub owner: String,
    pub name: String,
    pub host_path: PathBuf,
    pub visibility: Visibility,
}

/// Returned by `mount`, carrying what the caller needs to append to the
/// container's own volume-mount list.
#[derive(Clone, Debug)]
pub struct MountDescriptor {
    pub volume_id: String,
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

pub struct VolumeService {
    store: Arc<dyn RecordStore<Volume>>,
    locks: LockMap<String>,
}

impl VolumeService {
    pub fn new(store: Arc<dyn RecordStore<Volume>>) -> Self {
        Self {
            store,
            locks: LockMap::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore<Volume>> {
        &self.store
    }

    pub async fn create(&self, req: CreateRequest) -> Result<Volume> {
        let lock_key = format!("{}:{}", req.owner, req.name);
        let _guard = self.locks.lock(lock_key).await;

        if !req.host_path.is_dir() {
            return Err(EngineError::NotFound(format!(
                "host path {} does not exist",
                req.host_path.display()
            ))
            .into());
        }

        let (owner, name) = (req.owner.clone(), req.name.clone());
        if self
            .store
            .find_by_filter(&|v: &Volume| v.owner() == owner && v.name() == name)?
            .is_some()
        {
            return Err(EngineError::Conflict(format!(
                "volume {}/{} already exists",
                req.owner, req.name
            ))
            .into());
        }

        let mut volume = VolumeBuilder::default()
            .id(Volume::new_id())
            .owner(req.owner)
            .name(req.name)
            .host_path(req.host_path)
            .visibility(req.visibility)
            .build()?;
        self.store.save_record(&mut volume)?;
        Ok(volume)
    }

    pub fn get(&self, id: &str, caller: &str) -> Result<Volume> {
        let volume = self
            .store
            .find_by_id(id)?
            .ok_or_else(|| EngineError::NotFound(format!("volume {id}")))?;
        if volume.owner() != caller && !volume.is_public() {
            return Err(EngineError::Forbidden(format!("volume {id}")).into());
        }
        Ok(volume)
    }

    pub fn list(&self, caller: &str) -> Result<Vec<Volume>> {
        let caller = caller.to_string();
        self.store
            .find_all_by_filter(&|v: &Volume| v.owner() == caller || v.is_public())
    }

    /// Allowed only while the referencing container is in status=created
    /// (spec §5: "mounting into a running container is not supported").
    /// `container_is_created` is supplied by the caller.
    pub async fn mount(
        &self,
        volume_id: &str,
        container_id: &str,
        caller: &str,
        container_is_created: bool,
        container_path: PathBuf,
        read_only: bool,
    ) -> Result<MountDescriptor> {
        if !container_is_created {
            return Err(EngineError::InvalidTransition(
                "cannot mount a volume into a container that is not in status=created".to_string(),
            )
            .into());
        }

        let _guard = self.locks.lock(volume_id.to_string()).await;
        let mut volume = self.get(volume_id, caller)?;
        if !volume.mounted_by().iter().any(|c| c == container_id) {
            let mut mounted = volume.mounted_by().clone();
            mounted.push(container_id.to_string());
            volume.set_mounted_by(mounted);
            self.store.save_record(&mut volume)?;
        }

        Ok(MountDescriptor {
            volume_id: volume.id().to_string(),
            host_path: volume.host_path().clone(),
            container_path,
            read_only,
        })
    }

    /// Inverse of `mount`; allowed regardless of container status (spec
    /// §5: "mirrors that Volume mount-list bookkeeping must stay correct
    /// even if the container later changes state").
    pub async fn unmount(&self, volume_id: &str, container_id: &str, caller: &str) -> Result<()> {
        let _guard = self.locks.lock(volume_id.to_string()).await;
        let mut volume = self.get(volume_id, caller)?;
        let mounted = volume
            .mounted_by()
            .iter()
            .filter(|c| c.as_str() != container_id)
            .cloned()
            .collect();
        volume.set_mounted_by(mounted);
        self.store.save_record(&mut volume)?;
        Ok(())
    }

    pub fn delete(&self, id: &str, caller: &str) -> Result<()> {
        let volume = self.get(id, caller)?;
        if volume.owner() != caller {
            return Err(EngineError::Forbidden(format!("volume {id}")).into());
        }
        if !volume.mounted_by().is_empty() {
            return Err(EngineError::VolumeInUse(id.to_string()).into());
        }
        self.store.delete_by_id(id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{MemoryKeyValueStorage, TypedRecordStore};
    use tempfile::TempDir;

    fn service() -> VolumeService {
        let store: Arc<dyn RecordStore<Volume>> =
            Arc::new(TypedRecordStore::new(MemoryKeyValueStorage::default(), "volume"));
        VolumeService::new(store)
    }

    #[tokio::test]
    async fn create_requires_existing_directory() {
        let svc = service();
        let err = svc
            .create(CreateRequest {
                owner: "alice".into(),
                name: "data".into(),
                host_path: PathBuf::from("/does/not/exist"),
                visibility: Visibility::Owner,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn mount_rejected_unless_container_created() -> Result<()> {
        let dir = TempDir::new()?;
        let svc = service();
        let v = svc
            .create(CreateRequest {
                owner: "alice".into(),
                name: "data".into(),
                host_path: dir.path().to_path_buf(),
                visibility: Visibility::Owner,
            })
            .await?;

        let err = svc
            .mount(v.id(), "c1", "alice", false, PathBuf::from("/data"), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid transition"));

        let desc = svc
            .mount(v.id(), "c1", "alice", true, PathBuf::from("/data"), false)
            .await?;
        assert_eq!(desc.volume_id, v.id());
        assert_eq!(svc.get(v.id(), "alice")?.mounted_by(), &vec!["c1".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn delete_blocked_while_mounted() -> Result<()> {
        let dir = TempDir::new()?;
        let svc = service();
        let v = svc
            .create(CreateRequest {
                owner: "alice".into(),
                name: "data".into(),
                host_path: dir.path().to_path_buf(),
                visibility: Visibility::Owner,
            })
            .await?;
        svc.mount(v.id(), "c1", "alice", true, PathBuf::from("/data"), false)
            .await?;

        let err = svc.delete(v.id(), "alice").unwrap_err();
        assert!(err.to_string().contains("volume in use"));

        svc.unmount(v.id(), "c1", "alice").await?;
        svc.delete(v.id(), "alice")?;
        Ok(())
    }
}
