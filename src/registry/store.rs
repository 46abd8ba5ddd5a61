//! Persistence for container records.
//!
//! [`RecordStore`] keeps every record in memory and, when opened with a path,
//! rewrites a JSON snapshot after each mutation. The snapshot is written to a
//! sibling temp file first and renamed over the old one.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::record::ContainerRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("A record for build {0} already exists")]
    Duplicate(String),
    #[error("Record {0} does not exist")]
    Missing(Uuid),
}

#[async_trait]
pub trait ContainerStore: Send + Sync {
    async fn insert(&self, record: ContainerRecord) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<ContainerRecord>, StoreError>;
    async fn find_by_build_id(&self, build_id: &str)
    -> Result<Option<ContainerRecord>, StoreError>;
    async fn find_by_container_id(
        &self,
        container_id: &str,
    ) -> Result<Option<ContainerRecord>, StoreError>;
    async fn list(&self) -> Result<Vec<ContainerRecord>, StoreError>;
    async fn update(&self, record: ContainerRecord) -> Result<(), StoreError>;
    /// Returns whether a record was deleted.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct RecordStore {
    records: Mutex<BTreeMap<Uuid, ContainerRecord>>,
    path: Option<PathBuf>,
}

impl RecordStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a file-backed store, loading the existing snapshot if there is one.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<ContainerRecord> = serde_json::from_slice(&bytes)?;
                log::info!("Loaded {} container records from {path:?}", list.len());
                list.into_iter().map(|r| (r.id, r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No container records at {path:?}, starting empty");
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            records: Mutex::new(records),
            path: Some(path),
        })
    }

    async fn persist(&self, records: &BTreeMap<Uuid, ContainerRecord>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let snapshot: Vec<&ContainerRecord> = records.values().collect();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerStore for RecordStore {
    async fn insert(&self, record: ContainerRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.values().any(|r| r.build_id == record.build_id) {
            return Err(StoreError::Duplicate(record.build_id));
        }
        records.insert(record.id, record);
        self.persist(&records).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ContainerRecord>, StoreError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn find_by_build_id(
        &self,
        build_id: &str,
    ) -> Result<Option<ContainerRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .find(|r| r.build_id == build_id)
            .cloned())
    }

    async fn find_by_container_id(
        &self,
        container_id: &str,
    ) -> Result<Option<ContainerRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .find(|r| r.container_id.as_deref() == Some(container_id))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn update(&self, record: ContainerRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        match records.get_mut(&record.id) {
            Some(existing) => *existing = record,
            None => return Err(StoreError::Missing(record.id)),
        }
        self.persist(&records).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        let removed = records.remove(&id).is_some();
        if removed {
            self.persist(&records).await?;
        }
        Ok(removed)
    }
}
