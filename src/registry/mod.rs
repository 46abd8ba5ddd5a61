//! The container registry: durable records of the containers this service
//! builds and manages.
//!
//! Writes follow a last-writer-wins model. The pipeline, the lifecycle
//! controller and HTTP handlers may update the same record concurrently and
//! no version check is applied.

pub mod record;
pub mod store;

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::runtime::{ContainerRuntime, RuntimeError};

pub use record::{ContainerIntent, ContainerRecord, ContainerState, is_valid_build_id};
pub use store::{ContainerStore, RecordStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid container request: {0}")]
    Invalid(String),
    #[error("Port {0} is already allocated, please choose a different port")]
    PortAllocated(u16),
    #[error("No container record for build {0}")]
    UnknownBuild(String),
    #[error("No container record with id {0}")]
    NotFound(Uuid),
    #[error("Build id {0} is already registered")]
    DuplicateBuild(String),
    #[error("Build {0} already produced a container")]
    AlreadyBuilt(String),
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// What the image build pipeline needs from the registry.
#[async_trait]
pub trait BuildRecords: Send + Sync {
    /// Load the record for `build_id` and mark it as building again.
    /// Only records that are still building or whose last build failed qualify.
    async fn begin_build(&self, build_id: &str) -> Result<ContainerRecord, RegistryError>;

    async fn complete_build(
        &self,
        build_id: &str,
        container_id: &str,
        state: ContainerState,
    ) -> Result<ContainerRecord, RegistryError>;

    async fn fail_build(&self, build_id: &str) -> Result<(), RegistryError>;
}

pub struct ContainerRegistry {
    store: Arc<dyn ContainerStore>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerRegistry {
    pub fn new(store: Arc<dyn ContainerStore>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { store, runtime }
    }

    /// Register a container to be built later and return its build id.
    ///
    /// The port check only sees ports bound by live containers. Two intents
    /// for the same port are both accepted while neither has been built yet.
    pub async fn create_intent(&self, intent: ContainerIntent) -> Result<String, RegistryError> {
        log::info!("Registering container intent for build {}", intent.build_id);
        let record = intent.into_record()?;

        if self.allocated_host_ports().await?.contains(&record.host_port) {
            log::warn!(
                "Rejecting build {}: port {} is in use",
                record.build_id,
                record.host_port
            );
            return Err(RegistryError::PortAllocated(record.host_port));
        }

        let build_id = record.build_id.clone();
        match self.store.insert(record).await {
            Ok(()) => Ok(build_id),
            Err(StoreError::Duplicate(id)) => Err(RegistryError::DuplicateBuild(id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self) -> Result<Vec<ContainerRecord>, RegistryError> {
        Ok(self.store.list().await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<ContainerRecord, RegistryError> {
        self.store
            .get(id)
            .await?
            .ok_or(RegistryError::NotFound(id))
    }

    pub async fn find_by_build_id(
        &self,
        build_id: &str,
    ) -> Result<ContainerRecord, RegistryError> {
        self.store
            .find_by_build_id(build_id)
            .await?
            .ok_or_else(|| RegistryError::UnknownBuild(build_id.to_string()))
    }

    /// Host ports published by running containers, whether or not we manage them.
    pub async fn allocated_host_ports(&self) -> Result<BTreeSet<u16>, RegistryError> {
        let containers = self.runtime.list_containers(false).await?;
        Ok(containers
            .into_iter()
            .flat_map(|c| c.public_ports)
            .collect())
    }

    /// Record a state observed for a runtime container. Returns `false` when
    /// no record tracks that container.
    pub async fn set_state_for_container(
        &self,
        container_id: &str,
        state: ContainerState,
    ) -> Result<bool, RegistryError> {
        let Some(mut record) = self.store.find_by_container_id(container_id).await? else {
            return Ok(false);
        };
        record.state = state;
        record.updated_at = Utc::now();
        self.store.update(record).await?;
        Ok(true)
    }

    /// Delete the record tracking `container_id`, if any.
    pub async fn remove_for_container(&self, container_id: &str) -> Result<bool, RegistryError> {
        match self.store.find_by_container_id(container_id).await? {
            Some(record) => Ok(self.store.delete(record.id).await?),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl BuildRecords for ContainerRegistry {
    async fn begin_build(&self, build_id: &str) -> Result<ContainerRecord, RegistryError> {
        let mut record = self.find_by_build_id(build_id).await?;
        if !record.state.is_unbuilt() {
            return Err(RegistryError::AlreadyBuilt(build_id.to_string()));
        }
        if record.state != ContainerState::Building {
            record.state = ContainerState::Building;
            record.updated_at = Utc::now();
            self.store.update(record.clone()).await?;
        }
        Ok(record)
    }

    async fn complete_build(
        &self,
        build_id: &str,
        container_id: &str,
        state: ContainerState,
    ) -> Result<ContainerRecord, RegistryError> {
        let mut record = self.find_by_build_id(build_id).await?;
        record.container_id = Some(container_id.to_string());
        record.state = state;
        record.updated_at = Utc::now();
        self.store.update(record.clone()).await?;
        Ok(record)
    }

    async fn fail_build(&self, build_id: &str) -> Result<(), RegistryError> {
        let mut record = self.find_by_build_id(build_id).await?;
        record.container_id = None;
        record.state = ContainerState::Failed;
        record.updated_at = Utc::now();
        self.store.update(record).await?;
        Ok(())
    }
}
