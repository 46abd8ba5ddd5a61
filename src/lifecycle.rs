use std::sync::Arc;

use async_trait::async_trait;

use crate::registry::{ContainerRegistry, ContainerState};
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeContainer, RuntimeError, RuntimeStatus};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Container {0} not found")]
    NotFound(String),
    #[error("Failed to {operation} container")]
    Failed {
        operation: &'static str,
        #[source]
        source: RuntimeError,
    },
}

impl LifecycleError {
    fn from_runtime(operation: &'static str, source: RuntimeError) -> Self {
        match source {
            RuntimeError::NotFound(id) => Self::NotFound(id),
            source => Self::Failed { operation, source },
        }
    }
}

/// What the image build pipeline needs to bring a container into existence.
#[async_trait]
pub trait ContainerProvisioner: Send + Sync {
    async fn create(&self, spec: ContainerSpec) -> Result<String, LifecycleError>;
    async fn start(&self, id: &str) -> Result<String, LifecycleError>;
    async fn state(&self, id: &str) -> Result<RuntimeStatus, LifecycleError>;
    async fn remove(&self, id: &str) -> Result<String, LifecycleError>;
}

/// Start, stop, restart and remove containers on request, keeping the
/// registry's view of them current.
pub struct LifecycleController {
    registry: Arc<ContainerRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl LifecycleController {
    pub fn new(registry: Arc<ContainerRegistry>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { registry, runtime }
    }

    pub async fn list_runtime(&self) -> Result<Vec<RuntimeContainer>, LifecycleError> {
        self.runtime
            .list_containers(true)
            .await
            .map_err(|e| LifecycleError::from_runtime("list", e))
    }

    pub async fn stop(&self, id: &str) -> Result<String, LifecycleError> {
        self.runtime
            .stop_container(id)
            .await
            .map_err(|e| LifecycleError::from_runtime("stop", e))?;
        self.record_state(id, ContainerState::Stopped).await;
        log::info!("Container {id} stopped");
        Ok(format!("Container {id} stopped!"))
    }

    pub async fn restart(&self, id: &str) -> Result<String, LifecycleError> {
        self.runtime
            .restart_container(id)
            .await
            .map_err(|e| LifecycleError::from_runtime("restart", e))?;
        self.record_state(id, ContainerState::Running).await;
        log::info!("Container {id} restarted");
        Ok(format!("Container {id} restarted!"))
    }

    async fn record_state(&self, id: &str, state: ContainerState) {
        match self.registry.set_state_for_container(id, state).await {
            Ok(true) => log::debug!("Recorded container {id} as {state}"),
            Ok(false) => log::debug!("Container {id} is not managed by the registry"),
            Err(e) => log::warn!("Unable to record container {id} as {state}: {e}"),
        }
    }
}

#[async_trait]
impl ContainerProvisioner for LifecycleController {
    async fn create(&self, spec: ContainerSpec) -> Result<String, LifecycleError> {
        let name = spec.name.clone();
        let id = self
            .runtime
            .create_container(spec)
            .await
            .map_err(|e| LifecycleError::from_runtime("create", e))?;
        log::info!("Created container {name} with id {id}");
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<String, LifecycleError> {
        self.runtime
            .start_container(id)
            .await
            .map_err(|e| LifecycleError::from_runtime("start", e))?;
        self.record_state(id, ContainerState::Running).await;
        log::info!("Container {id} started");
        Ok(format!("Container {id} started!"))
    }

    async fn state(&self, id: &str) -> Result<RuntimeStatus, LifecycleError> {
        self.runtime
            .inspect_status(id)
            .await
            .map_err(|e| LifecycleError::from_runtime("inspect", e))
    }

    async fn remove(&self, id: &str) -> Result<String, LifecycleError> {
        self.runtime
            .remove_container(id)
            .await
            .map_err(|e| LifecycleError::from_runtime("remove", e))?;
        match self.registry.remove_for_container(id).await {
            Ok(true) => log::info!("Removed container {id} and its record"),
            Ok(false) => log::info!("Removed unmanaged container {id}"),
            // The runtime container is already gone, so the stale record is only logged.
            Err(e) => log::error!("Container {id} removed but its record could not be deleted: {e}"),
        }
        Ok(format!("Container {id} removed!"))
    }
}
