//! Docker runtime using bollard.
//!
//! One `Docker` handle is created at startup and shared by every task through
//! the [`ContainerRuntime`] trait object.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    BuildImageOptions, BuildImageOptionsBuilder, CreateContainerOptions,
    CreateContainerOptionsBuilder, InspectContainerOptions, InspectContainerOptionsBuilder,
    ListContainersOptions, ListContainersOptionsBuilder, ListImagesOptions,
    ListImagesOptionsBuilder, RemoveContainerOptions, RemoveContainerOptionsBuilder,
    RestartContainerOptions, RestartContainerOptionsBuilder, StartContainerOptions,
    StartContainerOptionsBuilder, StopContainerOptions, StopContainerOptionsBuilder,
};
use futures::stream::BoxStream;
use futures_util::StreamExt;

use super::{
    ContainerRuntime, ContainerSpec, ImageBuildRequest, RuntimeContainer, RuntimeError,
    RuntimeStatus,
};
use crate::config::DockerConfig;

/// Seconds the daemon waits for a graceful stop before killing the container.
const STOP_TIMEOUT_SECS: i32 = 10;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

/// Map a 404 from the daemon to [`RuntimeError::NotFound`].
fn classify(id: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        e => RuntimeError::DockerApi(e),
    }
}

impl DockerRuntime {
    /// Connect to the daemon at the configured socket, or with the platform
    /// defaults (Unix socket on Linux/macOS, named pipe on Windows).
    pub fn connect(config: &DockerConfig) -> Result<Self, RuntimeError> {
        let docker = match &config.socket {
            Some(socket) => Docker::connect_with_socket(
                socket,
                config.timeout_secs,
                bollard::API_DEFAULT_VERSION,
            )?,
            None => Docker::connect_with_local_defaults()?
                .with_timeout(Duration::from_secs(config.timeout_secs)),
        };
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(all).build();
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let public_ports = summary
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|port| port.public_port)
                    .collect();
                Some(RuntimeContainer {
                    id,
                    names: summary.names.unwrap_or_default(),
                    image: summary.image,
                    status: summary.status,
                    public_ports,
                })
            })
            .collect())
    }

    async fn list_image_tags(&self) -> Result<Vec<String>, RuntimeError> {
        let options: ListImagesOptions = ListImagesOptionsBuilder::new().build();
        let images = self.docker.list_images(Some(options)).await?;
        Ok(images
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .collect())
    }

    fn build_image(&self, request: ImageBuildRequest) -> BoxStream<'_, Result<String, RuntimeError>> {
        log::info!(
            "Building image {} from a {} byte context",
            request.tag,
            request.context.len()
        );
        let options: BuildImageOptions = BuildImageOptionsBuilder::new()
            .t(&request.tag)
            .dockerfile(&request.dockerfile)
            .networkmode(&request.network_mode)
            .rm(true)
            .build();

        self.docker
            .build_image(options, None, Some(bollard::body_full(request.context)))
            .map(|item| match item {
                Ok(info) => {
                    if let Some(detail) = info.error_detail {
                        let message = detail
                            .message
                            .unwrap_or_else(|| "unknown build error".to_string());
                        return Err(RuntimeError::Build(message));
                    }
                    Ok(info.stream.unwrap_or_default())
                }
                Err(e) => Err(RuntimeError::DockerApi(e)),
            })
            .boxed()
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String, RuntimeError> {
        log::info!("Creating container: {}", spec.name);

        let container_port = format!("{}/tcp", spec.host_port);
        let exposed_ports: Vec<String> = vec![container_port.clone()];

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            container_port,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options: CreateContainerOptions =
            CreateContainerOptionsBuilder::new().name(&spec.name).build();

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .inspect_err(|e| log::error!("Failed to create container {}: {}", spec.name, e))?;

        for warning in &response.warnings {
            log::warn!("Runtime warning for {}: {}", spec.name, warning);
        }
        log::info!("Container {} created as {}", spec.name, response.id);
        Ok(response.id)
    }

    async fn inspect_status(&self, id: &str) -> Result<RuntimeStatus, RuntimeError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        let info = self
            .docker
            .inspect_container(id, Some(options))
            .await
            .map_err(|e| classify(id, e))?;

        Ok(info
            .state
            .and_then(|state| state.status)
            .map(RuntimeStatus::from)
            .unwrap_or(RuntimeStatus::Unknown))
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options: StartContainerOptions = StartContainerOptionsBuilder::new().build();
        match self.docker.start_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                log::info!("Container {id} already started");
                Ok(())
            }
            Err(e) => Err(classify(id, e)),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options: StopContainerOptions = StopContainerOptionsBuilder::new()
            .t(STOP_TIMEOUT_SECS)
            .build();
        match self.docker.stop_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                log::info!("Container {id} already stopped");
                Ok(())
            }
            Err(e) => Err(classify(id, e)),
        }
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options: RestartContainerOptions = RestartContainerOptionsBuilder::new()
            .t(STOP_TIMEOUT_SECS)
            .build();
        self.docker
            .restart_container(id, Some(options))
            .await
            .map_err(|e| classify(id, e))
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options: RemoveContainerOptions = RemoveContainerOptionsBuilder::new().build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| classify(id, e))
    }

    async fn unpause_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(|e| classify(id, e))
    }
}
