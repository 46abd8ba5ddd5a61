//! Container runtime abstraction.
//!
//! Everything that talks to the container engine goes through
//! [`ContainerRuntime`]. The production implementation is [`DockerRuntime`],
//! a thin wrapper around a shared bollard client. Build, lifecycle and
//! reconciliation tasks all hold the same `Arc<dyn ContainerRuntime>`.

pub mod docker;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use bollard::models::ContainerStateStatusEnum;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;

pub use docker::DockerRuntime;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("Container {0} not found")]
    NotFound(String),
    #[error("Image build failed: {0}")]
    Build(String),
}

/// Lifecycle state reported by the runtime for a single container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Empty,
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl AsRef<str> for RuntimeStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Empty => "empty",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl From<ContainerStateStatusEnum> for RuntimeStatus {
    fn from(status: ContainerStateStatusEnum) -> Self {
        match status {
            ContainerStateStatusEnum::EMPTY => Self::Empty,
            ContainerStateStatusEnum::CREATED => Self::Created,
            ContainerStateStatusEnum::RUNNING => Self::Running,
            ContainerStateStatusEnum::PAUSED => Self::Paused,
            ContainerStateStatusEnum::RESTARTING => Self::Restarting,
            ContainerStateStatusEnum::REMOVING => Self::Removing,
            ContainerStateStatusEnum::EXITED => Self::Exited,
            ContainerStateStatusEnum::DEAD => Self::Dead,
        }
    }
}

/// A container as seen in the runtime's container list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeContainer {
    pub id: String,
    pub names: Vec<String>,
    pub image: Option<String>,
    pub status: Option<String>,
    pub public_ports: Vec<u16>,
}

/// Everything needed to ask the runtime for a new image.
#[derive(Debug, Clone)]
pub struct ImageBuildRequest {
    pub tag: String,
    pub dockerfile: String,
    pub network_mode: String,
    /// Tar archive of the build context.
    pub context: Bytes,
}

/// Desired shape of a container created from a freshly built image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: String,
    /// Published on all interfaces as `host_port/tcp -> host_port`.
    pub host_port: u16,
    pub env: Vec<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Lists containers. With `all == false` only running ones are returned.
    async fn list_containers(&self, all: bool) -> Result<Vec<RuntimeContainer>, RuntimeError>;

    /// Every `repo:tag` known to the runtime.
    async fn list_image_tags(&self) -> Result<Vec<String>, RuntimeError>;

    /// Starts an image build and returns its progress lines as they arrive.
    /// An error item ends the build.
    fn build_image(&self, request: ImageBuildRequest) -> BoxStream<'_, Result<String, RuntimeError>>;

    /// Returns the id of the created container.
    async fn create_container(&self, spec: ContainerSpec) -> Result<String, RuntimeError>;

    async fn inspect_status(&self, id: &str) -> Result<RuntimeStatus, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn unpause_container(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Parse an image reference into (image, tag) components
pub fn parse_image_reference(image: &str) -> (&str, &str) {
    if let Some(at_pos) = image.find('@') {
        return (&image[..at_pos], &image[at_pos..]);
    }

    // A colon followed by a slash belongs to a registry port (localhost:5000/app)
    if let Some(colon_pos) = image.rfind(':') {
        let after_colon = &image[colon_pos + 1..];
        if !after_colon.contains('/') {
            return (&image[..colon_pos], after_colon);
        }
    }

    (image, "latest")
}

/// The `repo:tag` string the runtime lists once `image` has been built.
pub fn expected_image_tag(image: &str) -> String {
    let (name, tag) = parse_image_reference(image);
    if tag.starts_with('@') {
        return image.to_string();
    }
    format!("{name}:{tag}")
}
