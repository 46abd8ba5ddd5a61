use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::runtime::RuntimeStatus;

use super::RegistryError;

const MAX_BUILD_ID_LEN: usize = 128;

/// Desired state of a managed container as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Building,
    Created,
    Running,
    Stopped,
    Failed,
    Removed,
}

impl ContainerState {
    /// States in which no runtime container exists for the record.
    pub fn is_unbuilt(self) -> bool {
        matches!(self, Self::Building | Self::Failed)
    }
}

impl AsRef<str> for ContainerState {
    fn as_ref(&self) -> &str {
        match self {
            Self::Building => "building",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl From<RuntimeStatus> for ContainerState {
    fn from(status: RuntimeStatus) -> Self {
        match status {
            RuntimeStatus::Created | RuntimeStatus::Empty => Self::Created,
            RuntimeStatus::Running | RuntimeStatus::Restarting => Self::Running,
            RuntimeStatus::Removing => Self::Removed,
            RuntimeStatus::Paused
            | RuntimeStatus::Exited
            | RuntimeStatus::Dead
            | RuntimeStatus::Unknown => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub id: Uuid,
    pub build_id: String,
    pub project_id: String,
    pub name: String,
    pub image: String,
    pub host_port: u16,
    #[serde(default)]
    pub environment_variables: Vec<String>,
    pub state: ContainerState,
    /// Set once the image is built and the runtime container exists.
    #[serde(default)]
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to manage a new container, submitted before its archive is uploaded.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerIntent {
    pub build_id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(deserialize_with = "deserialize_port")]
    pub host_port: u16,
    #[serde(default)]
    pub environment_variables: Vec<String>,
}

/// Ports arrive either as JSON numbers or as strings like `"8080"`.
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u64),
        Text(String),
    }

    let port = match RawPort::deserialize(deserializer)? {
        RawPort::Number(n) => n,
        RawPort::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid port {s:?}")))?,
    };
    match u16::try_from(port) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(serde::de::Error::custom(format!(
            "port {port} is outside 1-65535"
        ))),
    }
}

/// Build ids name workspace directories, so only a conservative alphabet is allowed.
pub fn is_valid_build_id(build_id: &str) -> bool {
    !build_id.is_empty()
        && build_id.len() <= MAX_BUILD_ID_LEN
        && build_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ContainerIntent {
    pub fn into_record(self) -> Result<ContainerRecord, RegistryError> {
        if !is_valid_build_id(&self.build_id) {
            return Err(RegistryError::Invalid(format!(
                "build id {:?} must be 1-{MAX_BUILD_ID_LEN} characters of [A-Za-z0-9_-]",
                self.build_id
            )));
        }
        if self.project_id.trim().is_empty() {
            return Err(RegistryError::Invalid("project id is required".into()));
        }
        let name = self.name.trim().to_string();
        if name.chars().count() < 2 {
            return Err(RegistryError::Invalid(
                "container name needs at least 2 characters".into(),
            ));
        }
        if let Some(bad) = self
            .environment_variables
            .iter()
            .find(|var| !matches!(var.split_once('='), Some((key, _)) if !key.is_empty()))
        {
            return Err(RegistryError::Invalid(format!(
                "environment variable {bad:?} is not KEY=VALUE"
            )));
        }

        let image = match self.image.map(|i| i.trim().to_string()) {
            Some(image) if !image.is_empty() => image,
            _ => name.to_lowercase(),
        };

        let now = Utc::now();
        Ok(ContainerRecord {
            id: Uuid::now_v7(),
            build_id: self.build_id,
            project_id: self.project_id,
            name,
            image,
            host_port: self.host_port,
            environment_variables: self.environment_variables,
            state: ContainerState::Building,
            container_id: None,
            created_at: now,
            updated_at: now,
        })
    }
}
