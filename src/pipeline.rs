//! The image build pipeline.
//!
//! A build takes the record registered for a build id plus its uploaded
//! archive, and ends with a container created from the freshly built image.
//! Progress is published to the build's log channel as it happens:
//!
//! ```text
//! [BUILD_START]
//! Step 1/4 : FROM node:20
//! ...
//! [BUILD_COMPLETE]
//! ContainerId-3f9c...
//! ```
//!
//! or, when anything goes wrong, `[BUILD_ERROR]` followed by a message.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use futures_util::StreamExt;

use crate::broadcast::{BuildLogBroadcaster, BuildLogEvent};
use crate::config::BuildConfig;
use crate::intake::{ArchiveIntake, IntakeError, UploadedArchive, Workspace};
use crate::lifecycle::{ContainerProvisioner, LifecycleError};
use crate::registry::{BuildRecords, ContainerRecord, RegistryError};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ImageBuildRequest, RuntimeError, expected_image_tag,
};

const CONTAINER_HOSTNAME: &str = "localhost";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("{0}")]
    Rejected(#[from] IntakeError),
    #[error("No container was registered for build {0}")]
    UnknownBuild(String),
    #[error("A build for {0} is already in progress")]
    InProgress(String),
    #[error("Build {0} already produced a container")]
    AlreadyBuilt(String),
    #[error("Failed to create a new container for this host")]
    Failed,
}

/// Failure of a single step once the workspace exists.
#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error("Unable to pack the build context: {0}")]
    Context(#[from] std::io::Error),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    #[error("Image {0} was not found after the build")]
    MissingImage(String),
    #[error("{0}: {msg}", msg = source_message(.0))]
    Lifecycle(#[from] LifecycleError),
    #[error("{0}")]
    Registry(#[from] RegistryError),
}

fn source_message(e: &LifecycleError) -> String {
    match e {
        LifecycleError::Failed { source, .. } => source.to_string(),
        LifecycleError::NotFound(id) => format!("container {id} disappeared"),
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub network_mode: String,
    pub start_after_build: bool,
    pub log_grace: Duration,
}

impl From<&BuildConfig> for PipelineSettings {
    fn from(config: &BuildConfig) -> Self {
        Self {
            network_mode: config.network_mode.clone(),
            start_after_build: config.start_after_build,
            log_grace: config.log_grace(),
        }
    }
}

/// Holds a build id in the in-flight set until dropped.
struct BuildClaim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    build_id: String,
}

impl Drop for BuildClaim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .expect("Poisoned mutex")
            .remove(&self.build_id);
    }
}

pub struct ImageBuildPipeline {
    records: Arc<dyn BuildRecords>,
    provisioner: Arc<dyn ContainerProvisioner>,
    runtime: Arc<dyn ContainerRuntime>,
    intake: ArchiveIntake,
    broadcaster: Arc<BuildLogBroadcaster>,
    settings: PipelineSettings,
    in_flight: Mutex<HashSet<String>>,
}

impl ImageBuildPipeline {
    pub fn new(
        records: Arc<dyn BuildRecords>,
        provisioner: Arc<dyn ContainerProvisioner>,
        runtime: Arc<dyn ContainerRuntime>,
        intake: ArchiveIntake,
        broadcaster: Arc<BuildLogBroadcaster>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            records,
            provisioner,
            runtime,
            intake,
            broadcaster,
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, build_id: &str) -> Option<BuildClaim<'_>> {
        let mut in_flight = self.in_flight.lock().expect("Poisoned mutex");
        if !in_flight.insert(build_id.to_string()) {
            return None;
        }
        Some(BuildClaim {
            in_flight: &self.in_flight,
            build_id: build_id.to_string(),
        })
    }

    /// Build the image for `build_id` from `upload` and create its container.
    /// Returns the runtime id of the new container.
    pub async fn run(&self, build_id: &str, upload: UploadedArchive) -> Result<String, BuildError> {
        let Some(_claim) = self.claim(build_id) else {
            log::warn!("Rejected upload for build {build_id}: a build is already running");
            return Err(BuildError::InProgress(build_id.to_string()));
        };

        self.broadcaster.begin(build_id);
        let res = self.build(build_id, upload).await;
        match &res {
            Ok(id) => log::info!("Build {build_id} finished with container {id}"),
            Err(e) => log::error!("Build {build_id} failed: {e}"),
        }
        self.broadcaster.release(build_id, self.settings.log_grace);
        res
    }

    async fn build(&self, build_id: &str, upload: UploadedArchive) -> Result<String, BuildError> {
        let record = match self.records.begin_build(build_id).await {
            Ok(record) => record,
            Err(e) => {
                self.broadcaster.publish_error(build_id, e.to_string());
                return Err(match e {
                    RegistryError::UnknownBuild(id) => BuildError::UnknownBuild(id),
                    RegistryError::AlreadyBuilt(id) => BuildError::AlreadyBuilt(id),
                    _ => BuildError::Failed,
                });
            }
        };

        let workspace = match self.intake.accept(build_id, upload).await {
            Ok(workspace) => workspace,
            Err(e) => {
                self.mark_failed(build_id, None).await;
                return Err(e.into());
            }
        };

        let mut created = None;
        let res = self.build_in(&record, &workspace, &mut created).await;
        workspace.remove().await;

        match res {
            Ok(container_id) => Ok(container_id),
            Err(e) => {
                self.broadcaster.publish_error(build_id, e.to_string());
                self.mark_failed(build_id, created).await;
                Err(BuildError::Failed)
            }
        }
    }

    async fn build_in(
        &self,
        record: &ContainerRecord,
        workspace: &Workspace,
        created: &mut Option<String>,
    ) -> Result<String, StepError> {
        let build_id = record.build_id.as_str();
        self.broadcaster.publish(build_id, BuildLogEvent::Start);

        let context = pack_context(workspace.context_dir.clone()).await?;
        let tag = expected_image_tag(&record.image);
        log::info!(
            "Building image {tag} for build {build_id} ({} byte context)",
            context.len()
        );

        let mut progress = self.runtime.build_image(ImageBuildRequest {
            tag: tag.clone(),
            dockerfile: workspace.descriptor.clone(),
            network_mode: self.settings.network_mode.clone(),
            context,
        });
        while let Some(chunk) = progress.next().await {
            let chunk = chunk?;
            for line in chunk.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()) {
                self.broadcaster.publish(build_id, BuildLogEvent::line(line));
            }
        }
        drop(progress);

        if !self.runtime.list_image_tags().await?.contains(&tag) {
            return Err(StepError::MissingImage(tag));
        }

        let container_id = self
            .provisioner
            .create(ContainerSpec {
                name: record.name.clone(),
                image: tag,
                hostname: CONTAINER_HOSTNAME.to_string(),
                host_port: record.host_port,
                env: record.environment_variables.clone(),
            })
            .await?;
        *created = Some(container_id.clone());

        self.broadcaster.publish(build_id, BuildLogEvent::Complete);
        self.broadcaster
            .publish(build_id, BuildLogEvent::ContainerId(container_id.clone()));

        if self.settings.start_after_build {
            self.provisioner.start(&container_id).await?;
        }

        let status = self.provisioner.state(&container_id).await?;
        self.records
            .complete_build(build_id, &container_id, status.into())
            .await?;
        Ok(container_id)
    }

    async fn mark_failed(&self, build_id: &str, created: Option<String>) {
        if let Err(e) = self.records.fail_build(build_id).await {
            log::error!("Unable to mark build {build_id} as failed: {e}");
        }
        if let Some(container_id) = created {
            if let Err(e) = self.provisioner.remove(&container_id).await {
                log::warn!("Unable to remove container {container_id} of failed build {build_id}: {e}");
            }
        }
    }
}

/// Tar the build context in memory on the blocking pool.
async fn pack_context(dir: PathBuf) -> Result<Bytes, std::io::Error> {
    tokio::task::spawn_blocking(move || -> std::io::Result<Bytes> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &dir)?;
        Ok(Bytes::from(builder.into_inner()?))
    })
    .await
    .map_err(std::io::Error::other)?
}
