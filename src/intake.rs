//! Turns an uploaded zip archive into a build workspace on disk.
//!
//! Every entry name is checked before anything is extracted, so a hostile
//! archive never writes a single byte outside (or inside) the workspace.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::broadcast::BuildLogBroadcaster;
use crate::registry::is_valid_build_id;

const ACCEPTED_MIME_TYPES: &[&str] = &["application/zip", "application/x-zip-compressed"];

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Unsupported file type {0:?}, only zip archives are accepted")]
    UnsupportedType(String),
    #[error("Invalid build id {0:?}")]
    InvalidBuildId(String),
    #[error("Archive entry {0:?} escapes the build workspace")]
    PathTraversal(String),
    #[error("Corrupt zip archive: {0}")]
    Corrupt(#[from] zip::result::ZipError),
    #[error("Missing {0:?} in the uploaded archive")]
    MissingDescriptor(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// An upload staged on local disk, as handed over by the HTTP layer.
#[derive(Debug, Clone)]
pub struct UploadedArchive {
    pub path: PathBuf,
    /// Name of the file as sent by the client, e.g. `my-app.zip`.
    pub file_name: String,
    pub mime_type: String,
}

/// An extracted build workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
    /// Directory holding the descriptor, sent to the runtime as the build context.
    pub context_dir: PathBuf,
    pub descriptor: String,
}

impl Workspace {
    pub async fn remove(&self) {
        remove_workspace(&self.root).await;
    }
}

async fn remove_workspace(root: &Path) {
    match tokio::fs::remove_dir_all(root).await {
        Ok(()) => log::debug!("Removed workspace {root:?}"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Unable to remove workspace {root:?}: {e}"),
    }
}

pub struct ArchiveIntake {
    workspace_dir: PathBuf,
    descriptor: String,
    broadcaster: Arc<BuildLogBroadcaster>,
}

impl ArchiveIntake {
    pub fn new(
        workspace_dir: impl Into<PathBuf>,
        descriptor: impl Into<String>,
        broadcaster: Arc<BuildLogBroadcaster>,
    ) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            descriptor: descriptor.into(),
            broadcaster,
        }
    }

    /// Extract `upload` into the workspace of `build_id`.
    ///
    /// Failures are reported on the build's log channel before being returned,
    /// and whatever was already extracted is removed.
    pub async fn accept(
        &self,
        build_id: &str,
        upload: UploadedArchive,
    ) -> Result<Workspace, IntakeError> {
        let res = self.try_accept(build_id, upload).await;
        if let Err(e) = &res {
            log::warn!("Rejected archive for build {build_id}: {e}");
            if is_valid_build_id(build_id) {
                remove_workspace(&self.workspace_dir.join(build_id)).await;
            }
            self.broadcaster.publish_error(build_id, e.to_string());
        }
        res
    }

    async fn try_accept(
        &self,
        build_id: &str,
        upload: UploadedArchive,
    ) -> Result<Workspace, IntakeError> {
        if !is_accepted_mime_type(&upload.mime_type) {
            return Err(IntakeError::UnsupportedType(upload.mime_type));
        }
        if !is_valid_build_id(build_id) {
            return Err(IntakeError::InvalidBuildId(build_id.to_string()));
        }

        let root = self.workspace_dir.join(build_id);
        let archive = upload.path.clone();
        let dest = root.clone();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
            .await
            .map_err(io::Error::other)??;

        if let Err(e) = tokio::fs::remove_file(&upload.path).await {
            log::warn!("Unable to remove staged upload {:?}: {e}", upload.path);
        }

        let stem = Path::new(&upload.file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let workspace = Workspace {
            context_dir: root.join(&stem),
            root,
            descriptor: self.descriptor.clone(),
        };

        let descriptor_path = workspace.context_dir.join(&workspace.descriptor);
        if stem.is_empty() || !tokio::fs::try_exists(&descriptor_path).await? {
            workspace.remove().await;
            return Err(IntakeError::MissingDescriptor(
                Path::new(&stem).join(&workspace.descriptor),
            ));
        }

        log::info!(
            "Extracted archive {} for build {build_id} into {:?}",
            upload.file_name,
            workspace.root
        );
        Ok(workspace)
    }
}

fn is_accepted_mime_type(mime_type: &str) -> bool {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    ACCEPTED_MIME_TYPES
        .iter()
        .any(|accepted| accepted.eq_ignore_ascii_case(essence))
}

/// Whether a raw zip entry name stays inside the directory it is extracted to.
pub fn is_safe_entry_path(name: &str) -> bool {
    if name.is_empty() || name.starts_with('/') || name.starts_with('\\') {
        return false;
    }
    let mut chars = name.chars();
    if let (Some(drive), Some(':')) = (chars.next(), chars.next()) {
        if drive.is_ascii_alphabetic() {
            return false;
        }
    }
    !name.split(['/', '\\']).any(|segment| segment == "..")
}

fn extract_archive(archive_path: &Path, dest: &Path) -> Result<(), IntakeError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        let name = entry.name().to_string();
        match entry.enclosed_name() {
            Some(relative) if is_safe_entry_path(&name) => {
                entries.push((index, relative, entry.is_dir()))
            }
            _ => return Err(IntakeError::PathTraversal(name)),
        }
    }

    match std::fs::remove_dir_all(dest) {
        Ok(()) => log::info!("Removed previous workspace {dest:?}"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::fs::create_dir_all(dest)?;

    for (index, relative, is_dir) in entries {
        let target = dest.join(relative);
        if is_dir {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut entry = archive.by_index(index)?;
        let mut out = std::fs::File::create(&target)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o777))?;
        }
    }
    Ok(())
}
