//! Source snapshots for RUN executions.
//!
//! A RUN either targets a file already resident in the project, or a scratch
//! copy of the submitted source under `<project>/.temp/`. A [`ScratchFile`]
//! is deleted by consuming it, so it can only ever be removed once.

use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use swazipen_core::{ProjectContext, RunPolicy};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Filename used when a RUN request names none.
pub const DEFAULT_RUN_FILENAME: &str = "run.sl";

/// Scratch-file error.
#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),
    #[error("Failed to prepare run file: {0}")]
    Io(#[from] std::io::Error),
}

/// Temporary file holding a source snapshot.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Write `source` to a freshly named file in `dir`.
    ///
    /// The name is `<unix-millis>-<8 hex>-<basename of filename>`.
    ///
    /// # Errors
    /// Returns error if the directory or file cannot be written.
    pub async fn create(dir: &Path, filename: &Path, source: &str) -> Result<Self, ScratchError> {
        tokio::fs::create_dir_all(dir).await?;

        let basename = filename
            .file_name()
            .map_or_else(|| DEFAULT_RUN_FILENAME.into(), |name| name.to_string_lossy());
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        let nonce = Uuid::new_v4().simple().to_string();
        let path = dir.join(format!("{millis}-{}-{basename}", &nonce[..8]));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(source.as_bytes()).await?;
        file.flush().await?;

        tracing::debug!(path = %path.display(), "Created scratch file");
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the snapshot. A file that is already gone counts as removed.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be deleted.
    pub async fn remove(self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Blocking variant of [`ScratchFile::remove`] for drop paths.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be deleted.
    pub fn remove_blocking(self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// The file a RUN executes.
#[derive(Debug)]
pub enum RunTarget {
    /// A file already on disk inside the project; never deleted by us.
    Resident(PathBuf),
    /// A snapshot owned by the caller.
    Scratch(ScratchFile),
}

impl RunTarget {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Resident(path) => path,
            Self::Scratch(scratch) => scratch.path(),
        }
    }

    /// The scratch file to clean up, if one was allocated.
    #[must_use]
    pub fn into_scratch(self) -> Option<ScratchFile> {
        match self {
            Self::Resident(_) => None,
            Self::Scratch(scratch) => Some(scratch),
        }
    }
}

/// Decide which file a RUN of `filename` executes.
///
/// With [`RunPolicy::PreferResident`] an existing project file of that name is
/// used as-is; otherwise `source` is written to a new scratch file.
///
/// # Errors
/// Returns error if the filename escapes the project or the snapshot cannot
/// be written.
pub async fn prepare_run_target(
    ctx: &ProjectContext,
    filename: Option<&str>,
    source: &str,
) -> Result<RunTarget, ScratchError> {
    let filename = filename
        .filter(|f| !f.trim().is_empty())
        .unwrap_or(DEFAULT_RUN_FILENAME);
    let relative = project_relative(filename)?;

    if ctx.run_policy == RunPolicy::PreferResident {
        let candidate = ctx.root().join(&relative);
        if tokio::fs::metadata(&candidate)
            .await
            .is_ok_and(|meta| meta.is_file())
        {
            return Ok(RunTarget::Resident(candidate));
        }
    }

    let scratch = ScratchFile::create(&ctx.scratch_dir(), &relative, source).await?;
    Ok(RunTarget::Scratch(scratch))
}

/// Normalize a client filename into a path below the project root.
fn project_relative(filename: &str) -> Result<PathBuf, ScratchError> {
    let mut relative = PathBuf::new();
    for component in Path::new(filename).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ScratchError::InvalidFilename(filename.to_string()));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(ScratchError::InvalidFilename(filename.to_string()));
    }
    Ok(relative)
}
