use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("workspace root {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("failed to enumerate {}: {source}", root.display())]
    Enumerate {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create working copy: {0}")]
    Scratch(#[source] io::Error),

    #[error("failed to copy {}: {source}", path.display())]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("provisioning task failed: {0}")]
    Join(String),
}

/// A private mirror of a client workspace. The directory is deleted when this value is dropped.
#[derive(Debug)]
pub struct WorkingCopy {
    source: PathBuf,
    dir: TempDir,
    files: usize,
}

impl WorkingCopy {
    /// The client's logical workspace root.
    pub fn source_root(&self) -> &Path {
        &self.source
    }

    /// The private directory the backend sees.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn file_count(&self) -> usize {
        self.files
    }

    /// Delete the working copy, reporting failures instead of ignoring them on drop.
    pub fn remove(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// Mirror every file under `source_root` into a fresh directory under `scratch_dir` (or the
/// system temp dir). Version-control metadata is not copied.
pub async fn provision(
    source_root: PathBuf,
    scratch_dir: Option<PathBuf>,
) -> Result<WorkingCopy, ProvisionError> {
    tokio::task::spawn_blocking(move || provision_blocking(source_root, scratch_dir.as_deref()))
        .await
        .map_err(|err| ProvisionError::Join(err.to_string()))?
}

fn provision_blocking(
    source_root: PathBuf,
    scratch_dir: Option<&Path>,
) -> Result<WorkingCopy, ProvisionError> {
    if !source_root.is_dir() {
        return Err(ProvisionError::NotADirectory(source_root));
    }

    let files = tessera_core::collect_files(&source_root).map_err(|source| ProvisionError::Enumerate {
        root: source_root.clone(),
        source,
    })?;

    let mut builder = tempfile::Builder::new();
    builder.prefix("tessera-relay-");
    let dir = match scratch_dir {
        Some(scratch_dir) => {
            fs::create_dir_all(scratch_dir).map_err(ProvisionError::Scratch)?;
            builder.tempdir_in(scratch_dir)
        }
        None => builder.tempdir(),
    }
    .map_err(ProvisionError::Scratch)?;

    let mut copied = 0;
    for file in &files {
        let Ok(rel) = file.strip_prefix(&source_root) else {
            continue;
        };
        let dest = dir.path().join(rel);
        let copy = || -> io::Result<()> {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(file, &dest)?;
            Ok(())
        };
        copy().map_err(|source| ProvisionError::Copy {
            path: file.clone(),
            source,
        })?;
        copied += 1;
    }

    tracing::debug!(
        target: "tessera.relay",
        source = %source_root.display(),
        copy = %dir.path().display(),
        files = copied,
        "provisioned working copy"
    );

    Ok(WorkingCopy {
        source: source_root,
        dir,
        files: copied,
    })
}
