//! Disposable per-job workspace directories.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::core::types::JobId;

/// Uniquely named directory owned by exactly one running job.
///
/// [`Workspace::remove`] is the normal exit path; dropping the value removes
/// the directory as a fallback.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    /// Create `patchrunner-job-{id}-XXXX` under `root` (or the system temp dir).
    pub fn create(root: Option<&Path>, job_id: JobId) -> Result<Self> {
        let prefix = format!("patchrunner-job-{job_id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)
                    .with_context(|| format!("create workspace root {}", root.display()))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .context("create workspace directory")?;
        let path = dir.path().to_path_buf();
        debug!(path = %path.display(), "workspace created");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory tree.
    pub async fn remove(mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        // Hand the path back from TempDir so Drop does not race this removal.
        let path = dir.keep();
        tokio::fs::remove_dir_all(&path)
            .await
            .with_context(|| format!("remove workspace {}", path.display()))?;
        debug!(path = %path.display(), "workspace removed");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(err) = dir.close() {
                warn!(path = %self.path.display(), err = %err, "workspace cleanup on drop failed");
            }
        }
    }
}
