//! Per-attempt scratch directories
//!
//! Each attempt gets a fresh directory: the only place the script may write.
//! Data sources are copied into `data/` and marked read-only, so no attempt
//! can alter a source another step reads. The directory is removed when the
//! attempt ends, whatever the outcome.

use crate::error::SandboxError;
use analyst_core::DataHandle;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Sub-directory holding read-only data copies
pub const DATA_DIR: &str = "data";

/// One attempt's scratch directory
#[derive(Debug)]
pub struct ScratchSpace {
    dir: TempDir,
    staged: BTreeMap<String, String>,
}

impl ScratchSpace {
    /// Create a fresh directory under `root` (system temp dir when `None`)
    ///
    /// # Errors
    /// Returns `SandboxError::Scratch` if the directory cannot be created.
    pub fn create(root: Option<&Path>, label: &str) -> Result<Self, SandboxError> {
        let mut builder = tempfile::Builder::new();
        let prefix = format!("analyst-{label}-");
        builder.prefix(&prefix);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| SandboxError::scratch(root, e))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| SandboxError::scratch(root.unwrap_or(Path::new("<tmp>")), e))?;

        let data = dir.path().join(DATA_DIR);
        std::fs::create_dir(&data).map_err(|e| SandboxError::scratch(&data, e))?;

        Ok(Self {
            dir,
            staged: BTreeMap::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copy data sources in and make the copies read-only
    ///
    /// # Errors
    /// Returns `SandboxError::Scratch` if a source cannot be copied.
    pub async fn stage_data(&mut self, handles: &[DataHandle]) -> Result<(), SandboxError> {
        let data = self.path().join(DATA_DIR);
        for handle in handles {
            let file = handle.file_name();
            let target = data.join(&file);
            tokio::fs::copy(handle.path(), &target)
                .await
                .map_err(|e| SandboxError::scratch(handle.path(), e))?;
            let mut perms = tokio::fs::metadata(&target)
                .await
                .map_err(|e| SandboxError::scratch(&target, e))?
                .permissions();
            perms.set_readonly(true);
            tokio::fs::set_permissions(&target, perms)
                .await
                .map_err(|e| SandboxError::scratch(&target, e))?;
            self.staged.insert(handle.name().to_string(), file);
        }
        Ok(())
    }

    /// Handle name to file name under `data/`
    #[inline]
    #[must_use]
    pub fn staged(&self) -> &BTreeMap<String, String> {
        &self.staged
    }

    /// Write a file at the top of the scratch directory
    ///
    /// # Errors
    /// Returns `SandboxError::Scratch` on write failure.
    pub async fn write(&self, name: &str, contents: &[u8]) -> Result<PathBuf, SandboxError> {
        let path = self.path().join(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| SandboxError::scratch(&path, e))?;
        Ok(path)
    }

    /// Delete the directory and everything in it
    ///
    /// # Errors
    /// Returns `SandboxError::Scratch` if removal fails.
    pub fn close(self) -> Result<(), SandboxError> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| SandboxError::scratch(path, e))
    }
}
