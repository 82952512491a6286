//! Execution context - the ephemeral working directory of one task
//!
//! The directory is removed when the context is closed or dropped, so every
//! exit path of the pipeline (including panics) cleans up after itself.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;

const WORKDIR_PREFIX: &str = "radio-task-";

/// Tells the spawned program where to publish its output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub uploader_base_url: String,
    pub session_id: String,
    pub task_id: String,
    pub device_id: String,
}

#[derive(Debug)]
pub struct ExecutionContext {
    dir: TempDir,
    acquired_at: Instant,
}

impl ExecutionContext {
    /// Create a fresh working directory under the system temp dir
    pub fn create(acquired_at: Instant) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir()
            .context("creating task working directory")?;
        Ok(Self { dir, acquired_at })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Write `content` to `name` inside the working directory
    pub fn write_file(&self, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub fn write_manifest(&self, name: &str, manifest: &Manifest) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(manifest)?;
        log::debug!("Manifest {}:\n{}", name, json);
        self.write_file(name, &json)
    }

    /// Remove the directory, logging instead of failing
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => log::info!("Removed working directory {}", path.display()),
            Err(e) => log::warn!("Failed to remove working directory {}: {}", path.display(), e),
        }
    }
}
