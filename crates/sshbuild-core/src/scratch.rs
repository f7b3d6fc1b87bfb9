//! Per-run scratch directory

use crate::{CoreError, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SCRATCH_PREFIX: &str = "docker-ssh-build-";

/// File name of the packaged build context
pub const CONTEXT_ARCHIVE: &str = "ctx.tar.gz";

/// File name of the saved image stream
pub const IMAGE_ARCHIVE: &str = "image.tar";

/// Exclusively owned directory holding the run's intermediate artifacts.
///
/// Removed recursively when closed or dropped, whatever the outcome of the run.
/// Removal failures are logged and never fail the run.
#[derive(Debug)]
pub struct ScratchDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl ScratchDir {
    pub fn create_in(root: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(root)
            .map_err(CoreError::Scratch)?;
        let path = dir.path().to_path_buf();
        tracing::debug!("Created scratch directory {}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn context_archive(&self) -> PathBuf {
        self.path.join(CONTEXT_ARCHIVE)
    }

    pub fn image_archive(&self) -> PathBuf {
        self.path.join(IMAGE_ARCHIVE)
    }

    /// Remove the directory now
    pub fn close(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(dir) = self.dir.take() {
            match dir.close() {
                Ok(()) => tracing::debug!("Removed scratch directory {}", self.path.display()),
                Err(e) => tracing::warn!(
                    "Failed to remove scratch directory {}: {}",
                    self.path.display(),
                    e
                ),
            }
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_paths() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create_in(root.path()).unwrap();
        assert!(scratch.path().starts_with(root.path()));
        assert!(scratch
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(SCRATCH_PREFIX));
        assert_eq!(scratch.context_archive(), scratch.path().join("ctx.tar.gz"));
        assert_eq!(scratch.image_archive(), scratch.path().join("image.tar"));
    }

    #[test]
    fn test_removed_on_close_with_contents() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create_in(root.path()).unwrap();
        let path = scratch.path().to_path_buf();
        std::fs::write(scratch.context_archive(), b"ctx").unwrap();
        std::fs::write(scratch.image_archive(), b"img").unwrap();

        scratch.close();
        assert!(!path.exists());
    }

    #[test]
    fn test_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let scratch = ScratchDir::create_in(root.path()).unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_root_is_error() {
        let err = ScratchDir::create_in(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, CoreError::Scratch(_)));
    }

    #[test]
    fn test_already_removed_is_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create_in(root.path()).unwrap();
        std::fs::remove_dir_all(scratch.path()).unwrap();
        scratch.close();
    }
}
