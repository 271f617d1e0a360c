//! Per-worker scratch directories for temporary run files.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::sort::SortError;

/// Root directory scratch directories are created under: `TMPDIR` if set,
/// otherwise the current directory.
pub fn default_root() -> PathBuf {
    env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// A worker's private scratch directory. Every run file the worker creates
/// lives inside it; the directory is removed at coordinator teardown (and,
/// as a fallback, on drop).
pub struct ScratchDir {
    dir: tempfile::TempDir,
    rank: usize,
    next_id: AtomicU64,
}

impl ScratchDir {
    pub fn create(root: Option<&Path>, rank: usize) -> Result<Self, SortError> {
        let root = root.map(Path::to_path_buf).unwrap_or_else(default_root);
        let dir = tempfile::Builder::new()
            .prefix(&format!("recsort-w{}-", rank))
            .tempdir_in(&root)
            .map_err(SortError::TempDir)?;

        log::info!("worker {} using {} as scratch directory", rank, dir.path().display());

        Ok(ScratchDir {
            dir,
            rank,
            next_id: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Mints a fresh run file path. The name embeds the worker's rank and a
    /// monotonically increasing counter, so names are unique without
    /// locking.
    pub fn next_run_path(&self) -> PathBuf {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.dir.path().join(format!("run_{}_{}.bin", self.rank, id))
    }

    /// Removes the directory and everything in it. Best-effort: a failure is
    /// logged and otherwise ignored.
    pub fn cleanup(&self) {
        if let Err(err) = fs::remove_dir_all(self.dir.path()) {
            log::warn!(
                "worker {}: scratch directory {} not removed: {}",
                self.rank,
                self.dir.path().display(),
                err
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::ScratchDir;

    #[test]
    fn test_run_names_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(Some(root.path()), 3).unwrap();

        let first = scratch.next_run_path();
        let second = scratch.next_run_path();
        assert_ne!(first, second);
        assert!(first.starts_with(scratch.path()));
        assert!(first.file_name().unwrap().to_str().unwrap().starts_with("run_3_"));
    }

    #[test]
    fn test_cleanup_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(Some(root.path()), 0).unwrap();
        std::fs::write(scratch.next_run_path(), b"leftover").unwrap();

        let path = scratch.path().to_path_buf();
        scratch.cleanup();
        assert!(!path.exists());
    }
}
