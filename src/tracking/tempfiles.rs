//! Tracked temporary files and directories.
//!
//! Thin wrappers over the `tempfile` crate. Code under test creates its
//! scratch files through these functions; while a [`TempFileTracker`] is
//! installed every created path is recorded, and any path still on disk
//! after the call is reported as undeleted.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempDir};

use super::{EntryPoint, Hook, ResourceTracker, TrackedLeak};
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::Resource;

/// A created temporary path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempEntry {
    pub kind: Resource,
    pub path: PathBuf,
}

static TEMP_ENTRIES: EntryPoint<TempEntry> = EntryPoint::new();

fn record(kind: Resource, path: &Path) {
    TEMP_ENTRIES.record(TempEntry {
        kind,
        path: path.to_path_buf(),
    });
}

/// Temporary file in the default temp dir, deleted when dropped.
pub fn named_tempfile() -> io::Result<NamedTempFile> {
    let file = NamedTempFile::new()?;
    record(Resource::TempFile, file.path());
    Ok(file)
}

/// Temporary file in `dir`, deleted when dropped.
pub fn named_tempfile_in(dir: impl AsRef<Path>) -> io::Result<NamedTempFile> {
    let file = NamedTempFile::new_in(dir)?;
    record(Resource::TempFile, file.path());
    Ok(file)
}

/// Temporary directory, removed recursively when dropped.
pub fn tempdir() -> io::Result<TempDir> {
    let dir = TempDir::new()?;
    record(Resource::TempDir, dir.path());
    Ok(dir)
}

/// Temporary directory inside `parent`, removed recursively when dropped.
pub fn tempdir_in(parent: impl AsRef<Path>) -> io::Result<TempDir> {
    let dir = TempDir::new_in(parent)?;
    record(Resource::TempDir, dir.path());
    Ok(dir)
}

/// Creates a temporary file the caller must delete.
pub fn mkstemp() -> io::Result<(File, PathBuf)> {
    let (file, path) = NamedTempFile::new()?.keep().map_err(|e| e.error)?;
    record(Resource::TempFile, &path);
    Ok((file, path))
}

/// Creates a temporary directory the caller must delete.
pub fn mkdtemp() -> io::Result<PathBuf> {
    let path = TempDir::new()?.keep();
    record(Resource::TempDir, &path);
    Ok(path)
}

/// Reports temporary files and directories that outlive the call.
///
/// Files are reported before directories.
#[derive(Debug)]
pub struct TempFileTracker<F: FileSystem = RealFs> {
    hook: Hook<TempEntry>,
    fs: F,
}

impl TempFileTracker<RealFs> {
    pub fn new() -> Self {
        Self::with_fs(RealFs::new())
    }
}

impl Default for TempFileTracker<RealFs> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: FileSystem> TempFileTracker<F> {
    /// Tracker that checks existence through `fs`.
    pub fn with_fs(fs: F) -> Self {
        Self {
            hook: Hook::new(&TEMP_ENTRIES),
            fs,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.hook.is_installed()
    }
}

impl<F: FileSystem> ResourceTracker for TempFileTracker<F> {
    fn install(&mut self) {
        self.hook.install();
    }

    fn uninstall(&mut self) {
        self.hook.uninstall();
    }

    fn tracked_leaks(&self) -> Vec<TrackedLeak> {
        let mut leaks: Vec<TrackedLeak> = self
            .hook
            .tracked()
            .iter()
            .filter(|e| self.fs.exists(&e.path))
            .map(|e| TrackedLeak {
                resource: e.kind,
                ident: e.path.display().to_string(),
            })
            .collect();
        // Stable: creation order is kept within each kind.
        leaks.sort_by_key(|l| l.resource != Resource::TempFile);
        leaks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;
    use crate::global_state_lock as serial;

    #[test]
    fn test_untracked_creation_works() {
        let _guard = serial();
        let file = named_tempfile().unwrap();
        assert!(file.path().exists());
    }

    #[test]
    fn test_deleted_paths_are_not_leaks() {
        let _guard = serial();
        let scratch = TempDir::new().unwrap();
        let mut tracker = TempFileTracker::new();
        tracker.install();

        drop(named_tempfile_in(scratch.path()).unwrap());
        drop(tempdir_in(scratch.path()).unwrap());
        assert!(tracker.tracked_leaks().is_empty());
        assert!(tracker.check("clean").is_ok());
        tracker.uninstall();
    }

    #[test]
    fn test_kept_paths_are_reported_files_first() {
        let _guard = serial();
        let mut tracker = TempFileTracker::new();
        tracker.install();

        let dir = mkdtemp().unwrap();
        let (_file, path) = mkstemp().unwrap();

        let leaks = tracker.tracked_leaks();
        assert_eq!(leaks.len(), 2);
        assert_eq!(leaks[0].resource, Resource::TempFile);
        assert_eq!(leaks[1].resource, Resource::TempDir);

        let err = tracker.check("leaky").unwrap_err();
        assert_eq!(err.resource(), Some(Resource::TempFile));
        assert_eq!(
            err.evidence().unwrap().extras,
            vec![path.display().to_string()]
        );
        assert!(path.exists());

        std::fs::remove_file(&path).unwrap();
        let err = tracker.check("leaky").unwrap_err();
        assert_eq!(err.resource(), Some(Resource::TempDir));
        assert!(err.to_string().contains("1 undeleted temporary directory"));

        std::fs::remove_dir(&dir).unwrap();
        assert!(tracker.check("leaky").is_ok());
        tracker.uninstall();
    }

    #[test]
    fn test_uninstall_clears_and_stops_tracking() {
        let _guard = serial();
        let mut fs = MockFs::new();
        fs.add_file("/tmp/kept", "");
        let mut tracker = TempFileTracker::with_fs(fs);
        tracker.install();
        tracker.install();
        assert!(tracker.is_installed());

        record(Resource::TempFile, Path::new("/tmp/kept"));
        assert_eq!(tracker.tracked_leaks().len(), 1);

        tracker.uninstall();
        assert!(!tracker.is_installed());
        assert!(tracker.tracked_leaks().is_empty());
        record(Resource::TempFile, Path::new("/tmp/kept"));
        assert!(tracker.tracked_leaks().is_empty());
        tracker.uninstall();
    }
}
