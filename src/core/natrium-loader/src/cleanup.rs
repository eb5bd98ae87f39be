//! Process-wide best-effort cleanup of temporary artifacts.
//!
//! Paths registered here are removed during normal shutdown, newest first, by
//! dropping an [`ExitCleanupGuard`] or calling [`run_exit_cleanup`]. A process
//! that terminates abnormally (signal, abort, power loss) leaks whatever is
//! still registered.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// A list of paths to remove at shutdown.
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    paths: Mutex<Vec<PathBuf>>,
}

impl CleanupRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide registry.
    pub fn global() -> Arc<CleanupRegistry> {
        static GLOBAL: OnceLock<Arc<CleanupRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(CleanupRegistry::new())).clone()
    }

    /// Registers a file or directory for removal.
    pub fn register(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut paths = self.paths.lock();
        if !paths.contains(&path) {
            debug!(path = %path.display(), "Registered for exit cleanup");
            paths.push(path);
        }
    }

    /// Returns true if `path` is waiting for removal.
    pub fn is_registered(&self, path: &Path) -> bool {
        self.paths.lock().iter().any(|p| p == path)
    }

    /// Number of paths waiting for removal.
    pub fn pending(&self) -> usize {
        self.paths.lock().len()
    }

    /// Removes every registered path, newest first.
    ///
    /// Paths that are already gone count as removed. Failures are logged and
    /// the path is dropped from the registry either way. Returns the number
    /// of paths removed.
    pub fn run(&self) -> usize {
        let paths = std::mem::take(&mut *self.paths.lock());
        let mut removed = 0;

        for path in paths.iter().rev() {
            match remove_path(path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove temporary artifact");
                },
            }
        }

        debug!(removed, total = paths.len(), "Exit cleanup finished");
        removed
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Walks the process-wide registry.
pub fn run_exit_cleanup() -> usize {
    CleanupRegistry::global().run()
}

/// Runs the process-wide cleanup when dropped.
///
/// Hold one in `main` for the lifetime of the program.
#[derive(Debug)]
#[must_use = "cleanup runs when the guard is dropped"]
pub struct ExitCleanupGuard {
    _private: (),
}

impl ExitCleanupGuard {
    /// Creates the guard.
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for ExitCleanupGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExitCleanupGuard {
    fn drop(&mut self) {
        run_exit_cleanup();
    }
}
