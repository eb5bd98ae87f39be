//! Disposal of bound artifacts.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::artifact::{ArtifactKind, DeletionPolicy, TempArtifact};
use crate::cleanup::CleanupRegistry;
use crate::permissions::FsCapability;

/// Outcome of disposing an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisposedArtifact {
    /// Where the artifact lived.
    pub path: PathBuf,
    /// Policy that was applied.
    pub policy: DeletionPolicy,
}

/// Removes artifacts once the dynamic loader has mapped them.
///
/// On POSIX filesystems the mapping keeps the inode alive, so the file is
/// unlinked right away. Elsewhere an open library cannot be removed and the
/// path is handed to the cleanup registry instead.
#[derive(Debug, Clone)]
pub struct ArtifactLifecycle {
    capability: FsCapability,
    registry: Arc<CleanupRegistry>,
}

impl ArtifactLifecycle {
    /// Creates a lifecycle for the probed host capability, using the
    /// process-wide cleanup registry.
    pub fn detect() -> Self {
        Self::new(FsCapability::detect(), CleanupRegistry::global())
    }

    /// Creates a lifecycle for an explicit capability and registry.
    pub fn new(capability: FsCapability, registry: Arc<CleanupRegistry>) -> Self {
        Self {
            capability,
            registry,
        }
    }

    /// Policy this lifecycle applies to every artifact.
    pub fn policy(&self) -> DeletionPolicy {
        match self.capability {
            FsCapability::Posix => DeletionPolicy::Immediate,
            FsCapability::NonPosix => DeletionPolicy::Deferred,
        }
    }

    /// Disposes of an artifact that has already been bound.
    ///
    /// A failed immediate removal falls back to deferred removal: the library
    /// is mapped at this point, so the load itself has succeeded.
    pub fn dispose(&self, mut artifact: TempArtifact) -> DisposedArtifact {
        let policy = match self.policy() {
            DeletionPolicy::Immediate => {
                let removed = match artifact.kind {
                    ArtifactKind::File => fs::remove_file(&artifact.path),
                    ArtifactKind::Directory => fs::remove_dir_all(&artifact.path),
                };
                match removed {
                    Ok(()) => DeletionPolicy::Immediate,
                    Err(e) => {
                        warn!(
                            path = %artifact.path.display(),
                            error = %e,
                            "Immediate removal failed, deferring to exit"
                        );
                        self.registry.register(&artifact.path);
                        DeletionPolicy::Deferred
                    },
                }
            },
            _ => {
                self.registry.register(&artifact.path);
                DeletionPolicy::Deferred
            },
        };

        artifact.deletion = policy;
        debug!(path = %artifact.path.display(), ?policy, "Artifact disposed");

        DisposedArtifact {
            path: artifact.path,
            policy,
        }
    }
}
