//! Materialized temporary artifacts.

use std::path::{Path, PathBuf};

use crate::permissions::PermissionSet;

/// What kind of filesystem entry an artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// A single file (the only kind that can be bound).
    File,
    /// A directory tree copied out of an expanded resource directory.
    Directory,
}

/// When an artifact is removed from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Not decided yet; the artifact has not been disposed.
    Undetermined,
    /// Removed right after binding.
    Immediate,
    /// Registered for removal at process exit.
    Deferred,
}

/// One resource copied out of the resource space onto the filesystem.
///
/// Disposal consumes the artifact.
#[derive(Debug)]
pub struct TempArtifact {
    pub(crate) path: PathBuf,
    pub(crate) resource: String,
    pub(crate) kind: ArtifactKind,
    pub(crate) len: u64,
    pub(crate) sha256: Option<[u8; 32]>,
    pub(crate) permissions: Option<PermissionSet>,
    pub(crate) deletion: DeletionPolicy,
}

impl TempArtifact {
    pub(crate) fn new(
        path: PathBuf,
        resource: impl Into<String>,
        kind: ArtifactKind,
        len: u64,
        sha256: Option<[u8; 32]>,
    ) -> Self {
        Self {
            path,
            resource: resource.into(),
            kind,
            len,
            sha256,
            permissions: None,
            deletion: DeletionPolicy::Undetermined,
        }
    }

    /// Absolute path of the materialized file or directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resource path this artifact was materialized from.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Kind of filesystem entry.
    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// Total number of bytes written.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// SHA-256 of the file content (files only).
    pub fn sha256(&self) -> Option<&[u8; 32]> {
        self.sha256.as_ref()
    }

    /// Hex encoded SHA-256 of the file content (files only).
    pub fn sha256_hex(&self) -> Option<String> {
        self.sha256.map(hex::encode)
    }

    /// Permission set applied to the artifact, if any.
    pub fn permissions(&self) -> Option<PermissionSet> {
        self.permissions
    }

    /// Current deletion policy.
    pub fn deletion_policy(&self) -> DeletionPolicy {
        self.deletion
    }
}
