//! Copying bundled resources onto the filesystem.
//!
//! Every call creates its own uniquely named temporary directory, so two
//! artifacts sharing a file name (or two loaders running at once) never touch
//! the same path. File content is written to a staging file, flushed and then
//! renamed into place: nothing downstream ever sees a partially written file.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::artifact::{ArtifactKind, TempArtifact};
use crate::cleanup::CleanupRegistry;
use crate::error::LoaderError;
use crate::resources::{normalize_resource, ResourceEntry, ResourceResolver};

/// Prefix of the per-call temporary directories.
pub const TEMP_DIR_PREFIX: &str = "natrium-lib";

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Extracts resources into fresh temporary locations.
#[derive(Debug, Clone)]
pub struct ResourceMaterializer {
    resolver: ResourceResolver,
    registry: Arc<CleanupRegistry>,
    temp_root: Option<PathBuf>,
}

impl ResourceMaterializer {
    /// Creates a materializer registering its directories with the
    /// process-wide cleanup registry.
    pub fn new(resolver: ResourceResolver) -> Self {
        Self::with_registry(resolver, CleanupRegistry::global())
    }

    /// Creates a materializer with an explicit cleanup registry.
    pub fn with_registry(resolver: ResourceResolver, registry: Arc<CleanupRegistry>) -> Self {
        Self {
            resolver,
            registry,
            temp_root: None,
        }
    }

    /// Creates temporary directories below `root` instead of the system
    /// temporary directory.
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    /// The resolver used to locate resources.
    pub fn resolver(&self) -> &ResourceResolver {
        &self.resolver
    }

    /// Copies `resource` into a new temporary directory.
    ///
    /// The artifact keeps its relative layout, so `linux64/libsodium.so`
    /// becomes `<tmp>/linux64/libsodium.so`. The temporary directory is
    /// registered for removal at exit whatever happens to the artifact.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::ResourceNotFound`] if no source has the resource
    /// and [`LoaderError::Materialization`] if copying fails.
    pub fn materialize(&self, resource: &str) -> Result<TempArtifact, LoaderError> {
        let resource = normalize_resource(resource)?;
        let (source, entry) = self.resolver.resolve(&resource)?;

        let io_err = |source| LoaderError::Materialization {
            resource: resource.clone(),
            source,
        };

        let root = self.create_temp_dir().map_err(io_err)?;
        self.registry.register(&root);

        let destination = resource.split('/').fold(root, |path, part| path.join(part));

        let artifact = match entry {
            ResourceEntry::Stream(reader) => {
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent).map_err(io_err)?;
                }
                let (len, digest) = write_staged(reader, &destination).map_err(io_err)?;
                TempArtifact::new(
                    destination,
                    resource.clone(),
                    ArtifactKind::File,
                    len,
                    Some(digest),
                )
            },
            ResourceEntry::Directory(source_dir) => {
                let len = copy_tree(&source_dir, &destination).map_err(io_err)?;
                TempArtifact::new(
                    destination,
                    resource.clone(),
                    ArtifactKind::Directory,
                    len,
                    None,
                )
            },
        };

        info!(
            resource = %resource,
            source = %source,
            path = %artifact.path().display(),
            len = artifact.len(),
            "Resource materialized"
        );

        Ok(artifact)
    }

    fn create_temp_dir(&self) -> io::Result<PathBuf> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_DIR_PREFIX);

        let dir = match &self.temp_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            },
            None => builder.tempdir()?,
        };

        Ok(dir.keep())
    }
}

/// Checks the artifact content against an expected hex SHA-256 digest.
///
/// # Errors
///
/// Returns [`LoaderError::IntegrityMismatch`] on mismatch and
/// [`LoaderError::InvalidArtifact`] for directory artifacts.
pub fn verify_sha256(artifact: &TempArtifact, expected: &str) -> Result<(), LoaderError> {
    let actual = artifact
        .sha256_hex()
        .ok_or_else(|| LoaderError::InvalidArtifact {
            path: artifact.path().to_path_buf(),
            reason: "directories have no content digest".into(),
        })?;

    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(LoaderError::IntegrityMismatch {
            resource: artifact.resource().to_string(),
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        });
    }

    debug!(resource = artifact.resource(), sha256 = %actual, "Integrity check passed");
    Ok(())
}

/// Streams `reader` into `destination` through a staging file.
fn write_staged(mut reader: impl Read, destination: &Path) -> io::Result<(u64, [u8; 32])> {
    let file_name = destination
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"))?;
    let staging = destination.with_file_name(format!(".{}.part", file_name.to_string_lossy()));

    let result = (|| -> io::Result<(u64, [u8; 32])> {
        let mut file = File::create(&staging)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut len = 0u64;

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])?;
            len += n as u64;
        }

        file.sync_all()?;
        drop(file);
        fs::rename(&staging, destination)?;

        Ok((len, hasher.finalize().into()))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

/// Recursively copies `source` into `destination`, returning the bytes copied.
fn copy_tree(source: &Path, destination: &Path) -> io::Result<u64> {
    let mut total = 0;

    for entry in WalkDir::new(source) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            total += fs::copy(entry.path(), &target)?;
        }
    }

    Ok(total)
}
