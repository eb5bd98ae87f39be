//! Resource space lookup.
//!
//! A bundled library can live in several places depending on how the
//! application was packaged: an expanded directory next to the binary, a
//! compressed archive, or bytes compiled into the executable. Each of those is
//! a [`ResourceSource`]; a [`ResourceResolver`] asks them in order and the
//! first one that yields a readable entry wins.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

use flate2::read::GzDecoder;
use parking_lot::RwLock;
use tar::Archive;
use tracing::{debug, warn};

use crate::error::LoaderError;

/// Environment variable naming the ambient resource directory.
pub const RESOURCE_DIR_ENV: &str = "NATRIUM_RESOURCE_DIR";

/// A located resource, ready to be copied.
pub enum ResourceEntry {
    /// A readable byte stream.
    Stream(Box<dyn Read + Send>),
    /// A directory inside an expanded resource tree.
    Directory(PathBuf),
}

impl fmt::Debug for ResourceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceEntry::Stream(_) => f.write_str("Stream(..)"),
            ResourceEntry::Directory(path) => f.debug_tuple("Directory").field(path).finish(),
        }
    }
}

/// One place resources can be looked up in.
pub trait ResourceSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Opens a normalized resource path.
    ///
    /// Returns `Ok(None)` when this source does not have the resource.
    fn open(&self, resource: &str) -> io::Result<Option<ResourceEntry>>;
}

fn open_in_dir(root: &Path, resource: &str) -> io::Result<Option<ResourceEntry>> {
    let path = resource.split('/').fold(root.to_path_buf(), |p, c| p.join(c));

    match fs::metadata(&path) {
        Ok(meta) if meta.is_dir() => Ok(Some(ResourceEntry::Directory(path))),
        Ok(_) => Ok(Some(ResourceEntry::Stream(Box::new(File::open(&path)?)))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Directory named by an environment variable, read at lookup time.
#[derive(Debug, Clone)]
pub struct AmbientDirectorySource {
    var: String,
}

impl AmbientDirectorySource {
    /// Uses [`RESOURCE_DIR_ENV`].
    pub fn new() -> Self {
        Self::from_var(RESOURCE_DIR_ENV)
    }

    /// Uses a custom environment variable.
    pub fn from_var(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for AmbientDirectorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSource for AmbientDirectorySource {
    fn name(&self) -> &str {
        "ambient"
    }

    fn open(&self, resource: &str) -> io::Result<Option<ResourceEntry>> {
        match std::env::var_os(&self.var) {
            Some(root) if !root.is_empty() => open_in_dir(Path::new(&root), resource),
            _ => Ok(None),
        }
    }
}

/// An expanded resource directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Creates a source rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResourceSource for DirectorySource {
    fn name(&self) -> &str {
        "directory"
    }

    fn open(&self, resource: &str) -> io::Result<Option<ResourceEntry>> {
        open_in_dir(&self.root, resource)
    }
}

/// A gzip compressed tar archive.
///
/// Only regular file entries can be resolved from an archive.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    archive: PathBuf,
}

impl ArchiveSource {
    /// Creates a source reading `archive` (`.tar.gz`).
    pub fn new(archive: impl Into<PathBuf>) -> Self {
        Self {
            archive: archive.into(),
        }
    }
}

impl ResourceSource for ArchiveSource {
    fn name(&self) -> &str {
        "archive"
    }

    fn open(&self, resource: &str) -> io::Result<Option<ResourceEntry>> {
        let file = File::open(&self.archive)?;
        let mut archive = Archive::new(GzDecoder::new(file));

        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let entry_path = entry.path()?;
            let Some(entry_path) = entry_path.to_str() else {
                continue;
            };
            if normalize_resource(entry_path).ok().as_deref() != Some(resource) {
                continue;
            }

            // The header size is untrusted; only the bytes actually present count.
            let declared = entry.size();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            if bytes.len() as u64 != declared {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "archive entry {resource} declares {declared} bytes, found {}",
                        bytes.len()
                    ),
                ));
            }
            return Ok(Some(ResourceEntry::Stream(Box::new(Cursor::new(bytes)))));
        }

        Ok(None)
    }
}

fn embedded_registry() -> &'static RwLock<HashMap<String, &'static [u8]>> {
    static EMBEDDED: OnceLock<RwLock<HashMap<String, &'static [u8]>>> = OnceLock::new();
    EMBEDDED.get_or_init(Default::default)
}

/// Registers bytes compiled into the executable under a resource path.
///
/// ```ignore
/// natrium_loader::register_embedded(
///     "linux64/libsodium.so",
///     include_bytes!("../resources/linux64/libsodium.so"),
/// )?;
/// ```
pub fn register_embedded(resource: &str, bytes: &'static [u8]) -> Result<(), LoaderError> {
    let resource = normalize_resource(resource)?;
    debug!(resource = %resource, len = bytes.len(), "Registered embedded resource");
    embedded_registry().write().insert(resource, bytes);
    Ok(())
}

/// Bytes registered with [`register_embedded`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedSource;

impl ResourceSource for EmbeddedSource {
    fn name(&self) -> &str {
        "embedded"
    }

    fn open(&self, resource: &str) -> io::Result<Option<ResourceEntry>> {
        Ok(embedded_registry()
            .read()
            .get(resource)
            .map(|bytes| ResourceEntry::Stream(Box::new(Cursor::new(*bytes)))))
    }
}

/// Paths relative to the process working directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct RootRelativeSource;

impl ResourceSource for RootRelativeSource {
    fn name(&self) -> &str {
        "root-relative"
    }

    fn open(&self, resource: &str) -> io::Result<Option<ResourceEntry>> {
        open_in_dir(&std::env::current_dir()?, resource)
    }
}

/// The resource-space root a caller anchors lookups to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAnchor {
    /// An expanded directory.
    Directory(PathBuf),
    /// A `.tar.gz` archive.
    Archive(PathBuf),
}

impl ResourceAnchor {
    /// Picks the anchor kind from the path: `.tar.gz` and `.tgz` files are
    /// archives, anything else is a directory.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ResourceAnchor::Archive(path)
        } else {
            ResourceAnchor::Directory(path)
        }
    }

    fn into_source(self) -> Arc<dyn ResourceSource> {
        match self {
            ResourceAnchor::Directory(root) => Arc::new(DirectorySource::new(root)),
            ResourceAnchor::Archive(archive) => Arc::new(ArchiveSource::new(archive)),
        }
    }
}

/// Ordered chain of resource sources.
#[derive(Clone, Default)]
pub struct ResourceResolver {
    sources: Vec<Arc<dyn ResourceSource>>,
}

impl ResourceResolver {
    /// Creates a resolver with no sources.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The standard chain: ambient directory, anchor (if any), embedded
    /// bytes, then paths relative to the working directory.
    pub fn standard(anchor: Option<ResourceAnchor>) -> Self {
        let mut resolver = Self::empty().with_source(Arc::new(AmbientDirectorySource::new()));
        if let Some(anchor) = anchor {
            resolver = resolver.with_source(anchor.into_source());
        }
        resolver
            .with_source(Arc::new(EmbeddedSource))
            .with_source(Arc::new(RootRelativeSource))
    }

    /// Appends a source to the end of the chain.
    pub fn with_source(mut self, source: Arc<dyn ResourceSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Names of the sources, in lookup order.
    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Finds `resource`, returning the name of the winning source and the entry.
    ///
    /// Sources that fail with an I/O error are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::InvalidResourcePath`] for malformed paths and
    /// [`LoaderError::ResourceNotFound`] when no source has the resource.
    pub fn resolve(&self, resource: &str) -> Result<(String, ResourceEntry), LoaderError> {
        let resource = normalize_resource(resource)?;

        for source in &self.sources {
            match source.open(&resource) {
                Ok(Some(entry)) => {
                    debug!(resource = %resource, source = source.name(), "Resource resolved");
                    return Ok((source.name().to_string(), entry));
                },
                Ok(None) => {},
                Err(e) => {
                    warn!(
                        resource = %resource,
                        source = source.name(),
                        error = %e,
                        "Resource source failed, trying next"
                    );
                },
            }
        }

        Err(LoaderError::ResourceNotFound { resource })
    }
}

impl fmt::Debug for ResourceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceResolver")
            .field("sources", &self.source_names())
            .finish()
    }
}

/// Normalizes a resource path to `a/b/c` form.
///
/// Leading separators and `.` components are dropped; `..` components,
/// drive prefixes and empty paths are rejected.
pub fn normalize_resource(resource: &str) -> Result<String, LoaderError> {
    let unified = resource.replace('\\', "/");
    let mut parts = Vec::new();

    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => {
                    return Err(LoaderError::InvalidResourcePath(resource.to_string()));
                },
            },
            Component::RootDir | Component::CurDir => {},
            Component::ParentDir | Component::Prefix(_) => {
                return Err(LoaderError::InvalidResourcePath(resource.to_string()));
            },
        }
    }

    if parts.is_empty() {
        return Err(LoaderError::InvalidResourcePath(resource.to_string()));
    }

    Ok(parts.join("/"))
}
