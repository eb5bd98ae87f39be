//! Loader configuration file and environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LoaderError;
use crate::loader::{LibraryLoaderBuilder, LoadMode};
use crate::permissions::{NonPosixPolicy, PermissionSet};
use crate::resources::{normalize_resource, ResourceAnchor};

/// Overrides [`LoaderConfig::mode`].
pub const LOAD_MODE_ENV: &str = "NATRIUM_LOAD_MODE";
/// Overrides [`LoaderConfig::system_library`].
pub const SYSTEM_LIBRARY_ENV: &str = "NATRIUM_SYSTEM_LIBRARY";
/// Overrides [`LoaderConfig::bundled_resource`].
pub const BUNDLED_RESOURCE_ENV: &str = "NATRIUM_BUNDLED_RESOURCE";
/// Overrides [`LoaderConfig::resource_archive`].
pub const RESOURCE_ARCHIVE_ENV: &str = "NATRIUM_RESOURCE_ARCHIVE";

/// Serializable loader settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// Load mode.
    pub mode: LoadMode,
    /// System library name (e.g. "sodium").
    pub system_library: Option<String>,
    /// Bundled resource path (e.g. "linux64/libsodium.so").
    pub bundled_resource: Option<String>,
    /// Expanded resource directory.
    pub resource_dir: Option<PathBuf>,
    /// `.tar.gz` resource bundle.
    pub resource_archive: Option<PathBuf>,
    /// Octal permission string (e.g. "755").
    pub permissions: Option<String>,
    /// Reduction policy on non-POSIX filesystems.
    pub non_posix_policy: NonPosixPolicy,
    /// Expected hex SHA-256 of the bundled library.
    pub expected_sha256: Option<String>,
}

impl LoaderConfig {
    /// Parses a JSON document.
    pub fn from_json(json: &str) -> Result<Self, LoaderError> {
        serde_json::from_str(json)
            .map_err(|e| LoaderError::Configuration(format!("invalid loader config: {e}")))
    }

    /// Reads and parses a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoaderError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            LoaderError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Loaded loader config");
        Self::from_json(&json)
    }

    /// Applies `NATRIUM_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, LoaderError> {
        self.with_overrides(|key| env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup. Empty values are ignored.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, LoaderError> {
        let get = |key: &str| lookup(key).filter(|v: &String| !v.trim().is_empty());

        if let Some(mode) = get(LOAD_MODE_ENV) {
            self.mode = mode.parse()?;
        }
        if let Some(name) = get(SYSTEM_LIBRARY_ENV) {
            self.system_library = Some(name);
        }
        if let Some(resource) = get(BUNDLED_RESOURCE_ENV) {
            self.bundled_resource = Some(resource);
        }
        if let Some(archive) = get(RESOURCE_ARCHIVE_ENV) {
            self.resource_archive = Some(PathBuf::from(archive));
            self.resource_dir = None;
        }

        Ok(self)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.resource_dir.is_some() && self.resource_archive.is_some() {
            return Err(LoaderError::Configuration(
                "resource_dir and resource_archive are mutually exclusive".into(),
            ));
        }
        if let Some(resource) = &self.bundled_resource {
            normalize_resource(resource)?;
        }
        self.permission_set()?;
        if let Some(digest) = &self.expected_sha256 {
            let bytes = hex::decode(digest.trim()).map_err(|e| {
                LoaderError::Configuration(format!("expected_sha256 is not hex: {e}"))
            })?;
            if bytes.len() != 32 {
                return Err(LoaderError::Configuration(
                    "expected_sha256 must be 32 bytes".into(),
                ));
            }
        }
        Ok(())
    }

    /// Parsed permission set, if configured.
    pub fn permission_set(&self) -> Result<Option<PermissionSet>, LoaderError> {
        self.permissions
            .as_deref()
            .map(PermissionSet::parse_octal)
            .transpose()
    }

    /// Resource anchor, if configured.
    pub fn anchor(&self) -> Option<ResourceAnchor> {
        match (&self.resource_archive, &self.resource_dir) {
            (Some(archive), _) => Some(ResourceAnchor::Archive(archive.clone())),
            (None, Some(dir)) => Some(ResourceAnchor::Directory(dir.clone())),
            (None, None) => None,
        }
    }

    /// Validates the configuration and turns it into a loader builder.
    pub fn builder(&self) -> Result<LibraryLoaderBuilder, LoaderError> {
        self.validate()?;

        let mut builder = LibraryLoaderBuilder::default().non_posix_policy(self.non_posix_policy);
        if let Some(name) = &self.system_library {
            builder = builder.system_library(name.clone());
        }
        if let Some(resource) = &self.bundled_resource {
            builder = builder.bundled_resource(resource.clone());
        }
        if let Some(anchor) = self.anchor() {
            builder = builder.anchor(anchor);
        }
        if let Some(permissions) = self.permission_set()? {
            builder = builder.permissions(permissions);
        }
        if let Some(digest) = &self.expected_sha256 {
            builder = builder.expected_sha256(digest.clone());
        }
        Ok(builder)
    }
}
