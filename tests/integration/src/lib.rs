//! Integration tests for the Natrium loader.
//!
//! These tests load a real shared object end to end: the host's `libm` plays
//! the part of a bundled library. Tests return early on hosts without one.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use natrium_loader::{BindingTarget, BindingTargetSet, LoadedLibrary};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

// ============================================================================
// Host Library
// ============================================================================

/// Path of the host math library, if one is installed where we look.
pub fn host_libm() -> Option<PathBuf> {
    let candidates = [
        "/lib/x86_64-linux-gnu/libm.so.6",
        "/usr/lib/x86_64-linux-gnu/libm.so.6",
        "/lib/aarch64-linux-gnu/libm.so.6",
        "/usr/lib/aarch64-linux-gnu/libm.so.6",
        "/lib64/libm.so.6",
        "/usr/lib64/libm.so.6",
        "/usr/lib/libm.so.6",
        "/lib/libm.so.6",
    ];

    if !cfg!(target_os = "linux") {
        return None;
    }
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

/// A binding target for `cos` and `floor` under a test-unique name.
pub fn math_targets(name: &'static str) -> BindingTargetSet {
    BindingTargetSet::new().with(BindingTarget::new(name, ["cos", "floor"]))
}

/// Calls `cos` through a loaded library.
pub fn call_cos(loaded: &LoadedLibrary, x: f64) -> Result<f64> {
    // SAFETY: `cos` has this signature in every libm.
    let cos: unsafe extern "C" fn(f64) -> f64 = unsafe { loaded.symbol("cos")? };
    Ok(unsafe { cos(x) })
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

// ============================================================================
// Resource Bundle
// ============================================================================

/// A resource tree on disk that can also be packed as a `.tar.gz`.
pub struct Bundle {
    root: TempDir,
    out: TempDir,
    resources: Vec<String>,
}

impl Bundle {
    /// Creates an empty bundle.
    pub fn new() -> Result<Self> {
        Ok(Self {
            root: TempDir::new().context("Failed to create bundle dir")?,
            out: TempDir::new().context("Failed to create output dir")?,
            resources: Vec::new(),
        })
    }

    /// Root of the expanded tree.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Copies `source` into the bundle as `resource`.
    pub fn add_file(&mut self, resource: &str, source: &Path) -> Result<&mut Self> {
        let target = self.root.path().join(resource);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, &target)
            .with_context(|| format!("Failed to copy {}", source.display()))?;
        self.resources.push(resource.to_string());
        Ok(self)
    }

    /// Packs every added resource into a `.tar.gz` and returns its path.
    pub fn archive(&self) -> Result<PathBuf> {
        let path = self.out.path().join("natives.tar.gz");
        let file = fs::File::create(&path)?;
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut tar = tar::Builder::new(enc);

        for resource in &self.resources {
            tar.append_path_with_name(self.root.path().join(resource), resource)?;
        }
        tar.into_inner()?.finish()?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natrium_loader::{
        CleanupRegistry, DeletionPolicy, FsCapability, LibraryLoader, LibraryOrigin, LoadMode,
        LoaderConfig, LoaderError, ResourceAnchor, Strategy,
    };
    use natrium_sodium::{Sodium, SodiumError};
    use std::sync::Arc;
    use std::thread;

    fn libm_bundle(resource: &str) -> Option<(Bundle, PathBuf)> {
        let libm = host_libm()?;
        let mut bundle = Bundle::new().unwrap();
        bundle.add_file(resource, &libm).unwrap();
        Some((bundle, libm))
    }

    #[test]
    fn test_bundled_from_archive_deletes_file_and_stays_callable() {
        let Some((bundle, _)) = libm_bundle("linux64/libm.so") else { return };
        let archive = bundle.archive().unwrap();
        let registry = Arc::new(CleanupRegistry::new());

        let loader = LibraryLoader::builder()
            .bundled_resource("linux64/libm.so")
            .anchor(ResourceAnchor::from_path(&archive))
            .capability(FsCapability::Posix)
            .cleanup_registry(registry.clone())
            .build();

        let loaded = loader
            .load(LoadMode::BundledOnly, &math_targets("it-archive-posix"))
            .unwrap();

        assert_eq!(loaded.strategy(), Some(Strategy::Bundled));
        assert_eq!(
            loaded.origin(),
            &LibraryOrigin::Bundled("linux64/libm.so".into())
        );
        assert_eq!(loaded.deletion_policy(), Some(DeletionPolicy::Immediate));
        assert!(!loaded.resolved().exists());
        assert_eq!(call_cos(&loaded, 0.0).unwrap(), 1.0);

        // Only the extraction directory remains for exit cleanup.
        assert_eq!(registry.pending(), 1);
        registry.run();
    }

    #[test]
    fn test_non_posix_defers_deletion_to_exit() {
        let Some((bundle, _)) = libm_bundle("windows64/libm.so") else { return };
        let registry = Arc::new(CleanupRegistry::new());

        let loader = LibraryLoader::builder()
            .bundled_resource("windows64/libm.so")
            .anchor(ResourceAnchor::Directory(bundle.root().to_path_buf()))
            .capability(FsCapability::NonPosix)
            .cleanup_registry(registry.clone())
            .build();

        let loaded = loader
            .load(LoadMode::BundledOnly, &math_targets("it-non-posix"))
            .unwrap();

        assert_eq!(loaded.deletion_policy(), Some(DeletionPolicy::Deferred));
        assert!(loaded.resolved().exists());
        assert!(registry.is_registered(loaded.resolved()));

        registry.run();
        assert!(!loaded.resolved().exists());
        assert_eq!(call_cos(&loaded, 0.0).unwrap(), 1.0);
    }

    #[test]
    fn test_prefer_bundled_falls_back_to_system() {
        let Some(libm) = host_libm() else { return };
        let bundle = Bundle::new().unwrap();
        let name = libm.file_name().unwrap().to_str().unwrap().to_string();

        let loader = LibraryLoader::builder()
            .system_library(name.clone())
            .bundled_resource("linux64/libabsent.so")
            .anchor(ResourceAnchor::Directory(bundle.root().to_path_buf()))
            .build();

        let loaded = loader
            .load(LoadMode::PreferBundled, &math_targets("it-fallback"))
            .unwrap();

        assert_eq!(loaded.strategy(), Some(Strategy::System));
        assert_eq!(loaded.origin(), &LibraryOrigin::System(name));
        assert_eq!(loaded.failures().len(), 1);
        assert_eq!(loaded.failures()[0].strategy, Strategy::Bundled);
        assert!(matches!(
            loaded.failures()[0].error,
            LoaderError::ResourceNotFound { .. }
        ));
    }

    #[test]
    fn test_exhaustion_reports_both_strategies() {
        let bundle = Bundle::new().unwrap();
        let loader = LibraryLoader::builder()
            .system_library("natrium_absent_library")
            .bundled_resource("linux64/libabsent.so")
            .anchor(ResourceAnchor::Directory(bundle.root().to_path_buf()))
            .build();

        let err = loader
            .load(LoadMode::PreferBundled, &math_targets("it-exhausted"))
            .unwrap_err();

        let causes = err.causes();
        assert_eq!(causes.len(), 2);
        assert_eq!(causes[0].strategy, Strategy::Bundled);
        assert_eq!(causes[1].strategy, Strategy::System);
        assert!(matches!(
            causes[1].error,
            LoaderError::SymbolBindingFailed { symbol: None, .. }
        ));
    }

    #[test]
    fn test_absolute_path_load() {
        let Some(libm) = host_libm() else { return };
        let loader = LibraryLoader::builder().build();

        let loaded = loader
            .load_absolute_path(&libm, &math_targets("it-absolute"))
            .unwrap();

        assert_eq!(loaded.origin(), &LibraryOrigin::Path(libm.clone()));
        assert_eq!(loaded.strategy(), None);
        assert!(libm.exists());
        assert_eq!(call_cos(&loaded, 0.0).unwrap(), 1.0);
    }

    #[test]
    fn test_bundled_reload_is_a_noop_and_other_origin_conflicts() {
        let Some(libm) = host_libm() else { return };
        let mut bundle = Bundle::new().unwrap();
        bundle.add_file("linux64/libm.so", &libm).unwrap();
        bundle.add_file("linux64/libm-copy.so", &libm).unwrap();
        let targets = math_targets("it-reload");

        let build = |resource: &str| {
            LibraryLoader::builder()
                .bundled_resource(resource)
                .anchor(ResourceAnchor::Directory(bundle.root().to_path_buf()))
                .build()
        };

        let first = build("linux64/libm.so")
            .load(LoadMode::BundledOnly, &targets)
            .unwrap();
        let second = build("./linux64//libm.so")
            .load(LoadMode::BundledOnly, &targets)
            .unwrap();

        assert!(Arc::ptr_eq(first.library(), second.library()));
        assert_eq!(second.strategy(), None);

        let err = build("linux64/libm-copy.so")
            .load(LoadMode::BundledOnly, &targets)
            .unwrap_err();
        assert!(err.is_rebind_conflict());
    }

    #[test]
    fn test_integrity_check() {
        let Some((bundle, libm)) = libm_bundle("linux64/libm.so") else { return };
        let digest = sha256_file(&libm).unwrap();

        let loader = |expected: String| {
            LibraryLoader::builder()
                .bundled_resource("linux64/libm.so")
                .anchor(ResourceAnchor::Directory(bundle.root().to_path_buf()))
                .expected_sha256(expected)
                .build()
        };

        let err = loader("00".repeat(32))
            .load(LoadMode::BundledOnly, &math_targets("it-integrity"))
            .unwrap_err();
        assert!(matches!(
            err.causes()[0].error,
            LoaderError::IntegrityMismatch { .. }
        ));

        let loaded = loader(digest.to_uppercase())
            .load(LoadMode::BundledOnly, &math_targets("it-integrity"))
            .unwrap();
        assert_eq!(loaded.strategy(), Some(Strategy::Bundled));
    }

    #[test]
    fn test_concurrent_loaders_use_disjoint_paths() {
        let Some(libm) = host_libm() else { return };
        let mut bundle = Bundle::new().unwrap();
        bundle.add_file("a/libm.so", &libm).unwrap();
        bundle.add_file("b/libm.so", &libm).unwrap();
        let root = bundle.root().to_path_buf();

        let spawn = |resource: &'static str, target: &'static str| {
            let root = root.clone();
            thread::spawn(move || {
                let loader = LibraryLoader::builder()
                    .bundled_resource(resource)
                    .anchor(ResourceAnchor::Directory(root))
                    .capability(FsCapability::NonPosix)
                    .cleanup_registry(Arc::new(CleanupRegistry::new()))
                    .build();
                let loaded = loader
                    .load(LoadMode::BundledOnly, &math_targets(target))
                    .unwrap();
                assert_eq!(call_cos(&loaded, 0.0).unwrap(), 1.0);
                loaded.resolved().to_path_buf()
            })
        };

        let a = spawn("a/libm.so", "it-concurrent-a");
        let b = spawn("b/libm.so", "it-concurrent-b");
        let (a, b) = (a.join().unwrap(), b.join().unwrap());

        assert_ne!(a.parent(), b.parent());
    }

    #[test]
    fn test_config_driven_load() {
        let Some((bundle, _)) = libm_bundle("linux64/libm.so") else { return };
        let config = LoaderConfig::from_json(
            &serde_json::json!({
                "mode": "bundled-only",
                "bundled_resource": "linux64/libm.so",
                "resource_dir": bundle.root(),
                "permissions": "500",
            })
            .to_string(),
        )
        .unwrap();

        let loaded = config
            .builder()
            .unwrap()
            .build()
            .load(config.mode, &math_targets("it-config"))
            .unwrap();

        assert_eq!(loaded.strategy(), Some(Strategy::Bundled));
        assert_eq!(call_cos(&loaded, 0.0).unwrap(), 1.0);
    }

    #[test]
    fn test_sodium_construction_fails_outright() {
        let bundle = Bundle::new().unwrap();
        let config = LoaderConfig {
            mode: LoadMode::BundledOnly,
            resource_dir: Some(bundle.root().to_path_buf()),
            ..Default::default()
        };

        let err = Sodium::with_config(&config).unwrap_err();
        match err {
            SodiumError::Loader(LoaderError::AllStrategiesExhausted { causes, .. }) => {
                assert_eq!(causes.len(), 1);
                assert_eq!(causes[0].strategy, Strategy::Bundled);
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
