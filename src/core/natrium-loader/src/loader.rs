//! Load modes, resolution strategies and the loader that drives them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactKind, DeletionPolicy};
use crate::binder::{
    BindingTargetSet, BoundLibrary, LibraryLocation, LibraryOrigin, SymbolBinder,
};
use crate::cleanup::CleanupRegistry;
use crate::error::{LoaderError, StrategyFailure};
use crate::lifecycle::ArtifactLifecycle;
use crate::materialize::{verify_sha256, ResourceMaterializer};
use crate::permissions::{FsCapability, NonPosixPolicy, PermissionSet, PermissionSetter};
use crate::resources::{normalize_resource, ResourceAnchor, ResourceResolver};

/// Which strategies a load tries, and in which order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadMode {
    /// System library first, bundled copy as fallback.
    #[default]
    PreferSystem,
    /// Bundled copy first, system library as fallback.
    PreferBundled,
    /// System library only.
    SystemOnly,
    /// Bundled copy only.
    BundledOnly,
}

impl LoadMode {
    /// Strategies in the order they are attempted.
    pub fn strategies(self) -> &'static [Strategy] {
        match self {
            LoadMode::PreferSystem => &[Strategy::System, Strategy::Bundled],
            LoadMode::PreferBundled => &[Strategy::Bundled, Strategy::System],
            LoadMode::SystemOnly => &[Strategy::System],
            LoadMode::BundledOnly => &[Strategy::Bundled],
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LoadMode::PreferSystem => "prefer-system",
            LoadMode::PreferBundled => "prefer-bundled",
            LoadMode::SystemOnly => "system-only",
            LoadMode::BundledOnly => "bundled-only",
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadMode {
    type Err = LoaderError;

    /// Accepts `prefer-system`, `prefer_system` and `PREFER_SYSTEM` forms.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "prefer-system" => Ok(LoadMode::PreferSystem),
            "prefer-bundled" => Ok(LoadMode::PreferBundled),
            "system-only" => Ok(LoadMode::SystemOnly),
            "bundled-only" => Ok(LoadMode::BundledOnly),
            other => Err(LoaderError::Configuration(format!(
                "unknown load mode: {other}"
            ))),
        }
    }
}

/// A single way of obtaining the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Ask the OS loader for an installed copy.
    System,
    /// Extract the bundled copy and load it.
    Bundled,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::System => f.write_str("system"),
            Strategy::Bundled => f.write_str("bundled"),
        }
    }
}

/// Successful outcome of one strategy.
#[derive(Debug)]
pub struct Resolution {
    /// The bound library.
    pub library: Arc<BoundLibrary>,
    /// Name or path the library was opened from.
    pub resolved: PathBuf,
    /// How the extracted artifact was disposed of, for bundled loads.
    pub deletion: Option<DeletionPolicy>,
}

impl Resolution {
    fn existing(library: Arc<BoundLibrary>) -> Self {
        Self {
            resolved: PathBuf::from(library.file()),
            library,
            deletion: None,
        }
    }
}

/// A way of obtaining and binding the library.
pub trait ResolutionStrategy: Send + Sync {
    /// Which strategy this implements.
    fn kind(&self) -> Strategy;

    /// What the strategy tries, for diagnostics.
    fn describe(&self) -> String;

    /// Origin a successful resolution would bind, if the strategy is configured.
    fn origin(&self) -> Option<LibraryOrigin>;

    /// Obtains the library and binds `targets` against it.
    fn resolve(
        &self,
        targets: &BindingTargetSet,
        binder: &SymbolBinder,
    ) -> Result<Resolution, LoaderError>;
}

/// Binds against a library installed on the host.
#[derive(Debug, Clone, Default)]
pub struct SystemStrategy {
    name: Option<String>,
}

impl SystemStrategy {
    /// Creates a strategy for the library `name`, or an unconfigured one.
    pub fn new(name: Option<String>) -> Self {
        Self { name }
    }
}

impl ResolutionStrategy for SystemStrategy {
    fn kind(&self) -> Strategy {
        Strategy::System
    }

    fn describe(&self) -> String {
        match &self.name {
            Some(name) => format!("system library {name}"),
            None => "system library (unconfigured)".into(),
        }
    }

    fn origin(&self) -> Option<LibraryOrigin> {
        self.name.clone().map(LibraryOrigin::System)
    }

    fn resolve(
        &self,
        targets: &BindingTargetSet,
        binder: &SymbolBinder,
    ) -> Result<Resolution, LoaderError> {
        let name = self.name.as_deref().ok_or_else(|| {
            LoaderError::Configuration("no system library name configured".into())
        })?;

        let location = LibraryLocation::system(name);
        let library = binder.bind(targets, &location)?;

        Ok(Resolution {
            resolved: PathBuf::from(location.file()),
            library,
            deletion: None,
        })
    }
}

/// Extracts a bundled resource, prepares it and binds against it.
#[derive(Debug, Clone)]
pub struct BundledStrategy {
    resource: Option<String>,
    materializer: ResourceMaterializer,
    setter: PermissionSetter,
    lifecycle: ArtifactLifecycle,
    permissions: Option<PermissionSet>,
    expected_sha256: Option<String>,
}

impl BundledStrategy {
    /// Creates a strategy for `resource`, or an unconfigured one.
    pub fn new(
        resource: Option<String>,
        materializer: ResourceMaterializer,
        setter: PermissionSetter,
        lifecycle: ArtifactLifecycle,
    ) -> Self {
        Self {
            resource,
            materializer,
            setter,
            lifecycle,
            permissions: None,
            expected_sha256: None,
        }
    }

    /// Permission set to apply instead of [`PermissionSet::LOADABLE`].
    pub fn with_permissions(mut self, permissions: Option<PermissionSet>) -> Self {
        self.permissions = permissions;
        self
    }

    /// Hex SHA-256 digest the extracted artifact must match.
    pub fn with_expected_sha256(mut self, digest: Option<String>) -> Self {
        self.expected_sha256 = digest;
        self
    }
}

impl ResolutionStrategy for BundledStrategy {
    fn kind(&self) -> Strategy {
        Strategy::Bundled
    }

    fn describe(&self) -> String {
        match &self.resource {
            Some(resource) => format!("bundled resource {resource}"),
            None => "bundled resource (unconfigured)".into(),
        }
    }

    fn origin(&self) -> Option<LibraryOrigin> {
        let resource = self.resource.as_deref()?;
        normalize_resource(resource).ok().map(LibraryOrigin::Bundled)
    }

    fn resolve(
        &self,
        targets: &BindingTargetSet,
        binder: &SymbolBinder,
    ) -> Result<Resolution, LoaderError> {
        let resource = self.resource.as_deref().ok_or_else(|| {
            LoaderError::Configuration("no bundled resource configured".into())
        })?;
        let resource = normalize_resource(resource)?;

        if let Some(library) = binder.lookup(targets, &LibraryOrigin::Bundled(resource.clone()))? {
            return Ok(Resolution::existing(library));
        }

        let mut artifact = self.materializer.materialize(&resource)?;
        if artifact.kind() == ArtifactKind::Directory {
            return Err(LoaderError::InvalidArtifact {
                path: artifact.path().to_path_buf(),
                reason: "bundled resource is a directory, not a library file".into(),
            });
        }

        if let Some(expected) = &self.expected_sha256 {
            verify_sha256(&artifact, expected)?;
        }

        self.setter.apply(&mut artifact, self.permissions)?;

        let location = LibraryLocation::bundled(resource, artifact.path());
        let resolved = artifact.path().to_path_buf();
        let bound = binder.bind(targets, &location);
        let disposed = self.lifecycle.dispose(artifact);

        Ok(Resolution {
            library: bound?,
            resolved,
            deletion: Some(disposed.policy),
        })
    }
}

/// A library whose binding targets are bound and callable.
#[derive(Debug)]
pub struct LoadedLibrary {
    strategy: Option<Strategy>,
    resolved: PathBuf,
    targets: BindingTargetSet,
    library: Arc<BoundLibrary>,
    failures: Vec<StrategyFailure>,
    deletion: Option<DeletionPolicy>,
}

impl LoadedLibrary {
    /// Strategy that succeeded. `None` for direct path loads and for loads
    /// satisfied by an earlier binding.
    pub fn strategy(&self) -> Option<Strategy> {
        self.strategy
    }

    /// Logical origin of the bound library.
    pub fn origin(&self) -> &LibraryOrigin {
        self.library.origin()
    }

    /// Name or path the library was opened from.
    pub fn resolved(&self) -> &Path {
        &self.resolved
    }

    /// Targets bound by this load.
    pub fn targets(&self) -> &BindingTargetSet {
        &self.targets
    }

    /// Failures of strategies attempted before the successful one.
    pub fn failures(&self) -> &[StrategyFailure] {
        &self.failures
    }

    /// How the extracted artifact was disposed of, for bundled loads.
    pub fn deletion_policy(&self) -> Option<DeletionPolicy> {
        self.deletion
    }

    /// The underlying library handle.
    pub fn library(&self) -> &Arc<BoundLibrary> {
        &self.library
    }

    /// Returns a declared symbol as `T`.
    ///
    /// # Safety
    ///
    /// `T` must match the C signature of the symbol.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::Configuration`] if no target declares the
    /// symbol, and [`LoaderError::SymbolBindingFailed`] if lookup fails.
    pub unsafe fn symbol<T: Copy>(&self, symbol: &str) -> Result<T, LoaderError> {
        let target = self.targets.declaring(symbol).ok_or_else(|| {
            LoaderError::Configuration(format!(
                "symbol {symbol} is not declared by any binding target"
            ))
        })?;

        self.library
            .symbol(symbol)
            .map_err(|source| LoaderError::SymbolBindingFailed {
                target: target.name().to_string(),
                location: self.library.origin().to_string(),
                symbol: Some(symbol.to_string()),
                source,
            })
    }
}

/// Loads a native library according to a [`LoadMode`].
///
/// Create one per application and pass it by reference; every instance
/// shares the process-wide [`SymbolBinder`].
pub struct LibraryLoader {
    system: Arc<dyn ResolutionStrategy>,
    bundled: Arc<dyn ResolutionStrategy>,
    binder: SymbolBinder,
}

impl fmt::Debug for LibraryLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryLoader")
            .field("system", &self.system.describe())
            .field("bundled", &self.bundled.describe())
            .finish()
    }
}

impl LibraryLoader {
    /// Starts building a loader.
    pub fn builder() -> LibraryLoaderBuilder {
        LibraryLoaderBuilder::default()
    }

    fn strategy(&self, kind: Strategy) -> &Arc<dyn ResolutionStrategy> {
        match kind {
            Strategy::System => &self.system,
            Strategy::Bundled => &self.bundled,
        }
    }

    /// Loads the library and binds `targets` against it.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::RebindConflict`] as soon as any strategy hits
    /// one, and [`LoaderError::AllStrategiesExhausted`] with every cause in
    /// attempted order when no strategy succeeds.
    pub fn load(
        &self,
        mode: LoadMode,
        targets: &BindingTargetSet,
    ) -> Result<LoadedLibrary, LoaderError> {
        if targets.is_empty() {
            return Err(LoaderError::Configuration(
                "binding target set is empty".into(),
            ));
        }

        info!(%mode, targets = ?targets.names(), "Loading native library");

        if let Some(loaded) = self.already_bound(mode, targets)? {
            return Ok(loaded);
        }

        let mut failures = Vec::new();
        for &kind in mode.strategies() {
            let strategy = self.strategy(kind);
            debug!(strategy = %kind, attempted = %strategy.describe(), "Trying strategy");

            match strategy.resolve(targets, &self.binder) {
                Ok(resolution) => {
                    info!(
                        strategy = %kind,
                        origin = %resolution.library.origin(),
                        resolved = %resolution.resolved.display(),
                        failed_attempts = failures.len(),
                        "Native library loaded"
                    );
                    return Ok(LoadedLibrary {
                        strategy: Some(kind),
                        resolved: resolution.resolved,
                        targets: targets.clone(),
                        library: resolution.library,
                        failures,
                        deletion: resolution.deletion,
                    });
                },
                Err(e) if e.is_rebind_conflict() => return Err(e),
                Err(e) => {
                    warn!(strategy = %kind, error = %e, "Strategy failed");
                    failures.push(StrategyFailure {
                        strategy: kind,
                        attempted: strategy.describe(),
                        error: e,
                    });
                },
            }
        }

        Err(LoaderError::AllStrategiesExhausted {
            mode,
            causes: failures,
        })
    }

    fn already_bound(
        &self,
        mode: LoadMode,
        targets: &BindingTargetSet,
    ) -> Result<Option<LoadedLibrary>, LoaderError> {
        let Some(existing) = self.binder.existing(targets) else {
            return Ok(None);
        };

        let matches_mode = mode
            .strategies()
            .iter()
            .any(|&kind| self.strategy(kind).origin().as_ref() == Some(existing.origin()));
        if !matches_mode {
            return Ok(None);
        }

        let Some(library) = self.binder.lookup(targets, existing.origin())? else {
            return Ok(None);
        };

        debug!(origin = %library.origin(), "Targets already bound, nothing to load");
        let resolution = Resolution::existing(library);
        Ok(Some(LoadedLibrary {
            strategy: None,
            resolved: resolution.resolved,
            targets: targets.clone(),
            library: resolution.library,
            failures: Vec::new(),
            deletion: None,
        }))
    }

    /// Binds `targets` directly against a caller-owned library file.
    ///
    /// No mode selection, extraction or disposal takes place.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::Configuration`] for relative paths and any
    /// binding error otherwise.
    pub fn load_absolute_path(
        &self,
        path: impl AsRef<Path>,
        targets: &BindingTargetSet,
    ) -> Result<LoadedLibrary, LoaderError> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(LoaderError::Configuration(format!(
                "library path must be absolute: {}",
                path.display()
            )));
        }

        info!(path = %path.display(), targets = ?targets.names(), "Loading native library from path");
        let library = self.binder.bind(targets, &LibraryLocation::path(path))?;

        Ok(LoadedLibrary {
            strategy: None,
            resolved: path.to_path_buf(),
            targets: targets.clone(),
            library,
            failures: Vec::new(),
            deletion: None,
        })
    }
}

/// Builder for [`LibraryLoader`].
#[derive(Default)]
pub struct LibraryLoaderBuilder {
    system_library: Option<String>,
    bundled_resource: Option<String>,
    anchor: Option<ResourceAnchor>,
    resolver: Option<ResourceResolver>,
    permissions: Option<PermissionSet>,
    non_posix_policy: NonPosixPolicy,
    expected_sha256: Option<String>,
    registry: Option<Arc<CleanupRegistry>>,
    capability: Option<FsCapability>,
    temp_root: Option<PathBuf>,
    system_override: Option<Arc<dyn ResolutionStrategy>>,
    bundled_override: Option<Arc<dyn ResolutionStrategy>>,
}

impl LibraryLoaderBuilder {
    /// Name of the system library, e.g. `sodium`.
    pub fn system_library(mut self, name: impl Into<String>) -> Self {
        self.system_library = Some(name.into());
        self
    }

    /// Bundled resource path, e.g. `linux64/libsodium.so`.
    pub fn bundled_resource(mut self, resource: impl Into<String>) -> Self {
        self.bundled_resource = Some(resource.into());
        self
    }

    /// Directory or archive the bundled resource is looked up in.
    pub fn anchor(mut self, anchor: ResourceAnchor) -> Self {
        self.anchor = Some(anchor);
        self
    }

    /// Replaces the standard resource chain entirely.
    pub fn resolver(mut self, resolver: ResourceResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Permission set applied to extracted artifacts.
    pub fn permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Reduction policy on non-POSIX filesystems.
    pub fn non_posix_policy(mut self, policy: NonPosixPolicy) -> Self {
        self.non_posix_policy = policy;
        self
    }

    /// Hex SHA-256 digest extracted artifacts must match.
    pub fn expected_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into());
        self
    }

    /// Cleanup registry for temporary directories and deferred deletions.
    pub fn cleanup_registry(mut self, registry: Arc<CleanupRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Overrides the probed filesystem capability.
    pub fn capability(mut self, capability: FsCapability) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Directory temporary extraction directories are created in.
    pub fn temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    /// Replaces the built-in strategy of the same kind.
    pub fn strategy(mut self, strategy: Arc<dyn ResolutionStrategy>) -> Self {
        match strategy.kind() {
            Strategy::System => self.system_override = Some(strategy),
            Strategy::Bundled => self.bundled_override = Some(strategy),
        }
        self
    }

    /// Builds the loader.
    pub fn build(self) -> LibraryLoader {
        let registry = self.registry.unwrap_or_else(CleanupRegistry::global);
        let capability = self.capability.unwrap_or_else(FsCapability::detect);

        let system = match self.system_override {
            Some(strategy) => strategy,
            None => Arc::new(SystemStrategy::new(self.system_library)),
        };

        let bundled = match self.bundled_override {
            Some(strategy) => strategy,
            None => {
                let resolver = self
                    .resolver
                    .unwrap_or_else(|| ResourceResolver::standard(self.anchor));
                let mut materializer = ResourceMaterializer::with_registry(resolver, registry.clone());
                if let Some(root) = self.temp_root {
                    materializer = materializer.with_temp_root(root);
                }

                let strategy = BundledStrategy::new(
                    self.bundled_resource,
                    materializer,
                    PermissionSetter::new(capability).with_policy(self.non_posix_policy),
                    ArtifactLifecycle::new(capability, registry),
                )
                .with_permissions(self.permissions)
                .with_expected_sha256(self.expected_sha256);
                Arc::new(strategy)
            },
        };

        LibraryLoader {
            system,
            bundled,
            binder: SymbolBinder::global(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::binder::BindingTarget;
    use crate::testing::host_libm;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    enum Outcome {
        Fail,
        BindLibm(&'static str),
    }

    struct FakeStrategy {
        kind: Strategy,
        outcome: Outcome,
        calls: AtomicUsize,
    }

    impl FakeStrategy {
        fn new(kind: Strategy, outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                kind,
                outcome,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn location(&self, libm: &str) -> LibraryLocation {
            match self.kind {
                Strategy::System => LibraryLocation::system(libm),
                Strategy::Bundled => LibraryLocation::bundled("fake/libm.so", Path::new(libm)),
            }
        }
    }

    impl ResolutionStrategy for FakeStrategy {
        fn kind(&self) -> Strategy {
            self.kind
        }

        fn describe(&self) -> String {
            format!("fake {}", self.kind)
        }

        fn origin(&self) -> Option<LibraryOrigin> {
            match self.outcome {
                Outcome::Fail => None,
                Outcome::BindLibm(libm) => Some(self.location(libm).origin().clone()),
            }
        }

        fn resolve(
            &self,
            targets: &BindingTargetSet,
            binder: &SymbolBinder,
        ) -> Result<Resolution, LoaderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcome {
                Outcome::Fail => Err(LoaderError::ResourceNotFound {
                    resource: format!("fake {}", self.kind),
                }),
                Outcome::BindLibm(libm) => {
                    let library = binder.bind(targets, &self.location(libm))?;
                    Ok(Resolution::existing(library))
                },
            }
        }
    }

    fn targets(name: &'static str) -> BindingTargetSet {
        BindingTargetSet::new().with(BindingTarget::new(name, ["cos"]))
    }

    #[test]
    fn test_load_mode_order_and_parsing() {
        assert_eq!(
            LoadMode::PreferBundled.strategies(),
            &[Strategy::Bundled, Strategy::System]
        );
        assert_eq!(LoadMode::SystemOnly.strategies(), &[Strategy::System]);
        assert_eq!(LoadMode::default(), LoadMode::PreferSystem);

        assert_eq!("bundled-only".parse::<LoadMode>().unwrap(), LoadMode::BundledOnly);
        assert_eq!("PREFER_BUNDLED".parse::<LoadMode>().unwrap(), LoadMode::PreferBundled);
        assert!("anything".parse::<LoadMode>().is_err());
        assert_eq!(LoadMode::PreferSystem.to_string(), "prefer-system");

        let json = serde_json::to_string(&LoadMode::SystemOnly).unwrap();
        assert_eq!(json, "\"system-only\"");
    }

    #[test]
    fn test_unconfigured_strategies_are_failed_attempts() {
        let loader = LibraryLoader::builder()
            .cleanup_registry(Arc::new(CleanupRegistry::new()))
            .build();

        let err = loader
            .load(LoadMode::PreferSystem, &targets("test-loader-unconfigured"))
            .unwrap_err();

        let causes = err.causes();
        assert_eq!(causes.len(), 2);
        assert_eq!(causes[0].strategy, Strategy::System);
        assert_eq!(causes[1].strategy, Strategy::Bundled);
        assert!(causes
            .iter()
            .all(|c| matches!(c.error, LoaderError::Configuration(_))));
    }

    #[test]
    fn test_exhaustion_keeps_attempted_order() {
        let system = FakeStrategy::new(Strategy::System, Outcome::Fail);
        let bundled = FakeStrategy::new(Strategy::Bundled, Outcome::Fail);
        let loader = LibraryLoader::builder()
            .strategy(system.clone())
            .strategy(bundled.clone())
            .build();

        let err = loader
            .load(LoadMode::PreferBundled, &targets("test-loader-exhausted"))
            .unwrap_err();

        match &err {
            LoaderError::AllStrategiesExhausted { mode, causes } => {
                assert_eq!(*mode, LoadMode::PreferBundled);
                assert_eq!(causes.len(), 2);
                assert_eq!(causes[0].strategy, Strategy::Bundled);
                assert_eq!(causes[1].strategy, Strategy::System);
            },
            other => panic!("unexpected error: {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains("prefer-bundled"));
        assert!(message.contains("fake bundled"));
        assert_eq!((system.calls(), bundled.calls()), (1, 1));
    }

    #[test]
    fn test_only_modes_do_not_fall_back() {
        let system = FakeStrategy::new(Strategy::System, Outcome::Fail);
        let bundled = FakeStrategy::new(Strategy::Bundled, Outcome::Fail);
        let loader = LibraryLoader::builder()
            .strategy(system.clone())
            .strategy(bundled.clone())
            .build();

        let err = loader
            .load(LoadMode::BundledOnly, &targets("test-loader-bundled-only"))
            .unwrap_err();

        assert_eq!(err.causes().len(), 1);
        assert_eq!(system.calls(), 0);
    }

    #[test]
    fn test_prefer_system_falls_back_to_bundled() {
        let Some(libm) = host_libm() else { return };
        let system = FakeStrategy::new(Strategy::System, Outcome::Fail);
        let bundled = FakeStrategy::new(Strategy::Bundled, Outcome::BindLibm(libm));
        let loader = LibraryLoader::builder()
            .strategy(system)
            .strategy(bundled)
            .build();

        let loaded = loader
            .load(LoadMode::PreferSystem, &targets("test-loader-fallback"))
            .unwrap();

        assert_eq!(loaded.strategy(), Some(Strategy::Bundled));
        assert_eq!(loaded.failures().len(), 1);
        assert_eq!(loaded.failures()[0].strategy, Strategy::System);
        assert_eq!(
            loaded.origin(),
            &LibraryOrigin::Bundled("fake/libm.so".into())
        );

        let cos: unsafe extern "C" fn(f64) -> f64 = unsafe { loaded.symbol("cos").unwrap() };
        assert_eq!(unsafe { cos(0.0) }, 1.0);
        assert!(matches!(
            unsafe { loaded.symbol::<unsafe extern "C" fn(f64) -> f64>("sin") },
            Err(LoaderError::Configuration(_))
        ));
    }

    #[test]
    fn test_existing_binding_short_circuits() {
        let Some(libm) = host_libm() else { return };
        let set = targets("test-loader-existing");
        SymbolBinder::global()
            .bind(&set, &LibraryLocation::system(libm))
            .unwrap();

        let system = FakeStrategy::new(Strategy::System, Outcome::BindLibm(libm));
        let loader = LibraryLoader::builder().strategy(system.clone()).build();

        let loaded = loader.load(LoadMode::PreferSystem, &set).unwrap();

        assert_eq!(system.calls(), 0);
        assert_eq!(loaded.strategy(), None);
        assert_eq!(loaded.origin(), &LibraryOrigin::System(libm.into()));
    }

    #[test]
    fn test_rebind_conflict_aborts_without_fallback() {
        let Some(libm) = host_libm() else { return };
        let set = targets("test-loader-conflict");
        SymbolBinder::global()
            .bind(&set, &LibraryLocation::system(libm))
            .unwrap();

        let system = FakeStrategy::new(Strategy::System, Outcome::Fail);
        let bundled = FakeStrategy::new(Strategy::Bundled, Outcome::BindLibm(libm));
        let loader = LibraryLoader::builder()
            .strategy(system.clone())
            .strategy(bundled.clone())
            .build();

        let err = loader.load(LoadMode::BundledOnly, &set).unwrap_err();
        assert!(err.is_rebind_conflict());

        let err = loader.load(LoadMode::PreferBundled, &set).unwrap_err();
        assert!(err.is_rebind_conflict());
        assert_eq!(bundled.calls(), 2);
        assert_eq!(system.calls(), 0);

        let rebound = LibraryLoader::builder()
            .strategy(FakeStrategy::new(Strategy::System, Outcome::BindLibm(libm)))
            .strategy(bundled.clone())
            .build()
            .load(LoadMode::PreferBundled, &set)
            .unwrap();
        assert_eq!(rebound.strategy(), None);
        assert_eq!(bundled.calls(), 2);
    }

    #[test]
    fn test_relative_path_is_rejected() {
        let loader = LibraryLoader::builder().build();
        let err = loader
            .load_absolute_path("lib/libsodium.so", &targets("test-loader-relative"))
            .unwrap_err();
        assert!(matches!(err, LoaderError::Configuration(_)));
    }

    #[test]
    fn test_bundled_directory_is_rejected() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("linux64/libsodium.so")).unwrap();
        fs::write(tmp.path().join("linux64/libsodium.so/readme"), b"x").unwrap();

        let registry = Arc::new(CleanupRegistry::new());
        let loader = LibraryLoader::builder()
            .bundled_resource("linux64/libsodium.so")
            .resolver(ResourceResolver::empty().with_source(Arc::new(
                crate::resources::DirectorySource::new(tmp.path()),
            )))
            .cleanup_registry(registry.clone())
            .build();

        let err = loader
            .load(LoadMode::BundledOnly, &targets("test-loader-directory"))
            .unwrap_err();

        assert!(matches!(
            err.causes()[0].error,
            LoaderError::InvalidArtifact { .. }
        ));
        assert_eq!(registry.pending(), 1);
        registry.run();
    }

    #[test]
    fn test_bundled_digest_mismatch_stops_before_binding() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("linux64")).unwrap();
        fs::write(tmp.path().join("linux64/libfake.so"), b"not a library").unwrap();

        let registry = Arc::new(CleanupRegistry::new());
        let loader = LibraryLoader::builder()
            .bundled_resource("linux64/libfake.so")
            .anchor(ResourceAnchor::Directory(tmp.path().to_path_buf()))
            .expected_sha256(hex::encode([0u8; 32]))
            .cleanup_registry(registry.clone())
            .build();

        let err = loader
            .load(LoadMode::BundledOnly, &targets("test-loader-digest"))
            .unwrap_err();

        assert!(matches!(
            err.causes()[0].error,
            LoaderError::IntegrityMismatch { .. }
        ));
        assert!(!SymbolBinder::global().is_bound("test-loader-digest"));
        registry.run();
    }
}
