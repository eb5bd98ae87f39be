//! Binding declared native entry points to a loaded library.
//!
//! The dynamic linker's symbol table is process-global, so every bind in the
//! process goes through one lock no matter how many loaders exist. A target
//! is bound at most once: binding it again against the same origin hands
//! back the existing library, binding it against anything else is refused.
//! Bound libraries are never unloaded.

use std::borrow::Cow;
use std::collections::HashMap;
use std::ffi::{c_void, OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use libloading::Library;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::LoaderError;

/// A module whose native entry points must resolve against a library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingTarget {
    name: Cow<'static, str>,
    symbols: Vec<Cow<'static, str>>,
}

impl BindingTarget {
    /// Creates a target declaring `symbols`.
    pub fn new<S>(name: impl Into<Cow<'static, str>>, symbols: impl IntoIterator<Item = S>) -> Self
    where
        S: Into<Cow<'static, str>>,
    {
        Self {
            name: name.into(),
            symbols: symbols.into_iter().map(Into::into).collect(),
        }
    }

    /// Target name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared symbols, in declaration order.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(|s| s.as_ref())
    }

    /// Returns true if `symbol` is declared by this target.
    pub fn declares(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s == symbol)
    }
}

/// Ordered set of binding targets, unique by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingTargetSet {
    targets: Vec<BindingTarget>,
}

impl BindingTargetSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target, builder style. Duplicates are ignored.
    pub fn with(mut self, target: BindingTarget) -> Self {
        self.insert(target);
        self
    }

    /// Adds a target. Returns false if a target with that name is present.
    pub fn insert(&mut self, target: BindingTarget) -> bool {
        if self.targets.iter().any(|t| t.name == target.name) {
            return false;
        }
        self.targets.push(target);
        true
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true if the set has no targets.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Targets in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &BindingTarget> {
        self.targets.iter()
    }

    /// Target names in insertion order.
    pub fn names(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.name()).collect()
    }

    /// Returns the first target declaring `symbol`.
    pub fn declaring(&self, symbol: &str) -> Option<&BindingTarget> {
        self.targets.iter().find(|t| t.declares(symbol))
    }
}

impl FromIterator<BindingTarget> for BindingTargetSet {
    fn from_iter<I: IntoIterator<Item = BindingTarget>>(iter: I) -> Self {
        let mut set = Self::new();
        for target in iter {
            set.insert(target);
        }
        set
    }
}

/// Logical identity of a bound library.
///
/// Two binds are equivalent when their origins are equal, which lets a
/// bundled library be "bound again" even though each extraction lands at a
/// different temporary path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LibraryOrigin {
    /// Found by the OS loader search path.
    System(String),
    /// Extracted from a bundled resource.
    Bundled(String),
    /// A caller-supplied absolute path.
    Path(PathBuf),
}

impl fmt::Display for LibraryOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryOrigin::System(name) => write!(f, "system library {name}"),
            LibraryOrigin::Bundled(resource) => write!(f, "bundled resource {resource}"),
            LibraryOrigin::Path(path) => write!(f, "path {}", path.display()),
        }
    }
}

/// What to open, and the origin to record for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryLocation {
    origin: LibraryOrigin,
    file: OsString,
}

impl LibraryLocation {
    /// A library found through the OS search path.
    ///
    /// A bare name such as `sodium` is expanded to the platform file name
    /// (`libsodium.so`, `libsodium.dylib`, `sodium.dll`); anything containing
    /// a dot or a path separator is used as given.
    pub fn system(name: impl Into<String>) -> Self {
        let name = name.into();
        let file = system_file_name(&name);
        Self {
            origin: LibraryOrigin::System(name),
            file,
        }
    }

    /// A bundled resource extracted to `path`.
    pub fn bundled(resource: impl Into<String>, path: &Path) -> Self {
        Self {
            origin: LibraryOrigin::Bundled(resource.into()),
            file: path.as_os_str().to_owned(),
        }
    }

    /// A caller-owned file.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            file: path.as_os_str().to_owned(),
            origin: LibraryOrigin::Path(path),
        }
    }

    /// Logical origin.
    pub fn origin(&self) -> &LibraryOrigin {
        &self.origin
    }

    /// Name or path handed to the dynamic loader.
    pub fn file(&self) -> &OsStr {
        &self.file
    }
}

impl fmt::Display for LibraryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.origin, self.file.to_string_lossy())
    }
}

fn system_file_name(name: &str) -> OsString {
    if name.contains(['.', '/', '\\']) {
        OsString::from(name)
    } else {
        libloading::library_filename(name)
    }
}

/// A library that has been opened and had its declared symbols verified.
#[derive(Debug)]
pub struct BoundLibrary {
    origin: LibraryOrigin,
    file: OsString,
    library: Library,
}

impl BoundLibrary {
    /// Logical origin of the library.
    pub fn origin(&self) -> &LibraryOrigin {
        &self.origin
    }

    /// Name or path the library was opened from.
    pub fn file(&self) -> &OsStr {
        &self.file
    }

    /// Looks up `symbol` and returns it as `T`.
    ///
    /// # Safety
    ///
    /// `T` must match the actual type of the symbol, typically an
    /// `unsafe extern "C" fn` pointer with the exact C signature.
    pub unsafe fn symbol<T: Copy>(&self, symbol: &str) -> Result<T, libloading::Error> {
        let found: libloading::Symbol<'_, T> = self.library.get(symbol.as_bytes())?;
        Ok(*found)
    }
}

#[derive(Default)]
struct BinderState {
    bound: HashMap<String, Arc<BoundLibrary>>,
}

fn binder_state() -> &'static Mutex<BinderState> {
    static STATE: OnceLock<Mutex<BinderState>> = OnceLock::new();
    STATE.get_or_init(Default::default)
}

/// Handle to the process-wide symbol binder.
///
/// Every handle shares the same state and lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymbolBinder;

impl SymbolBinder {
    /// Returns the process-wide binder.
    pub fn global() -> Self {
        SymbolBinder
    }

    /// Returns true if a target with this name is bound.
    pub fn is_bound(&self, target: &str) -> bool {
        binder_state().lock().bound.contains_key(target)
    }

    /// Returns the library any target of the set is bound to.
    pub fn existing(&self, targets: &BindingTargetSet) -> Option<Arc<BoundLibrary>> {
        let state = binder_state().lock();
        targets
            .iter()
            .find_map(|t| state.bound.get(t.name()).cloned())
    }

    /// Returns the existing library if every target is bound to `origin`.
    ///
    /// Returns `Ok(None)` if at least one target still needs binding.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::RebindConflict`] if a target is bound elsewhere.
    pub fn lookup(
        &self,
        targets: &BindingTargetSet,
        origin: &LibraryOrigin,
    ) -> Result<Option<Arc<BoundLibrary>>, LoaderError> {
        let state = binder_state().lock();
        let mut existing = None;
        let mut complete = true;

        for target in targets.iter() {
            match state.bound.get(target.name()) {
                Some(bound) if bound.origin != *origin => {
                    return Err(rebind_conflict(target, bound, origin));
                },
                Some(bound) => {
                    existing.get_or_insert_with(|| bound.clone());
                },
                None => complete = false,
            }
        }

        Ok(existing.filter(|_| complete))
    }

    /// Binds every target of the set against `location`.
    ///
    /// All declared symbols of every target that is not yet bound must
    /// resolve before any of them is recorded; a failure leaves the binder
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::RebindConflict`] if a target is bound to another
    /// origin and [`LoaderError::SymbolBindingFailed`] if the library cannot
    /// be opened or a symbol is missing.
    pub fn bind(
        &self,
        targets: &BindingTargetSet,
        location: &LibraryLocation,
    ) -> Result<Arc<BoundLibrary>, LoaderError> {
        if targets.is_empty() {
            return Err(LoaderError::Configuration(
                "binding target set is empty".into(),
            ));
        }

        let mut state = binder_state().lock();

        let mut existing: Option<Arc<BoundLibrary>> = None;
        for target in targets.iter() {
            if let Some(bound) = state.bound.get(target.name()) {
                if bound.origin != location.origin {
                    return Err(rebind_conflict(target, bound, &location.origin));
                }
                existing.get_or_insert_with(|| bound.clone());
            }
        }

        let pending: Vec<&BindingTarget> = targets
            .iter()
            .filter(|t| !state.bound.contains_key(t.name()))
            .collect();

        let library = match existing {
            Some(library) if pending.is_empty() => {
                debug!(targets = ?targets.names(), origin = %location.origin, "Targets already bound");
                return Ok(library);
            },
            Some(library) => library,
            None => Arc::new(open_library(location, pending[0])?),
        };

        for target in &pending {
            for symbol in target.symbols() {
                // SAFETY: the symbol is only checked for presence, never called.
                let found = unsafe { library.library.get::<*mut c_void>(symbol.as_bytes()) };
                found.map_err(|source| LoaderError::SymbolBindingFailed {
                    target: target.name().to_string(),
                    location: location.to_string(),
                    symbol: Some(symbol.to_string()),
                    source,
                })?;
            }
        }

        for target in &pending {
            state
                .bound
                .insert(target.name().to_string(), library.clone());
        }

        info!(
            targets = ?pending.iter().map(|t| t.name()).collect::<Vec<_>>(),
            origin = %location.origin,
            file = %location.file.to_string_lossy(),
            "Native library bound"
        );

        Ok(library)
    }
}

fn open_library(
    location: &LibraryLocation,
    first: &BindingTarget,
) -> Result<BoundLibrary, LoaderError> {
    debug!(location = %location, "Opening native library");

    // SAFETY: loading runs the library's initializers. The loader only opens
    // the configured library, which is trusted by whoever configured it.
    let library = unsafe { Library::new(&location.file) }.map_err(|source| {
        LoaderError::SymbolBindingFailed {
            target: first.name().to_string(),
            location: location.to_string(),
            symbol: None,
            source,
        }
    })?;

    Ok(BoundLibrary {
        origin: location.origin.clone(),
        file: location.file.clone(),
        library,
    })
}

fn rebind_conflict(
    target: &BindingTarget,
    bound: &BoundLibrary,
    requested: &LibraryOrigin,
) -> LoaderError {
    LoaderError::RebindConflict {
        target: target.name().to_string(),
        bound: bound.origin.to_string(),
        requested: requested.to_string(),
    }
}
