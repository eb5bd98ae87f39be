//! # Natrium Loader
//!
//! Locates a native shared library, either installed on the host or bundled
//! with the application, and binds declared entry points against it.
//!
//! A load follows a [`LoadMode`]:
//! - `PreferSystem` / `PreferBundled`: try one strategy, fall back to the other
//! - `SystemOnly` / `BundledOnly`: a single strategy, no fallback
//!
//! The bundled strategy extracts the resource to a fresh temporary directory
//! ([`ResourceMaterializer`]), applies loadable permissions
//! ([`PermissionSetter`]), binds it ([`SymbolBinder`]) and disposes of the
//! file ([`ArtifactLifecycle`]). Binding is guarded by a single process-wide
//! lock and each target is bound at most once.
//!
//! Hold an [`ExitCleanupGuard`] in `main` so deferred deletions run at exit.

#![warn(missing_docs)]

pub mod artifact;
pub mod binder;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod loader;
pub mod materialize;
pub mod permissions;
pub mod platform;
pub mod resources;

pub use artifact::{ArtifactKind, DeletionPolicy, TempArtifact};
pub use binder::{
    BindingTarget, BindingTargetSet, BoundLibrary, LibraryLocation, LibraryOrigin, SymbolBinder,
};
pub use cleanup::{run_exit_cleanup, CleanupRegistry, ExitCleanupGuard};
pub use config::LoaderConfig;
pub use error::{LoaderError, StrategyFailure};
pub use lifecycle::{ArtifactLifecycle, DisposedArtifact};
pub use loader::{
    BundledStrategy, LibraryLoader, LibraryLoaderBuilder, LoadMode, LoadedLibrary, Resolution,
    ResolutionStrategy, Strategy, SystemStrategy,
};
pub use materialize::{verify_sha256, ResourceMaterializer};
pub use permissions::{FsCapability, NonPosixPolicy, PermissionSet, PermissionSetter};
pub use platform::bundled_library_path;
pub use resources::{register_embedded, ResourceAnchor, ResourceResolver, ResourceSource};
