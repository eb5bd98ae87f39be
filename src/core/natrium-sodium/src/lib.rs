//! # Natrium Sodium
//!
//! libsodium loaded through the Natrium loader.
//!
//! [`Sodium`] loads the library once, binds the core, random and generic
//! hash entry points, and runs `sodium_init` before handing out a value.
//! Construction either succeeds completely or fails; there is no partially
//! usable instance.

#![warn(missing_docs)]

pub mod error;

use std::ffi::{c_char, c_int, c_void, CStr};
use std::path::Path;
use std::ptr;

use natrium_loader::{
    bundled_library_path, BindingTarget, BindingTargetSet, LibraryLoader, LibraryLoaderBuilder,
    LoadMode, LoadedLibrary, LoaderConfig, LoaderError,
};
use tracing::{info, warn};
use zeroize::Zeroizing;

pub use error::SodiumError;

/// System library name of libsodium.
pub const SYSTEM_LIBRARY: &str = "sodium";

/// Smallest accepted generic hash key, in bytes.
pub const GENERICHASH_KEYBYTES_MIN: usize = 16;
/// Largest accepted generic hash key, in bytes.
pub const GENERICHASH_KEYBYTES_MAX: usize = 64;

type InitFn = unsafe extern "C" fn() -> c_int;
type VersionFn = unsafe extern "C" fn() -> *const c_char;
type RandomBufFn = unsafe extern "C" fn(*mut c_void, usize);
type RandomU32Fn = unsafe extern "C" fn() -> u32;
type GenericHashFn =
    unsafe extern "C" fn(*mut u8, usize, *const u8, u64, *const u8, usize) -> c_int;
type SizeFn = unsafe extern "C" fn() -> usize;

/// Targets bound by [`Sodium`].
pub fn binding_targets() -> BindingTargetSet {
    BindingTargetSet::new()
        .with(BindingTarget::new(
            "sodium-core",
            ["sodium_init", "sodium_version_string"],
        ))
        .with(BindingTarget::new(
            "sodium-random",
            ["randombytes_buf", "randombytes_random"],
        ))
        .with(BindingTarget::new(
            "sodium-generichash",
            [
                "crypto_generichash",
                "crypto_generichash_bytes_min",
                "crypto_generichash_bytes_max",
            ],
        ))
}

struct Api {
    version_string: VersionFn,
    randombytes_buf: RandomBufFn,
    randombytes_random: RandomU32Fn,
    generichash: GenericHashFn,
    generichash_bytes_min: SizeFn,
    generichash_bytes_max: SizeFn,
}

/// An initialized libsodium.
pub struct Sodium {
    loaded: LoadedLibrary,
    api: Api,
}

impl std::fmt::Debug for Sodium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sodium")
            .field("origin", self.loaded.origin())
            .finish_non_exhaustive()
    }
}

impl Sodium {
    /// Loads libsodium with the given mode, using the platform bundle layout.
    pub fn new(mode: LoadMode) -> Result<Self, SodiumError> {
        let loader = with_defaults(LibraryLoader::builder(), true, true).build();
        Self::from_loaded(loader.load(mode, &binding_targets())?)
    }

    /// Loads libsodium according to a loader configuration.
    ///
    /// Missing library names fall back to the defaults used by [`Sodium::new`].
    pub fn with_config(config: &LoaderConfig) -> Result<Self, SodiumError> {
        let builder = with_defaults(
            config.builder()?,
            config.system_library.is_none(),
            config.bundled_resource.is_none(),
        );
        Self::from_loaded(builder.build().load(config.mode, &binding_targets())?)
    }

    /// Loads libsodium from a caller-owned absolute path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SodiumError> {
        let loader = LibraryLoader::builder().build();
        Self::from_loaded(loader.load_absolute_path(path, &binding_targets())?)
    }

    fn from_loaded(loaded: LoadedLibrary) -> Result<Self, SodiumError> {
        // SAFETY: the signatures below match the libsodium headers.
        let (init, api) = unsafe {
            let init: InitFn = loaded.symbol("sodium_init")?;
            let api = Api {
                version_string: loaded.symbol("sodium_version_string")?,
                randombytes_buf: loaded.symbol("randombytes_buf")?,
                randombytes_random: loaded.symbol("randombytes_random")?,
                generichash: loaded.symbol("crypto_generichash")?,
                generichash_bytes_min: loaded.symbol("crypto_generichash_bytes_min")?,
                generichash_bytes_max: loaded.symbol("crypto_generichash_bytes_max")?,
            };
            (init, api)
        };

        // 0 on first initialization, 1 if already initialized.
        if unsafe { init() } < 0 {
            return Err(SodiumError::InitFailed);
        }

        let sodium = Self { loaded, api };
        info!(
            origin = %sodium.loaded.origin(),
            version = %sodium.version_string(),
            "libsodium initialized"
        );
        Ok(sodium)
    }

    /// Load details of the underlying library.
    pub fn loaded(&self) -> &LoadedLibrary {
        &self.loaded
    }

    /// Version string reported by libsodium.
    pub fn version_string(&self) -> String {
        // SAFETY: libsodium returns a static NUL-terminated string.
        unsafe { CStr::from_ptr((self.api.version_string)()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Returns `len` random bytes, zeroed on drop.
    pub fn random_bytes(&self, len: usize) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(vec![0u8; len]);
        if len > 0 {
            // SAFETY: the buffer is valid for `len` bytes.
            unsafe { (self.api.randombytes_buf)(bytes.as_mut_ptr().cast(), len) };
        }
        bytes
    }

    /// Returns a random `u32`.
    pub fn random_u32(&self) -> u32 {
        // SAFETY: no arguments, no preconditions.
        unsafe { (self.api.randombytes_random)() }
    }

    /// Smallest and largest generic hash output length.
    pub fn generichash_bytes_range(&self) -> (usize, usize) {
        // SAFETY: constant getters.
        unsafe {
            (
                (self.api.generichash_bytes_min)(),
                (self.api.generichash_bytes_max)(),
            )
        }
    }

    /// BLAKE2b hash of `input`, optionally keyed, with `out_len` bytes of output.
    ///
    /// # Errors
    ///
    /// Returns [`SodiumError::InvalidInput`] for out-of-range output or key
    /// lengths.
    pub fn generichash(
        &self,
        input: &[u8],
        key: Option<&[u8]>,
        out_len: usize,
    ) -> Result<Vec<u8>, SodiumError> {
        let (min, max) = self.generichash_bytes_range();
        if !(min..=max).contains(&out_len) {
            return Err(SodiumError::InvalidInput(format!(
                "output length {out_len} outside {min}..={max}"
            )));
        }

        let key = key.unwrap_or_default();
        if !key.is_empty()
            && !(GENERICHASH_KEYBYTES_MIN..=GENERICHASH_KEYBYTES_MAX).contains(&key.len())
        {
            return Err(SodiumError::InvalidInput(format!(
                "key length {} outside {GENERICHASH_KEYBYTES_MIN}..={GENERICHASH_KEYBYTES_MAX}",
                key.len()
            )));
        }

        let mut out = vec![0u8; out_len];
        let key_ptr = if key.is_empty() { ptr::null() } else { key.as_ptr() };

        // SAFETY: every pointer is valid for its paired length.
        let rc = unsafe {
            (self.api.generichash)(
                out.as_mut_ptr(),
                out.len(),
                input.as_ptr(),
                input.len() as u64,
                key_ptr,
                key.len(),
            )
        };
        if rc != 0 {
            return Err(SodiumError::OperationFailed(format!(
                "crypto_generichash returned {rc}"
            )));
        }

        Ok(out)
    }
}

fn with_defaults(
    mut builder: LibraryLoaderBuilder,
    system: bool,
    bundled: bool,
) -> LibraryLoaderBuilder {
    if system {
        builder = builder.system_library(SYSTEM_LIBRARY);
    }
    if bundled {
        match bundled_library_path(SYSTEM_LIBRARY) {
            Ok(resource) => builder = builder.bundled_resource(resource),
            Err(LoaderError::UnsupportedPlatform(platform)) => {
                warn!(%platform, "No bundled libsodium layout for this platform");
            },
            Err(e) => warn!(error = %e, "Bundled libsodium path unavailable"),
        }
    }
    builder
}
