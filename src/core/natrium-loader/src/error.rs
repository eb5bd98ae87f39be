//! Loader error types.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::loader::{LoadMode, Strategy};

/// Errors that can occur while resolving, extracting or binding a native library.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// No resource source could locate the bundled artifact.
    #[error("resource not found: {resource}")]
    ResourceNotFound {
        /// Normalized resource path that was requested.
        resource: String,
    },

    /// The resource path is empty or escapes the resource root.
    #[error("invalid resource path: {0}")]
    InvalidResourcePath(String),

    /// Copying the resource into its temporary location failed.
    #[error("failed to materialize resource {resource}")]
    Materialization {
        /// Resource being materialized.
        resource: String,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The extracted artifact does not match the expected digest.
    #[error("integrity check failed for {resource}: expected sha256 {expected}, got {actual}")]
    IntegrityMismatch {
        /// Resource being verified.
        resource: String,
        /// Expected hex digest.
        expected: String,
        /// Digest of the extracted bytes.
        actual: String,
    },

    /// The artifact cannot be used for the requested operation.
    #[error("invalid artifact {}: {reason}", .path.display())]
    InvalidArtifact {
        /// Path of the offending artifact.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// The operating system refused a permission change.
    #[error("permission change refused for {}", .path.display())]
    PermissionDenied {
        /// File whose permissions were being changed.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The dynamic linker could not open the library or resolve a symbol.
    #[error("failed to bind {target} against {location}{}", symbol_suffix(.symbol))]
    SymbolBindingFailed {
        /// Binding target being bound.
        target: String,
        /// Library name or path that was being bound.
        location: String,
        /// Symbol that failed to resolve, if the library itself opened.
        symbol: Option<String>,
        /// Underlying linker error.
        #[source]
        source: libloading::Error,
    },

    /// The targets are already bound to a different library.
    #[error("{target} is already bound to {bound}, refusing to rebind to {requested}")]
    RebindConflict {
        /// Binding target that is already bound.
        target: String,
        /// Origin of the existing binding.
        bound: String,
        /// Origin that was requested.
        requested: String,
    },

    /// No bundled naming exists for the running platform.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Invalid or missing loader configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every strategy of a load mode failed.
    #[error("{}", exhausted_message(.mode, .causes))]
    AllStrategiesExhausted {
        /// Mode that was being loaded.
        mode: LoadMode,
        /// Failure of each attempted strategy, in attempted order.
        causes: Vec<StrategyFailure>,
    },
}

impl LoaderError {
    /// Returns the per-strategy causes of an aggregate failure.
    ///
    /// Any other error is reported as having no strategy causes.
    pub fn causes(&self) -> &[StrategyFailure] {
        match self {
            LoaderError::AllStrategiesExhausted { causes, .. } => causes,
            _ => &[],
        }
    }

    /// Returns true if this is a rebind conflict.
    pub fn is_rebind_conflict(&self) -> bool {
        matches!(self, LoaderError::RebindConflict { .. })
    }
}

/// The failure of one strategy attempt inside a load.
#[derive(Debug)]
pub struct StrategyFailure {
    /// Which strategy failed.
    pub strategy: Strategy,
    /// Human readable description of what the strategy tried.
    pub attempted: String,
    /// Why it failed.
    pub error: LoaderError,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.strategy, self.attempted, self.error)?;

        let mut source = StdError::source(&self.error);
        while let Some(cause) = source {
            write!(f, ": {cause}")?;
            source = cause.source();
        }
        Ok(())
    }
}

fn symbol_suffix(symbol: &Option<String>) -> String {
    match symbol {
        Some(symbol) => format!(" (symbol {symbol})"),
        None => String::new(),
    }
}

fn exhausted_message(mode: &LoadMode, causes: &[StrategyFailure]) -> String {
    let mut message = format!("failed to load native library in mode {mode}");
    if causes.is_empty() {
        message.push_str(": no strategy was attempted");
        return message;
    }
    for (i, cause) in causes.iter().enumerate() {
        message.push_str(&format!("\n  {}. {}", i + 1, cause));
    }
    message
}
