//! Sodium error types.

use natrium_loader::LoaderError;
use thiserror::Error;

/// Errors that can occur while loading or calling libsodium.
#[derive(Debug, Error)]
pub enum SodiumError {
    /// The native library could not be loaded and bound.
    #[error("failed to load libsodium")]
    Loader(#[from] LoaderError),

    /// `sodium_init` reported failure.
    #[error("sodium_init failed")]
    InitFailed,

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A native call returned an error code.
    #[error("operation failed: {0}")]
    OperationFailed(String),
}
