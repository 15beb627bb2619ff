use std::io;

use thiserror::Error;

/// An error produced while turning call arguments into a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// An argument could not be encoded into the canonical representation.
    ///
    /// Carried from the point the argument was supplied and surfaced when the
    /// wrapped function is called, before invoking it.
    #[error("argument `{name}` cannot be encoded for fingerprinting: {reason}")]
    Unencodable { name: String, reason: String },

    /// The same parameter was supplied both positionally and by name.
    #[error("parameter `{0}` supplied both positionally and by name")]
    DuplicateArgument(String),

    /// A wrapper was declared as a method but has an empty parameter list,
    /// so there is no receiver parameter to elide.
    #[error("method wrapper declared without a receiver parameter")]
    MissingReceiver,

    /// A custom key maker failed.
    #[error("custom key maker failed: {0}")]
    Custom(String),
}

/// An error raised by a storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("cache i/o failed: {0}")]
    Io(#[from] io::Error),

    /// A stored record could not be encoded.
    #[error("cache entry could not be encoded: {0}")]
    Encode(String),

    /// The external store cannot be reached or initialized.
    #[error("shared store unavailable: {0}")]
    Unavailable(String),

    /// The external store failed an operation.
    #[error("shared store operation failed: {0}")]
    Store(String),
}

/// The error type returned by memoized calls and cache management operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The call arguments could not be fingerprinted. The wrapped function
    /// was not invoked.
    #[error("argument not fingerprintable")]
    ArgumentNotFingerprintable(#[source] KeyError),

    /// The backend failed irrecoverably (at construction, or on an operation
    /// with no degradation path).
    #[error("cache backend unavailable")]
    BackendUnavailable(#[source] BackendError),

    /// The wrapper or global configuration is invalid.
    #[error("invalid cache configuration: {0}")]
    Config(String),

    /// A value handed to `precache` could not be serialized for storage.
    #[error("value could not be serialized for caching: {0}")]
    Serialization(String),

    /// The wrapped function failed. The underlying error is propagated
    /// unchanged; the in-flight claim has been released and nothing was
    /// stored.
    #[error(transparent)]
    UserFunction(anyhow::Error),
}

impl From<KeyError> for Error {
    fn from(err: KeyError) -> Self {
        Error::ArgumentNotFingerprintable(err)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
