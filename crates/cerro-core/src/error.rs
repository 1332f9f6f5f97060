//! Error types and result alias shared across Cerro components.

/// The result type used throughout Cerro.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while loading a manifest or deriving endpoints from it.
///
/// These never reach API callers directly: they are contained in the
/// refresh path (stale-table retention) or fail process startup when there
/// is nothing to serve yet.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The manifest could not be fetched from any configured source.
    #[error("manifest unavailable: {message}")]
    ManifestUnavailable {
        /// Description of the fetch failure(s), one per attempted source.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The manifest was fetched but violates the expected schema.
    #[error("manifest malformed: {message}")]
    ManifestMalformed {
        /// Description of the schema violation, naming the offending node.
        message: String,
    },

    /// Two descriptors derived the same endpoint path.
    ///
    /// This fails the whole table build; the previously published table
    /// (if any) stays live.
    #[error("duplicate endpoint path {path}: derived by models {first} and {second}")]
    DuplicatePath {
        /// The colliding path.
        path: String,
        /// Model processed first (deterministic name order).
        first: String,
        /// Model whose descriptor was rejected.
        second: String,
    },

    /// Invalid input (configuration values, tier names).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a manifest-unavailable error with the given message.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ManifestUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a manifest-unavailable error with a source cause.
    #[must_use]
    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ManifestUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a manifest-malformed error with the given message.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::ManifestMalformed {
            message: message.into(),
        }
    }
}
