use thiserror::Error;

pub type HypervisorResult<T> = std::result::Result<T, HypervisorError>;

/// Failure taxonomy for backend operations.
///
/// Callers branch on the variant, never on the message text; the text only
/// travels upward for diagnostics.
#[derive(Debug, Clone, Error)]
pub enum HypervisorError {
    /// The backend has no VM under this identifier. For anything but
    /// delete this usually means the VM was removed out-of-band.
    #[error("no such VM on the {backend} backend: {id}")]
    NotFound { backend: &'static str, id: String },

    /// Busy backend, network hiccup, or timed-out call. Safe to retry
    /// without side effects being assumed.
    #[error("backend temporarily unavailable: {0}")]
    Transient(String),

    /// The operation is not valid for the VM's current backend state.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Unrecoverable failure: malformed shape, missing tooling, corrupted
    /// backend state.
    #[error("backend failure: {0}")]
    Fatal(String),
}

impl HypervisorError {
    pub fn not_found(backend: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            backend,
            id: id.into(),
        }
    }

    /// Whether a retry of the failed call is safe and worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
