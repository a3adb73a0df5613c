use thiserror::Error;

use crate::machine::MachineStatus;
use vmm_hypervisor::HypervisorError;

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Everything a lifecycle operation can fail with.
///
/// Control flow branches on the variant; the backend's own message text is
/// carried in the wrapped source purely for diagnostics. The orchestrator
/// never retries internally; retrying a `BackendTransient` or `Conflict`
/// failure is the caller's decision.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Malformed request, rejected before any backend call.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The operation is not valid for the machine's current status.
    #[error("machine {id} is {status}; operation not allowed")]
    Precondition { id: String, status: MachineStatus },

    /// Another lifecycle operation moved the machine into a transitional
    /// status before this one could proceed.
    #[error("machine {id} is busy ({status})")]
    Conflict { id: String, status: MachineStatus },

    /// No record under this machine id.
    #[error("machine not found: {0}")]
    NotFound(String),

    /// The backend call failed in a way that is safe to retry; the record
    /// was left untouched.
    #[error("machine {id}: {source}")]
    BackendTransient {
        id: String,
        #[source]
        source: HypervisorError,
    },

    /// The backend call failed terminally; the record is in `error` until
    /// an operator intervenes.
    #[error("machine {id}: {source}")]
    BackendFatal {
        id: String,
        #[source]
        source: HypervisorError,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
