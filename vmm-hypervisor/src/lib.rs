//! Hypervisor backend abstraction.
//!
//! This library defines the contract the lifecycle orchestrator programs
//! against when it needs a virtual machine created, powered on or off,
//! resized, or deleted. It deliberately knows nothing about records,
//! databases, or HTTP: a backend is addressed purely by the identifier it
//! handed out at creation time.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod qemu;

#[cfg(any(test, feature = "test-helpers"))]
pub mod fake;

pub use error::{HypervisorError, HypervisorResult};
pub use qemu::QemuHypervisor;

#[cfg(any(test, feature = "test-helpers"))]
pub use fake::{BackendOp, FakeHypervisor};

/// Resource shape of a virtual machine.
///
/// All fields are counts of whole units; zero is never a valid value and is
/// rejected by both the orchestrator (before any backend call) and the
/// drivers themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineShape {
    pub cpu: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

/// Power state as observed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Stopped,
    Running,
}

/// Result of a successful `create` call: the backend-assigned identifier
/// and the power state the backend observed once provisioning finished.
#[derive(Debug, Clone)]
pub struct CreatedVm {
    pub id: String,
    pub state: PowerState,
}

/// The core trait every hypervisor backend implements.
///
/// Calls are blocking; callers that live on an async runtime are expected
/// to move them onto a blocking thread and to bound each call with a
/// timeout (an elapsed timeout is a transient failure by definition).
///
/// `delete` is idempotent: deleting a VM the backend no longer knows about
/// succeeds, since the desired end state already holds.
pub trait Hypervisor: Send + Sync {
    /// Backend identifier, e.g. "qemu".
    fn name(&self) -> &'static str;

    /// Provision a new VM with the given shape.
    ///
    /// Not required to deduplicate: retrying a create whose outcome is
    /// unknown may allocate a second VM. Only retry when no prior call can
    /// have succeeded.
    fn create(&self, name: &str, shape: &MachineShape) -> HypervisorResult<CreatedVm>;

    /// Power on an existing VM.
    fn start(&self, backend_id: &str) -> HypervisorResult<()>;

    /// Power off a running VM.
    fn stop(&self, backend_id: &str) -> HypervisorResult<()>;

    /// Apply a new resource shape to a stopped VM.
    ///
    /// Returns `Unsupported` when the VM is running; the stop-first policy
    /// belongs to the orchestrator, not the driver.
    fn resize(&self, backend_id: &str, shape: &MachineShape) -> HypervisorResult<()>;

    /// Remove the VM and all its backend resources.
    fn delete(&self, backend_id: &str) -> HypervisorResult<()>;
}

/// Resolve a hypervisor backend by name.
pub fn hypervisor_for(name: &str, state_dir: &Path) -> HypervisorResult<Arc<dyn Hypervisor>> {
    match name {
        "qemu" => Ok(Arc::new(QemuHypervisor::new(state_dir)?)),
        #[cfg(feature = "test-helpers")]
        "fake" => Ok(Arc::new(FakeHypervisor::new())),
        other => Err(HypervisorError::Fatal(format!(
            "unknown hypervisor backend: {other}"
        ))),
    }
}
