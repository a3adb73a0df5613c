//! The machine lifecycle state machine.
//!
//! Every operation follows the same sequence: acquire the per-machine
//! lock, check the status precondition, call the backend, then commit the
//! store mutation. The backend call always happens first because it is
//! the one that cannot be undone; the store only ever records what the
//! backend has confirmed.
//!
//! Status transitions:
//!
//! ```text
//! provisioning -> stopped | error
//! stopped      -> running | resizing | deleting | error
//! running      -> stopped | deleting | error
//! resizing     -> stopped | error
//! deleting     -> (removed) | error
//! error        -> deleting            (operator cleanup only)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task;
use tokio::time;
use tracing::{info, warn};

use crate::error::{LifecycleError, Result};
use crate::machine::{CreateMachineRequest, Machine, MachineStatus};
use crate::node::{Node, NodeRegistration};
use crate::operation::{Operation, OperationFilter, OperationKind, OperationStatus};
use crate::store::MachineStore;
use vmm_hypervisor::{Hypervisor, HypervisorError, HypervisorResult, MachineShape};

const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_NAME_LEN: usize = 64;

pub struct MachineOrchestrator {
    store: Arc<dyn MachineStore>,
    hypervisor: Arc<dyn Hypervisor>,
    backend_timeout: Duration,
    // One async mutex per machine id; the entry map itself is only held
    // long enough to clone the Arc out.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Debug, Clone, Copy)]
enum PowerAction {
    Start,
    Stop,
}

impl PowerAction {
    fn kind(self) -> OperationKind {
        match self {
            Self::Start => OperationKind::Start,
            Self::Stop => OperationKind::Stop,
        }
    }

    fn required(self) -> MachineStatus {
        match self {
            Self::Start => MachineStatus::Stopped,
            Self::Stop => MachineStatus::Running,
        }
    }

    fn target(self) -> MachineStatus {
        match self {
            Self::Start => MachineStatus::Running,
            Self::Stop => MachineStatus::Stopped,
        }
    }
}

impl MachineOrchestrator {
    pub fn new(store: Arc<dyn MachineStore>, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            store,
            hypervisor,
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    /// Provision a new machine.
    ///
    /// The record is inserted as `provisioning` before the backend call so
    /// the machine is visible and addressable even while the backend is
    /// still working. A transient backend failure leaves it there: the
    /// caller may retry the create or delete the stub; nothing has been
    /// committed on the backend that the interface could observe.
    pub async fn create_machine(&self, request: CreateMachineRequest) -> Result<Machine> {
        validate_name(&request.name)?;
        let shape = request.shape();
        validate_shape(&shape)?;

        let machine = Machine::provisioning(&request.name, &shape);
        let lock = self.lock_for(&machine.id);
        let _guard = lock.lock().await;

        self.store.insert(&machine).await?;
        let op = self
            .store
            .record_operation(&machine.id, OperationKind::Create, OperationStatus::Running)
            .await?;

        let name = request.name.clone();
        let create_shape = shape.clone();
        let outcome = self
            .backend_call(move |hv| hv.create(&name, &create_shape))
            .await;

        match outcome {
            Ok(created) => {
                self.store
                    .update_status(
                        &machine.id,
                        created.state.into(),
                        None,
                        Some(&created.id),
                        None,
                    )
                    .await?;
                self.store
                    .finish_operation(&op, OperationStatus::Succeeded, None)
                    .await?;

                info!(machine_id = %machine.id, backend_id = %created.id, "machine created");
                self.store.get(&machine.id).await
            }
            Err(err) if err.is_transient() => {
                self.store
                    .finish_operation(&op, OperationStatus::Failed, Some(&err.to_string()))
                    .await?;

                warn!(machine_id = %machine.id, error = %err, "create failed transiently; record left provisioning");
                Err(LifecycleError::BackendTransient {
                    id: machine.id,
                    source: err,
                })
            }
            Err(err) => {
                // The backend may have partially provisioned in ways the
                // interface cannot observe, so the record is kept for
                // operator cleanup rather than silently dropped.
                self.store
                    .update_status(
                        &machine.id,
                        MachineStatus::Error,
                        None,
                        None,
                        Some(&err.to_string()),
                    )
                    .await?;
                self.store
                    .finish_operation(&op, OperationStatus::Failed, Some(&err.to_string()))
                    .await?;

                warn!(machine_id = %machine.id, error = %err, "create failed");
                Err(LifecycleError::BackendFatal {
                    id: machine.id,
                    source: err,
                })
            }
        }
    }

    pub async fn get_machine(&self, id: &str) -> Result<Machine> {
        self.store.get(id).await
    }

    pub async fn list_machines(&self) -> Result<Vec<Machine>> {
        self.store.list().await
    }

    pub async fn start_machine(&self, id: &str) -> Result<Machine> {
        self.power_transition(id, PowerAction::Start).await
    }

    pub async fn stop_machine(&self, id: &str) -> Result<Machine> {
        self.power_transition(id, PowerAction::Stop).await
    }

    async fn power_transition(&self, id: &str, action: PowerAction) -> Result<Machine> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let machine = self.store.get(id).await?;
        if machine.status != action.required() {
            return Err(status_rejection(&machine));
        }
        let backend_id = require_backend_id(&machine)?;

        let op = self
            .store
            .record_operation(id, action.kind(), OperationStatus::Running)
            .await?;

        let outcome = self
            .backend_call(move |hv| match action {
                PowerAction::Start => hv.start(&backend_id),
                PowerAction::Stop => hv.stop(&backend_id),
            })
            .await;

        match outcome {
            Ok(()) => {
                self.store
                    .update_status(id, action.target(), None, None, None)
                    .await?;
                self.store
                    .finish_operation(&op, OperationStatus::Succeeded, None)
                    .await?;

                info!(machine_id = %id, status = %action.target(), "power state changed");
                self.store.get(id).await
            }
            Err(err) if err.is_transient() => {
                // State unchanged; the caller may simply retry.
                self.store
                    .finish_operation(&op, OperationStatus::Failed, Some(&err.to_string()))
                    .await?;

                Err(LifecycleError::BackendTransient {
                    id: id.to_string(),
                    source: err,
                })
            }
            Err(err) => {
                // Covers backend NotFound as well: the store believed the
                // VM existed, the backend disagrees. That drift is exactly
                // what the error status records.
                self.store
                    .update_status(id, MachineStatus::Error, None, None, Some(&err.to_string()))
                    .await?;
                self.store
                    .finish_operation(&op, OperationStatus::Failed, Some(&err.to_string()))
                    .await?;

                warn!(machine_id = %id, error = %err, "power transition failed");
                Err(LifecycleError::BackendFatal {
                    id: id.to_string(),
                    source: err,
                })
            }
        }
    }

    /// Apply a new shape to a stopped machine.
    ///
    /// The record moves to `resizing` before the backend is called so any
    /// concurrent request on the same id observes a non-idle status. Once
    /// the resize call has been issued there is no failure mode that
    /// leaves the old shape trustworthy, so every backend failure lands
    /// the record in `error`.
    pub async fn resize_machine(&self, id: &str, shape: MachineShape) -> Result<Machine> {
        validate_shape(&shape)?;

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let machine = self.store.get(id).await?;
        if machine.status != MachineStatus::Stopped {
            return Err(status_rejection(&machine));
        }
        let backend_id = require_backend_id(&machine)?;

        self.store
            .update_status(id, MachineStatus::Resizing, None, None, None)
            .await?;
        let op = self
            .store
            .record_operation(id, OperationKind::Resize, OperationStatus::Running)
            .await?;

        let resize_shape = shape.clone();
        let outcome = self
            .backend_call(move |hv| hv.resize(&backend_id, &resize_shape))
            .await;

        match outcome {
            Ok(()) => {
                self.store
                    .update_status(id, MachineStatus::Stopped, Some(&shape), None, None)
                    .await?;
                self.store
                    .finish_operation(&op, OperationStatus::Succeeded, None)
                    .await?;

                info!(machine_id = %id, cpu = shape.cpu, memory_mb = shape.memory_mb, disk_gb = shape.disk_gb, "machine resized");
                self.store.get(id).await
            }
            Err(err) => {
                self.store
                    .update_status(id, MachineStatus::Error, None, None, Some(&err.to_string()))
                    .await?;
                self.store
                    .finish_operation(&op, OperationStatus::Failed, Some(&err.to_string()))
                    .await?;

                warn!(machine_id = %id, error = %err, "resize failed");
                Err(LifecycleError::BackendFatal {
                    id: id.to_string(),
                    source: err,
                })
            }
        }
    }

    /// Delete a machine.
    ///
    /// Allowed from every status, `deleting` included: once deletion has
    /// been requested there is no route back, and re-invoking delete is
    /// the retry path after a transient backend failure. A backend that
    /// no longer knows the VM counts as success.
    pub async fn delete_machine(&self, id: &str) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let machine = self.store.get(id).await?;

        self.store
            .update_status(id, MachineStatus::Deleting, None, None, None)
            .await?;
        let op = self
            .store
            .record_operation(id, OperationKind::Delete, OperationStatus::Running)
            .await?;

        let outcome = match machine.backend_id.clone() {
            Some(backend_id) => self.backend_call(move |hv| hv.delete(&backend_id)).await,
            // The create never got a backend id; nothing to tear down.
            None => Ok(()),
        };

        match outcome {
            Ok(()) | Err(HypervisorError::NotFound { .. }) => {
                self.store.delete(id).await?;
                self.store
                    .finish_operation(&op, OperationStatus::Succeeded, None)
                    .await?;

                info!(machine_id = %id, "machine deleted");
                self.forget_lock(id);
                Ok(())
            }
            Err(err) if err.is_transient() => {
                self.store
                    .finish_operation(&op, OperationStatus::Failed, Some(&err.to_string()))
                    .await?;

                warn!(machine_id = %id, error = %err, "delete failed transiently; record stays deleting");
                Err(LifecycleError::BackendTransient {
                    id: id.to_string(),
                    source: err,
                })
            }
            Err(err) => {
                self.store
                    .update_status(id, MachineStatus::Error, None, None, Some(&err.to_string()))
                    .await?;
                self.store
                    .finish_operation(&op, OperationStatus::Failed, Some(&err.to_string()))
                    .await?;

                warn!(machine_id = %id, error = %err, "delete failed");
                Err(LifecycleError::BackendFatal {
                    id: id.to_string(),
                    source: err,
                })
            }
        }
    }

    pub async fn get_operation(&self, id: &str) -> Result<Operation> {
        self.store.get_operation(id).await
    }

    pub async fn list_operations(&self, filter: OperationFilter) -> Result<Vec<Operation>> {
        self.store.list_operations(filter).await
    }

    pub async fn register_node(&self, registration: NodeRegistration) -> Result<Node> {
        validate_name(&registration.name)?;
        self.store.upsert_node(&registration).await
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.store.list_nodes().await
    }

    /// Run one blocking backend call on a blocking thread, bounded by the
    /// configured timeout. An elapsed timeout classifies as transient:
    /// nothing is known about the call's outcome, and knowing nothing is
    /// exactly what `Transient` promises the caller.
    async fn backend_call<T, F>(&self, call: F) -> HypervisorResult<T>
    where
        F: FnOnce(&dyn Hypervisor) -> HypervisorResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let hypervisor = Arc::clone(&self.hypervisor);
        let handle = task::spawn_blocking(move || call(hypervisor.as_ref()));

        match time::timeout(self.backend_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(HypervisorError::Fatal(format!(
                "backend task aborted: {join_err}"
            ))),
            Err(_) => Err(HypervisorError::Transient(format!(
                "backend call exceeded {}s",
                self.backend_timeout.as_secs()
            ))),
        }
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn forget_lock(&self, id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

/// Map a status that failed its precondition to the right rejection:
/// transitional statuses mean another operation got there first
/// (`Conflict`), settled-but-wrong statuses are the caller's mistake
/// (`Precondition`).
fn status_rejection(machine: &Machine) -> LifecycleError {
    match machine.status {
        MachineStatus::Provisioning | MachineStatus::Resizing | MachineStatus::Deleting => {
            LifecycleError::Conflict {
                id: machine.id.clone(),
                status: machine.status,
            }
        }
        _ => LifecycleError::Precondition {
            id: machine.id.clone(),
            status: machine.status,
        },
    }
}

fn require_backend_id(machine: &Machine) -> Result<String> {
    machine
        .backend_id
        .clone()
        .ok_or_else(|| LifecycleError::BackendFatal {
            id: machine.id.clone(),
            source: HypervisorError::Fatal("record has no backend id".to_string()),
        })
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LifecycleError::Validation("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(LifecycleError::Validation(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(LifecycleError::Validation(format!(
            "name {name:?} may only contain alphanumerics, '-', '_' and '.'"
        )));
    }
    Ok(())
}

fn validate_shape(shape: &MachineShape) -> Result<()> {
    if shape.cpu == 0 {
        return Err(LifecycleError::Validation("cpu must be positive".into()));
    }
    if shape.memory_mb == 0 {
        return Err(LifecycleError::Validation(
            "memory_mb must be positive".into(),
        ));
    }
    if shape.disk_gb == 0 {
        return Err(LifecycleError::Validation(
            "disk_gb must be positive".into(),
        ));
    }
    Ok(())
}
