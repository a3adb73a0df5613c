//! Scriptable in-memory backend for tests.
//!
//! Keeps every VM in a map, lets tests queue up failures per operation,
//! and counts calls so a test can assert an operation never reached the
//! backend at all.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{HypervisorError, HypervisorResult};
use crate::{CreatedVm, Hypervisor, MachineShape, PowerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Create,
    Start,
    Stop,
    Resize,
    Delete,
}

#[derive(Debug)]
struct FakeVm {
    shape: MachineShape,
    state: PowerState,
}

#[derive(Debug, Default)]
struct FakeState {
    machines: HashMap<String, FakeVm>,
    failures: HashMap<BackendOp, VecDeque<HypervisorError>>,
    calls: HashMap<BackendOp, u32>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
    call_delay: Option<Duration>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call block for `delay` before answering, so tests can
    /// exercise the caller's timeout classification.
    pub fn with_call_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            call_delay: Some(delay),
        }
    }

    /// Queue a failure for the next invocation of `op`. Failures are
    /// consumed in FIFO order, one per call.
    pub fn fail_next(&self, op: BackendOp, err: HypervisorError) {
        let mut state = self.lock();
        state.failures.entry(op).or_default().push_back(err);
    }

    /// Number of times `op` has been invoked, including failed calls.
    pub fn calls(&self, op: BackendOp) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn contains(&self, backend_id: &str) -> bool {
        self.lock().machines.contains_key(backend_id)
    }

    pub fn power_state(&self, backend_id: &str) -> Option<PowerState> {
        self.lock().machines.get(backend_id).map(|vm| vm.state)
    }

    pub fn shape(&self, backend_id: &str) -> Option<MachineShape> {
        self.lock()
            .machines
            .get(backend_id)
            .map(|vm| vm.shape.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Count the call, apply any configured delay, and pop a scripted
    /// failure if one is queued.
    fn enter(&self, op: BackendOp) -> HypervisorResult<()> {
        if let Some(delay) = self.call_delay {
            std::thread::sleep(delay);
        }

        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;

        if let Some(err) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }
}

impl Hypervisor for FakeHypervisor {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn create(&self, _name: &str, shape: &MachineShape) -> HypervisorResult<CreatedVm> {
        self.enter(BackendOp::Create)?;

        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.machines.insert(
            id.clone(),
            FakeVm {
                shape: shape.clone(),
                state: PowerState::Stopped,
            },
        );

        Ok(CreatedVm {
            id,
            state: PowerState::Stopped,
        })
    }

    fn start(&self, backend_id: &str) -> HypervisorResult<()> {
        self.enter(BackendOp::Start)?;

        let mut state = self.lock();
        let vm = state
            .machines
            .get_mut(backend_id)
            .ok_or_else(|| HypervisorError::not_found("fake", backend_id))?;
        vm.state = PowerState::Running;
        Ok(())
    }

    fn stop(&self, backend_id: &str) -> HypervisorResult<()> {
        self.enter(BackendOp::Stop)?;

        let mut state = self.lock();
        let vm = state
            .machines
            .get_mut(backend_id)
            .ok_or_else(|| HypervisorError::not_found("fake", backend_id))?;
        vm.state = PowerState::Stopped;
        Ok(())
    }

    fn resize(&self, backend_id: &str, shape: &MachineShape) -> HypervisorResult<()> {
        self.enter(BackendOp::Resize)?;

        let mut state = self.lock();
        let vm = state
            .machines
            .get_mut(backend_id)
            .ok_or_else(|| HypervisorError::not_found("fake", backend_id))?;
        if vm.state == PowerState::Running {
            return Err(HypervisorError::Unsupported(format!(
                "{backend_id} is running; resize requires a stopped VM"
            )));
        }
        vm.shape = shape.clone();
        Ok(())
    }

    fn delete(&self, backend_id: &str) -> HypervisorResult<()> {
        self.enter(BackendOp::Delete)?;

        // Absent is success: idempotent delete.
        self.lock().machines.remove(backend_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> MachineShape {
        MachineShape {
            cpu: 2,
            memory_mb: 2048,
            disk_gb: 20,
        }
    }

    #[test]
    fn scripted_failure_is_consumed_once() {
        let fake = FakeHypervisor::new();
        fake.fail_next(BackendOp::Create, HypervisorError::Transient("busy".into()));

        assert!(fake.create("web", &shape()).is_err());
        let created = fake.create("web", &shape()).expect("second create");
        assert_eq!(created.state, PowerState::Stopped);
        assert_eq!(fake.calls(BackendOp::Create), 2);
    }

    #[test]
    fn lifecycle_tracks_power_state() {
        let fake = FakeHypervisor::new();
        let created = fake.create("web", &shape()).expect("create");

        fake.start(&created.id).expect("start");
        assert_eq!(fake.power_state(&created.id), Some(PowerState::Running));

        assert!(matches!(
            fake.resize(&created.id, &shape()),
            Err(HypervisorError::Unsupported(_))
        ));

        fake.stop(&created.id).expect("stop");
        assert_eq!(fake.power_state(&created.id), Some(PowerState::Stopped));

        fake.delete(&created.id).expect("delete");
        assert!(!fake.contains(&created.id));
        fake.delete(&created.id).expect("idempotent delete");
    }

    #[test]
    fn start_of_unknown_vm_is_not_found() {
        let fake = FakeHypervisor::new();
        assert!(matches!(
            fake.start("fake-404"),
            Err(HypervisorError::NotFound { .. })
        ));
    }
}
