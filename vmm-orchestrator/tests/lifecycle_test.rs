//! Integration tests for the machine lifecycle orchestrator, driven
//! against the scriptable fake backend and an in-memory database.

use std::sync::Arc;
use std::time::Duration;

use vmm_hypervisor::{BackendOp, FakeHypervisor, HypervisorError, MachineShape};
use vmm_orchestrator::test_utils::create_test_db;
use vmm_orchestrator::{
    CreateMachineRequest, LifecycleError, MachineOrchestrator, MachineStatus, NodeRegistration,
    OperationFilter, OperationKind, OperationStatus, SqliteMachineStore,
};

async fn orchestrator() -> (Arc<MachineOrchestrator>, Arc<FakeHypervisor>) {
    let pool = create_test_db().await;
    let fake = Arc::new(FakeHypervisor::new());
    let store = Arc::new(SqliteMachineStore::new(pool));
    let orch = Arc::new(MachineOrchestrator::new(store, fake.clone()));
    (orch, fake)
}

fn request(name: &str) -> CreateMachineRequest {
    CreateMachineRequest {
        name: name.to_string(),
        cpu: 2,
        memory_mb: 2048,
        disk_gb: 20,
    }
}

fn bigger_shape() -> MachineShape {
    MachineShape {
        cpu: 4,
        memory_mb: 4096,
        disk_gb: 40,
    }
}

#[tokio::test]
async fn create_with_healthy_backend_lands_stopped() {
    let (orch, fake) = orchestrator().await;

    let machine = orch
        .create_machine(request("web"))
        .await
        .expect("Failed to create machine");

    assert_eq!(machine.name, "web");
    assert_eq!(machine.status, MachineStatus::Stopped);
    assert_eq!(machine.cpu, 2);
    assert_eq!(machine.memory_mb, 2048);
    assert_eq!(machine.disk_gb, 20);

    let backend_id = machine.backend_id.expect("backend id must be set");
    assert!(fake.contains(&backend_id));
    assert_eq!(fake.calls(BackendOp::Create), 1);
}

#[tokio::test]
async fn end_to_end_scenario() {
    let (orch, fake) = orchestrator().await;

    // create 2/2048/20 => stopped
    let machine = orch.create_machine(request("app")).await.expect("create");
    assert_eq!(machine.status, MachineStatus::Stopped);
    let id = machine.id.clone();

    // start => running
    let machine = orch.start_machine(&id).await.expect("start");
    assert_eq!(machine.status, MachineStatus::Running);

    // resize while running => precondition, status unchanged, backend untouched
    let err = orch
        .resize_machine(&id, bigger_shape())
        .await
        .expect_err("resize of a running machine must fail");
    assert!(matches!(err, LifecycleError::Precondition { .. }));
    assert_eq!(
        orch.get_machine(&id).await.expect("get").status,
        MachineStatus::Running
    );
    assert_eq!(fake.calls(BackendOp::Resize), 0);

    // stop, then resize succeeds and the new shape is listed
    orch.stop_machine(&id).await.expect("stop");
    let machine = orch.resize_machine(&id, bigger_shape()).await.expect("resize");
    assert_eq!(machine.status, MachineStatus::Stopped);

    let listed = orch.list_machines().await.expect("list");
    let entry = listed.iter().find(|m| m.id == id).expect("listed machine");
    assert_eq!(entry.cpu, 4);
    assert_eq!(entry.memory_mb, 4096);
    assert_eq!(entry.disk_gb, 40);

    // delete => gone from the list, and the backend resource is gone too
    let backend_id = entry.backend_id.clone().expect("backend id");
    orch.delete_machine(&id).await.expect("delete");
    assert!(orch.list_machines().await.expect("list").is_empty());
    assert!(!fake.contains(&backend_id));
}

#[tokio::test]
async fn lifecycle_is_idempotent_in_outcome() {
    let (orch, _fake) = orchestrator().await;

    let machine = orch.create_machine(request("short-lived")).await.expect("create");
    let id = machine.id.clone();

    orch.start_machine(&id).await.expect("start");
    orch.stop_machine(&id).await.expect("stop");
    orch.delete_machine(&id).await.expect("delete");

    // Running the same sequence against the dead id yields NotFound at
    // every step, never a crash or a resurrected record.
    assert!(matches!(
        orch.start_machine(&id).await,
        Err(LifecycleError::NotFound(_))
    ));
    assert!(matches!(
        orch.stop_machine(&id).await,
        Err(LifecycleError::NotFound(_))
    ));
    assert!(matches!(
        orch.delete_machine(&id).await,
        Err(LifecycleError::NotFound(_))
    ));
    assert!(orch.list_machines().await.expect("list").is_empty());
}

#[tokio::test]
async fn transient_create_leaves_record_provisioning() {
    let (orch, fake) = orchestrator().await;
    fake.fail_next(
        BackendOp::Create,
        HypervisorError::Transient("backend busy".into()),
    );

    let err = orch
        .create_machine(request("web"))
        .await
        .expect_err("create must fail");
    assert!(matches!(err, LifecycleError::BackendTransient { .. }));

    // The stub record is visible, still provisioning, and has no backend id.
    let listed = orch.list_machines().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, MachineStatus::Provisioning);
    assert!(listed[0].backend_id.is_none());

    // Deleting the stub never touches the backend.
    orch.delete_machine(&listed[0].id).await.expect("delete stub");
    assert_eq!(fake.calls(BackendOp::Delete), 0);
}

#[tokio::test]
async fn fatal_create_keeps_error_record() {
    let (orch, fake) = orchestrator().await;
    fake.fail_next(
        BackendOp::Create,
        HypervisorError::Fatal("unsupported image".into()),
    );

    let err = orch
        .create_machine(request("web"))
        .await
        .expect_err("create must fail");
    assert!(matches!(err, LifecycleError::BackendFatal { .. }));

    let listed = orch.list_machines().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, MachineStatus::Error);
    assert!(listed[0].backend_id.is_none());
    assert!(listed[0]
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("unsupported image")));
}

#[tokio::test]
async fn transient_start_failure_leaves_status_and_retry_succeeds() {
    let (orch, fake) = orchestrator().await;

    let machine = orch.create_machine(request("web")).await.expect("create");
    let id = machine.id.clone();

    fake.fail_next(
        BackendOp::Start,
        HypervisorError::Transient("connection reset".into()),
    );

    let err = orch.start_machine(&id).await.expect_err("start must fail");
    assert!(matches!(err, LifecycleError::BackendTransient { .. }));
    assert_eq!(
        orch.get_machine(&id).await.expect("get").status,
        MachineStatus::Stopped
    );

    // Backend recovered; a plain retry goes through.
    let machine = orch.start_machine(&id).await.expect("retry start");
    assert_eq!(machine.status, MachineStatus::Running);
    assert_eq!(fake.calls(BackendOp::Start), 2);
}

#[tokio::test]
async fn backend_drift_on_start_moves_record_to_error() {
    let (orch, fake) = orchestrator().await;

    let machine = orch.create_machine(request("web")).await.expect("create");
    let id = machine.id.clone();
    let backend_id = machine.backend_id.expect("backend id");

    // The VM vanished out-of-band; the next start observes the drift.
    fake.fail_next(
        BackendOp::Start,
        HypervisorError::not_found("fake", backend_id.clone()),
    );

    let err = orch.start_machine(&id).await.expect_err("start must fail");
    assert!(matches!(err, LifecycleError::BackendFatal { .. }));

    // The record is marked error but keeps its backend id: it may still
    // denote a live backend resource and must not be silently dropped.
    let machine = orch.get_machine(&id).await.expect("get");
    assert_eq!(machine.status, MachineStatus::Error);
    assert_eq!(machine.backend_id, Some(backend_id));
}

#[tokio::test]
async fn error_status_only_accepts_delete() {
    let (orch, fake) = orchestrator().await;

    let machine = orch.create_machine(request("web")).await.expect("create");
    let id = machine.id.clone();

    fake.fail_next(BackendOp::Start, HypervisorError::Fatal("kvm lost".into()));
    orch.start_machine(&id).await.expect_err("start must fail");

    assert!(matches!(
        orch.start_machine(&id).await,
        Err(LifecycleError::Precondition { .. })
    ));
    assert!(matches!(
        orch.stop_machine(&id).await,
        Err(LifecycleError::Precondition { .. })
    ));
    assert!(matches!(
        orch.resize_machine(&id, bigger_shape()).await,
        Err(LifecycleError::Precondition { .. })
    ));

    // Operator cleanup is still possible.
    orch.delete_machine(&id).await.expect("delete");
    assert!(orch.list_machines().await.expect("list").is_empty());
}

#[tokio::test]
async fn resize_failure_lands_in_error_even_when_transient() {
    let (orch, fake) = orchestrator().await;

    let machine = orch.create_machine(request("web")).await.expect("create");
    let id = machine.id.clone();

    fake.fail_next(
        BackendOp::Resize,
        HypervisorError::Transient("socket timeout".into()),
    );

    // Once the resize call has been issued the old shape cannot be
    // trusted, so even a transport-level failure is terminal.
    let err = orch
        .resize_machine(&id, bigger_shape())
        .await
        .expect_err("resize must fail");
    assert!(matches!(err, LifecycleError::BackendFatal { .. }));

    let machine = orch.get_machine(&id).await.expect("get");
    assert_eq!(machine.status, MachineStatus::Error);
    assert_eq!(machine.cpu, 2, "shape must not be updated on failure");
}

#[tokio::test]
async fn transient_delete_keeps_deleting_and_is_retryable() {
    let (orch, fake) = orchestrator().await;

    let machine = orch.create_machine(request("web")).await.expect("create");
    let id = machine.id.clone();

    fake.fail_next(
        BackendOp::Delete,
        HypervisorError::Transient("backend busy".into()),
    );

    let err = orch.delete_machine(&id).await.expect_err("delete must fail");
    assert!(matches!(err, LifecycleError::BackendTransient { .. }));
    assert_eq!(
        orch.get_machine(&id).await.expect("get").status,
        MachineStatus::Deleting
    );

    // No route back to stopped: power operations now conflict.
    assert!(matches!(
        orch.start_machine(&id).await,
        Err(LifecycleError::Conflict { .. })
    ));

    // Retrying the delete is the only path forward, and it works.
    orch.delete_machine(&id).await.expect("retry delete");
    assert!(orch.list_machines().await.expect("list").is_empty());
    assert_eq!(fake.calls(BackendOp::Delete), 2);
}

#[tokio::test]
async fn concurrent_deletes_reach_backend_once() {
    let (orch, fake) = orchestrator().await;

    let machine = orch.create_machine(request("web")).await.expect("create");
    let id = machine.id.clone();

    let first = {
        let orch = Arc::clone(&orch);
        let id = id.clone();
        tokio::spawn(async move { orch.delete_machine(&id).await })
    };
    let second = {
        let orch = Arc::clone(&orch);
        let id = id.clone();
        tokio::spawn(async move { orch.delete_machine(&id).await })
    };

    let outcomes = [
        first.await.expect("task"),
        second.await.expect("task"),
    ];

    let successes = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(successes, 1, "exactly one delete may succeed");

    let loser = outcomes
        .iter()
        .find_map(|o| o.as_ref().err())
        .expect("one delete must lose");
    assert!(matches!(
        loser,
        LifecycleError::NotFound(_) | LifecycleError::Conflict { .. }
    ));

    assert_eq!(fake.calls(BackendOp::Delete), 1);
    assert!(orch.list_machines().await.expect("list").is_empty());
}

#[tokio::test]
async fn backend_timeout_is_transient_and_leaves_record_untouched() {
    let pool = create_test_db().await;
    let fake = Arc::new(FakeHypervisor::with_call_delay(Duration::from_millis(200)));
    let store = Arc::new(SqliteMachineStore::new(pool));
    let orch = MachineOrchestrator::new(store, fake.clone())
        .with_backend_timeout(Duration::from_millis(20));

    let err = orch
        .create_machine(request("slow"))
        .await
        .expect_err("create must time out");
    assert!(matches!(err, LifecycleError::BackendTransient { .. }));

    let listed = orch.list_machines().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, MachineStatus::Provisioning);
}

#[tokio::test]
async fn validation_rejects_before_any_backend_call() {
    let (orch, fake) = orchestrator().await;

    let mut bad = request("web");
    bad.cpu = 0;
    assert!(matches!(
        orch.create_machine(bad).await,
        Err(LifecycleError::Validation(_))
    ));

    let mut bad = request("web");
    bad.name = "no spaces allowed".to_string();
    assert!(matches!(
        orch.create_machine(bad).await,
        Err(LifecycleError::Validation(_))
    ));

    assert_eq!(fake.calls(BackendOp::Create), 0);
    assert!(orch.list_machines().await.expect("list").is_empty());
}

#[tokio::test]
async fn operations_audit_every_lifecycle_call() {
    let (orch, fake) = orchestrator().await;

    let machine = orch.create_machine(request("web")).await.expect("create");
    let id = machine.id.clone();

    fake.fail_next(
        BackendOp::Start,
        HypervisorError::Transient("flaky".into()),
    );
    orch.start_machine(&id).await.expect_err("start must fail");
    orch.start_machine(&id).await.expect("retry start");
    orch.stop_machine(&id).await.expect("stop");

    let ops = orch
        .list_operations(OperationFilter {
            machine_id: Some(id.clone()),
            ..Default::default()
        })
        .await
        .expect("list operations");

    let kinds: Vec<_> = ops.iter().map(|op| op.kind).collect();
    assert_eq!(kinds.len(), 4); // create + failed start + start + stop
    assert!(kinds.contains(&OperationKind::Create));
    assert!(kinds.contains(&OperationKind::Stop));

    let failed = orch
        .list_operations(OperationFilter {
            machine_id: Some(id),
            status: Some(OperationStatus::Failed),
            ..Default::default()
        })
        .await
        .expect("list failed operations");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].kind, OperationKind::Start);
    assert!(failed[0]
        .error
        .as_deref()
        .is_some_and(|m| m.contains("flaky")));
    assert!(failed[0].completed_at.is_some());
}

#[tokio::test]
async fn nodes_are_tracked_by_name() {
    let (orch, _fake) = orchestrator().await;

    let registration = NodeRegistration {
        name: "hv-01".to_string(),
        hostname: "hv-01.internal".to_string(),
        ip: Some("10.0.0.7".to_string()),
        cpu_total: 64,
        mem_total_mb: 262144,
        disk_total_gb: 4096,
    };

    let node = orch.register_node(registration.clone()).await.expect("register");
    assert_eq!(node.status, "ready");
    assert_eq!(node.cpu_used, 0);

    // Re-registering the same name updates in place.
    let mut updated = registration;
    updated.cpu_total = 128;
    orch.register_node(updated).await.expect("re-register");

    let nodes = orch.list_nodes().await.expect("list nodes");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].cpu_total, 128);
    assert_eq!(nodes[0].id, node.id);
}
