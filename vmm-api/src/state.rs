use std::sync::Arc;

use sqlx::SqlitePool;
use vmm_orchestrator::MachineOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<MachineOrchestrator>,
    pub pool: SqlitePool,
}

impl AppState {
    pub fn new(orchestrator: Arc<MachineOrchestrator>, pool: SqlitePool) -> Self {
        Self { orchestrator, pool }
    }
}
