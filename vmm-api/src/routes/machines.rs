use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use vmm_hypervisor::MachineShape;
use vmm_orchestrator::{CreateMachineRequest, MachineView};

use crate::{error::ApiResult, state::AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/machines",
            get(list_machines).post(create_machine),
        )
        .route(
            "/api/v1/machines/{id}",
            get(get_machine)
                .patch(resize_machine)
                .delete(delete_machine),
        )
        .route("/api/v1/machines/{id}/start", post(start_machine))
        .route("/api/v1/machines/{id}/stop", post(stop_machine))
}

async fn create_machine(
    State(state): State<AppState>,
    Json(req): Json<CreateMachineRequest>,
) -> ApiResult<Json<MachineView>> {
    let machine = state.orchestrator.create_machine(req).await?;

    Ok(Json(machine.into()))
}

async fn list_machines(State(state): State<AppState>) -> ApiResult<Json<Vec<MachineView>>> {
    let machines = state.orchestrator.list_machines().await?;

    Ok(Json(machines.into_iter().map(Into::into).collect()))
}

async fn get_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MachineView>> {
    let machine = state.orchestrator.get_machine(&id).await?;

    Ok(Json(machine.into()))
}

async fn start_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MachineView>> {
    let machine = state.orchestrator.start_machine(&id).await?;

    Ok(Json(machine.into()))
}

async fn stop_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MachineView>> {
    let machine = state.orchestrator.stop_machine(&id).await?;

    Ok(Json(machine.into()))
}

async fn resize_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(shape): Json<MachineShape>,
) -> ApiResult<Json<MachineView>> {
    let machine = state.orchestrator.resize_machine(&id, shape).await?;

    Ok(Json(machine.into()))
}

async fn delete_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.orchestrator.delete_machine(&id).await?;

    Ok(Json(serde_json::json!({ "message": "machine deleted" })))
}
