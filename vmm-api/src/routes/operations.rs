use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use vmm_orchestrator::{Operation, OperationFilter, OperationKind, OperationStatus};

use crate::{error::ApiResult, state::AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/operations", get(list_operations))
        .route("/api/v1/operations/{id}", get(get_operation))
}

#[derive(Debug, Deserialize)]
struct OperationsQuery {
    machine_id: Option<String>,
    kind: Option<String>,
    status: Option<String>,
}

async fn list_operations(
    State(state): State<AppState>,
    Query(query): Query<OperationsQuery>,
) -> ApiResult<Json<Vec<Operation>>> {
    // Query params arrive as bare strings; lean on the enums' serde
    // renames to parse them.
    let kind = query
        .kind
        .and_then(|s| serde_json::from_str::<OperationKind>(&format!("\"{}\"", s)).ok());
    let status = query
        .status
        .and_then(|s| serde_json::from_str::<OperationStatus>(&format!("\"{}\"", s)).ok());

    let operations = state
        .orchestrator
        .list_operations(OperationFilter {
            machine_id: query.machine_id,
            kind,
            status,
        })
        .await?;

    Ok(Json(operations))
}

async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Operation>> {
    let operation = state.orchestrator.get_operation(&id).await?;

    Ok(Json(operation))
}
