use axum::{
    extract::State,
    routing::get,
    Json, Router,
};

use vmm_orchestrator::{Node, NodeRegistration};

use crate::{error::ApiResult, state::AppState};

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/nodes", get(list_nodes).post(register_node))
}

async fn register_node(
    State(state): State<AppState>,
    Json(registration): Json<NodeRegistration>,
) -> ApiResult<Json<Node>> {
    let node = state.orchestrator.register_node(registration).await?;

    Ok(Json(node))
}

async fn list_nodes(State(state): State<AppState>) -> ApiResult<Json<Vec<Node>>> {
    let nodes = state.orchestrator.list_nodes().await?;

    Ok(Json(nodes))
}
