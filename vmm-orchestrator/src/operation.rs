use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::machine::{serialize_datetime, serialize_optional_datetime};

/// One row of the lifecycle audit log. Every backend-touching operation
/// gets a record, including the ones that fail.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub id: String,
    pub machine_id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub error: Option<String>,

    #[serde(serialize_with = "serialize_datetime")]
    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(serialize_with = "serialize_optional_datetime")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Start,
    Stop,
    Resize,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub machine_id: Option<String>,
    pub kind: Option<OperationKind>,
    pub status: Option<OperationStatus>,
}
