use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::machine::serialize_datetime;

/// A hypervisor host known to the control plane.
///
/// Nodes are tracked for inventory only; nothing in the lifecycle core
/// schedules machines onto them.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub ip: Option<String>,
    pub cpu_total: i64,
    pub cpu_used: i64,
    pub mem_total_mb: i64,
    pub mem_used_mb: i64,
    pub disk_total_gb: i64,
    pub disk_used_gb: i64,
    pub status: String,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,
}

/// Registration payload a node (or an operator) submits. Upserts by name.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeRegistration {
    pub name: String,
    pub hostname: String,
    pub ip: Option<String>,
    pub cpu_total: i64,
    pub mem_total_mb: i64,
    pub disk_total_gb: i64,
}
