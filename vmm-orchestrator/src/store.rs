//! Durable machine record store.
//!
//! The orchestrator only ever talks to the [`MachineStore`] trait, so it
//! can be exercised against an in-memory database in tests. The SQLite
//! implementation keeps to single-statement writes: a concurrent reader
//! sees either the previous row or the new one, never a half-written mix.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{LifecycleError, Result};
use crate::machine::{Machine, MachineStatus};
use crate::node::{Node, NodeRegistration};
use crate::operation::{Operation, OperationFilter, OperationKind, OperationStatus};
use vmm_hypervisor::MachineShape;

#[async_trait]
pub trait MachineStore: Send + Sync {
    async fn insert(&self, machine: &Machine) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Machine>;

    /// Move a machine to `status`, optionally applying a confirmed shape
    /// and backend id. `None` for shape or backend id leaves the stored
    /// value untouched: a failed operation must never strip the backend
    /// id off a record, or the backend resource would be orphaned with no
    /// trace. `error_message` is written verbatim (and cleared on `None`).
    async fn update_status(
        &self,
        id: &str,
        status: MachineStatus,
        shape: Option<&MachineShape>,
        backend_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()>;

    async fn list(&self) -> Result<Vec<Machine>>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn record_operation(
        &self,
        machine_id: &str,
        kind: OperationKind,
        status: OperationStatus,
    ) -> Result<String>;

    async fn finish_operation(
        &self,
        operation_id: &str,
        status: OperationStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn get_operation(&self, id: &str) -> Result<Operation>;

    async fn list_operations(&self, filter: OperationFilter) -> Result<Vec<Operation>>;

    async fn upsert_node(&self, registration: &NodeRegistration) -> Result<Node>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;
}

#[derive(Clone)]
pub struct SqliteMachineStore {
    pool: SqlitePool,
}

impl SqliteMachineStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MachineStore for SqliteMachineStore {
    async fn insert(&self, machine: &Machine) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO machines (id, name, cpu, memory_mb, disk_gb, status, backend_id, error_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&machine.id)
        .bind(&machine.name)
        .bind(machine.cpu)
        .bind(machine.memory_mb)
        .bind(machine.disk_gb)
        .bind(machine.status)
        .bind(&machine.backend_id)
        .bind(&machine.error_message)
        .bind(machine.created_at.timestamp())
        .bind(machine.updated_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Machine> {
        let row = sqlx::query_as::<_, MachineRow>("SELECT * FROM machines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        Ok(row.into())
    }

    async fn update_status(
        &self,
        id: &str,
        status: MachineStatus,
        shape: Option<&MachineShape>,
        backend_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE machines
               SET status = ?,
                   cpu = COALESCE(?, cpu),
                   memory_mb = COALESCE(?, memory_mb),
                   disk_gb = COALESCE(?, disk_gb),
                   backend_id = COALESCE(?, backend_id),
                   error_message = ?,
                   updated_at = ?
             WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(shape.map(|s| s.cpu as i64))
        .bind(shape.map(|s| s.memory_mb as i64))
        .bind(shape.map(|s| s.disk_gb as i64))
        .bind(backend_id)
        .bind(error_message)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::NotFound(id.to_string()));
        }

        Ok(())
    }

    async fn list(&self) -> Result<Vec<Machine>> {
        let rows =
            sqlx::query_as::<_, MachineRow>("SELECT * FROM machines ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM machines WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::NotFound(id.to_string()));
        }

        Ok(())
    }

    async fn record_operation(
        &self,
        machine_id: &str,
        kind: OperationKind,
        status: OperationStatus,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO operations (id, machine_id, kind, status, started_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(machine_id)
        .bind(kind)
        .bind(status)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn finish_operation(
        &self,
        operation_id: &str,
        status: OperationStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE operations SET status = ?, error = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(operation_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_operation(&self, id: &str) -> Result<Operation> {
        let row = sqlx::query_as::<_, OperationRow>("SELECT * FROM operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        Ok(row.into())
    }

    async fn list_operations(&self, filter: OperationFilter) -> Result<Vec<Operation>> {
        let mut query = "SELECT * FROM operations WHERE 1=1".to_string();

        if filter.machine_id.is_some() {
            query.push_str(" AND machine_id = ?");
        }
        if filter.kind.is_some() {
            query.push_str(" AND kind = ?");
        }
        if filter.status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY started_at DESC");

        let mut q = sqlx::query_as::<_, OperationRow>(&query);

        if let Some(machine_id) = &filter.machine_id {
            q = q.bind(machine_id);
        }
        if let Some(kind) = filter.kind {
            q = q.bind(kind);
        }
        if let Some(status) = filter.status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert_node(&self, registration: &NodeRegistration) -> Result<Node> {
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO nodes (id, name, hostname, ip, cpu_total, mem_total_mb, disk_total_gb, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'ready', ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                hostname = excluded.hostname,
                ip = excluded.ip,
                cpu_total = excluded.cpu_total,
                mem_total_mb = excluded.mem_total_mb,
                disk_total_gb = excluded.disk_total_gb,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&registration.name)
        .bind(&registration.hostname)
        .bind(&registration.ip)
        .bind(registration.cpu_total)
        .bind(registration.mem_total_mb)
        .bind(registration.disk_total_gb)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE name = ?")
            .bind(&registration.name)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let rows = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct MachineRow {
    id: String,
    name: String,
    cpu: i64,
    memory_mb: i64,
    disk_gb: i64,
    status: MachineStatus,
    backend_id: Option<String>,
    error_message: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    machine_id: String,
    kind: OperationKind,
    status: OperationStatus,
    error: Option<String>,
    started_at: i64,
    completed_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: String,
    name: String,
    hostname: String,
    ip: Option<String>,
    cpu_total: i64,
    cpu_used: i64,
    mem_total_mb: i64,
    mem_used_mb: i64,
    disk_total_gb: i64,
    disk_used_gb: i64,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl From<MachineRow> for Machine {
    fn from(row: MachineRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            cpu: row.cpu,
            memory_mb: row.memory_mb,
            disk_gb: row.disk_gb,
            status: row.status,
            backend_id: row.backend_id,
            error_message: row.error_message,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.updated_at, 0).unwrap_or_default(),
        }
    }
}

impl From<OperationRow> for Operation {
    fn from(row: OperationRow) -> Self {
        Self {
            id: row.id,
            machine_id: row.machine_id,
            kind: row.kind,
            status: row.status,
            error: row.error,
            started_at: DateTime::from_timestamp(row.started_at, 0).unwrap_or_default(),
            completed_at: row
                .completed_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        }
    }
}

impl From<NodeRow> for Node {
    fn from(row: NodeRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            hostname: row.hostname,
            ip: row.ip,
            cpu_total: row.cpu_total,
            cpu_used: row.cpu_used,
            mem_total_mb: row.mem_total_mb,
            mem_used_mb: row.mem_used_mb,
            disk_total_gb: row.disk_total_gb,
            disk_used_gb: row.disk_used_gb,
            status: row.status,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.updated_at, 0).unwrap_or_default(),
        }
    }
}
