use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vmm_hypervisor::{MachineShape, PowerState};

/// A virtual machine record as persisted by the store.
///
/// `cpu`/`memory_mb`/`disk_gb` always describe the last shape the backend
/// confirmed, never an in-flight request. `backend_id` is `None` only
/// while a create is still in its provisioning window (or failed before
/// the backend handed out an id). The struct deliberately does not
/// implement `Serialize`: anything that leaves the process goes through
/// [`MachineView`].
#[derive(Debug, Clone)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub cpu: i64,
    pub memory_mb: i64,
    pub disk_gb: i64,
    pub status: MachineStatus,
    pub backend_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Machine {
    /// Fresh record for a create that has not yet reached the backend.
    pub fn provisioning(name: &str, shape: &MachineShape) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            cpu: shape.cpu as i64,
            memory_mb: shape.memory_mb as i64,
            disk_gb: shape.disk_gb as i64,
            status: MachineStatus::Provisioning,
            backend_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn shape(&self) -> MachineShape {
        MachineShape {
            cpu: self.cpu as u32,
            memory_mb: self.memory_mb as u64,
            disk_gb: self.disk_gb as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MachineStatus {
    Provisioning,
    Stopped,
    Running,
    Resizing,
    Deleting,
    Error,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Resizing => "resizing",
            Self::Deleting => "deleting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<PowerState> for MachineStatus {
    fn from(state: PowerState) -> Self {
        match state {
            PowerState::Stopped => Self::Stopped,
            PowerState::Running => Self::Running,
        }
    }
}

/// The externally visible projection of a machine record. The backend
/// identifier and error diagnostics never cross this boundary.
#[derive(Debug, Clone, Serialize)]
pub struct MachineView {
    pub id: String,
    pub name: String,
    pub cpu: i64,
    pub memory_mb: i64,
    pub disk_gb: i64,
    pub status: MachineStatus,
}

impl From<Machine> for MachineView {
    fn from(machine: Machine) -> Self {
        Self {
            id: machine.id,
            name: machine.name,
            cpu: machine.cpu,
            memory_mb: machine.memory_mb,
            disk_gb: machine.disk_gb,
            status: machine.status,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMachineRequest {
    pub name: String,
    pub cpu: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

impl CreateMachineRequest {
    pub fn shape(&self) -> MachineShape {
        MachineShape {
            cpu: self.cpu,
            memory_mb: self.memory_mb,
            disk_gb: self.disk_gb,
        }
    }
}

// Serialize DateTime as RFC 3339 / ISO 8601 string
pub(crate) fn serialize_datetime<S>(
    dt: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}

pub(crate) fn serialize_optional_datetime<S>(
    dt: &Option<DateTime<Utc>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match dt {
        Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_hides_backend_fields() {
        let mut machine = Machine::provisioning(
            "web",
            &MachineShape {
                cpu: 2,
                memory_mb: 2048,
                disk_gb: 20,
            },
        );
        machine.backend_id = Some("vm-abc".into());
        machine.error_message = Some("diagnostics".into());
        machine.status = MachineStatus::Stopped;

        let value = serde_json::to_value(MachineView::from(machine)).expect("serialize view");
        let object = value.as_object().expect("object");

        assert!(object.contains_key("id"));
        assert_eq!(object["status"], "stopped");
        assert!(!object.contains_key("backend_id"));
        assert!(!object.contains_key("error_message"));
    }
}
