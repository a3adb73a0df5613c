//! QEMU process driver.
//!
//! Each VM lives in its own directory under the state dir: a JSON manifest
//! describing the shape, a qcow2 disk image, and a pidfile while the guest
//! process is up. The directory name is the backend identifier.
//!
//! Start daemonizes `qemu-system-x86_64`; stop signals the pid from the
//! pidfile. Resize only grows the disk; qcow2 images cannot shrink.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{HypervisorError, HypervisorResult};
use crate::{CreatedVm, Hypervisor, MachineShape, PowerState};

const QEMU_SYSTEM: &str = "qemu-system-x86_64";
const QEMU_IMG: &str = "qemu-img";

const MANIFEST_FILE: &str = "machine.json";
const DISK_FILE: &str = "disk.qcow2";
const PID_FILE: &str = "qemu.pid";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    name: String,
    cpu: u32,
    memory_mb: u64,
    disk_gb: u64,
}

pub struct QemuHypervisor {
    state_dir: PathBuf,
}

impl QemuHypervisor {
    /// Build a driver rooted at `state_dir`, verifying the QEMU tooling is
    /// on the PATH up front so a misconfigured host fails at startup
    /// instead of on the first create.
    pub fn new(state_dir: impl Into<PathBuf>) -> HypervisorResult<Self> {
        for tool in [QEMU_SYSTEM, QEMU_IMG] {
            which::which(tool)
                .map_err(|_| HypervisorError::Fatal(format!("{tool} not found on PATH")))?;
        }

        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir).map_err(|e| {
            HypervisorError::Fatal(format!(
                "cannot create state dir {}: {e}",
                state_dir.display()
            ))
        })?;

        Ok(Self { state_dir })
    }

    fn vm_dir(&self, id: &str) -> PathBuf {
        self.state_dir.join(id)
    }

    fn read_manifest(&self, id: &str) -> HypervisorResult<Manifest> {
        let path = self.vm_dir(id).join(MANIFEST_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(HypervisorError::not_found("qemu", id));
            }
            Err(e) => {
                return Err(HypervisorError::Transient(format!(
                    "cannot read manifest for {id}: {e}"
                )));
            }
        };

        serde_json::from_str(&raw).map_err(|e| {
            HypervisorError::Fatal(format!("corrupted manifest for {id}: {e}"))
        })
    }

    fn write_manifest(&self, id: &str, manifest: &Manifest) -> HypervisorResult<()> {
        let raw = serde_json::to_string_pretty(manifest)
            .map_err(|e| HypervisorError::Fatal(format!("cannot encode manifest: {e}")))?;

        fs::write(self.vm_dir(id).join(MANIFEST_FILE), raw).map_err(|e| {
            HypervisorError::Transient(format!("cannot write manifest for {id}: {e}"))
        })
    }

    /// Pid of the guest process if it is alive, clearing stale pidfiles as
    /// a side effect.
    fn running_pid(&self, id: &str) -> Option<i32> {
        let pidfile = self.vm_dir(id).join(PID_FILE);
        let pid: i32 = fs::read_to_string(&pidfile).ok()?.trim().parse().ok()?;

        match kill(Pid::from_raw(pid), None) {
            Ok(()) => Some(pid),
            Err(_) => {
                if let Err(e) = fs::remove_file(&pidfile) {
                    warn!("failed to clear stale pidfile for {id}: {e}");
                }
                None
            }
        }
    }

    /// Run an external command, splitting failures into "could not run"
    /// (transient) and "ran and refused" (fatal, with stderr attached).
    fn run_tool(&self, program: &str, args: &[String]) -> HypervisorResult<()> {
        let output = duct::cmd(program, args)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|e| HypervisorError::Transient(format!("{program} did not run: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(HypervisorError::Fatal(format!(
                "{program} failed: {}",
                stderr.trim()
            )))
        }
    }
}

impl Hypervisor for QemuHypervisor {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn create(&self, name: &str, shape: &MachineShape) -> HypervisorResult<CreatedVm> {
        if shape.cpu == 0 || shape.memory_mb == 0 || shape.disk_gb == 0 {
            return Err(HypervisorError::Fatal(format!(
                "malformed shape: cpu={} memory_mb={} disk_gb={}",
                shape.cpu, shape.memory_mb, shape.disk_gb
            )));
        }

        let id = format!("vm-{}", Uuid::new_v4().simple());
        let dir = self.vm_dir(&id);
        fs::create_dir_all(&dir).map_err(|e| {
            HypervisorError::Transient(format!("cannot create VM dir {}: {e}", dir.display()))
        })?;

        let disk = dir.join(DISK_FILE);
        self.run_tool(
            QEMU_IMG,
            &[
                "create".into(),
                "-f".into(),
                "qcow2".into(),
                disk.display().to_string(),
                format!("{}G", shape.disk_gb),
            ],
        )?;

        self.write_manifest(
            &id,
            &Manifest {
                name: name.to_string(),
                cpu: shape.cpu,
                memory_mb: shape.memory_mb,
                disk_gb: shape.disk_gb,
            },
        )?;

        info!(backend_id = %id, name, "created qemu VM");
        Ok(CreatedVm {
            id,
            state: PowerState::Stopped,
        })
    }

    fn start(&self, backend_id: &str) -> HypervisorResult<()> {
        let manifest = self.read_manifest(backend_id)?;
        if self.running_pid(backend_id).is_some() {
            return Ok(());
        }

        let dir = self.vm_dir(backend_id);
        let disk = dir.join(DISK_FILE);
        let pidfile = dir.join(PID_FILE);

        let output = duct::cmd(
            QEMU_SYSTEM,
            [
                "-name".to_string(),
                manifest.name.clone(),
                "-smp".into(),
                manifest.cpu.to_string(),
                "-m".into(),
                format!("{}M", manifest.memory_mb),
                "-drive".into(),
                format!("file={},format=qcow2,if=virtio", disk.display()),
                "-display".into(),
                "none".into(),
                "-daemonize".into(),
                "-pidfile".into(),
                pidfile.display().to_string(),
            ],
        )
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .map_err(|e| HypervisorError::Transient(format!("{QEMU_SYSTEM} did not run: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::Transient(format!(
                "qemu failed to launch {backend_id}: {}",
                stderr.trim()
            )));
        }

        info!(backend_id, "started qemu VM");
        Ok(())
    }

    fn stop(&self, backend_id: &str) -> HypervisorResult<()> {
        self.read_manifest(backend_id)?;

        let Some(pid) = self.running_pid(backend_id) else {
            return Ok(());
        };

        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(HypervisorError::Transient(format!(
                    "cannot signal qemu pid {pid}: {e}"
                )));
            }
        }

        let pidfile = self.vm_dir(backend_id).join(PID_FILE);
        if let Err(e) = fs::remove_file(&pidfile) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove pidfile for {backend_id}: {e}");
            }
        }

        info!(backend_id, "stopped qemu VM");
        Ok(())
    }

    fn resize(&self, backend_id: &str, shape: &MachineShape) -> HypervisorResult<()> {
        let mut manifest = self.read_manifest(backend_id)?;

        if self.running_pid(backend_id).is_some() {
            return Err(HypervisorError::Unsupported(format!(
                "{backend_id} is running; resize requires a stopped VM"
            )));
        }
        if shape.cpu == 0 || shape.memory_mb == 0 || shape.disk_gb == 0 {
            return Err(HypervisorError::Fatal(format!(
                "malformed shape: cpu={} memory_mb={} disk_gb={}",
                shape.cpu, shape.memory_mb, shape.disk_gb
            )));
        }
        if shape.disk_gb < manifest.disk_gb {
            return Err(HypervisorError::Unsupported(format!(
                "qcow2 disks cannot shrink ({} -> {} GB)",
                manifest.disk_gb, shape.disk_gb
            )));
        }

        if shape.disk_gb > manifest.disk_gb {
            let disk = self.vm_dir(backend_id).join(DISK_FILE);
            self.run_tool(
                QEMU_IMG,
                &[
                    "resize".into(),
                    disk.display().to_string(),
                    format!("{}G", shape.disk_gb),
                ],
            )?;
        }

        manifest.cpu = shape.cpu;
        manifest.memory_mb = shape.memory_mb;
        manifest.disk_gb = shape.disk_gb;
        self.write_manifest(backend_id, &manifest)?;

        info!(backend_id, cpu = shape.cpu, memory_mb = shape.memory_mb, disk_gb = shape.disk_gb, "resized qemu VM");
        Ok(())
    }

    fn delete(&self, backend_id: &str) -> HypervisorResult<()> {
        let dir = self.vm_dir(backend_id);
        if !dir.exists() {
            // Already gone; the desired end state holds.
            return Ok(());
        }

        if let Some(pid) = self.running_pid(backend_id) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                if e != Errno::ESRCH {
                    return Err(HypervisorError::Transient(format!(
                        "cannot kill qemu pid {pid}: {e}"
                    )));
                }
            }
        }

        fs::remove_dir_all(&dir).map_err(|e| {
            HypervisorError::Transient(format!("cannot remove VM dir {}: {e}", dir.display()))
        })?;

        info!(backend_id, "deleted qemu VM");
        Ok(())
    }
}
