use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_hypervisor")]
    pub hypervisor: String,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    std::env::var("VMM_API_BIND").unwrap_or_else(|_| "0.0.0.0:1270".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("VMM_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".vmm").join("vmm.db")
}

fn default_hypervisor() -> String {
    std::env::var("VMM_HYPERVISOR").unwrap_or_else(|_| "qemu".to_string())
}

fn default_state_dir() -> PathBuf {
    if let Ok(path) = std::env::var("VMM_STATE_DIR") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".vmm").join("machines")
}

fn default_backend_timeout() -> u64 {
    std::env::var("VMM_BACKEND_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            hypervisor: default_hypervisor(),
            state_dir: default_state_dir(),
            backend_timeout_secs: default_backend_timeout(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}
