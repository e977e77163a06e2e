#![allow(clippy::module_name_repetitions)]
//! Hypervisor contract consumed by the provisioning pipelines.
//!
//! Only the calls Kapsule needs are modelled. Everything is string-typed the way the
//! hypervisor stores it; typed interpretation happens in `container::metadata`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::HypervisorError;

pub mod incus;
pub mod profile;

pub use incus::IncusClient;
pub use profile::{build_profile, ensure_base_profile, ProfileSyncResult, BASE_PROFILE_NAME};

pub type HypervisorResult<T> = std::result::Result<T, HypervisorError>;

/// Instance configuration: flat string keys to string values.
pub type ConfigMap = BTreeMap<String, String>;
/// Attributes of a single device.
pub type DeviceConfig = BTreeMap<String, String>;
/// Devices keyed by device name.
pub type DeviceMap = BTreeMap<String, DeviceConfig>;

pub const STATUS_RUNNING: &str = "Running";
pub const STATUS_STOPPED: &str = "Stopped";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub devices: DeviceMap,
    #[serde(default)]
    pub created_at: String,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status == STATUS_RUNNING
    }

    /// Human image description as recorded by the hypervisor.
    pub fn image_description(&self) -> &str {
        self.config
            .get("image.description")
            .or_else(|| self.config.get("image.os"))
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

/// Runtime state of an instance.
///
/// `started_at` changes on every boot and serves as the boot identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InstanceState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub pid: Option<i64>,
    #[serde(default)]
    pub started_at: Option<String>,
}

impl InstanceState {
    pub fn boot_identity(&self) -> &str {
        self.started_at.as_deref().unwrap_or("")
    }

    /// Init pid of a running instance; zero or negative means none.
    pub fn init_pid(&self) -> Option<i64> {
        self.pid.filter(|p| *p > 0)
    }
}

/// Where the instance root filesystem comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: String,
    pub server: String,
    pub alias: String,
}

impl InstanceSource {
    pub fn simplestreams(server: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            kind: "image".to_string(),
            protocol: "simplestreams".to_string(),
            server: server.into(),
            alias: alias.into(),
        }
    }
}

/// Creation request for a new container instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub profiles: Vec<String>,
    pub source: InstanceSource,
    pub start: bool,
    pub config: ConfigMap,
    pub devices: DeviceMap,
}

/// Final state of a hypervisor background operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OperationOutcome {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub err: String,
}

impl OperationOutcome {
    pub fn success() -> Self {
        Self {
            status: "Success".to_string(),
            err: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "Success"
    }

    /// Error text, falling back to the status when the error is empty.
    pub fn reason(&self) -> &str {
        if self.err.is_empty() {
            &self.status
        } else {
            &self.err
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub devices: DeviceMap,
}

/// Ownership and permission bits for files created inside an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl FileMode {
    pub const fn new(uid: u32, gid: u32, mode: u32) -> Self {
        Self { uid, gid, mode }
    }

    pub const fn root(mode: u32) -> Self {
        Self::new(0, 0, mode)
    }
}

/// The hypervisor service Kapsule drives. All calls may fail with a `HypervisorError`.
///
/// State-changing calls wait for the hypervisor's background operation to finish
/// and return its outcome.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn list_instances(&self) -> HypervisorResult<Vec<Instance>>;

    async fn instance_exists(&self, name: &str) -> HypervisorResult<bool>;

    async fn get_instance(&self, name: &str) -> HypervisorResult<Instance>;

    async fn get_instance_state(&self, name: &str) -> HypervisorResult<InstanceState>;

    async fn create_instance(&self, spec: &InstanceSpec) -> HypervisorResult<OperationOutcome>;

    async fn start_instance(&self, name: &str) -> HypervisorResult<OperationOutcome>;

    async fn stop_instance(&self, name: &str, force: bool) -> HypervisorResult<OperationOutcome>;

    async fn delete_instance(&self, name: &str) -> HypervisorResult<OperationOutcome>;

    async fn add_instance_device(
        &self,
        name: &str,
        device_name: &str,
        device: &DeviceConfig,
    ) -> HypervisorResult<()>;

    async fn push_file(
        &self,
        name: &str,
        path: &str,
        content: &[u8],
        mode: FileMode,
    ) -> HypervisorResult<()>;

    async fn create_symlink(
        &self,
        name: &str,
        path: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> HypervisorResult<()>;

    async fn mkdir(&self, name: &str, path: &str, mode: FileMode) -> HypervisorResult<()>;

    async fn patch_instance_config(&self, name: &str, patch: &ConfigMap) -> HypervisorResult<()>;

    async fn profile_exists(&self, name: &str) -> HypervisorResult<bool>;

    async fn get_profile(&self, name: &str) -> HypervisorResult<Profile>;

    async fn create_profile(&self, profile: &Profile) -> HypervisorResult<()>;

    async fn update_profile(&self, profile: &Profile) -> HypervisorResult<()>;
}

/// Build a device attribute map from `(key, value)` pairs.
pub fn device<I, K, V>(attrs: I) -> DeviceConfig
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    attrs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_spec_serializes_with_wire_names() {
        let spec = InstanceSpec {
            name: "dev".to_string(),
            kind: "container".to_string(),
            profiles: Vec::new(),
            source: InstanceSource::simplestreams("https://images.linuxcontainers.org", "archlinux"),
            start: true,
            config: ConfigMap::new(),
            devices: DeviceMap::new(),
        };
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v["type"], "container");
        assert_eq!(v["source"]["type"], "image");
        assert_eq!(v["source"]["protocol"], "simplestreams");
    }

    #[test]
    fn state_without_pid_has_no_init_pid() {
        let s: InstanceState = serde_json::from_str(r#"{"status":"Stopped","pid":0}"#).unwrap();
        assert_eq!(s.init_pid(), None);
        assert_eq!(s.boot_identity(), "");
    }

    #[test]
    fn outcome_reason_falls_back_to_status() {
        let o = OperationOutcome {
            status: "Failure".to_string(),
            err: String::new(),
        };
        assert!(!o.is_success());
        assert_eq!(o.reason(), "Failure");
    }
}
