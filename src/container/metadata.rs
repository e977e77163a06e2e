//! Typed view of the `user.kapsule.*` keys persisted in instance config.
//!
//! The pipelines work with `ContainerMetadata`; conversion to and from the string map
//! happens only where config is sent to or read from the hypervisor.

use std::collections::BTreeSet;
use std::fmt;

use super::constants::{
    user_mapped_key, CUSTOM_MOUNTS_KEY, DBUS_MUX_KEY, GPU_KEY, HOST_ROOTFS_KEY, MOUNT_HOME_KEY,
    NVIDIA_DRIVERS_KEY, SESSION_MODE_KEY,
};
use crate::hypervisor::ConfigMap;
use crate::options::ContainerOptions;

const MAPPED_PREFIX: &str = "user.kapsule.host-users.";
const MAPPED_SUFFIX: &str = ".mapped";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerMode {
    Default,
    Session,
    DbusMux,
}

impl ContainerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerMode::Default => "Default",
            ContainerMode::Session => "Session",
            ContainerMode::DbusMux => "DbusMux",
        }
    }
}

impl fmt::Display for ContainerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMetadata {
    pub session_mode: bool,
    pub dbus_mux: bool,
    pub host_rootfs: bool,
    pub mount_home: bool,
    pub custom_mounts: Vec<String>,
    pub gpu: bool,
    pub nvidia_drivers: bool,
    pub mapped_users: BTreeSet<u32>,
    /// Raw custom-mounts value that failed to parse, if any.
    pub invalid_custom_mounts: Option<String>,
}

fn bool_str(b: bool) -> String {
    if b { "true" } else { "false" }.to_string()
}

impl ContainerMetadata {
    pub fn from_options(opts: &ContainerOptions) -> Self {
        Self {
            session_mode: opts.session_mode(),
            dbus_mux: opts.dbus_mux(),
            host_rootfs: opts.host_rootfs(),
            mount_home: opts.mount_home(),
            custom_mounts: opts.custom_mounts().to_vec(),
            gpu: opts.gpu(),
            nvidia_drivers: opts.gpu() && opts.nvidia_drivers(),
            mapped_users: BTreeSet::new(),
            invalid_custom_mounts: None,
        }
    }

    /// Read metadata back from instance config.
    ///
    /// Missing flags read as `false`, except `mount-home` which defaults to `true`.
    pub fn from_config(config: &ConfigMap) -> Self {
        let flag = |key: &str| config.get(key).map(String::as_str) == Some("true");

        let (custom_mounts, invalid_custom_mounts) = match config.get(CUSTOM_MOUNTS_KEY) {
            None => (Vec::new(), None),
            Some(raw) if raw.is_empty() => (Vec::new(), None),
            Some(raw) => match serde_json::from_str::<Vec<String>>(raw) {
                Ok(list) => (list, None),
                Err(_) => (Vec::new(), Some(raw.clone())),
            },
        };

        let mapped_users = config
            .iter()
            .filter(|(_, v)| v.as_str() == "true")
            .filter_map(|(k, _)| {
                k.strip_prefix(MAPPED_PREFIX)?
                    .strip_suffix(MAPPED_SUFFIX)?
                    .parse::<u32>()
                    .ok()
            })
            .collect();

        Self {
            session_mode: flag(SESSION_MODE_KEY),
            dbus_mux: flag(DBUS_MUX_KEY),
            host_rootfs: flag(HOST_ROOTFS_KEY),
            mount_home: config
                .get(MOUNT_HOME_KEY)
                .map(|v| v == "true")
                .unwrap_or(true),
            custom_mounts,
            gpu: flag(GPU_KEY),
            nvidia_drivers: flag(NVIDIA_DRIVERS_KEY),
            mapped_users,
            invalid_custom_mounts,
        }
    }

    /// Serialize into config keys. Session flags are only written when set.
    pub fn write_config(&self, config: &mut ConfigMap) {
        if self.session_mode {
            config.insert(SESSION_MODE_KEY.to_string(), bool_str(true));
        }
        if self.dbus_mux {
            config.insert(DBUS_MUX_KEY.to_string(), bool_str(true));
        }
        config.insert(HOST_ROOTFS_KEY.to_string(), bool_str(self.host_rootfs));
        config.insert(MOUNT_HOME_KEY.to_string(), bool_str(self.mount_home));
        if !self.custom_mounts.is_empty() {
            // A Vec<String> always serializes.
            if let Ok(raw) = serde_json::to_string(&self.custom_mounts) {
                config.insert(CUSTOM_MOUNTS_KEY.to_string(), raw);
            }
        }
        config.insert(GPU_KEY.to_string(), bool_str(self.gpu));
        config.insert(NVIDIA_DRIVERS_KEY.to_string(), bool_str(self.nvidia_drivers));
        for uid in &self.mapped_users {
            config.insert(user_mapped_key(*uid), bool_str(true));
        }
    }

    pub fn mode(&self) -> ContainerMode {
        if self.dbus_mux {
            ContainerMode::DbusMux
        } else if self.session_mode {
            ContainerMode::Session
        } else {
            ContainerMode::Default
        }
    }

    pub fn is_user_mapped(&self, uid: u32) -> bool {
        self.mapped_users.contains(&uid)
    }
}
