#![allow(clippy::module_name_repetitions)]
//! User configuration (layered YAML files) and service settings (environment).
//!
//! User configuration layers, highest priority first:
//! 1. `~/.config/kapsule/kapsule.yaml` (or `$KAPSULE_CONFIG` when set)
//! 2. `/etc/kapsule/kapsule.yaml`
//! 3. `/usr/lib/kapsule/kapsule.yaml`
//! 4. built-in defaults
//!
//! Each key is taken from the first layer that sets it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{KapsuleError, Result};

pub const DEFAULT_CONTAINER: &str = "kapsule";
pub const DEFAULT_IMAGE: &str = "images:archlinux";

const SYSTEM_CONFIG: &str = "/etc/kapsule/kapsule.yaml";
const PACKAGE_CONFIG: &str = "/usr/lib/kapsule/kapsule.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserConfig {
    pub default_container: String,
    pub default_image: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            default_container: DEFAULT_CONTAINER.to_string(),
            default_image: DEFAULT_IMAGE.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigLayer {
    default_container: Option<String>,
    default_image: Option<String>,
}

impl UserConfig {
    /// Config file paths for a user with the given home directory, highest priority first.
    pub fn layer_paths(home: Option<&Path>) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        match std::env::var("KAPSULE_CONFIG") {
            Ok(p) if !p.trim().is_empty() => paths.push(PathBuf::from(p.trim())),
            _ => {
                if let Some(h) = home {
                    paths.push(h.join(".config").join("kapsule").join("kapsule.yaml"));
                }
            }
        }
        paths.push(PathBuf::from(SYSTEM_CONFIG));
        paths.push(PathBuf::from(PACKAGE_CONFIG));
        paths
    }

    /// Load configuration for the user owning `home` (defaults to the current user).
    pub fn load(home: Option<&Path>) -> Result<Self> {
        let home = home.map(Path::to_path_buf).or_else(home::home_dir);
        Self::load_from(&Self::layer_paths(home.as_deref()))
    }

    /// Merge the given files, highest priority first. Missing files are skipped.
    pub fn load_from(paths: &[PathBuf]) -> Result<Self> {
        let mut default_container = None;
        let mut default_image = None;
        for path in paths {
            let Some(layer) = read_layer(path)? else {
                continue;
            };
            default_container = default_container.or(layer.default_container);
            default_image = default_image.or(layer.default_image);
        }
        let defaults = Self::default();
        Ok(Self {
            default_container: default_container
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.default_container),
            default_image: default_image
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.default_image),
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "default_container" => Some(&self.default_container),
            "default_image" => Some(&self.default_image),
            _ => None,
        }
    }

    pub fn entries(&self) -> [(&'static str, &str); 2] {
        [
            ("default_container", &self.default_container),
            ("default_image", &self.default_image),
        ]
    }
}

fn read_layer(path: &Path) -> Result<Option<ConfigLayer>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(KapsuleError::Config(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )))
        }
    };
    if content.trim().is_empty() {
        return Ok(Some(ConfigLayer::default()));
    }
    serde_yaml::from_str(&content)
        .map(Some)
        .map_err(|e| KapsuleError::Config(format!("cannot parse {}: {}", path.display(), e)))
}

/// Runtime settings for the provisioning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub incus_socket: PathBuf,
    pub incus_bin: String,
    pub nsenter_bin: String,
    pub incus_timeout: Duration,
    pub command_timeout: Duration,
    pub nvidia_hook: PathBuf,
    /// Host directory holding per-user runtime dirs (`/run/user`).
    pub host_runtime_root: PathBuf,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            incus_socket: PathBuf::from("/var/lib/incus/unix.socket"),
            incus_bin: "incus".to_string(),
            nsenter_bin: "nsenter".to_string(),
            incus_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(120),
            nvidia_hook: PathBuf::from("/usr/lib/kapsule/nvidia-container-hook.sh"),
            host_runtime_root: PathBuf::from("/run/user"),
        }
    }
}

impl ServiceSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build settings from an arbitrary variable lookup; empty values mean unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let duration = |k: &str, default: Duration| -> Result<Duration> {
            match get(k) {
                None => Ok(default),
                Some(v) => humantime::parse_duration(&v)
                    .map_err(|e| KapsuleError::Config(format!("invalid {k} '{v}': {e}"))),
            }
        };

        let d = Self::default();
        Ok(Self {
            incus_socket: get("KAPSULE_INCUS_SOCKET").map(PathBuf::from).unwrap_or(d.incus_socket),
            incus_bin: get("KAPSULE_INCUS_BIN").unwrap_or(d.incus_bin),
            nsenter_bin: get("KAPSULE_NSENTER_BIN").unwrap_or(d.nsenter_bin),
            incus_timeout: duration("KAPSULE_INCUS_TIMEOUT", d.incus_timeout)?,
            command_timeout: duration("KAPSULE_COMMAND_TIMEOUT", d.command_timeout)?,
            nvidia_hook: get("KAPSULE_NVIDIA_HOOK").map(PathBuf::from).unwrap_or(d.nvidia_hook),
            host_runtime_root: get("KAPSULE_HOST_RUNTIME_ROOT")
                .map(PathBuf::from)
                .unwrap_or(d.host_runtime_root),
        })
    }

    /// Host runtime directory of `uid` (`/run/user/<uid>`).
    pub fn host_runtime_dir(&self, uid: u32) -> PathBuf {
        self.host_runtime_root.join(uid.to_string())
    }
}
