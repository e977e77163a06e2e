//! The `kapsule-base` profile: content, identity hash, and sync.
//!
//! The hash is stored in the profile config so a stale profile is detected by a
//! single string comparison.

use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::info;

use super::{device, ConfigMap, DeviceMap, Hypervisor, Profile};
use crate::container::constants::{HOST_MOUNT_ROOT, PROFILE_HASH_KEY, RAW_LXC_HOST_NETWORK};
use crate::errors::{HypervisorResultExt, KapsuleError, Result};

pub const BASE_PROFILE_NAME: &str = "kapsule-base";

const DESCRIPTION: &str = "Kapsule base profile - privileged container with host integration";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSyncResult {
    Created,
    Updated,
    Unchanged,
}

impl ProfileSyncResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ProfileSyncResult::Created => "created",
            ProfileSyncResult::Updated => "updated",
            ProfileSyncResult::Unchanged => "unchanged",
        }
    }
}

/// Key/value separators `", "` and `": "`, keys sorted by the maps themselves.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

/// First 16 hex chars of SHA-256 over the canonical JSON of the profile content.
pub fn profile_hash(config: &ConfigMap, devices: &DeviceMap, description: &str) -> Result<String> {
    // serde_json's default Map is ordered by key, so nesting is canonical.
    let canonical = json!({ "config": config, "description": description, "devices": devices });
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    canonical
        .serialize(&mut ser)
        .map_err(|e| KapsuleError::Internal(format!("cannot encode profile: {e}")))?;
    let digest = Sha256::digest(&buf);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok(hex[..16].to_string())
}

/// The desired `kapsule-base` profile, hash included.
pub fn build_profile() -> Result<Profile> {
    let mut config = ConfigMap::new();
    config.insert("security.privileged".to_string(), "true".to_string());
    config.insert("security.nesting".to_string(), "true".to_string());
    config.insert("raw.lxc".to_string(), RAW_LXC_HOST_NETWORK.to_string());

    let mut devices = DeviceMap::new();
    devices.insert(
        "root".to_string(),
        device([("type", "disk"), ("path", "/"), ("pool", "default")]),
    );
    devices.insert("gpu".to_string(), device([("type", "gpu")]));
    devices.insert(
        "hostfs".to_string(),
        device([
            ("type", "disk"),
            ("source", "/"),
            ("path", HOST_MOUNT_ROOT),
            ("propagation", "rslave"),
            ("recursive", "true"),
            ("shift", "false"),
        ]),
    );

    let hash = profile_hash(&config, &devices, DESCRIPTION)?;
    config.insert(PROFILE_HASH_KEY.to_string(), hash);

    Ok(Profile {
        name: BASE_PROFILE_NAME.to_string(),
        description: DESCRIPTION.to_string(),
        config,
        devices,
    })
}

/// Create the base profile, or update it when its stored hash differs.
pub async fn ensure_base_profile(hv: &dyn Hypervisor) -> Result<ProfileSyncResult> {
    let desired = build_profile()?;

    let exists = hv
        .profile_exists(BASE_PROFILE_NAME)
        .await
        .context("Failed to query profiles")?;
    if !exists {
        hv.create_profile(&desired)
            .await
            .context("Failed to create profile")?;
        info!(profile = BASE_PROFILE_NAME, "profile created");
        return Ok(ProfileSyncResult::Created);
    }

    let existing = hv
        .get_profile(BASE_PROFILE_NAME)
        .await
        .context("Failed to read profile")?;
    if existing.config.get(PROFILE_HASH_KEY) == desired.config.get(PROFILE_HASH_KEY) {
        return Ok(ProfileSyncResult::Unchanged);
    }

    hv.update_profile(&desired)
        .await
        .context("Failed to update profile")?;
    info!(profile = BASE_PROFILE_NAME, "profile updated");
    Ok(ProfileSyncResult::Updated)
}
