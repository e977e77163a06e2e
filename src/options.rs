#![allow(clippy::module_name_repetitions)]
//! Container creation option schema and validation.
//!
//! The schema is the external contract: clients fetch it as JSON, render it, and send
//! back a flat `key -> value` map holding only the keys the user set. `parse_options`
//! turns that map into an immutable `ContainerOptions`.
//!
//! Validation order:
//! 1. reject unknown keys;
//! 2. fill missing keys from schema defaults;
//! 3. type-check every value (and every array item);
//! 4. apply implications (`dbus_mux` forces `session_mode`);
//! 5. enforce hard dependencies and `requires` constraints.

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::util::parse_bool;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Boolean,
    String,
    Array,
}

impl OptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            OptionType::Boolean => "boolean",
            OptionType::String => "string",
            OptionType::Array => "array",
        }
    }

    fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (OptionType::Boolean, Value::Bool(_))
                | (OptionType::String, Value::String(_))
                | (OptionType::Array, Value::Array(_))
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemSpec {
    #[serde(rename = "type")]
    pub kind: OptionType,
    pub format: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionSpec {
    pub key: &'static str,
    #[serde(rename = "type")]
    pub kind: OptionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<ItemSpec>,
    pub title: &'static str,
    pub description: &'static str,
    pub default: Value,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub requires: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaSection {
    pub id: &'static str,
    pub title: &'static str,
    pub options: Vec<OptionSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSchema {
    pub version: u32,
    pub sections: Vec<SchemaSection>,
}

impl CreateSchema {
    /// Options in display order.
    pub fn options(&self) -> impl Iterator<Item = &OptionSpec> {
        self.sections.iter().flat_map(|s| s.options.iter())
    }

    pub fn option(&self, key: &str) -> Option<&OptionSpec> {
        self.options().find(|o| o.key == key)
    }
}

fn boolean(
    key: &'static str,
    title: &'static str,
    description: &'static str,
    default: bool,
) -> OptionSpec {
    OptionSpec {
        key,
        kind: OptionType::Boolean,
        items: None,
        title,
        description,
        default: Value::Bool(default),
        requires: Map::new(),
    }
}

fn requiring(mut spec: OptionSpec, prerequisite: &str, value: bool) -> OptionSpec {
    spec.requires
        .insert(prerequisite.to_string(), Value::Bool(value));
    spec
}

pub static CREATE_SCHEMA: Lazy<CreateSchema> = Lazy::new(|| CreateSchema {
    version: SCHEMA_VERSION,
    sections: vec![
        SchemaSection {
            id: "dbus",
            title: "D-Bus Integration",
            options: vec![
                boolean(
                    "session_mode",
                    "Session Mode",
                    "Container gets its own D-Bus session bus",
                    false,
                ),
                requiring(
                    boolean(
                        "dbus_mux",
                        "D-Bus Multiplexer",
                        "Enable D-Bus multiplexer for hybrid host/container access (implies Session Mode)",
                        false,
                    ),
                    "session_mode",
                    true,
                ),
            ],
        },
        SchemaSection {
            id: "mounts",
            title: "Host Mounts",
            options: vec![
                boolean(
                    "host_rootfs",
                    "Mount Host Filesystem",
                    "Mount entire host rootfs at /.kapsule/host",
                    true,
                ),
                boolean(
                    "mount_home",
                    "Mount Home Directory",
                    "Mount the user's home directory in the container",
                    true,
                ),
                OptionSpec {
                    key: "custom_mounts",
                    kind: OptionType::Array,
                    items: Some(ItemSpec {
                        kind: OptionType::String,
                        format: "directory-path",
                    }),
                    title: "Additional Mounts",
                    description: "Extra host directories to mount in the container",
                    default: Value::Array(Vec::new()),
                    requires: Map::new(),
                },
            ],
        },
        SchemaSection {
            id: "gpu",
            title: "GPU",
            options: vec![
                boolean(
                    "gpu",
                    "GPU Passthrough",
                    "Pass through GPU devices to the container",
                    true,
                ),
                requiring(
                    boolean(
                        "nvidia_drivers",
                        "NVIDIA Driver Injection",
                        "Inject host NVIDIA userspace drivers on each start",
                        false,
                    ),
                    "gpu",
                    true,
                ),
            ],
        },
    ],
});

/// Compact JSON rendering of the schema, as served to clients.
pub fn create_schema_json() -> serde_json::Result<String> {
    serde_json::to_string(&*CREATE_SCHEMA)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OptionValidationError {
    #[error("Unknown options: {}", .0.join(", "))]
    UnknownOptions(Vec<String>),

    #[error("Option '{key}' must be {expected}, got {actual}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{key}[{index}] must be a string, got {actual}")]
    WrongItemType {
        key: String,
        index: usize,
        actual: &'static str,
    },

    #[error("D-Bus multiplexer requires host_rootfs (the mux binary is accessed via the host filesystem mount)")]
    MuxRequiresHostRootfs,

    #[error("{key} requires {prerequisite} to be {state}")]
    Requires {
        key: String,
        prerequisite: String,
        state: &'static str,
    },

    #[error("Invalid value for option '{key}': {value}")]
    InvalidValue { key: String, value: String },

    #[error("Expected key=value, got '{0}'")]
    InvalidAssignment(String),
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validated container creation options. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOptions {
    session_mode: bool,
    dbus_mux: bool,
    host_rootfs: bool,
    mount_home: bool,
    custom_mounts: Vec<String>,
    gpu: bool,
    nvidia_drivers: bool,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            session_mode: false,
            dbus_mux: false,
            host_rootfs: true,
            mount_home: true,
            custom_mounts: Vec::new(),
            gpu: true,
            nvidia_drivers: false,
        }
    }
}

impl ContainerOptions {
    pub fn session_mode(&self) -> bool {
        self.session_mode
    }

    pub fn dbus_mux(&self) -> bool {
        self.dbus_mux
    }

    pub fn host_rootfs(&self) -> bool {
        self.host_rootfs
    }

    pub fn mount_home(&self) -> bool {
        self.mount_home
    }

    pub fn custom_mounts(&self) -> &[String] {
        &self.custom_mounts
    }

    pub fn gpu(&self) -> bool {
        self.gpu
    }

    pub fn nvidia_drivers(&self) -> bool {
        self.nvidia_drivers
    }

    fn flag(&self, key: &str) -> Option<bool> {
        match key {
            "session_mode" => Some(self.session_mode),
            "dbus_mux" => Some(self.dbus_mux),
            "host_rootfs" => Some(self.host_rootfs),
            "mount_home" => Some(self.mount_home),
            "gpu" => Some(self.gpu),
            "nvidia_drivers" => Some(self.nvidia_drivers),
            _ => None,
        }
    }
}

/// Parse and validate a raw option map into `ContainerOptions`.
pub fn parse_options(raw: &Map<String, Value>) -> Result<ContainerOptions, OptionValidationError> {
    let schema = &*CREATE_SCHEMA;

    let mut unknown: Vec<String> = raw
        .keys()
        .filter(|k| schema.option(k).is_none())
        .cloned()
        .collect();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(OptionValidationError::UnknownOptions(unknown));
    }

    let mut merged: Map<String, Value> = Map::new();
    for spec in schema.options() {
        let value = raw.get(spec.key).unwrap_or(&spec.default);
        if !spec.kind.matches(value) {
            return Err(OptionValidationError::WrongType {
                key: spec.key.to_string(),
                expected: spec.kind.as_str(),
                actual: json_type_name(value),
            });
        }
        if let (Some(items), Value::Array(list)) = (&spec.items, value) {
            for (index, item) in list.iter().enumerate() {
                if !items.kind.matches(item) {
                    return Err(OptionValidationError::WrongItemType {
                        key: spec.key.to_string(),
                        index,
                        actual: json_type_name(item),
                    });
                }
            }
        }
        merged.insert(spec.key.to_string(), value.clone());
    }

    let flag = |key: &str| merged.get(key).and_then(Value::as_bool).unwrap_or(false);
    let custom_mounts = merged
        .get("custom_mounts")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let dbus_mux = flag("dbus_mux");
    let opts = ContainerOptions {
        session_mode: flag("session_mode") || dbus_mux,
        dbus_mux,
        host_rootfs: flag("host_rootfs"),
        mount_home: flag("mount_home"),
        custom_mounts,
        gpu: flag("gpu"),
        nvidia_drivers: flag("nvidia_drivers"),
    };

    if opts.dbus_mux && !opts.host_rootfs {
        return Err(OptionValidationError::MuxRequiresHostRootfs);
    }

    for spec in schema.options() {
        if opts.flag(spec.key) != Some(true) {
            continue;
        }
        for (prerequisite, wanted) in &spec.requires {
            let wanted = wanted.as_bool().unwrap_or(true);
            if opts.flag(prerequisite) != Some(wanted) {
                return Err(OptionValidationError::Requires {
                    key: spec.key.to_string(),
                    prerequisite: prerequisite.clone(),
                    state: if wanted { "enabled" } else { "disabled" },
                });
            }
        }
    }

    Ok(opts)
}

/// Apply one command-line `key=value` assignment to a raw option map.
///
/// Values are coerced by the schema type; array options accumulate.
pub fn apply_assignment(
    raw: &mut Map<String, Value>,
    assignment: &str,
) -> Result<(), OptionValidationError> {
    let (key, value) = assignment
        .split_once('=')
        .ok_or_else(|| OptionValidationError::InvalidAssignment(assignment.to_string()))?;
    let key = key.trim();
    let spec = CREATE_SCHEMA
        .option(key)
        .ok_or_else(|| OptionValidationError::UnknownOptions(vec![key.to_string()]))?;

    match spec.kind {
        OptionType::Boolean => {
            let b = parse_bool(value).ok_or_else(|| OptionValidationError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            })?;
            raw.insert(key.to_string(), Value::Bool(b));
        }
        OptionType::String => {
            raw.insert(key.to_string(), Value::String(value.to_string()));
        }
        OptionType::Array => {
            let entry = raw
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            match entry {
                Value::Array(list) => list.push(Value::String(value.to_string())),
                other => *other = Value::Array(vec![Value::String(value.to_string())]),
            }
        }
    }
    Ok(())
}
