#![allow(clippy::module_name_repetitions)]
//! kapsule: Incus-backed desktop containers.
//!
//! - `pipeline`: ordered, fail-fast step pipelines
//! - `container`: the create / post-create / user-setup pipelines and `ContainerService`
//! - `bridge`: host socket bind mounts into running containers
//! - `operations`: tracked long-running calls and their progress events
//! - `hypervisor`: the hypervisor contract and its Incus adapter

pub mod bridge;
pub mod color;
pub mod config;
pub mod container;
pub mod doctor;
pub mod errors;
pub mod hypervisor;
pub mod operations;
pub mod options;
pub mod pipeline;
pub mod telemetry;
pub mod ui;
pub mod util;

pub use bridge::{BridgeOutcome, EnvMap, RuntimeBridge};
pub use color::{color_enabled_stderr, color_enabled_stdout, paint, set_color_mode, ColorMode};
pub use config::{ServiceSettings, UserConfig};
pub use container::{Backend, ContainerService, ContainerSummary, HostUser};
pub use errors::{exit_code_for_error, HypervisorError, KapsuleError, Result};
pub use hypervisor::{Hypervisor, IncusClient};
pub use operations::{OperationEvent, OperationTracker, ProgressReporter};
pub use options::{apply_assignment, parse_options, ContainerOptions, OptionValidationError};
pub use pipeline::{Pipeline, PipelineBuilder, Step, StepOutcome};
pub use util::{CommandRunner, ExecOutput, ExecRequest, ProcessRunner};
