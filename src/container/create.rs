//! Steps of the `create` pipeline: everything up to materializing the instance.

use std::path::Path;

use async_trait::async_trait;

use super::constants::{image_server_url, DEFAULT_IMAGE_SERVER, HOST_MOUNT_ROOT, RAW_LXC_HOST_NETWORK};
use super::context::CreateContext;
use super::metadata::ContainerMetadata;
use crate::errors::{HypervisorResultExt, KapsuleError, Result};
use crate::hypervisor::{device, ConfigMap, DeviceMap, InstanceSource, InstanceSpec};
use crate::pipeline::{PipelineBuilder, Step, StepOutcome};

pub fn register(p: &mut PipelineBuilder<CreateContext>) {
    p.step_at(-500, ValidateNotExists)
        .step_at(-400, ParseImageSource)
        .step_at(-300, BuildBaseConfig)
        .step_at(-200, StoreOptions)
        .step_at(-100, BuildDevices)
        .step_at(0, CreateInstance);
}

/// Resolve `server:alias` (or a bare alias on the default server).
pub fn parse_image_source(image: &str) -> Result<InstanceSource> {
    let invalid = || KapsuleError::precondition(format!("Invalid image format: {image}"));
    let (server, alias) = image
        .split_once(':')
        .unwrap_or((DEFAULT_IMAGE_SERVER, image));
    if alias.is_empty() {
        return Err(invalid());
    }
    let url = image_server_url(server).ok_or_else(invalid)?;
    Ok(InstanceSource::simplestreams(url, alias))
}

/// Isolation and networking config; registers the NVIDIA mount hook when requested
/// and the hook script exists on the host.
pub fn base_config(nvidia_drivers: bool, hook: &Path) -> ConfigMap {
    let mut raw_lxc = RAW_LXC_HOST_NETWORK.to_string();
    if nvidia_drivers && hook.is_file() {
        raw_lxc.push_str(&format!("lxc.hook.mount={}\n", hook.display()));
    }
    let mut config = ConfigMap::new();
    config.insert("security.privileged".to_string(), "true".to_string());
    config.insert("security.nesting".to_string(), "true".to_string());
    config.insert("raw.lxc".to_string(), raw_lxc);
    config
}

/// Root disk, plus GPU passthrough and the host filesystem mount when enabled.
pub fn base_devices(host_rootfs: bool, gpu: bool) -> DeviceMap {
    let mut devices = DeviceMap::new();
    devices.insert(
        "root".to_string(),
        device([("type", "disk"), ("path", "/"), ("pool", "default")]),
    );
    if gpu {
        devices.insert("gpu".to_string(), device([("type", "gpu")]));
    }
    if host_rootfs {
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
    }
    devices
}

/// Reads `name`.
struct ValidateNotExists;

#[async_trait]
impl Step<CreateContext> for ValidateNotExists {
    fn name(&self) -> &'static str {
        "validate_not_exists"
    }

    async fn run(&self, ctx: &mut CreateContext) -> Result<StepOutcome> {
        let exists = ctx
            .backend
            .hypervisor
            .instance_exists(&ctx.name)
            .await
            .context("Failed to query container")?;
        if exists {
            return Err(KapsuleError::precondition(format!(
                "Container '{}' already exists",
                ctx.name
            )));
        }
        Ok(StepOutcome::Done)
    }
}

/// Reads `image`; writes `source`.
struct ParseImageSource;

#[async_trait]
impl Step<CreateContext> for ParseImageSource {
    fn name(&self) -> &'static str {
        "parse_image_source"
    }

    async fn run(&self, ctx: &mut CreateContext) -> Result<StepOutcome> {
        ctx.source = Some(parse_image_source(&ctx.image)?);
        Ok(StepOutcome::Done)
    }
}

/// Reads `options`; writes `config`.
struct BuildBaseConfig;

#[async_trait]
impl Step<CreateContext> for BuildBaseConfig {
    fn name(&self) -> &'static str {
        "build_base_config"
    }

    async fn run(&self, ctx: &mut CreateContext) -> Result<StepOutcome> {
        let gpu = ctx.options.gpu();
        let nvidia = gpu && ctx.options.nvidia_drivers();
        let hook = &ctx.backend.settings.nvidia_hook;
        ctx.config = base_config(nvidia, hook);

        ctx.progress.info(format!("Image: {}", ctx.image));
        if !gpu {
            ctx.progress.info("GPU passthrough: disabled");
        } else if !ctx.options.nvidia_drivers() {
            ctx.progress.info("NVIDIA driver injection: disabled");
        }
        let hook_line = format!("lxc.hook.mount={}", hook.display());
        if ctx
            .config
            .get("raw.lxc")
            .is_some_and(|raw| raw.contains(&hook_line))
        {
            ctx.progress
                .dim("NVIDIA userspace drivers will be injected on start");
        }
        Ok(StepOutcome::Done)
    }
}

/// Reads `options`; writes `user.kapsule.*` keys into `config`.
struct StoreOptions;

#[async_trait]
impl Step<CreateContext> for StoreOptions {
    fn name(&self) -> &'static str {
        "store_options"
    }

    async fn run(&self, ctx: &mut CreateContext) -> Result<StepOutcome> {
        ContainerMetadata::from_options(&ctx.options).write_config(&mut ctx.config);
        Ok(StepOutcome::Done)
    }
}

/// Reads `options`; writes `devices`.
struct BuildDevices;

#[async_trait]
impl Step<CreateContext> for BuildDevices {
    fn name(&self) -> &'static str {
        "build_devices"
    }

    async fn run(&self, ctx: &mut CreateContext) -> Result<StepOutcome> {
        ctx.devices = base_devices(ctx.options.host_rootfs(), ctx.options.gpu());
        Ok(StepOutcome::Done)
    }
}

/// Reads `name`, `source`, `config`, `devices`; writes `created`.
struct CreateInstance;

#[async_trait]
impl Step<CreateContext> for CreateInstance {
    fn name(&self) -> &'static str {
        "create_instance"
    }

    async fn run(&self, ctx: &mut CreateContext) -> Result<StepOutcome> {
        let source = ctx
            .source
            .clone()
            .ok_or_else(|| KapsuleError::Internal("image source was not resolved".to_string()))?;
        ctx.progress.info("Downloading image and creating container...");

        let spec = InstanceSpec {
            name: ctx.name.clone(),
            kind: "container".to_string(),
            profiles: Vec::new(),
            source,
            start: true,
            config: ctx.config.clone(),
            devices: ctx.devices.clone(),
        };
        let outcome = ctx
            .backend
            .hypervisor
            .create_instance(&spec)
            .await
            .context("Failed to create container")?;
        if !outcome.is_success() {
            return Err(KapsuleError::failed(format!(
                "Creation failed: {}",
                outcome.reason()
            )));
        }
        ctx.created = true;
        Ok(StepOutcome::Done)
    }
}
