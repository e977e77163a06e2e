//! Steps of the `user_setup` pipeline: make a host user usable inside a container.
//!
//! Home and host-dir mounts, the account and sudo rights are required; custom mounts
//! and linger are best-effort.

use std::path::Path;

use async_trait::async_trait;

use super::constants::{user_mapped_key, HOST_MOUNT_ROOT, X11_SOCKET_DIR};
use super::context::UserSetupContext;
use crate::errors::{HypervisorResultExt, KapsuleError, Result};
use crate::hypervisor::{device, ConfigMap, FileMode};
use crate::pipeline::{PipelineBuilder, Step, StepOutcome};
use crate::util::ExecOutput;

pub fn register(p: &mut PipelineBuilder<UserSetupContext>) {
    p.step_at(100, MountHome)
        .step_at(200, MountCustom)
        .step_at(300, MountHostDirs)
        .step_at(400, CreateAccount)
        .step_at(500, ConfigureSudo)
        .step_at(600, EnableLinger)
        .step_at(900, MarkMapped);
}

/// Device name for a custom mount: `kapsule-mount-` plus the path with `/` and `.` as `-`.
pub fn custom_mount_device_name(path: &str) -> String {
    let safe = path.trim_matches('/').replace(['/', '.'], "-");
    format!("kapsule-mount-{safe}")
}

fn bind_device(source: &str, path: &str) -> crate::hypervisor::DeviceConfig {
    device([
        ("type", "disk"),
        ("source", source),
        ("path", path),
        ("shift", "false"),
        ("recursive", "true"),
        ("propagation", "rslave"),
    ])
}

fn already_exists(out: &ExecOutput) -> bool {
    out.stderr.contains("already exists")
}

/// Reads `metadata.mount_home`, `user`, `container_home`.
struct MountHome;

#[async_trait]
impl Step<UserSetupContext> for MountHome {
    fn name(&self) -> &'static str {
        "mount_home"
    }

    async fn run(&self, ctx: &mut UserSetupContext) -> Result<StepOutcome> {
        if ctx.metadata.mount_home {
            ctx.progress.info(format!(
                "Mounting home directory: {} -> {}",
                ctx.user.home_dir, ctx.container_home
            ));
            let dev = device([
                ("type", "disk"),
                ("source", ctx.user.home_dir.as_str()),
                ("path", ctx.container_home.as_str()),
            ]);
            ctx.backend
                .ensure_device(&ctx.container, &format!("kapsule-home-{}", ctx.user.username), &dev)
                .await
                .context("Failed to mount home directory")?;
        } else {
            ctx.progress.info("Home directory mount: skipped (disabled)");
            let mode = FileMode::new(ctx.user.uid, ctx.user.gid, 0o700);
            // An existing home is fine.
            let _ = ctx
                .backend
                .hypervisor
                .mkdir(&ctx.container, &ctx.container_home, mode)
                .await;
        }
        Ok(StepOutcome::Done)
    }
}

/// Reads `metadata.custom_mounts`, `metadata.invalid_custom_mounts`.
struct MountCustom;

#[async_trait]
impl Step<UserSetupContext> for MountCustom {
    fn name(&self) -> &'static str {
        "mount_custom"
    }

    async fn run(&self, ctx: &mut UserSetupContext) -> Result<StepOutcome> {
        if let Some(raw) = &ctx.metadata.invalid_custom_mounts {
            return Ok(StepOutcome::Warn(format!("Invalid custom-mounts config: {raw}")));
        }
        let mut warnings = Vec::new();
        for path in &ctx.metadata.custom_mounts {
            if !Path::new(path).is_dir() {
                warnings.push(format!("Custom mount source does not exist: {path}"));
                continue;
            }
            ctx.progress.info(format!("Custom mount: {path} -> {path}"));
            let dev = device([("type", "disk"), ("source", path.as_str()), ("path", path.as_str())]);
            if let Err(e) = ctx
                .backend
                .ensure_device(&ctx.container, &custom_mount_device_name(path), &dev)
                .await
            {
                warnings.push(format!("Failed to mount {path}: {e}"));
            }
        }
        Ok(StepOutcome::from_warnings(warnings))
    }
}

/// Without the full host rootfs, mount just the runtime and X11 dirs the bridge needs.
///
/// Reads `metadata.host_rootfs`, `user.uid`.
struct MountHostDirs;

#[async_trait]
impl Step<UserSetupContext> for MountHostDirs {
    fn name(&self) -> &'static str {
        "mount_host_dirs"
    }

    async fn run(&self, ctx: &mut UserSetupContext) -> Result<StepOutcome> {
        if ctx.metadata.host_rootfs {
            return Ok(StepOutcome::Done);
        }
        ctx.progress.info("Minimal host mounts (no full rootfs)");

        let uid = ctx.user.uid;
        let host_run = ctx.backend.settings.host_runtime_dir(uid);
        let run_dev = bind_device(
            &host_run.to_string_lossy(),
            &format!("{HOST_MOUNT_ROOT}/run/user/{uid}"),
        );
        ctx.backend
            .ensure_device(&ctx.container, &format!("kapsule-hostrun-{uid}"), &run_dev)
            .await
            .context("Failed to mount host runtime dir")?;

        let x11_dev = bind_device(X11_SOCKET_DIR, &format!("{HOST_MOUNT_ROOT}{X11_SOCKET_DIR}"));
        ctx.backend
            .ensure_device(&ctx.container, "kapsule-x11", &x11_dev)
            .await
            .context("Failed to mount host X11 dir")?;
        Ok(StepOutcome::Done)
    }
}

/// Reads `user`, `container_home`.
struct CreateAccount;

#[async_trait]
impl Step<UserSetupContext> for CreateAccount {
    fn name(&self) -> &'static str {
        "create_account"
    }

    async fn run(&self, ctx: &mut UserSetupContext) -> Result<StepOutcome> {
        let u = &ctx.user;
        ctx.progress
            .info(format!("Creating group '{}' (gid={})", u.username, u.gid));
        let gid = u.gid.to_string();
        let out = ctx
            .backend
            .exec_in(&ctx.container, ["groupadd", "-o", "-g", gid.as_str(), u.username.as_str()])
            .await?;
        if !out.success() && !already_exists(&out) {
            return Err(KapsuleError::Command(format!(
                "Failed to create group '{}': {}",
                u.username,
                out.failure_reason()
            )));
        }

        ctx.progress
            .info(format!("Creating user '{}' (uid={})", u.username, u.uid));
        let uid = u.uid.to_string();
        let argv = [
            "useradd",
            "-o",
            "-M",
            "-u",
            uid.as_str(),
            "-g",
            gid.as_str(),
            "-d",
            ctx.container_home.as_str(),
            "-s",
            "/bin/bash",
            u.username.as_str(),
        ];
        let out = ctx.backend.exec_in(&ctx.container, argv).await?;
        if !out.success() && !already_exists(&out) {
            return Err(KapsuleError::Command(format!(
                "Failed to create user '{}': {}",
                u.username,
                out.failure_reason()
            )));
        }
        Ok(StepOutcome::Done)
    }
}

/// Reads `user.username`.
struct ConfigureSudo;

#[async_trait]
impl Step<UserSetupContext> for ConfigureSudo {
    fn name(&self) -> &'static str {
        "configure_sudo"
    }

    async fn run(&self, ctx: &mut UserSetupContext) -> Result<StepOutcome> {
        let username = &ctx.user.username;
        ctx.progress
            .info(format!("Configuring passwordless sudo for '{username}'"));
        // The push below reports the real failure if this does not work.
        let _ = ctx
            .backend
            .exec_in(&ctx.container, ["mkdir", "-p", "/etc/sudoers.d"])
            .await;
        let content = format!("{username} ALL=(ALL) NOPASSWD:ALL\n");
        ctx.backend
            .hypervisor
            .push_file(
                &ctx.container,
                &format!("/etc/sudoers.d/{username}"),
                content.as_bytes(),
                FileMode::root(0o440),
            )
            .await
            .context("Failed to configure sudo")?;
        Ok(StepOutcome::Done)
    }
}

/// Reads `metadata.session_mode`, `user.username`.
struct EnableLinger;

#[async_trait]
impl Step<UserSetupContext> for EnableLinger {
    fn name(&self) -> &'static str {
        "enable_linger"
    }

    async fn run(&self, ctx: &mut UserSetupContext) -> Result<StepOutcome> {
        if !ctx.metadata.session_mode {
            return Ok(StepOutcome::Done);
        }
        let username = ctx.user.username.as_str();
        ctx.progress
            .info(format!("Enabling linger for '{username}' (session mode)"));
        let outcome = match ctx
            .backend
            .exec_in(&ctx.container, ["loginctl", "enable-linger", username])
            .await
        {
            Ok(out) if out.success() => StepOutcome::Done,
            Ok(out) => StepOutcome::Warn(format!("loginctl enable-linger: {}", out.failure_reason())),
            Err(e) => StepOutcome::Warn(format!("loginctl enable-linger: {e}")),
        };
        Ok(outcome)
    }
}

/// Reads `user.uid`; persists the mapped flag.
struct MarkMapped;

#[async_trait]
impl Step<UserSetupContext> for MarkMapped {
    fn name(&self) -> &'static str {
        "mark_mapped"
    }

    async fn run(&self, ctx: &mut UserSetupContext) -> Result<StepOutcome> {
        let mut patch = ConfigMap::new();
        patch.insert(user_mapped_key(ctx.user.uid), "true".to_string());
        ctx.backend
            .hypervisor
            .patch_instance_config(&ctx.container, &patch)
            .await
            .context("Failed to update container config")?;
        ctx.metadata.mapped_users.insert(ctx.user.uid);
        Ok(StepOutcome::Done)
    }
}
