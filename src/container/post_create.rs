//! Steps of the `post_create` pipeline: fixups applied to a freshly created container.
//!
//! Everything here is best-effort except installing the D-Bus socket drop-in and the
//! multiplexer unit, without which a mux container cannot reach its own bus.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use nix::unistd::{chown, Gid, Uid};

use super::constants::{dbus_socket_systemd, DBUS_MUX_BIN, DBUS_MUX_UNIT, HOST_MOUNT_ROOT, SESSION_PLACEHOLDER_UID};
use super::context::PostCreateContext;
use crate::errors::{HypervisorResultExt, Result};
use crate::hypervisor::FileMode;
use crate::pipeline::{PipelineBuilder, Step, StepOutcome};
use crate::util::TextLines;

pub fn register(p: &mut PipelineBuilder<PostCreateContext>) {
    p.step_at(100, FixFileCapabilities)
        .step_at(200, HostNetworkFixups)
        .step_at(300, SessionSetup);
}

const CAPABILITIES: &[(&str, &str)] = &[
    ("/usr/bin/newuidmap", "cap_setuid+ep"),
    ("/usr/bin/newgidmap", "cap_setgid+ep"),
];

const WAIT_ONLINE_UNIT: &str = "/etc/systemd/system/systemd-networkd-wait-online.service";
const PODMAN_CONF_DIRS: &[&str] = &["/etc/containers", "/etc/containers/containers.conf.d"];
const PODMAN_CONF: &str = "/etc/containers/containers.conf.d/50-kapsule-cgroupfs.conf";
const DBUS_DROPIN_DIR: &str = "/etc/systemd/user/dbus.socket.d";
const USER_UNIT_DIR: &str = "/etc/systemd/user";

/// `[Socket]` drop-in moving the container bus to a host-visible path.
pub fn dbus_socket_dropin(container: &str) -> std::io::Result<String> {
    let mut t = TextLines::new();
    t.section("Socket")
        .kv("ListenStream", "")
        .kv("ListenStream", dbus_socket_systemd(container));
    t.build()
}

/// User unit running the D-Bus multiplexer on the standard session bus path.
pub fn dbus_mux_unit(container: &str) -> std::io::Result<String> {
    let exec = format!(
        "{} --listen %t/bus --container-bus unix:path={} --host-bus unix:path={}%t/bus",
        DBUS_MUX_BIN,
        dbus_socket_systemd(container),
        HOST_MOUNT_ROOT
    );
    let mut t = TextLines::new();
    t.section("Unit")
        .kv("Description", "Kapsule D-Bus Multiplexer")
        .kv("Documentation", "man:kapsule(1)")
        .kv("After", "dbus.service")
        .kv("Requires", "dbus.service")
        .section("Service")
        .kv("Type", "simple")
        .kv("ExecStart", exec)
        .kv("Restart", "on-failure")
        .kv("RestartSec", "1")
        .section("Install")
        .kv("WantedBy", "default.target");
    t.build()
}

/// Restore file capabilities image extraction strips from the shadow helpers.
///
/// Reads `name`.
struct FixFileCapabilities;

#[async_trait]
impl Step<PostCreateContext> for FixFileCapabilities {
    fn name(&self) -> &'static str {
        "fix_file_capabilities"
    }

    async fn run(&self, ctx: &mut PostCreateContext) -> Result<StepOutcome> {
        let mut warnings = Vec::new();
        for &(binary, cap) in CAPABILITIES {
            match ctx.backend.exec_in(&ctx.name, ["setcap", cap, binary]).await {
                Ok(out) if out.success() => ctx.progress.dim(format!("Set {cap} on {binary}")),
                Ok(out) => warnings.push(format!(
                    "Could not set {cap} on {binary}: {}",
                    out.failure_reason()
                )),
                Err(e) => warnings.push(format!("Could not set {cap} on {binary}: {e}")),
            }
        }
        Ok(StepOutcome::from_warnings(warnings))
    }
}

/// Mask the wait-online unit; there are no interfaces to wait for under host networking.
///
/// Reads `name`.
struct HostNetworkFixups;

#[async_trait]
impl Step<PostCreateContext> for HostNetworkFixups {
    fn name(&self) -> &'static str {
        "host_network_fixups"
    }

    async fn run(&self, ctx: &mut PostCreateContext) -> Result<StepOutcome> {
        ctx.progress
            .info("Masking systemd-networkd-wait-online.service (host networking)");
        let masked = ctx
            .backend
            .hypervisor
            .create_symlink(&ctx.name, WAIT_ONLINE_UNIT, "/dev/null", 0, 0)
            .await;
        Ok(match masked {
            Ok(()) => StepOutcome::Done,
            Err(e) => StepOutcome::Warn(format!(
                "Could not mask systemd-networkd-wait-online: {e}"
            )),
        })
    }
}

/// Session bus setup in session mode, rootless Podman config otherwise.
///
/// Reads `name`, `metadata.session_mode`, `metadata.dbus_mux`.
struct SessionSetup;

#[async_trait]
impl Step<PostCreateContext> for SessionSetup {
    fn name(&self) -> &'static str {
        "session_setup"
    }

    async fn run(&self, ctx: &mut PostCreateContext) -> Result<StepOutcome> {
        if !ctx.metadata.session_mode {
            return configure_rootless_podman(ctx).await;
        }
        if !ctx.metadata.dbus_mux {
            ctx.progress
                .info("Session mode: container will use its own D-Bus session bus");
            return Ok(StepOutcome::Done);
        }
        setup_dbus_mux(ctx).await
    }
}

async fn configure_rootless_podman(ctx: &PostCreateContext) -> Result<StepOutcome> {
    let hv = &ctx.backend.hypervisor;
    for dir in PODMAN_CONF_DIRS {
        // Usually present already.
        let _ = hv.mkdir(&ctx.name, dir, FileMode::root(0o755)).await;
    }
    let mut conf = TextLines::new();
    conf.push("# Installed by Kapsule: non-session containers lack a systemd")
        .push("# user instance, so the default systemd cgroup manager fails.")
        .section("engine")
        .push("cgroup_manager = \"cgroupfs\"");
    let content = conf.build()?;
    if let Err(e) = hv
        .push_file(&ctx.name, PODMAN_CONF, content.as_bytes(), FileMode::root(0o644))
        .await
    {
        return Ok(StepOutcome::Warn(format!(
            "Could not configure rootless Podman: {e}"
        )));
    }
    ctx.progress
        .dim("Configured rootless Podman (cgroup_manager=cgroupfs)");
    Ok(StepOutcome::Done)
}

fn prepare_host_socket_dir(base: &Path, socket_dir: &Path, uid: u32) -> std::io::Result<()> {
    fs::create_dir_all(socket_dir)?;
    let owner = (Some(Uid::from_raw(uid)), Some(Gid::from_raw(uid)));
    for dir in [base, socket_dir] {
        chown(dir, owner.0, owner.1).map_err(std::io::Error::from)?;
    }
    Ok(())
}

async fn setup_dbus_mux(ctx: &PostCreateContext) -> Result<StepOutcome> {
    let hv = &ctx.backend.hypervisor;
    let mut warnings = Vec::new();

    let uid = SESSION_PLACEHOLDER_UID;
    let base = ctx.backend.settings.host_runtime_dir(uid).join("kapsule");
    let socket_dir = base.join(&ctx.name);
    ctx.progress.info(format!(
        "Configuring container D-Bus socket at: {}",
        socket_dir.join("dbus.socket").display()
    ));
    if let Err(e) = prepare_host_socket_dir(&base, &socket_dir, uid) {
        warnings.push(format!(
            "Could not prepare host socket directory {}: {e}",
            socket_dir.display()
        ));
    }

    let _ = hv.mkdir(&ctx.name, DBUS_DROPIN_DIR, FileMode::root(0o755)).await;
    let dropin = dbus_socket_dropin(&ctx.name)?;
    hv.push_file(
        &ctx.name,
        &format!("{DBUS_DROPIN_DIR}/kapsule.conf"),
        dropin.as_bytes(),
        FileMode::root(0o644),
    )
    .await
    .context("Failed to configure D-Bus socket")?;

    ctx.progress
        .info("Installing kapsule-dbus-mux.service for D-Bus multiplexing");
    let _ = hv.mkdir(&ctx.name, USER_UNIT_DIR, FileMode::root(0o755)).await;
    let unit = dbus_mux_unit(&ctx.name)?;
    hv.push_file(
        &ctx.name,
        &format!("{USER_UNIT_DIR}/{DBUS_MUX_UNIT}"),
        unit.as_bytes(),
        FileMode::root(0o644),
    )
    .await
    .context("Failed to install dbus-mux service")?;

    ctx.progress.info("Enabling kapsule-dbus-mux.service globally");
    let systemctl: [&[&str]; 2] = [
        &["systemctl", "--user", "--global", "enable", DBUS_MUX_UNIT],
        &["systemctl", "--user", "--global", "daemon-reload"],
    ];
    for argv in systemctl {
        let what = argv.join(" ");
        match ctx.backend.exec_in(&ctx.name, argv.iter().copied()).await {
            Ok(out) if out.success() => {}
            Ok(out) => warnings.push(format!("{what}: {}", out.failure_reason())),
            Err(e) => warnings.push(format!("{what}: {e}")),
        }
    }
    Ok(StepOutcome::from_warnings(warnings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropin_resets_then_redirects_socket() {
        assert_eq!(
            dbus_socket_dropin("dev").unwrap(),
            "[Socket]\nListenStream=\nListenStream=/.kapsule/host%t/kapsule/dev/dbus.socket\n"
        );
    }

    #[test]
    fn mux_unit_points_at_both_buses() {
        let unit = dbus_mux_unit("dev").unwrap();
        assert!(unit.starts_with("[Unit]\nDescription=Kapsule D-Bus Multiplexer\n"));
        assert!(unit.contains(
            "ExecStart=/.kapsule/host/usr/lib/kapsule/kapsule-dbus-mux --listen %t/bus \
             --container-bus unix:path=/.kapsule/host%t/kapsule/dev/dbus.socket \
             --host-bus unix:path=/.kapsule/host%t/bus\n"
        ));
        assert!(unit.ends_with("[Install]\nWantedBy=default.target\n"));
    }
}
