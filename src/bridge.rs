#![allow(clippy::module_name_repetitions)]
//! Runtime environment bridge: bind-mount host desktop sockets into a running container.
//!
//! Work is cached per `(container, uid)` as `(boot identity, environment fingerprint)`.
//! A hit requires both to match what was just observed; a restart or a change in
//! `WAYLAND_DISPLAY` / `DISPLAY` / `XAUTHORITY` forces a new mount batch.
//!
//! The batch enters the container's mount namespace with `nsenter` and runs one
//! `sh -c` script over all entries. Each entry is skipped when the target is already a
//! mount point or the host source is absent, so re-running a batch is harmless.
//! Bridge runs for the same key are serialized by a per-key async lock; unrelated
//! keys never wait on each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::container::constants::{HOST_MOUNT_ROOT, X11_SOCKET_DIR};
use crate::container::context::Backend;
use crate::container::metadata::ContainerMetadata;
use crate::errors::{HypervisorResultExt, Result};
use crate::hypervisor::FileMode;
use crate::util::{basename, ExecRequest, ShellScript};

/// Caller environment, sorted by key.
pub type EnvMap = BTreeMap<String, String>;

/// Variables that select which sockets get bridged.
pub const FINGERPRINT_KEYS: [&str; 3] = ["WAYLAND_DISPLAY", "DISPLAY", "XAUTHORITY"];

type CacheKey = (String, u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub uid: u32,
    pub gid: u32,
}

impl BindMount {
    fn new(source: impl Into<String>, target: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            uid,
            gid,
        }
    }
}

/// Directories to create inside the container, then the mounts to perform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPlan {
    pub dirs: Vec<(String, FileMode)>,
    pub mounts: Vec<BindMount>,
}

impl MountPlan {
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.mounts.iter().map(|m| m.target.as_str())
    }
}

/// `WAYLAND_DISPLAY=..|DISPLAY=..|XAUTHORITY=..`, unset keys as empty values.
pub fn env_fingerprint(env: &EnvMap) -> String {
    FINGERPRINT_KEYS
        .iter()
        .map(|k| format!("{}={}", k, env.get(*k).map(String::as_str).unwrap_or("")))
        .collect::<Vec<_>>()
        .join("|")
}

/// X11 socket name for a local display (`:3.0` gives `X3`).
pub fn x11_socket_name(display: &str) -> Option<String> {
    let rest = display.strip_prefix(':')?;
    let number = rest.split('.').next().unwrap_or("");
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("X{number}"))
}

fn non_empty<'a>(env: &'a EnvMap, key: &str) -> Option<&'a str> {
    env.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Compute which host sockets to bind into the container's runtime directory.
pub fn plan_mounts(uid: u32, gid: u32, session_mode: bool, env: &EnvMap) -> MountPlan {
    let runtime = format!("/run/user/{uid}");
    let host_runtime = format!("{HOST_MOUNT_ROOT}/run/user/{uid}");
    let mut plan = MountPlan::default();

    plan.dirs.push(("/run/user".to_string(), FileMode::root(0o755)));
    plan.dirs
        .push((runtime.clone(), FileMode::new(uid, gid, 0o700)));

    let in_runtime = |name: &str| BindMount::new(format!("{host_runtime}/{name}"), format!("{runtime}/{name}"), uid, gid);

    if let Some(wayland) = non_empty(env, "WAYLAND_DISPLAY") {
        if wayland.starts_with('/') {
            plan.mounts
                .push(BindMount::new(format!("{HOST_MOUNT_ROOT}{wayland}"), wayland, uid, gid));
        } else {
            plan.mounts.push(in_runtime(wayland));
        }
    }
    plan.mounts.push(in_runtime("pipewire-0"));
    // Session containers run their own bus.
    if !session_mode {
        plan.mounts.push(in_runtime("bus"));
    }

    if let Some(socket) = non_empty(env, "DISPLAY").and_then(x11_socket_name) {
        plan.dirs
            .push((X11_SOCKET_DIR.to_string(), FileMode::root(0o1777)));
        plan.mounts.push(BindMount::new(
            format!("{HOST_MOUNT_ROOT}{X11_SOCKET_DIR}/{socket}"),
            format!("{X11_SOCKET_DIR}/{socket}"),
            0,
            0,
        ));
    }

    plan.dirs
        .push((format!("{runtime}/pulse"), FileMode::new(uid, gid, 0o700)));
    plan.mounts.push(in_runtime("pulse/native"));

    if let Some(xauth) = non_empty(env, "XAUTHORITY") {
        let name = basename(xauth);
        if !name.is_empty() {
            plan.mounts.push(in_runtime(name));
        }
    }
    plan
}

/// The batch script: `$@` holds `src tgt uid gid` quadruples.
fn batch_script() -> ShellScript {
    let mut s = ShellScript::new();
    s.push("rc=0")
        .push("while [ $# -ge 4 ]; do src=$1")
        .push("tgt=$2")
        .push("u=$3")
        .push("g=$4")
        .push("shift 4")
        .push("mountpoint -q \"$tgt\" 2>/dev/null && continue")
        .push("if [ -L \"$tgt\" ]; then rm -f \"$tgt\"; fi")
        .push("[ -e \"$src\" ] || continue")
        .push("{ touch \"$tgt\" && chown \"$u:$g\" \"$tgt\" && mount --bind \"$src\" \"$tgt\"; } || rc=1")
        .push("done")
        .push("exit $rc");
    s
}

/// Full `nsenter` command line for one batch.
pub fn batch_command(nsenter_bin: &str, pid: i64, mounts: &[BindMount]) -> std::io::Result<Vec<String>> {
    let args = mounts.iter().flat_map(|m| {
        [
            m.source.clone(),
            m.target.clone(),
            m.uid.to_string(),
            m.gid.to_string(),
        ]
    });
    let mut argv = vec![
        nsenter_bin.to_string(),
        "-t".to_string(),
        pid.to_string(),
        "-m".to_string(),
        "--".to_string(),
    ];
    argv.extend(batch_script().sh_argv("sh", args)?);
    Ok(argv)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Cache hit; nothing executed.
    Cached,
    /// A batch ran and the cache entry was refreshed.
    Mounted { entries: usize },
    /// Nothing could run (no init process); the cache is left untouched.
    Skipped(String),
    /// The batch failed; the cache is left untouched so the next entry retries.
    Incomplete(String),
}

#[derive(Default)]
struct BridgeState {
    cache: HashMap<CacheKey, (String, String)>,
    locks: HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
}

pub struct RuntimeBridge {
    backend: Backend,
    state: Mutex<BridgeState>,
}

impl std::fmt::Debug for RuntimeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBridge")
            .field("cached", &self.state().cache.len())
            .finish()
    }
}

impl RuntimeBridge {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            state: Mutex::new(BridgeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.state().locks.entry(key.clone()).or_default())
    }

    pub fn is_cached(&self, container: &str, uid: u32) -> bool {
        self.state()
            .cache
            .contains_key(&(container.to_string(), uid))
    }

    /// Drop every cache entry for a container (after delete).
    pub fn forget(&self, container: &str) {
        let mut st = self.state();
        st.cache.retain(|(name, _), _| name != container);
        st.locks.retain(|(name, _), _| name != container);
    }

    /// Make sure host sockets are mounted for `uid` inside a running container.
    pub async fn ensure(&self, container: &str, uid: u32, gid: u32, env: &EnvMap) -> Result<BridgeOutcome> {
        let key: CacheKey = (container.to_string(), uid);
        let lock = self.key_lock(&key);
        let _held = lock.lock().await;

        let hv = &self.backend.hypervisor;
        let state = hv
            .get_instance_state(container)
            .await
            .context("Failed to query container state")?;
        let boot = state.boot_identity().to_string();
        let fingerprint = env_fingerprint(env);

        let hit = self
            .state()
            .cache
            .get(&key)
            .is_some_and(|(b, f)| *b == boot && *f == fingerprint);
        if hit {
            debug!(container, uid, "bridge cache hit");
            return Ok(BridgeOutcome::Cached);
        }
        debug!(container, uid, boot = %boot, %fingerprint, "bridge cache miss");

        let instance = hv
            .get_instance(container)
            .await
            .context("Failed to query container")?;
        let session_mode = ContainerMetadata::from_config(&instance.config).session_mode;
        let plan = plan_mounts(uid, gid, session_mode, env);

        for (dir, mode) in &plan.dirs {
            // Pre-existing directories are expected.
            if let Err(e) = hv.mkdir(container, dir, *mode).await {
                debug!(container, dir = dir.as_str(), "mkdir skipped: {e}");
            }
        }

        let Some(pid) = state.init_pid() else {
            warn!(container, "container has no init process; socket bridge skipped");
            return Ok(BridgeOutcome::Skipped(
                "container has no init process".to_string(),
            ));
        };

        let argv = batch_command(&self.backend.settings.nsenter_bin, pid, &plan.mounts)?;
        let mut argv = argv.into_iter();
        let program = argv.next().unwrap_or_default();
        let request = ExecRequest::new(program)
            .args(argv)
            .timeout(self.backend.settings.command_timeout);

        let reason = match self.backend.runner.run(request).await {
            Ok(out) if out.success() => None,
            Ok(out) => Some(out.failure_reason()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = reason {
            warn!(container, uid, "socket bridge incomplete: {reason}");
            return Ok(BridgeOutcome::Incomplete(reason));
        }

        debug!(container, uid, entries = plan.mounts.len(), "socket bridge refreshed");
        self.state().cache.insert(key, (boot, fingerprint));
        Ok(BridgeOutcome::Mounted {
            entries: plan.mounts.len(),
        })
    }
}
