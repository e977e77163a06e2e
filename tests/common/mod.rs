#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use kapsule::hypervisor::{
    ConfigMap, DeviceConfig, FileMode, HypervisorResult, Instance, InstanceSpec, InstanceState,
    OperationOutcome, Profile, STATUS_RUNNING, STATUS_STOPPED,
};
use kapsule::operations::{EventPayload, MessageLevel};
use kapsule::{
    Backend, CommandRunner, ContainerService, ExecOutput, ExecRequest, HostUser, Hypervisor,
    HypervisorError, ServiceSettings,
};

pub const INIT_PID: i64 = 4242;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedFile {
    pub content: String,
    pub mode: FileMode,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub instances: BTreeMap<String, Instance>,
    pub states: BTreeMap<String, InstanceState>,
    pub files: BTreeMap<(String, String), PushedFile>,
    pub dirs: Vec<(String, String, FileMode)>,
    pub symlinks: Vec<(String, String, String)>,
    pub profiles: BTreeMap<String, Profile>,
    pub created: Vec<InstanceSpec>,
    pub calls: Vec<String>,
    pub failures: BTreeMap<&'static str, HypervisorError>,
    pub create_outcome: Option<OperationOutcome>,
}

/// In-memory hypervisor: instances, devices, pushed files and profiles live in a map.
#[derive(Debug, Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
    unavailable: AtomicBool,
    boots: AtomicU32,
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make every later call of `method` fail with `err`.
    pub fn fail_on(&self, method: &'static str, err: HypervisorError) {
        self.state().failures.insert(method, err);
    }

    pub fn add_instance(&self, name: &str, running: bool, config: &[(&str, &str)]) {
        let instance = Instance {
            name: name.to_string(),
            status: if running { STATUS_RUNNING } else { STATUS_STOPPED }.to_string(),
            config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            devices: BTreeMap::new(),
            created_at: "2026-01-02T03:04:05Z".to_string(),
        };
        let state = self.boot_state(running);
        let mut st = self.state();
        st.instances.insert(name.to_string(), instance);
        st.states.insert(name.to_string(), state);
    }

    pub fn set_instance_state(&self, name: &str, pid: Option<i64>, started_at: Option<&str>) {
        let mut st = self.state();
        let entry = st.states.entry(name.to_string()).or_default();
        entry.pid = pid;
        entry.started_at = started_at.map(str::to_string);
    }

    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.state().instances.get(name).cloned()
    }

    pub fn file(&self, container: &str, path: &str) -> Option<PushedFile> {
        self.state()
            .files
            .get(&(container.to_string(), path.to_string()))
            .cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn boot_state(&self, running: bool) -> InstanceState {
        if !running {
            return InstanceState {
                status: STATUS_STOPPED.to_string(),
                pid: None,
                started_at: None,
            };
        }
        let n = self.boots.fetch_add(1, Ordering::SeqCst) + 1;
        InstanceState {
            status: STATUS_RUNNING.to_string(),
            pid: Some(INIT_PID),
            started_at: Some(format!("2026-01-01T00:00:{n:02}Z")),
        }
    }

    fn enter(&self, method: &'static str, detail: &str) -> HypervisorResult<MutexGuard<'_, FakeState>> {
        let mut st = self.state();
        st.calls.push(format!("{method} {detail}").trim_end().to_string());
        match st.failures.get(method) {
            Some(err) => Err(err.clone()),
            None => Ok(st),
        }
    }
}

fn not_found(name: &str) -> HypervisorError {
    HypervisorError::with_code(format!("Instance '{name}' not found"), 404)
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn list_instances(&self) -> HypervisorResult<Vec<Instance>> {
        let st = self.enter("list_instances", "")?;
        Ok(st.instances.values().cloned().collect())
    }

    async fn instance_exists(&self, name: &str) -> HypervisorResult<bool> {
        let st = self.enter("instance_exists", name)?;
        Ok(st.instances.contains_key(name))
    }

    async fn get_instance(&self, name: &str) -> HypervisorResult<Instance> {
        let st = self.enter("get_instance", name)?;
        st.instances.get(name).cloned().ok_or_else(|| not_found(name))
    }

    async fn get_instance_state(&self, name: &str) -> HypervisorResult<InstanceState> {
        let st = self.enter("get_instance_state", name)?;
        st.states.get(name).cloned().ok_or_else(|| not_found(name))
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> HypervisorResult<OperationOutcome> {
        self.enter("create_instance", &spec.name)?;
        let state = self.boot_state(spec.start);
        let mut st = self.state();
        st.created.push(spec.clone());
        if let Some(outcome) = st.create_outcome.clone() {
            return Ok(outcome);
        }
        st.instances.insert(
            spec.name.clone(),
            Instance {
                name: spec.name.clone(),
                status: state.status.clone(),
                config: spec.config.clone(),
                devices: spec.devices.clone(),
                created_at: "2026-01-02T03:04:05Z".to_string(),
            },
        );
        st.states.insert(spec.name.clone(), state);
        Ok(OperationOutcome::success())
    }

    async fn start_instance(&self, name: &str) -> HypervisorResult<OperationOutcome> {
        drop(self.enter("start_instance", name)?);
        let state = self.boot_state(true);
        let mut st = self.state();
        let instance = st.instances.get_mut(name).ok_or_else(|| not_found(name))?;
        instance.status = STATUS_RUNNING.to_string();
        st.states.insert(name.to_string(), state);
        Ok(OperationOutcome::success())
    }

    async fn stop_instance(&self, name: &str, force: bool) -> HypervisorResult<OperationOutcome> {
        let mut st = self.enter("stop_instance", &format!("{name} force={force}"))?;
        let instance = st.instances.get_mut(name).ok_or_else(|| not_found(name))?;
        instance.status = STATUS_STOPPED.to_string();
        st.states.insert(
            name.to_string(),
            InstanceState {
                status: STATUS_STOPPED.to_string(),
                pid: None,
                started_at: None,
            },
        );
        Ok(OperationOutcome::success())
    }

    async fn delete_instance(&self, name: &str) -> HypervisorResult<OperationOutcome> {
        let mut st = self.enter("delete_instance", name)?;
        st.instances.remove(name).ok_or_else(|| not_found(name))?;
        st.states.remove(name);
        Ok(OperationOutcome::success())
    }

    async fn add_instance_device(
        &self,
        name: &str,
        device_name: &str,
        device: &DeviceConfig,
    ) -> HypervisorResult<()> {
        let mut st = self.enter("add_instance_device", &format!("{name} {device_name}"))?;
        let instance = st.instances.get_mut(name).ok_or_else(|| not_found(name))?;
        match instance.devices.get(device_name) {
            Some(existing) if existing == device => Ok(()),
            Some(_) => Err(HypervisorError::with_code(
                format!("Device '{device_name}' already exists"),
                409,
            )),
            None => {
                instance
                    .devices
                    .insert(device_name.to_string(), device.clone());
                Ok(())
            }
        }
    }

    async fn push_file(
        &self,
        name: &str,
        path: &str,
        content: &[u8],
        mode: FileMode,
    ) -> HypervisorResult<()> {
        let mut st = self.enter("push_file", &format!("{name} {path}"))?;
        st.files.insert(
            (name.to_string(), path.to_string()),
            PushedFile {
                content: String::from_utf8_lossy(content).into_owned(),
                mode,
            },
        );
        Ok(())
    }

    async fn create_symlink(
        &self,
        name: &str,
        path: &str,
        target: &str,
        _uid: u32,
        _gid: u32,
    ) -> HypervisorResult<()> {
        let mut st = self.enter("create_symlink", &format!("{name} {path}"))?;
        st.symlinks
            .push((name.to_string(), path.to_string(), target.to_string()));
        Ok(())
    }

    async fn mkdir(&self, name: &str, path: &str, mode: FileMode) -> HypervisorResult<()> {
        let mut st = self.enter("mkdir", &format!("{name} {path}"))?;
        st.dirs.push((name.to_string(), path.to_string(), mode));
        Ok(())
    }

    async fn patch_instance_config(&self, name: &str, patch: &ConfigMap) -> HypervisorResult<()> {
        let mut st = self.enter("patch_instance_config", name)?;
        let instance = st.instances.get_mut(name).ok_or_else(|| not_found(name))?;
        for (k, v) in patch {
            instance.config.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn profile_exists(&self, name: &str) -> HypervisorResult<bool> {
        let st = self.enter("profile_exists", name)?;
        Ok(st.profiles.contains_key(name))
    }

    async fn get_profile(&self, name: &str) -> HypervisorResult<Profile> {
        let st = self.enter("get_profile", name)?;
        st.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| HypervisorError::with_code("Profile not found", 404))
    }

    async fn create_profile(&self, profile: &Profile) -> HypervisorResult<()> {
        let mut st = self.enter("create_profile", &profile.name)?;
        st.profiles.insert(profile.name.clone(), profile.clone());
        Ok(())
    }

    async fn update_profile(&self, profile: &Profile) -> HypervisorResult<()> {
        let mut st = self.enter("update_profile", &profile.name)?;
        st.profiles.insert(profile.name.clone(), profile.clone());
        Ok(())
    }
}

type Responder = Box<dyn Fn(&ExecRequest) -> ExecOutput + Send + Sync>;

/// `CommandRunner` that records every request and answers from a responder
/// (exit 0 with empty output by default).
#[derive(Default)]
pub struct RecordingRunner {
    requests: Mutex<Vec<ExecRequest>>,
    responder: Mutex<Option<Responder>>,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond_with<F>(&self, f: F)
    where
        F: Fn(&ExecRequest) -> ExecOutput + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Command lines joined with spaces, in call order.
    pub fn command_lines(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| r.command_line().join(" "))
            .collect()
    }

    /// Requests whose program is `program`.
    pub fn runs_of(&self, program: &str) -> Vec<ExecRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.program() == program)
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, request: ExecRequest) -> kapsule::Result<ExecOutput> {
        let out = match &*self.responder.lock().unwrap() {
            Some(f) => f(&request),
            None => ok_output(),
        };
        self.requests.lock().unwrap().push(request);
        Ok(out)
    }
}

pub fn ok_output() -> ExecOutput {
    ExecOutput {
        code: Some(0),
        duration: Duration::from_millis(1),
        stdout: String::new(),
        stderr: String::new(),
    }
}

pub fn failed_output(code: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        code: Some(code),
        duration: Duration::from_millis(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Settings pointing host paths at `root` so tests never touch the real `/run/user`.
pub fn test_settings(root: &std::path::Path) -> ServiceSettings {
    ServiceSettings {
        incus_socket: root.join("incus.socket"),
        incus_bin: "incus".to_string(),
        nsenter_bin: "nsenter".to_string(),
        incus_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_secs(5),
        nvidia_hook: root.join("nvidia-hook.sh"),
        host_runtime_root: root.join("run-user"),
    }
}

pub struct Harness {
    pub hv: Arc<FakeHypervisor>,
    pub runner: Arc<RecordingRunner>,
    pub service: ContainerService,
    pub dir: tempfile::TempDir,
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let hv = FakeHypervisor::new();
    let runner = RecordingRunner::new();
    let backend = Backend::new(hv.clone(), runner.clone(), test_settings(dir.path()));
    Harness {
        service: ContainerService::new(backend),
        hv,
        runner,
        dir,
    }
}

impl Harness {
    pub fn backend(&self) -> Backend {
        self.service.backend().clone()
    }

    /// A host user whose home lives inside the harness temp dir.
    pub fn user(&self, name: &str, uid: u32) -> HostUser {
        let home = self.dir.path().join("home").join(name);
        std::fs::create_dir_all(&home).unwrap();
        HostUser {
            uid,
            gid: uid,
            username: name.to_string(),
            home_dir: home.to_string_lossy().into_owned(),
        }
    }
}

pub fn env(pairs: &[(&str, &str)]) -> kapsule::EnvMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Everything queued on `rx` so far.
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<kapsule::OperationEvent>) -> Vec<EventPayload> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev.payload);
    }
    out
}

/// Message texts at `level`, in emission order.
pub fn messages_at(events: &[EventPayload], level: MessageLevel) -> Vec<String> {
    events
        .iter()
        .filter_map(|p| match p {
            EventPayload::Message { level: l, text, .. } if *l == level => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Every message text regardless of level.
pub fn all_messages(events: &[EventPayload]) -> Vec<String> {
    events
        .iter()
        .filter_map(|p| match p {
            EventPayload::Message { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

pub fn raw_options(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
