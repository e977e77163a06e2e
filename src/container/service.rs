//! `ContainerService`: the action and query surface clients call.
//!
//! Actions run as tracked operations and stream progress through the tracker.
//! Queries answer directly from the hypervisor.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::context::{Backend, CreateContext, HostUser, PostCreateContext, UserSetupContext};
use super::enter::build_enter_command;
use super::metadata::{ContainerMetadata, ContainerMode};
use super::pipelines::Pipelines;
use crate::bridge::{BridgeOutcome, EnvMap, RuntimeBridge};
use crate::config::UserConfig;
use crate::errors::{HypervisorResultExt, KapsuleError, Result};
use crate::hypervisor::{ensure_base_profile, Instance, ProfileSyncResult};
use crate::operations::{OperationEvent, OperationSpec, OperationTracker, ProgressReporter};
use crate::options::{create_schema_json, parse_options, ContainerOptions};

/// One row of `list_containers` / `get_container_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub status: String,
    pub image: String,
    pub created: String,
    pub mode: ContainerMode,
}

impl ContainerSummary {
    fn from_instance(instance: &Instance) -> Self {
        Self {
            name: instance.name.clone(),
            status: instance.status.clone(),
            image: instance.image_description().to_string(),
            created: instance.created_at.clone(),
            mode: ContainerMetadata::from_config(&instance.config).mode(),
        }
    }
}

pub struct ContainerService {
    backend: Backend,
    pipelines: Arc<Pipelines>,
    tracker: OperationTracker,
    bridge: Arc<RuntimeBridge>,
}

impl std::fmt::Debug for ContainerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerService")
            .field("backend", &self.backend)
            .field("pipelines", &self.pipelines)
            .field("bridge", &self.bridge)
            .finish()
    }
}

impl ContainerService {
    pub fn new(backend: Backend) -> Self {
        Self {
            bridge: Arc::new(RuntimeBridge::new(backend.clone())),
            pipelines: Arc::new(Pipelines::build()),
            tracker: OperationTracker::new(),
            backend,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    pub fn bridge(&self) -> &RuntimeBridge {
        &self.bridge
    }

    // ---------------------------------------------------------------------
    // Actions
    // ---------------------------------------------------------------------

    /// Create and provision a container. Options are validated before anything runs.
    pub async fn create_container(
        &self,
        name: &str,
        image: &str,
        options: &Map<String, Value>,
    ) -> Result<()> {
        let options = parse_options(options)?;
        let spec = OperationSpec::new("create", "Creating container: {name}", "name")
            .arg("name", name)
            .arg("image", image);
        self.tracker
            .track(spec, |progress| async move {
                self.provision(name, image, options, progress.clone()).await?;
                progress.success(format!("Container '{name}' created successfully"));
                Ok(())
            })
            .await
    }

    pub async fn delete_container(&self, name: &str, force: bool) -> Result<()> {
        let spec = OperationSpec::new("delete", "Removing container: {name}", "name").arg("name", name);
        self.tracker
            .track(spec, |progress| async move {
                let hv = &self.backend.hypervisor;
                let instance = self.require_instance(name).await?;
                if instance.is_running() {
                    if !force {
                        return Err(KapsuleError::precondition(format!(
                            "Container '{name}' is running. Use --force to remove anyway."
                        )));
                    }
                    progress.info("Stopping container...");
                    let outcome = hv
                        .stop_instance(name, true)
                        .await
                        .context("Failed to stop container")?;
                    if !outcome.is_success() {
                        return Err(KapsuleError::failed(format!(
                            "Failed to stop: {}",
                            outcome.reason()
                        )));
                    }
                    progress.success("Container stopped");
                }

                progress.info("Deleting container...");
                let outcome = hv
                    .delete_instance(name)
                    .await
                    .context("Failed to delete container")?;
                if !outcome.is_success() {
                    return Err(KapsuleError::failed(format!(
                        "Deletion failed: {}",
                        outcome.reason()
                    )));
                }
                self.bridge.forget(name);
                progress.success(format!("Container '{name}' removed successfully"));
                Ok(())
            })
            .await
    }

    pub async fn start_container(&self, name: &str) -> Result<()> {
        let spec = OperationSpec::new("start", "Starting container: {name}", "name").arg("name", name);
        self.tracker
            .track(spec, |progress| async move {
                let instance = self.require_instance(name).await?;
                if instance.is_running() {
                    progress.warning(format!("Container '{name}' is already running"));
                    return Ok(());
                }
                self.start_instance(&instance, &progress).await?;
                progress.success(format!("Container '{name}' started successfully"));
                Ok(())
            })
            .await
    }

    pub async fn stop_container(&self, name: &str, force: bool) -> Result<()> {
        let spec = OperationSpec::new("stop", "Stopping container: {name}", "name").arg("name", name);
        self.tracker
            .track(spec, |progress| async move {
                let instance = self.require_instance(name).await?;
                if !instance.is_running() {
                    progress.warning(format!("Container '{name}' is not running"));
                    return Ok(());
                }
                progress.info("Stopping container...");
                let outcome = self
                    .backend
                    .hypervisor
                    .stop_instance(name, force)
                    .await
                    .context("Failed to stop container")?;
                if !outcome.is_success() {
                    return Err(KapsuleError::failed(format!(
                        "Stop failed: {}",
                        outcome.reason()
                    )));
                }
                progress.success(format!("Container '{name}' stopped successfully"));
                Ok(())
            })
            .await
    }

    /// Mount the user's home and create a matching account with passwordless sudo.
    pub async fn setup_user(&self, container: &str, user: &HostUser) -> Result<()> {
        let spec = OperationSpec::new(
            "setup_user",
            "Setting up user '{username}' in {container_name}",
            "container_name",
        )
        .arg("container_name", container)
        .arg("username", user.username.as_str());
        self.tracker
            .track(spec, |progress| async move {
                self.run_user_setup(container, user, progress.clone()).await?;
                progress.success(format!("User '{}' configured", user.username));
                Ok(())
            })
            .await
    }

    /// Get a container ready for `user` and return the command that enters it.
    ///
    /// The default container is created on first use; any other missing container is
    /// an error. Provisioning here is silent.
    pub async fn prepare_enter(
        &self,
        user: &HostUser,
        container: Option<&str>,
        command: &[String],
        env: &EnvMap,
    ) -> Result<Vec<String>> {
        let config = UserConfig::load(Some(Path::new(&user.home_dir)))?;
        let name = container.unwrap_or(config.default_container.as_str());
        let hv = &self.backend.hypervisor;

        let exists = hv
            .instance_exists(name)
            .await
            .context("Failed to query container")?;
        if !exists {
            if name != config.default_container {
                return Err(KapsuleError::precondition(format!(
                    "Container '{name}' does not exist"
                )));
            }
            info!(container = name, image = %config.default_image, "creating default container");
            self.provision(
                name,
                &config.default_image,
                ContainerOptions::default(),
                ProgressReporter::detached(),
            )
            .await?;
        }

        let instance = hv
            .get_instance(name)
            .await
            .context("Failed to query container")?;
        if !instance.is_running() {
            self.start_instance(&instance, &ProgressReporter::detached())
                .await?;
        }

        let metadata = ContainerMetadata::from_config(&instance.config);
        if !metadata.is_user_mapped(user.uid) {
            debug!(container = name, uid = user.uid, "user not mapped yet");
            self.run_user_setup(name, user, ProgressReporter::detached())
                .await?;
        }

        match self.bridge.ensure(name, user.uid, user.gid, env).await? {
            BridgeOutcome::Skipped(reason) | BridgeOutcome::Incomplete(reason) => {
                warn!(container = name, uid = user.uid, "entering without full socket bridge: {reason}");
            }
            BridgeOutcome::Cached | BridgeOutcome::Mounted { .. } => {}
        }

        Ok(build_enter_command(
            &self.backend.settings.incus_bin,
            name,
            &user.username,
            command,
            env,
        ))
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let instances = self
            .backend
            .hypervisor
            .list_instances()
            .await
            .context("Failed to list containers")?;
        Ok(instances.iter().map(ContainerSummary::from_instance).collect())
    }

    pub async fn get_container_info(&self, name: &str) -> Result<ContainerSummary> {
        let instance = self
            .backend
            .hypervisor
            .get_instance(name)
            .await
            .context(format!("Container '{name}' not found"))?;
        let mut summary = ContainerSummary::from_instance(&instance);
        if summary.name.is_empty() {
            summary.name = name.to_string();
        }
        if summary.status.is_empty() {
            summary.status = "Unknown".to_string();
        }
        Ok(summary)
    }

    /// Lookup failures count as "not set up".
    pub async fn is_user_setup(&self, container: &str, uid: u32) -> bool {
        match self.backend.hypervisor.get_instance(container).await {
            Ok(instance) => ContainerMetadata::from_config(&instance.config).is_user_mapped(uid),
            Err(e) => {
                debug!(container, uid, "is_user_setup lookup failed: {e}");
                false
            }
        }
    }

    /// Effective user configuration for `uid`.
    pub fn get_config(&self, uid: u32) -> Result<UserConfig> {
        let home = HostUser::from_uid(uid).ok().map(|u| u.home_dir);
        UserConfig::load(home.as_deref().map(Path::new))
    }

    pub fn create_schema_json(&self) -> Result<String> {
        create_schema_json().map_err(|e| KapsuleError::Internal(format!("cannot encode schema: {e}")))
    }

    pub fn list_operations(&self) -> Vec<String> {
        self.tracker.list_paths()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.tracker.subscribe()
    }

    pub async fn is_available(&self) -> bool {
        self.backend.hypervisor.is_available().await
    }

    pub async fn ensure_profile(&self) -> Result<ProfileSyncResult> {
        ensure_base_profile(self.backend.hypervisor.as_ref()).await
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    async fn require_instance(&self, name: &str) -> Result<Instance> {
        let hv = &self.backend.hypervisor;
        let exists = hv
            .instance_exists(name)
            .await
            .context("Failed to query container")?;
        if !exists {
            return Err(KapsuleError::precondition(format!(
                "Container '{name}' does not exist"
            )));
        }
        hv.get_instance(name)
            .await
            .context("Failed to query container")
    }

    async fn start_instance(&self, instance: &Instance, progress: &ProgressReporter) -> Result<()> {
        let hook = self.backend.settings.nvidia_hook.display().to_string();
        if instance
            .config
            .get("raw.lxc")
            .is_some_and(|raw| raw.contains(&hook))
        {
            progress.dim("NVIDIA userspace drivers will be injected on start");
        }
        progress.info("Starting container...");
        let outcome = self
            .backend
            .hypervisor
            .start_instance(&instance.name)
            .await
            .context("Failed to start container")?;
        if !outcome.is_success() {
            return Err(KapsuleError::failed(format!(
                "Start failed: {}",
                outcome.reason()
            )));
        }
        Ok(())
    }

    /// Run `create` then `post_create` for one container.
    async fn provision(
        &self,
        name: &str,
        image: &str,
        options: ContainerOptions,
        progress: ProgressReporter,
    ) -> Result<()> {
        let metadata = ContainerMetadata::from_options(&options);
        let mut ctx = CreateContext::new(self.backend.clone(), progress.clone(), name, image, options);
        self.pipelines.create.run(&mut ctx).await?;

        let mut ctx = PostCreateContext::new(self.backend.clone(), progress, name, metadata);
        self.pipelines.post_create.run(&mut ctx).await
    }

    async fn run_user_setup(&self, container: &str, user: &HostUser, progress: ProgressReporter) -> Result<()> {
        let instance = self.require_instance(container).await?;
        let metadata = ContainerMetadata::from_config(&instance.config);
        let mut ctx = UserSetupContext::new(self.backend.clone(), progress, container, user.clone(), metadata);
        self.pipelines.user_setup.run(&mut ctx).await
    }
}
