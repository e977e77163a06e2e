#![allow(clippy::module_name_repetitions)]
//! Per-run provisioning contexts.
//!
//! Each pipeline run owns exactly one context. Identity fields are set by the caller;
//! accumulator fields start empty and are filled by steps in order. Step docs state
//! which fields they read and write.

use std::sync::Arc;

use nix::unistd::{Uid, User};

use crate::config::ServiceSettings;
use crate::errors::{KapsuleError, Result};
use crate::hypervisor::{
    ConfigMap, DeviceConfig, DeviceMap, Hypervisor, HypervisorResult, InstanceSource,
};
use crate::operations::ProgressReporter;
use crate::options::ContainerOptions;
use crate::pipeline::PipelineContext;
use crate::util::{basename, CommandRunner, ExecOutput, ExecRequest};

use super::metadata::ContainerMetadata;

/// Shared collaborators every step may call out to.
#[derive(Clone)]
pub struct Backend {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub runner: Arc<dyn CommandRunner>,
    pub settings: Arc<ServiceSettings>,
}

impl Backend {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        runner: Arc<dyn CommandRunner>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            hypervisor,
            runner,
            settings: Arc::new(settings),
        }
    }

    /// Run `argv` inside a container through `incus exec`.
    pub async fn exec_in<I, S>(&self, container: &str, argv: I) -> Result<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = ExecRequest::incus_exec(&self.settings.incus_bin, container, argv)
            .timeout(self.settings.command_timeout);
        self.runner.run(request).await
    }

    /// Add a device, treating "already exists" as success.
    pub async fn ensure_device(
        &self,
        container: &str,
        device_name: &str,
        device: &DeviceConfig,
    ) -> HypervisorResult<()> {
        match self
            .hypervisor
            .add_instance_device(container, device_name, device)
            .await
        {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("settings", &self.settings)
            .finish()
    }
}

/// The host account being provisioned into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostUser {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub home_dir: String,
}

impl HostUser {
    pub fn from_uid(uid: u32) -> Result<Self> {
        let user = User::from_uid(Uid::from_raw(uid))
            .map_err(|e| KapsuleError::Internal(format!("cannot look up uid {uid}: {e}")))?
            .ok_or_else(|| KapsuleError::precondition(format!("User with UID {uid} not found")))?;
        Ok(Self {
            uid,
            gid: user.gid.as_raw(),
            username: user.name,
            home_dir: user.dir.to_string_lossy().into_owned(),
        })
    }

    /// Home path inside the container: `/home/<basename of host home>`.
    pub fn container_home(&self) -> String {
        format!("/home/{}", basename(&self.home_dir))
    }
}

/// State threaded through the `create` pipeline.
#[derive(Debug)]
pub struct CreateContext {
    pub backend: Backend,
    pub progress: ProgressReporter,
    pub name: String,
    pub image: String,
    pub options: ContainerOptions,

    pub source: Option<InstanceSource>,
    pub config: ConfigMap,
    pub devices: DeviceMap,
    pub created: bool,
}

impl CreateContext {
    pub fn new(
        backend: Backend,
        progress: ProgressReporter,
        name: impl Into<String>,
        image: impl Into<String>,
        options: ContainerOptions,
    ) -> Self {
        Self {
            backend,
            progress,
            name: name.into(),
            image: image.into(),
            options,
            source: None,
            config: ConfigMap::new(),
            devices: DeviceMap::new(),
            created: false,
        }
    }
}

impl PipelineContext for CreateContext {
    fn progress(&self) -> &ProgressReporter {
        &self.progress
    }
}

/// State threaded through the `post_create` pipeline.
#[derive(Debug)]
pub struct PostCreateContext {
    pub backend: Backend,
    pub progress: ProgressReporter,
    pub name: String,
    pub metadata: ContainerMetadata,
}

impl PostCreateContext {
    pub fn new(
        backend: Backend,
        progress: ProgressReporter,
        name: impl Into<String>,
        metadata: ContainerMetadata,
    ) -> Self {
        Self {
            backend,
            progress,
            name: name.into(),
            metadata,
        }
    }
}

impl PipelineContext for PostCreateContext {
    fn progress(&self) -> &ProgressReporter {
        &self.progress
    }
}

/// State threaded through the `user_setup` pipeline.
#[derive(Debug)]
pub struct UserSetupContext {
    pub backend: Backend,
    pub progress: ProgressReporter,
    pub container: String,
    pub user: HostUser,
    pub container_home: String,
    /// Metadata read from the instance before the run starts.
    pub metadata: ContainerMetadata,
}

impl UserSetupContext {
    pub fn new(
        backend: Backend,
        progress: ProgressReporter,
        container: impl Into<String>,
        user: HostUser,
        metadata: ContainerMetadata,
    ) -> Self {
        let container_home = user.container_home();
        Self {
            backend,
            progress,
            container: container.into(),
            user,
            container_home,
            metadata,
        }
    }
}

impl PipelineContext for UserSetupContext {
    fn progress(&self) -> &ProgressReporter {
        &self.progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_home_uses_basename() {
        let u = HostUser {
            uid: 1000,
            gid: 1000,
            username: "alice".to_string(),
            home_dir: "/var/home/alice/".to_string(),
        };
        assert_eq!(u.container_home(), "/home/alice");
    }

    #[test]
    fn root_is_resolvable() {
        let root = HostUser::from_uid(0).unwrap();
        assert_eq!(root.username, "root");
        assert_eq!(root.gid, 0);
    }
}
