//! Container provisioning: contexts, the three pipelines, entering, and the service
//! surface that ties them to the operation tracker.

pub mod constants;
pub mod context;
pub mod create;
pub mod enter;
pub mod metadata;
pub mod pipelines;
pub mod post_create;
pub mod service;
pub mod user_setup;

pub use context::{Backend, CreateContext, HostUser, PostCreateContext, UserSetupContext};
pub use enter::build_enter_command;
pub use metadata::{ContainerMetadata, ContainerMode};
pub use pipelines::Pipelines;
pub use service::{ContainerService, ContainerSummary};
