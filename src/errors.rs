//! Error taxonomy for provisioning operations.
//!
//! Error mapping guide:
//! - Precondition errors (exists / missing / wrong state) are definitive; never retried.
//! - Hypervisor errors are wrapped with a one-line context via `HypervisorResultExt::context`.
//! - Validation errors are raised before any side effect happens.
//! - Best-effort failures never reach this type; steps downgrade them to warnings.
use std::io;

use thiserror::Error;

use crate::options::OptionValidationError;

/// Error reported by the hypervisor service (message plus optional status code).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HypervisorError {
    pub message: String,
    pub code: Option<u16>,
}

impl HypervisorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == Some(404) || self.message.to_ascii_lowercase().contains("not found")
    }

    pub fn is_already_exists(&self) -> bool {
        self.code == Some(409) || self.message.to_ascii_lowercase().contains("already exists")
    }
}

#[derive(Debug, Error)]
pub enum KapsuleError {
    /// Target already exists, does not exist, or is in the wrong state.
    #[error("{0}")]
    Precondition(String),

    #[error("{context}: {source}")]
    Hypervisor {
        context: String,
        #[source]
        source: HypervisorError,
    },

    #[error(transparent)]
    Validation(#[from] OptionValidationError),

    /// The hypervisor accepted the request but reported the operation as unsuccessful.
    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    Command(String),

    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Internal(String),
}

impl KapsuleError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        KapsuleError::Precondition(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        KapsuleError::Failed(msg.into())
    }
}

pub type Result<T, E = KapsuleError> = std::result::Result<T, E>;

/// Attach a one-line context to hypervisor failures.
pub trait HypervisorResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> HypervisorResultExt<T> for std::result::Result<T, HypervisorError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| KapsuleError::Hypervisor {
            context: context.into(),
            source,
        })
    }
}

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Convert a KapsuleError to a process exit code.
pub fn exit_code_for_error(e: &KapsuleError) -> u8 {
    match e {
        KapsuleError::Io(ioe) => exit_code_for_io_error(ioe),
        KapsuleError::Validation(_) => 2,
        _ => 1,
    }
}
