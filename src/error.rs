//! Error types shared by the runtime layer and the update orchestrator.
//!
//! [`RuntimeError`] is what a [`ContainerRuntime`](crate::runtime::ContainerRuntime)
//! reports for a single call. [`UpdateError`] wraps those failures with the
//! container and the step they happened in, and [`ErrorKind`] flattens both
//! into the taxonomy callers match on.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Flat classification of every failure this crate reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Lookup of a container (or a stale reference) failed.
    NotFound,
    /// The requested image could not be resolved or pulled.
    ImageUnavailable,
    /// Transient failure talking to the container engine.
    RuntimeUnavailable,
    /// The engine refused the operation.
    PermissionDenied,
    /// Malformed configuration, snapshot or image reference.
    ValidationError,
    /// A replacement container never reached the running state.
    NotRunning,
    /// Terminal: the rollback itself failed.
    RollbackFailed,
    /// The update task was torn down before reaching a terminal state.
    Interrupted,
}

/// Failure reported by a container runtime for one call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("image unavailable: {0}")]
    ImageUnavailable(String),
    #[error("container engine unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid container configuration: {0}")]
    Validation(String),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::NotFound(_) => ErrorKind::NotFound,
            RuntimeError::ImageUnavailable(_) => ErrorKind::ImageUnavailable,
            RuntimeError::Unavailable(_) => ErrorKind::RuntimeUnavailable,
            RuntimeError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            RuntimeError::Validation(_) => ErrorKind::ValidationError,
        }
    }
}

/// The runtime call an [`UpdateError::Runtime`] happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Locate,
    Inspect,
    Remove,
    Create,
    Start,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Locate => "locate",
            Step::Inspect => "inspect",
            Step::Remove => "remove",
            Step::Create => "create",
            Step::Start => "start",
        };
        f.write_str(s)
    }
}

/// Failure of an update (or plain recreate) of a named container.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("invalid image reference `{0}`")]
    InvalidImage(String),

    #[error("no container named `{0}`")]
    NotFound(String),

    #[error("{step} failed for container `{name}`")]
    Runtime {
        name: String,
        step: Step,
        #[source]
        source: RuntimeError,
    },

    #[error("engine declined to start container `{0}`")]
    NotStarted(String),

    #[error("container `{name}` was not running within {timeout:?}")]
    NotRunning { name: String, timeout: Duration },

    /// Both the update and its rollback failed. The container named `name`
    /// may no longer exist.
    #[error("rollback of `{name}` failed ({rollback}) after update failure ({original})")]
    RollbackFailed {
        name: String,
        original: Box<UpdateError>,
        #[source]
        rollback: Box<UpdateError>,
    },

    #[error("update of `{name}` was interrupted: {reason}")]
    Interrupted { name: String, reason: String },
}

impl UpdateError {
    pub(crate) fn runtime(name: &str, step: Step, source: RuntimeError) -> Self {
        UpdateError::Runtime {
            name: name.to_owned(),
            step,
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::InvalidImage(_) => ErrorKind::ValidationError,
            UpdateError::NotFound(_) => ErrorKind::NotFound,
            UpdateError::Runtime { source, .. } => source.kind(),
            UpdateError::NotStarted(_) | UpdateError::NotRunning { .. } => ErrorKind::NotRunning,
            UpdateError::RollbackFailed { .. } => ErrorKind::RollbackFailed,
            UpdateError::Interrupted { .. } => ErrorKind::Interrupted,
        }
    }

    /// The error that caused a rollback, when this is a rollback failure.
    pub fn original(&self) -> Option<&UpdateError> {
        match self {
            UpdateError::RollbackFailed { original, .. } => Some(original),
            _ => None,
        }
    }

    /// The error the rollback itself hit, when this is a rollback failure.
    pub fn rollback(&self) -> Option<&UpdateError> {
        match self {
            UpdateError::RollbackFailed { rollback, .. } => Some(rollback),
            _ => None,
        }
    }
}
