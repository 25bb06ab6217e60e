//! Error types for the control surface and graph construction.

use thiserror::Error;

use crate::core::failure::Failure;
use crate::core::worker_pool::PoolError;

/// Errors produced by runtime construction and the lifecycle control surface.
///
/// Failures of work inside a running flow are not errors of this type; they
/// are [`Failure`] values routed through escalation.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The flow graph failed validation.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    /// A node name did not resolve.
    #[error("unknown node: {0}")]
    UnknownNode(String),
    /// A pool name did not resolve.
    #[error("unknown pool: {0}")]
    UnknownPool(String),
    /// A resource key did not resolve or is not process-scoped.
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    /// The process scope is closing or closed.
    #[error("process scope {0} is closed")]
    ProcessClosed(String),
    /// The default failure handler failed and the process scope was torn down.
    #[error("process scope terminated fatally: {0}")]
    Fatal(Failure),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A worker pool operation failed.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::InvalidGraph(_) => "invalid_graph",
            Self::UnknownNode(_) => "unknown_node",
            Self::UnknownPool(_) => "unknown_pool",
            Self::UnknownResource(_) => "unknown_resource",
            Self::ProcessClosed(_) => "process_closed",
            Self::Fatal(_) => "fatal",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Pool(_) => "pool",
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
