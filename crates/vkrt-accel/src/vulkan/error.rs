//! Error type shared by every ray tracing builder.
//!
//! None of these are recoverable at the call site. Builders propagate them with
//! `?` and the application is expected to abort with the message.

use ash::vk;
use thiserror::Error;

/// Errors raised while loading ray tracing support or building GPU structures.
#[derive(Debug, Error)]
pub enum RtError {
    /// A required extension, feature or entry point is not available.
    #[error("ray tracing capability missing: {0}")]
    CapabilityMissing(String),

    /// The caller broke a builder contract (programming error).
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// A Vulkan call returned an error code.
    #[error("{op} failed: {result:?}")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
    },

    /// GPU memory could not be allocated or bound.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Command buffer recording or submission failed.
    #[error("command submission failed: {0}")]
    Submission(String),
}

/// Result alias used throughout the crate.
pub type RtResult<T> = Result<T, RtError>;

impl RtError {
    /// Build a `map_err` adapter for a failing Vulkan call.
    pub fn vk(op: &'static str) -> impl FnOnce(vk::Result) -> RtError {
        move |result| {
            log::error!("{} failed: {:?}", op, result);
            RtError::Vulkan { op, result }
        }
    }

    /// Shorthand for a precondition failure, logged where it is raised.
    pub fn precondition(msg: impl Into<String>) -> RtError {
        let msg = msg.into();
        log::error!("{}", msg);
        RtError::Precondition(msg)
    }
}

impl From<gpu_allocator::AllocationError> for RtError {
    fn from(e: gpu_allocator::AllocationError) -> Self {
        RtError::Allocation(e.to_string())
    }
}
