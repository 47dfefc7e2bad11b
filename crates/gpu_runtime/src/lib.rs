//! GL display, context, and fence plumbing.
//!
//! The actual driver calls live behind [`GlBackend`]; this crate only adds the ownership
//! rules around them. A [`GlContext`] is tagged with the thread that created it and is
//! neither `Send` nor `Sync`, so the compiler keeps it on that thread. Work crosses
//! threads through [`Fence`]s.

mod context;
mod fence;
mod software;

use std::sync::Arc;
use std::time::Duration;

pub use context::{ContextId, ContextPurpose, GlContext};
pub use fence::{Fence, FenceId, FenceKind};
pub use software::SoftwareGl;

/// Default budget for a server-side fence wait before the context is considered lost.
pub const DEFAULT_FENCE_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GlError {
    #[error("failed to create {purpose:?} GL context")]
    ContextCreationFailed { purpose: ContextPurpose },
    #[error("GL context {0:?} was lost")]
    ContextLost(ContextId),
    #[error("GL context {0:?} could not be made current")]
    MakeCurrentFailed(ContextId),
    #[error("timed out waiting on fence {0:?}")]
    FenceTimeout(FenceId),
    #[error("GL context {0:?} used off its owning thread")]
    WrongThread(ContextId),
}

/// Driver boundary (EGL/GL or an equivalent). Implementations must be callable from any
/// thread; thread affinity is enforced by [`GlContext`].
pub trait GlBackend: Send + Sync + 'static {
    fn can_use_accelerated_buffers(&self) -> bool;

    fn create_context(&self, purpose: ContextPurpose) -> Result<ContextId, GlError>;

    fn destroy_context(&self, context: ContextId);

    fn make_current(&self, context: ContextId) -> Result<(), GlError>;

    /// Fence that signals once the GPU work issued so far on `context` has finished.
    fn create_fence(&self, context: ContextId) -> Result<Fence, GlError>;

    /// Orders subsequent commands on `context` after `fence` without stalling the CPU
    /// where the driver allows it.
    fn server_wait(&self, context: ContextId, fence: &Fence) -> Result<(), GlError>;

    fn swap_buffers(&self, context: ContextId) -> Result<(), GlError>;
}

/// Explicitly constructed display shared by every component of a rendering session.
pub struct PlatformDisplay {
    backend: Arc<dyn GlBackend>,
    accelerated_buffers_disabled: bool,
}

impl PlatformDisplay {
    pub fn new(backend: Arc<dyn GlBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            accelerated_buffers_disabled: false,
        })
    }

    /// Display that refuses GPU-backed buffers regardless of driver support.
    pub fn cpu_only(backend: Arc<dyn GlBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            accelerated_buffers_disabled: true,
        })
    }

    pub fn can_use_accelerated_buffers(&self) -> bool {
        !self.accelerated_buffers_disabled && self.backend.can_use_accelerated_buffers()
    }

    /// Creates a context owned by the calling thread.
    pub fn create_context(&self, purpose: ContextPurpose) -> Result<GlContext, GlError> {
        let id = self.backend.create_context(purpose)?;
        tracing::debug!(?id, ?purpose, "created GL context");
        Ok(GlContext::new(id, purpose, self.backend.clone()))
    }

    pub fn backend(&self) -> &Arc<dyn GlBackend> {
        &self.backend
    }
}

impl std::fmt::Debug for PlatformDisplay {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PlatformDisplay")
            .field("accelerated_buffers", &self.can_use_accelerated_buffers())
            .finish()
    }
}
