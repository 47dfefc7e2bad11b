use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::{Fence, GlBackend, GlError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextPurpose {
    /// The compositing thread's context, bound to the presentation surface.
    Compositing,
    /// Offscreen context used to rasterize tiles.
    Painting,
}

/// A GL context bound to the thread that created it.
pub struct GlContext {
    id: ContextId,
    purpose: ContextPurpose,
    owner: ThreadId,
    backend: Arc<dyn GlBackend>,
    // Keeps the context on its owning thread.
    _not_send: PhantomData<*const ()>,
}

impl GlContext {
    pub(crate) fn new(id: ContextId, purpose: ContextPurpose, backend: Arc<dyn GlBackend>) -> Self {
        Self {
            id,
            purpose,
            owner: thread::current().id(),
            backend,
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn purpose(&self) -> ContextPurpose {
        self.purpose
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    fn check_owner(&self) -> Result<(), GlError> {
        if thread::current().id() != self.owner {
            debug_assert!(false, "GL context {:?} used off its owning thread", self.id);
            return Err(GlError::WrongThread(self.id));
        }
        Ok(())
    }

    pub fn make_context_current(&self) -> bool {
        let result = self
            .check_owner()
            .and_then(|()| self.backend.make_current(self.id));
        match result {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(context = ?self.id, %error, "make current failed");
                false
            }
        }
    }

    pub fn create_fence(&self) -> Result<Fence, GlError> {
        self.check_owner()?;
        self.backend.create_fence(self.id)
    }

    pub fn server_wait(&self, fence: &Fence) -> Result<(), GlError> {
        self.check_owner()?;
        if fence.is_signaled() {
            return Ok(());
        }
        self.backend.server_wait(self.id, fence)
    }

    pub fn swap_buffers(&self) -> Result<(), GlError> {
        self.check_owner()?;
        self.backend.swap_buffers(self.id)
    }
}

impl Drop for GlContext {
    fn drop(&mut self) {
        self.backend.destroy_context(self.id);
    }
}

impl std::fmt::Debug for GlContext {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("GlContext")
            .field("id", &self.id)
            .field("purpose", &self.purpose)
            .field("owner", &self.owner)
            .finish()
    }
}
