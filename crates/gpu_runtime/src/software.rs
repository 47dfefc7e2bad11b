use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::{
    ContextId, ContextPurpose, DEFAULT_FENCE_WAIT_TIMEOUT, Fence, FenceKind, GlBackend, GlError,
};

#[derive(Debug)]
struct SoftwareContext {
    purpose: ContextPurpose,
    current_on: Option<ThreadId>,
    lost: bool,
}

/// CPU stand-in for a GL driver.
///
/// GPU work completes synchronously, so fences it creates are born signaled and a server
/// wait degrades to a bounded client wait.
#[derive(Debug)]
pub struct SoftwareGl {
    accelerated_buffers: bool,
    next_context_id: AtomicU64,
    contexts: Mutex<HashMap<ContextId, SoftwareContext>>,
}

impl SoftwareGl {
    pub fn new(accelerated_buffers: bool) -> Self {
        Self {
            accelerated_buffers,
            next_context_id: AtomicU64::new(1),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Marks a context as lost; every later call on it fails.
    pub fn lose_context(&self, context: ContextId) {
        if let Some(state) = self.contexts.lock().get_mut(&context) {
            state.lost = true;
        }
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.lock().len()
    }

    fn with_live_context<R>(
        &self,
        context: ContextId,
        f: impl FnOnce(&mut SoftwareContext) -> R,
    ) -> Result<R, GlError> {
        let mut contexts = self.contexts.lock();
        match contexts.get_mut(&context) {
            Some(state) if !state.lost => Ok(f(state)),
            _ => Err(GlError::ContextLost(context)),
        }
    }
}

impl GlBackend for SoftwareGl {
    fn can_use_accelerated_buffers(&self) -> bool {
        self.accelerated_buffers
    }

    fn create_context(&self, purpose: ContextPurpose) -> Result<ContextId, GlError> {
        if purpose == ContextPurpose::Painting && !self.accelerated_buffers {
            return Err(GlError::ContextCreationFailed { purpose });
        }
        let id = ContextId(self.next_context_id.fetch_add(1, Ordering::Relaxed));
        self.contexts.lock().insert(
            id,
            SoftwareContext {
                purpose,
                current_on: None,
                lost: false,
            },
        );
        Ok(id)
    }

    fn destroy_context(&self, context: ContextId) {
        self.contexts.lock().remove(&context);
    }

    fn make_current(&self, context: ContextId) -> Result<(), GlError> {
        let thread = thread::current().id();
        self.with_live_context(context, |state| {
            tracing::trace!(?context, purpose = ?state.purpose, "make current");
            state.current_on = Some(thread);
        })
    }

    fn create_fence(&self, context: ContextId) -> Result<Fence, GlError> {
        self.with_live_context(context, |_| Fence::signaled(FenceKind::GpuSync))
    }

    fn server_wait(&self, context: ContextId, fence: &Fence) -> Result<(), GlError> {
        self.with_live_context(context, |_| ())?;
        if fence.client_wait(DEFAULT_FENCE_WAIT_TIMEOUT) {
            Ok(())
        } else {
            Err(GlError::FenceTimeout(fence.id()))
        }
    }

    fn swap_buffers(&self, context: ContextId) -> Result<(), GlError> {
        self.with_live_context(context, |_| ())
    }
}
