use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceId(u64);

impl FenceId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    /// Server-side GPU sync object, waited on by a GL context.
    GpuSync,
    /// Exportable native fence file descriptor for cross-process consumers.
    NativeFd(i32),
}

struct FenceState {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

/// One-shot synchronization token.
///
/// Clones share the same state: signaling any clone releases every waiter.
#[derive(Clone)]
pub struct Fence {
    id: FenceId,
    kind: FenceKind,
    state: Arc<FenceState>,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Fence")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

impl Fence {
    pub fn new(kind: FenceKind) -> Self {
        Self {
            id: FenceId(NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
            state: Arc::new(FenceState {
                signaled: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    /// A fence whose producer already finished.
    pub fn signaled(kind: FenceKind) -> Self {
        let fence = Self::new(kind);
        fence.signal();
        fence
    }

    pub fn id(&self) -> FenceId {
        self.id
    }

    pub fn kind(&self) -> FenceKind {
        self.kind
    }

    pub fn export_fd(&self) -> Option<i32> {
        match self.kind {
            FenceKind::NativeFd(fd) => Some(fd),
            FenceKind::GpuSync => None,
        }
    }

    pub fn signal(&self) {
        let mut signaled = self.state.signaled.lock();
        if !*signaled {
            *signaled = true;
            self.state.condvar.notify_all();
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.state.signaled.lock()
    }

    /// Blocks the calling thread until signaled. Returns `false` on timeout.
    pub fn client_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.state.signaled.lock();
        while !*signaled {
            if self
                .state
                .condvar
                .wait_until(&mut signaled, deadline)
                .timed_out()
            {
                return *signaled;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn clones_share_signal_state() {
        let fence = Fence::new(FenceKind::GpuSync);
        let clone = fence.clone();
        assert!(!clone.is_signaled());
        fence.signal();
        assert!(clone.is_signaled());
        assert_eq!(fence.id(), clone.id());
    }

    #[test]
    fn client_wait_times_out_when_never_signaled() {
        let fence = Fence::new(FenceKind::GpuSync);
        assert!(!fence.client_wait(Duration::from_millis(5)));
    }

    #[test]
    fn client_wait_wakes_on_signal_from_other_thread() {
        let fence = Fence::new(FenceKind::NativeFd(7));
        let producer = fence.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.signal();
        });
        assert!(fence.client_wait(Duration::from_secs(5)));
        assert_eq!(fence.export_fd(), Some(7));
        handle.join().unwrap();
    }
}
