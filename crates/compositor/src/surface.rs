use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::SegQueue;
use gpu_runtime::{Fence, GlContext};
use parking_lot::Mutex;
use protocol::PresentedFrameInfo;
use render_protocol::{IntSize, PixelBuffer};
use threads::RunLoopHandle;

use crate::damage::{Damage, DamageMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SurfaceError {
    #[error("every render target is still held by the presenter")]
    NoFreeTarget,
    #[error("surface size is empty")]
    ZeroSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFormat {
    Rgba8Premultiplied,
}

/// One presented buffer, borrowed for the duration of [`FrameSink::present`].
#[derive(Debug)]
pub struct PresentedFrame<'a> {
    pub frame_number: u64,
    pub target: TargetId,
    pub size: IntSize,
    pub stride: usize,
    pub format: BufferFormat,
    pub pixels: &'a PixelBuffer,
    /// `None` when the whole buffer changed.
    pub damage: Option<&'a Damage>,
    /// Signaled once the compositor's rendering into the buffer is done.
    pub producer_fence: Option<Fence>,
}

/// Windowing side of the swap chain.
///
/// A presented target stays unavailable to the compositor until it is handed back through
/// the [`TargetReleaser`], either inside `present` or later from any thread.
pub trait FrameSink: Send + 'static {
    fn present(&mut self, frame: PresentedFrame<'_>, releaser: &TargetReleaser);

    fn visibility_did_change(&mut self, _visible: bool) {}
}

struct ReleaseShared {
    queue: SegQueue<(TargetId, Option<Fence>)>,
    starved: AtomicBool,
    waker: Mutex<Option<RunLoopHandle>>,
}

/// Returns presented targets to the swap chain. Cloneable and usable from any thread.
#[derive(Clone)]
pub struct TargetReleaser {
    shared: Arc<ReleaseShared>,
}

impl TargetReleaser {
    fn new() -> Self {
        Self {
            shared: Arc::new(ReleaseShared {
                queue: SegQueue::new(),
                starved: AtomicBool::new(false),
                waker: Mutex::new(None),
            }),
        }
    }

    /// `release_fence` must be waited on before the compositor draws into the target
    /// again.
    pub fn release(&self, target: TargetId, release_fence: Option<Fence>) {
        self.shared.queue.push((target, release_fence));
        if self.shared.starved.swap(false, Ordering::AcqRel) {
            if let Some(waker) = self.shared.waker.lock().as_ref() {
                tracing::trace!(?target, "target released, retrying skipped frame");
                waker.schedule_update();
            }
        }
    }

    pub(crate) fn set_waker(&self, handle: RunLoopHandle) {
        *self.shared.waker.lock() = Some(handle);
    }
}

impl std::fmt::Debug for TargetReleaser {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TargetReleaser")
            .field("queued", &self.shared.queue.len())
            .field("starved", &self.shared.starved.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    Free,
    Rendering,
    Presented,
}

#[derive(Debug)]
struct RenderTarget {
    id: TargetId,
    pixels: PixelBuffer,
    state: TargetState,
    release_fence: Option<Fence>,
    /// `None` means the contents are undefined and must be repainted in full.
    damage_since_last_use: Option<Damage>,
}

/// Fixed-depth chain of render targets cycling between the compositor and a
/// [`FrameSink`].
pub struct SwapChainSurface {
    sink: Box<dyn FrameSink>,
    depth: usize,
    targets: Vec<RenderTarget>,
    current: Option<usize>,
    next_target_id: u64,
    frame_number: u64,
    frame_damage: Option<Damage>,
    releaser: TargetReleaser,
}

impl SwapChainSurface {
    pub fn new(sink: Box<dyn FrameSink>, depth: usize) -> Self {
        Self {
            sink,
            depth: depth.max(1),
            targets: Vec::new(),
            current: None,
            next_target_id: 1,
            frame_number: 0,
            frame_damage: None,
            releaser: TargetReleaser::new(),
        }
    }

    pub fn releaser(&self) -> TargetReleaser {
        self.releaser.clone()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Picks a free target for the next frame, waiting on its release fence.
    pub fn will_render_frame(
        &mut self,
        size: IntSize,
        context: &GlContext,
    ) -> Result<(), SurfaceError> {
        if size.is_empty() {
            return Err(SurfaceError::ZeroSize);
        }
        self.collect_releases();
        debug_assert!(self.current.is_none(), "previous frame was never presented");
        self.current = None;
        self.frame_damage = None;

        let index = match self
            .targets
            .iter()
            .position(|target| target.state == TargetState::Free)
        {
            Some(index) => index,
            None if self.targets.len() < self.depth => {
                let id = TargetId(self.next_target_id);
                self.next_target_id += 1;
                tracing::debug!(?id, ?size, "render target created");
                self.targets.push(RenderTarget {
                    id,
                    pixels: PixelBuffer::new(size),
                    state: TargetState::Free,
                    release_fence: None,
                    damage_since_last_use: None,
                });
                self.targets.len() - 1
            }
            None => {
                self.releaser.shared.starved.store(true, Ordering::Release);
                // A release may have raced in before the flag was set.
                if !self.releaser.shared.queue.is_empty() {
                    self.releaser.shared.starved.store(false, Ordering::Release);
                    return self.will_render_frame(size, context);
                }
                return Err(SurfaceError::NoFreeTarget);
            }
        };

        let target = &mut self.targets[index];
        if target.pixels.size() != size {
            target.pixels = PixelBuffer::new(size);
            target.damage_since_last_use = None;
        }
        if let Some(fence) = target.release_fence.take() {
            if let Err(error) = context.server_wait(&fence) {
                tracing::warn!(target = ?target.id, %error, "release fence wait failed, recreating target");
                target.pixels = PixelBuffer::new(size);
                target.damage_since_last_use = None;
            }
        }
        target.state = TargetState::Rendering;
        self.current = Some(index);
        Ok(())
    }

    /// Records this frame's damage on every target.
    pub fn set_frame_damage(&mut self, damage: Damage) {
        for target in &mut self.targets {
            if let Some(accumulated) = target.damage_since_last_use.as_mut() {
                accumulated.add_damage(&damage);
            }
        }
        self.frame_damage = Some(damage);
    }

    /// Damage accumulated on the current target since it was last rendered. `None` means
    /// it must be repainted in full.
    pub fn frame_damage_since_last_use(&self) -> Option<&Damage> {
        let index = self.current?;
        self.targets[index].damage_since_last_use.as_ref()
    }

    pub fn backbuffer_mut(&mut self) -> Option<&mut PixelBuffer> {
        let index = self.current?;
        Some(&mut self.targets[index].pixels)
    }

    pub fn backbuffer(&self) -> Option<&PixelBuffer> {
        let index = self.current?;
        Some(&self.targets[index].pixels)
    }

    /// Hands the current target to the sink.
    pub fn did_render_frame(&mut self, producer_fence: Option<Fence>) -> Option<PresentedFrameInfo> {
        let index = self.current.take()?;
        self.frame_number += 1;
        let frame_damage = self.frame_damage.take();
        let target = &mut self.targets[index];
        target.state = TargetState::Presented;
        target.damage_since_last_use =
            Some(Damage::new(target.pixels.size(), DamageMode::Rectangles));

        let info = PresentedFrameInfo {
            frame_number: self.frame_number,
            target_id: target.id.0,
            damage_rect_count: frame_damage
                .as_ref()
                .map_or(0, |damage| damage.rects().len() as u32),
        };
        let frame = PresentedFrame {
            frame_number: self.frame_number,
            target: target.id,
            size: target.pixels.size(),
            stride: target.pixels.stride(),
            format: BufferFormat::Rgba8Premultiplied,
            pixels: &target.pixels,
            damage: frame_damage.as_ref(),
            producer_fence,
        };
        self.sink.present(frame, &self.releaser);
        Some(info)
    }

    pub fn visibility_did_change(&mut self, visible: bool) {
        tracing::debug!(visible, "surface visibility changed");
        self.sink.visibility_did_change(visible);
    }

    /// Drops every target; called before the compositing context goes away.
    pub fn will_destroy_gl_context(&mut self) {
        self.current = None;
        self.frame_damage = None;
        self.targets.clear();
        while self.releaser.shared.queue.pop().is_some() {}
    }

    fn collect_releases(&mut self) {
        while let Some((id, fence)) = self.releaser.shared.queue.pop() {
            let Some(target) = self.targets.iter_mut().find(|target| target.id == id) else {
                tracing::trace!(?id, "release of an unknown target ignored");
                continue;
            };
            debug_assert_eq!(target.state, TargetState::Presented, "target released twice");
            if target.state == TargetState::Presented {
                target.state = TargetState::Free;
                target.release_fence = fence;
            }
        }
    }
}

impl std::fmt::Debug for SwapChainSurface {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SwapChainSurface")
            .field("depth", &self.depth)
            .field("targets", &self.targets.len())
            .field("frame_number", &self.frame_number)
            .finish()
    }
}
