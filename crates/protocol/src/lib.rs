use smallvec::SmallVec;

/// Identifier of a composition the controlling thread asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CompositionRequestId(pub u32);

/// Identifier of the last composition request fully composited and presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CompositionResponseId(pub u32);

impl CompositionRequestId {
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl CompositionResponseId {
    /// Whether this response covers `request`.
    pub fn satisfies(self, request: CompositionRequestId) -> bool {
        self.0 >= request.0
    }
}

impl From<CompositionRequestId> for CompositionResponseId {
    fn from(request: CompositionRequestId) -> Self {
        Self(request.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentedFrameInfo {
    pub frame_number: u64,
    pub target_id: u64,
    pub damage_rect_count: u32,
}

/// What the compositing thread reports back to the controlling thread.
///
/// Frames are merged mailbox-style by the consumer: counters add up, the response id and
/// frame information keep the newest value. Nothing is dropped when the consumer lags, it
/// only sees fewer, fatter frames.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompositorFeedback {
    pub will_render_frames: u32,
    pub did_render_frames: u32,
    pub composition_response: Option<CompositionResponseId>,
    pub presented: SmallVec<[PresentedFrameInfo; 2]>,
}

impl CompositorFeedback {
    pub fn will_render_frame() -> Self {
        Self {
            will_render_frames: 1,
            ..Self::default()
        }
    }

    pub fn did_render_frame(
        response: CompositionResponseId,
        presented: Option<PresentedFrameInfo>,
    ) -> Self {
        Self {
            did_render_frames: 1,
            composition_response: Some(response),
            presented: presented.into_iter().collect(),
            ..Self::default()
        }
    }

    /// A cycle that could not produce a frame still answers the pending request.
    pub fn composition_skipped(response: CompositionResponseId) -> Self {
        Self {
            composition_response: Some(response),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.will_render_frames == 0
            && self.did_render_frames == 0
            && self.composition_response.is_none()
            && self.presented.is_empty()
    }

    pub fn merge_mailbox(mut current: Self, newer: Self) -> Self {
        current.will_render_frames = current
            .will_render_frames
            .saturating_add(newer.will_render_frames);
        current.did_render_frames = current
            .did_render_frames
            .saturating_add(newer.did_render_frames);
        current.composition_response = match (current.composition_response, newer.composition_response)
        {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        const MAX_PRESENTED_HISTORY: usize = 2;
        current.presented.extend(newer.presented);
        let excess = current.presented.len().saturating_sub(MAX_PRESENTED_HISTORY);
        if excess > 0 {
            current.presented.drain(..excess);
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presented(frame_number: u64) -> PresentedFrameInfo {
        PresentedFrameInfo {
            frame_number,
            target_id: frame_number % 3,
            damage_rect_count: 1,
        }
    }

    #[test]
    fn mailbox_merge_keeps_newest_response_and_sums_counters() {
        let current = CompositorFeedback::did_render_frame(
            CompositionResponseId(4),
            Some(presented(1)),
        );
        let newer = CompositorFeedback::merge_mailbox(
            CompositorFeedback::will_render_frame(),
            CompositorFeedback::did_render_frame(CompositionResponseId(6), Some(presented(2))),
        );

        let merged = CompositorFeedback::merge_mailbox(current, newer);
        assert_eq!(merged.will_render_frames, 1);
        assert_eq!(merged.did_render_frames, 2);
        assert_eq!(merged.composition_response, Some(CompositionResponseId(6)));
        assert_eq!(merged.presented.len(), 2);
    }

    #[test]
    fn merge_never_regresses_the_response() {
        let merged = CompositorFeedback::merge_mailbox(
            CompositorFeedback::did_render_frame(CompositionResponseId(9), None),
            CompositorFeedback::did_render_frame(CompositionResponseId(3), None),
        );
        assert_eq!(merged.composition_response, Some(CompositionResponseId(9)));
    }

    #[test]
    fn presented_history_is_bounded() {
        let mut merged = CompositorFeedback::default();
        for frame_number in 0..5 {
            merged = CompositorFeedback::merge_mailbox(
                merged,
                CompositorFeedback::did_render_frame(
                    CompositionResponseId(frame_number as u32),
                    Some(presented(frame_number)),
                ),
            );
        }
        let frames: Vec<u64> = merged.presented.iter().map(|p| p.frame_number).collect();
        assert_eq!(frames, vec![3, 4]);
    }

    #[test]
    fn skipped_composition_answers_without_a_frame() {
        let merged = CompositorFeedback::merge_mailbox(
            CompositorFeedback::will_render_frame(),
            CompositorFeedback::composition_skipped(CompositionResponseId(2)),
        );
        assert_eq!(merged.did_render_frames, 0);
        assert!(merged.presented.is_empty());
        assert_eq!(merged.composition_response, Some(CompositionResponseId(2)));
        assert!(!CompositorFeedback::composition_skipped(CompositionResponseId(0)).is_empty());
    }

    #[test]
    fn response_satisfies_equal_or_older_requests() {
        let response = CompositionResponseId(5);
        assert!(response.satisfies(CompositionRequestId(5)));
        assert!(response.satisfies(CompositionRequestId(2)));
        assert!(!response.satisfies(CompositionRequestId(6)));
        assert!(CompositorFeedback::default().is_empty());
    }
}
