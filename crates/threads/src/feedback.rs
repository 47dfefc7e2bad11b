use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use protocol::CompositorFeedback;
use rtrb::{Consumer, Producer, PushError, RingBuffer};

/// Compositing-thread end of the feedback channel.
///
/// When the ring is full, feedback is merged into a local pending frame and pushed on the
/// next attempt, so a slow consumer sees fewer frames but never loses a counter or a
/// composition response.
pub struct FeedbackProducer {
    ring: Producer<CompositorFeedback>,
    pending: Option<CompositorFeedback>,
    notify: Sender<()>,
}

impl FeedbackProducer {
    pub fn push(&mut self, feedback: CompositorFeedback) {
        let merged = match self.pending.take() {
            Some(pending) => CompositorFeedback::merge_mailbox(pending, feedback),
            None => feedback,
        };
        self.pending = Some(merged);
        self.flush();
    }

    /// Retries a frame left pending by a full ring.
    pub fn flush(&mut self) {
        let Some(frame) = self.pending.take() else {
            return;
        };
        match self.ring.push(frame) {
            Ok(()) => match self.notify.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    tracing::trace!("feedback consumer is gone");
                }
            },
            Err(PushError::Full(frame)) => {
                self.pending = Some(frame);
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Controlling-thread end of the feedback channel.
pub struct FeedbackConsumer {
    ring: Consumer<CompositorFeedback>,
    notify: Receiver<()>,
}

impl FeedbackConsumer {
    /// Pops everything available and merges it into one frame.
    pub fn drain(&mut self) -> Option<CompositorFeedback> {
        let mut merged: Option<CompositorFeedback> = None;
        while let Ok(frame) = self.ring.pop() {
            merged = Some(match merged {
                Some(current) => CompositorFeedback::merge_mailbox(current, frame),
                None => frame,
            });
        }
        merged
    }

    /// Waits for the producer to signal new feedback. Returns false on timeout or when
    /// the producer is gone.
    pub fn wait(&self, timeout: Duration) -> bool {
        if !self.ring.is_empty() {
            return true;
        }
        match self.notify.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => !self.ring.is_empty(),
            Err(RecvTimeoutError::Disconnected) => !self.ring.is_empty(),
        }
    }

    /// Receiver an event loop can `select!` on alongside its own sources.
    pub fn notifier(&self) -> Receiver<()> {
        self.notify.clone()
    }
}

pub fn feedback_channel(capacity: usize) -> (FeedbackProducer, FeedbackConsumer) {
    assert!(capacity > 0, "feedback capacity must be greater than zero");
    let (ring_producer, ring_consumer) = RingBuffer::new(capacity);
    let (notify_sender, notify_receiver) = bounded(1);
    (
        FeedbackProducer {
            ring: ring_producer,
            pending: None,
            notify: notify_sender,
        },
        FeedbackConsumer {
            ring: ring_consumer,
            notify: notify_receiver,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::CompositionResponseId;

    #[test]
    fn full_ring_merges_instead_of_dropping() {
        let (mut producer, mut consumer) = feedback_channel(1);
        producer.push(CompositorFeedback::will_render_frame());
        producer.push(CompositorFeedback::did_render_frame(
            CompositionResponseId(1),
            None,
        ));
        producer.push(CompositorFeedback::did_render_frame(
            CompositionResponseId(2),
            None,
        ));
        assert!(producer.has_pending());

        let first = consumer.drain().unwrap();
        assert_eq!(first.will_render_frames, 1);
        assert_eq!(first.composition_response, None);

        producer.flush();
        let second = consumer.drain().unwrap();
        assert_eq!(second.did_render_frames, 2);
        assert_eq!(second.composition_response, Some(CompositionResponseId(2)));
        assert!(consumer.drain().is_none());
    }

    #[test]
    fn consumer_wakes_on_feedback_from_other_thread() {
        let (mut producer, mut consumer) = feedback_channel(4);
        let handle = std::thread::spawn(move || {
            producer.push(CompositorFeedback::did_render_frame(
                CompositionResponseId(7),
                None,
            ));
        });
        assert!(consumer.wait(Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(
            consumer.drain().and_then(|frame| frame.composition_response),
            Some(CompositionResponseId(7))
        );
    }
}
