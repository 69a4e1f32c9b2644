use super::channel::EventConsumer;
use crossbeam::channel::RecvTimeoutError;
use std::time::Duration;

pub type CancellationMessage = ();

impl EventConsumer<CancellationMessage> {
    /// Blocks for up to `timeout` waiting for a cancellation message.
    ///
    /// Returns `true` when a message arrived or the channel was closed, so a
    /// dropped publisher also stops the consumer's loop. Returns `false` when
    /// the timeout elapsed, which makes this the interval timer of worker
    /// loops.
    pub fn is_cancelled(&self, timeout: Duration) -> bool {
        !matches!(
            self.as_ref().recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::channel::pub_sub;
    use std::time::Instant;

    #[test]
    fn times_out_without_message() {
        let (_publisher, consumer) = pub_sub::<CancellationMessage>();
        let start = Instant::now();
        assert!(!consumer.is_cancelled(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn message_cancels() {
        let (publisher, consumer) = pub_sub::<CancellationMessage>();
        publisher.publish(()).unwrap();
        assert!(consumer.is_cancelled(Duration::from_secs(5)));
    }

    #[test]
    fn dropped_publisher_cancels() {
        let (publisher, consumer) = pub_sub::<CancellationMessage>();
        drop(publisher);
        assert!(consumer.is_cancelled(Duration::from_secs(5)));
    }
}
