use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;

/// Receiving half of a typed event channel.
pub struct EventConsumer<E>(Receiver<E>);

/// Sending half of a typed event channel. Cheap to clone.
pub struct EventPublisher<E>(Sender<E>);

#[derive(Debug, Error, PartialEq)]
pub enum EventPublisherError {
    #[error("error while publishing event: {0}")]
    SendError(String),
}

/// Creates a connected publisher/consumer pair.
pub fn pub_sub<E>() -> (EventPublisher<E>, EventConsumer<E>) {
    let (tx, rx) = unbounded();
    (EventPublisher(tx), EventConsumer(rx))
}

impl<E> EventPublisher<E> {
    pub fn publish(&self, event: E) -> Result<(), EventPublisherError> {
        self.0
            .send(event)
            .map_err(|err| EventPublisherError::SendError(err.to_string()))
    }
}

impl<E> Clone for EventPublisher<E> {
    fn clone(&self) -> Self {
        EventPublisher(self.0.clone())
    }
}

impl<E> From<Sender<E>> for EventPublisher<E> {
    fn from(value: Sender<E>) -> Self {
        Self(value)
    }
}

impl<E> From<Receiver<E>> for EventConsumer<E> {
    fn from(value: Receiver<E>) -> Self {
        Self(value)
    }
}

impl<E> AsRef<Receiver<E>> for EventConsumer<E> {
    fn as_ref(&self) -> &Receiver<E> {
        &self.0
    }
}
