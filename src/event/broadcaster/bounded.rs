use crate::event::channel::EventConsumer;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// An event that can be fanned out, classified by a fieldless kind so
/// subscribers can register for a subset of the channel.
pub trait BroadcastEvent: Clone {
    type Kind: Copy + Eq + Hash;

    fn kind(&self) -> Self::Kind;
}

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// A multi-subscriber broadcast channel with bounded, drop-oldest buffering.
///
/// Every subscriber owns a bounded queue. When a subscriber falls behind and
/// its queue fills up, the broadcaster discards that subscriber's oldest
/// queued events to make room, so a slow subscriber loses history instead of
/// stalling the emitter. Disconnected subscribers are pruned on the next
/// broadcast.
///
/// Clones share the subscriber list, so any component holding a clone
/// publishes into the same fan-out.
pub struct BoundedBroadcast<T: BroadcastEvent> {
    subscribers: Arc<Mutex<Vec<Subscription<T>>>>,
    capacity: usize,
}

struct Subscription<T: BroadcastEvent> {
    tx: Sender<T>,
    // Clone of the subscriber's receiving half, used to discard the oldest
    // queued event when the queue is full.
    drain: Receiver<T>,
    kinds: Option<HashSet<T::Kind>>,
}

impl<T: BroadcastEvent> Default for BoundedBroadcast<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl<T: BroadcastEvent> Clone for BoundedBroadcast<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: BroadcastEvent> BoundedBroadcast<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    /// Registers a wildcard subscriber receiving every event on the channel.
    pub fn subscribe(&self) -> EventConsumer<T> {
        self.register(None)
    }

    /// Registers a subscriber receiving only events of the given kinds.
    pub fn subscribe_to(&self, kinds: &[T::Kind]) -> EventConsumer<T> {
        self.register(Some(kinds.iter().copied().collect()))
    }

    fn register(&self, kinds: Option<HashSet<T::Kind>>) -> EventConsumer<T> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers
            .lock()
            .expect("failed to acquire the subscriber lock")
            .push(Subscription {
                tx,
                drain: rx.clone(),
                kinds,
            });
        EventConsumer::from(rx)
    }

    /// Delivers `message` to every matching subscriber without blocking.
    pub fn broadcast(&self, message: T) {
        let kind = message.kind();
        self.subscribers
            .lock()
            .expect("failed to acquire the subscriber lock")
            .retain(|sub| {
                if let Some(kinds) = &sub.kinds {
                    if !kinds.contains(&kind) {
                        return true;
                    }
                }
                while sub.tx.is_full() {
                    if sub.drain.try_recv().is_err() {
                        break;
                    }
                }
                match sub.tx.try_send(message.clone()) {
                    Ok(()) => true,
                    // A concurrent consumer refilled the queue between the
                    // drain and the send; the newest event is dropped for
                    // this subscriber only.
                    Err(TrySendError::Full(_)) => true,
                    Err(TrySendError::Disconnected(_)) => false,
                }
            });
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("failed to acquire the subscriber lock")
            .len()
    }
}
