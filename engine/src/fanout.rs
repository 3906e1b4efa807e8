//! Multi-subscriber delivery of ordered event streams.
//!
//! A [`Fanout`] tracks subscribers and pushes every broadcast message to each
//! of them through an unbounded channel, so a slow subscriber never loses
//! messages and never blocks the publisher. Messages broadcast by one caller
//! at a time reach each subscriber in broadcast order.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;

/// Predicate deciding which messages a subscriber receives.
pub type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// A single registered subscriber.
struct Subscriber<T> {
    /// Only messages passing the filter are delivered
    filter: Option<Filter<T>>,
    /// Channel to the subscription
    sender: mpsc::UnboundedSender<T>,
}

impl<T> Subscriber<T> {
    fn accepts(&self, message: &T) -> bool {
        self.filter.as_ref().map_or(true, |f| f(message))
    }
}

/// Registry of subscribers for one event stream.
///
/// Thread-safe and shared via `Arc`.
pub struct Fanout<T> {
    subscribers: DashMap<String, Subscriber<T>>,
}

impl<T: Clone + Send + 'static> Fanout<T> {
    /// Create a new fanout wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
        })
    }

    /// Register a subscriber receiving every message.
    pub fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        self.register(None, Vec::new())
    }

    /// Register a subscriber.
    ///
    /// `seed` messages are delivered before anything broadcast afterwards.
    pub fn register(
        self: &Arc<Self>,
        filter: Option<Filter<T>>,
        seed: Vec<T>,
    ) -> Subscription<T> {
        let id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();

        for message in seed {
            // The receiver is alive, sending cannot fail
            let _ = sender.send(message);
        }

        self.subscribers
            .insert(id.clone(), Subscriber { filter, sender });
        tracing::trace!(subscriber = %id, "Subscriber registered");

        Subscription {
            id,
            receiver,
            fanout: Arc::downgrade(self),
        }
    }

    /// Unregister a subscriber.
    pub fn unregister(&self, id: &str) {
        if self.subscribers.remove(id).is_some() {
            tracing::trace!(subscriber = %id, "Subscriber unregistered");
        }
    }

    /// Broadcast a message to every subscriber whose filter accepts it.
    ///
    /// Returns the number of subscribers that received the message.
    pub fn broadcast(&self, message: &T) -> usize {
        let mut sent_count = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.accepts(message) {
                continue;
            }
            if subscriber.sender.send(message.clone()).is_ok() {
                sent_count += 1;
            } else {
                closed.push(entry.key().clone());
            }
        }

        for id in closed {
            self.unregister(&id);
        }

        sent_count
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Receiving side of a [`Fanout`] registration.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription<T> {
    id: String,
    receiver: mpsc::UnboundedReceiver<T>,
    fanout: Weak<Fanout<T>>,
}

impl<T> Subscription<T> {
    /// Wait for the next message. `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Take the next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Drain every buffered message.
    pub fn drain(&mut self) -> Vec<T> {
        let mut messages = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            messages.push(message);
        }
        messages
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(fanout) = self.fanout.upgrade() {
            if fanout.subscribers.remove(&self.id).is_some() {
                tracing::trace!(subscriber = %self.id, "Subscriber unregistered");
            }
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
