//! Typed event hub — publish/subscribe without emitter inheritance
//!
//! Components own an `EventHub` for their event type instead of inheriting
//! from a base emitter. `subscribe` returns a [`Subscription`] handle;
//! dropping (or `cancel`ing) it deregisters the callback. Tests drive
//! components by injecting events directly through `emit`.

use crate::peer::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;
type SubscriberMap<E> = HashMap<u64, Callback<E>>;

/// A typed publish/subscribe hub.
pub struct EventHub<E> {
    subscribers: Arc<RwLock<SubscriberMap<E>>>,
    next_id: AtomicU64,
}

impl<E> EventHub<E> {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a callback. The callback stays registered until the returned
    /// handle is dropped or cancelled.
    pub fn subscribe<F>(&self, callback: F) -> Subscription<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, Arc::new(callback));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Deliver an event to every registered subscriber.
    ///
    /// Callbacks are invoked outside the lock, so a callback may subscribe
    /// or emit without deadlocking.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self.subscribers.read().values().cloned().collect();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Deregistration handle returned by [`EventHub::subscribe`].
pub struct Subscription<E> {
    id: u64,
    subscribers: Weak<RwLock<SubscriberMap<E>>>,
}

impl<E> Subscription<E> {
    /// Explicitly deregister the callback.
    pub fn cancel(self) {
        drop(self);
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.write().remove(&self.id);
        }
    }
}

/// Lifecycle events emitted by the mesh node for presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// The signaling link received its greeting and we know our own id.
    SignalingConnected { id: PeerId },
    /// A peer link reached the connected state.
    NewConnection { peer_id: PeerId },
    /// A peer link was torn down and removed from the registry.
    PeerRemoved { peer_id: PeerId },
    /// Text received on a peer's `chat` channel.
    ChatMessage { peer_id: PeerId, text: String },
    /// Relay-fanned broadcast from another endpoint.
    BroadcastReceived { from: PeerId, message: String },
    /// A broker replied that it has no unconnected peer to introduce.
    NoPeersAvailable { via: PeerId },
}

// ============================================================================
// TESTS
// ============================================================================
