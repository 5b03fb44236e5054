//! Client fan-out.
//!
//! Each client tab owns an unbounded channel. Sends never block, and a
//! client whose receiver is gone is dropped on the next send.

use casesync_protocol::{Event, OutboundMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Identifier of a client tab.
pub type ClientId = String;

/// Receiving half handed to a client tab.
pub type ClientReceiver = mpsc::UnboundedReceiver<OutboundMessage>;

/// Registry of connected client tabs.
#[derive(Debug, Default)]
pub struct ClientHub {
    clients: RwLock<HashMap<ClientId, mpsc::UnboundedSender<OutboundMessage>>>,
}

impl ClientHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client, replacing any previous channel with the same id.
    pub fn register(&self, id: impl Into<ClientId>) -> ClientReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.write().insert(id.into(), tx);
        rx
    }

    /// Removes a client.
    pub fn unregister(&self, id: &str) -> bool {
        self.clients.write().remove(id).is_some()
    }

    /// Returns true if the client is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.clients.read().contains_key(id)
    }

    /// Sends a message to one client.
    ///
    /// Returns false if the client is unknown or gone.
    pub fn send(&self, id: &str, message: impl Into<OutboundMessage>) -> bool {
        let message = message.into();
        let delivered = match self.clients.read().get(id) {
            Some(tx) => tx.send(message).is_ok(),
            None => return false,
        };
        if !delivered {
            debug!(client = id, "dropping closed client");
            self.clients.write().remove(id);
        }
        delivered
    }

    /// Sends an event to every client. Returns how many received it.
    pub fn broadcast(&self, event: Event) -> usize {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|_, tx| {
            tx.send(OutboundMessage::Event(event.clone())).is_ok()
        });
        if clients.len() < before {
            debug!(dropped = before - clients.len(), "dropped closed clients");
        }
        clients.len()
    }

    /// Sends an event to a set of clients. Returns how many received it.
    pub fn send_to<'a>(&self, ids: impl IntoIterator<Item = &'a ClientId>, event: &Event) -> usize {
        ids.into_iter()
            .filter(|id| self.send(id, event.clone()))
            .count()
    }

    /// Returns the registered client ids.
    pub fn clients(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.clients.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Returns true if no client is registered.
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}
