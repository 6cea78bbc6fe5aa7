use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use signal_proto::{SignalingEnvelope, RELAY_IDENTITY};
use tokio::sync::mpsc;
use tracing::debug;

/// Delivery target for one registered endpoint.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<SignalingEnvelope>,
}

impl ClientHandle {
    pub fn new(tx: mpsc::UnboundedSender<SignalingEnvelope>) -> Self {
        Self { tx }
    }

    /// Handle plus the receiving half the endpoint reads its inbound envelopes from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SignalingEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Returns false when the endpoint has stopped reading.
    pub fn deliver(&self, envelope: SignalingEnvelope) -> bool {
        self.tx.send(envelope).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn same_channel(&self, other: &ClientHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

#[derive(Debug, Clone)]
struct Registration {
    handle: ClientHandle,
    registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub identity: String,
    pub registered_at: DateTime<Utc>,
}

/// Directory of endpoints keyed by identity.
///
/// Cloning yields another handle onto the same directory. At most one
/// registration exists per identity: adding an identity that is already
/// present replaces its handle.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<DashMap<String, Registration>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity`; returns true when an earlier registration was replaced.
    pub fn add_client(&self, identity: impl Into<String>, handle: ClientHandle) -> bool {
        let identity = identity.into();
        let registration = Registration {
            handle,
            registered_at: Utc::now(),
        };
        let replaced = self.clients.insert(identity.clone(), registration).is_some();
        if replaced {
            debug!(target = "relay", identity = %identity, "client re-registered, handle replaced");
        } else {
            debug!(target = "relay", identity = %identity, "client registered");
        }
        replaced
    }

    pub fn remove_client(&self, identity: &str) {
        if self.clients.remove(identity).is_some() {
            debug!(target = "relay", identity, "client removed");
        }
    }

    /// Remove `identity` only while it still maps to `handle`.
    ///
    /// A connection that is torn down after its identity was re-registered
    /// must not evict the newer registration.
    pub fn remove_handle(&self, identity: &str, handle: &ClientHandle) -> bool {
        self.clients
            .remove_if(identity, |_, registration| {
                registration.handle.same_channel(handle)
            })
            .is_some()
    }

    /// Deliver an End notice to `identity`, if it is registered.
    pub fn close_client_connection(&self, identity: &str) -> bool {
        let Some(handle) = self.lookup(identity) else {
            return false;
        };
        let delivered = handle.deliver(SignalingEnvelope::end(RELAY_IDENTITY, identity));
        debug!(target = "relay", identity, delivered, "forced connection close");
        delivered
    }

    pub fn lookup(&self, identity: &str) -> Option<ClientHandle> {
        self.clients
            .get(identity)
            .map(|registration| registration.handle.clone())
    }

    pub fn identities(&self) -> Vec<String> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .clients
            .iter()
            .map(|entry| ClientInfo {
                identity: entry.key().clone(),
                registered_at: entry.registered_at,
            })
            .collect();
        clients.sort_by(|a, b| a.identity.cmp(&b.identity));
        clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clear(&self) {
        self.clients.clear();
    }
}
