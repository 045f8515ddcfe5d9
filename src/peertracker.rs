//! Per-remote-peer connection lifecycle and contact registry (§4.6).
//! Grounded on `original_source/theseus/peertracker.py`'s `PeerState`/
//! `PeerTracker`.

use crate::contact::ContactInfo;
use crate::error::{DhtError, PolicyError, SchedulingError, TransportError};
use crate::krpc::KrpcHandle;
use crate::bencode::Value;
use async_std::sync::Mutex as AsyncMutex;
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::constants::DEFAULT_QUERY_RETRIES;

/// Dials a fresh connection to a contact, standing in for whatever
/// transport this peer is reachable over (TCP + `noise.rs` + `krpc.rs`, in
/// practice -- wired up in `service.rs`). Kept as a trait so this module
/// doesn't need to know about sockets.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, contact: &ContactInfo) -> Result<KrpcHandle, TransportError>;
}

#[derive(Clone)]
enum Connection {
    Disconnected,
    Connecting,
    Connected(KrpcHandle),
}

/// Lifecycle and query surface for one remote peer. Connects lazily on
/// first use and reconnects transparently if the link drops.
pub struct PeerState {
    pub contact: ContactInfo,
    conn: AsyncMutex<Connection>,
}

impl PeerState {
    fn new(contact: ContactInfo) -> PeerState {
        PeerState {
            contact,
            conn: AsyncMutex::new(Connection::Disconnected),
        }
    }

    /// Ensures a connection is live, dialing one if necessary. Mirrors
    /// `PeerState.connect()`'s DISCONNECTED -> CONNECTING -> CONNECTED
    /// transition; unlike the original, a second caller arriving while a
    /// dial is in flight simply waits on the same mutex rather than racing
    /// a second dial, since `AsyncMutex` serializes access to `conn`.
    async fn ensure_connected(&self, dialer: &dyn Dialer) -> Result<KrpcHandle, TransportError> {
        let mut guard = self.conn.lock().await;
        if let Connection::Connected(handle) = &*guard {
            return Ok(handle.clone());
        }
        *guard = Connection::Connecting;
        match dialer.dial(&self.contact).await {
            Ok(handle) => {
                *guard = Connection::Connected(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                *guard = Connection::Disconnected;
                Err(e)
            }
        }
    }

    async fn drop_connection(&self) {
        *self.conn.lock().await = Connection::Disconnected;
    }

    /// Sends a query, retrying on transport failure up to `retries` times
    /// with a fresh connection each attempt. A [`SchedulingError`] is
    /// terminal and never retried, matching the original's re-raise of
    /// `QueryRetriesExceededError`/`CancelledError` straight through
    /// `errback` rather than looping on it.
    pub async fn query(
        &self,
        dialer: &dyn Dialer,
        method: &[u8],
        args: Value,
        retries: u32,
    ) -> Result<Value, DhtError> {
        let handle = self.ensure_connected(dialer).await?;
        match handle.send_query(method, args.clone()).await {
            Ok(result) => Ok(result),
            Err(DhtError::Scheduling(e)) => Err(DhtError::Scheduling(e)),
            Err(err) => {
                self.drop_connection().await;
                if retries == 0 {
                    warn!("query to {:?} exhausted retries: {}", self.contact, err);
                    return Err(SchedulingError::RetriesExceeded.into());
                }
                debug!("query to {:?} failed ({}), retrying ({} left)", self.contact, err, retries);
                Box::pin(self.query(dialer, method, args, retries - 1)).await
            }
        }
    }

    pub async fn query_default(&self, dialer: &dyn Dialer, method: &[u8], args: Value) -> Result<Value, DhtError> {
        self.query(dialer, method, args, DEFAULT_QUERY_RETRIES).await
    }
}

/// Registry of every contact this peer currently knows about, keyed both
/// by `(host, port)` (to reject two contacts claiming the same address)
/// and by the contact itself (to find or create its [`PeerState`]).
pub struct PeerTracker {
    addr_to_contact: Mutex<HashMap<(Ipv4Addr, u16), ContactInfo>>,
    contact_to_state: Mutex<HashMap<ContactInfo, Arc<PeerState>>>,
}

impl PeerTracker {
    pub fn new() -> PeerTracker {
        PeerTracker {
            addr_to_contact: Mutex::new(HashMap::new()),
            contact_to_state: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a contact, or returns the already-registered
    /// [`PeerState`] if this exact contact is known. Rejects a contact
    /// whose `(host, port)` is already claimed by a *different* contact
    /// (same address, different key), matching the original's
    /// `DuplicateContactError`.
    pub fn register_contact(&self, contact: ContactInfo) -> Result<Arc<PeerState>, PolicyError> {
        let addr_key = (contact.host, contact.port);

        let mut addr_map = self.addr_to_contact.lock();
        match addr_map.get(&addr_key) {
            Some(existing) if *existing != contact => return Err(PolicyError::DuplicateContact),
            _ => {}
        }

        let mut state_map = self.contact_to_state.lock();
        if let Some(state) = state_map.get(&contact) {
            return Ok(state.clone());
        }

        addr_map.insert(addr_key, contact.clone());
        let state = Arc::new(PeerState::new(contact.clone()));
        state_map.insert(contact, state.clone());
        Ok(state)
    }

    pub fn get(&self, contact: &ContactInfo) -> Option<Arc<PeerState>> {
        self.contact_to_state.lock().get(contact).cloned()
    }

    pub fn remove(&self, contact: &ContactInfo) {
        self.contact_to_state.lock().remove(contact);
        self.addr_to_contact.lock().remove(&(contact.host, contact.port));
    }

    pub fn len(&self) -> usize {
        self.contact_to_state.lock().len()
    }
}

impl Default for PeerTracker {
    fn default() -> PeerTracker {
        PeerTracker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn contact(port: u16, key_byte: u8) -> ContactInfo {
        ContactInfo {
            host: Ipv4Addr::new(127, 0, 0, 1),
            port,
            key: [key_byte; 32],
        }
    }

    #[test]
    fn registers_and_reuses_same_contact() {
        let tracker = PeerTracker::new();
        let a = tracker.register_contact(contact(9000, 1)).unwrap();
        let b = tracker.register_contact(contact(9000, 1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn rejects_same_address_different_identity() {
        let tracker = PeerTracker::new();
        tracker.register_contact(contact(9000, 1)).unwrap();
        let result = tracker.register_contact(contact(9000, 2));
        assert_eq!(result.unwrap_err(), PolicyError::DuplicateContact);
    }

    #[test]
    fn distinct_ports_are_independent_contacts() {
        let tracker = PeerTracker::new();
        tracker.register_contact(contact(9000, 1)).unwrap();
        assert!(tracker.register_contact(contact(9001, 2)).is_ok());
        assert_eq!(tracker.len(), 2);
    }
}
