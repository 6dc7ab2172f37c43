//! In-process relay: a user → socket map that routes signaling by receiver.
//!
//! Stands in for the WebSocket server in tests and in the demo binary. Each
//! connected user gets a [`RelayClient`] (send side) and an unbounded
//! receiver of raw JSON text (receive side), exactly what a socket would
//! deliver.

use super::{RelayChannel, RelayDirectory, RelayMessage};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct Registration {
    tx: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
}

/// The relay's user → socket map.
///
/// Mutated only by [`connect`](Self::connect) and
/// [`disconnect`](Self::disconnect); routing only reads it.
#[derive(Default)]
pub struct RelayHub {
    users: RwLock<HashMap<String, Registration>>,
}

/// Deliverable handle on a connected user, as returned by a directory lookup.
#[derive(Clone)]
pub struct RelayEndpoint {
    tx: mpsc::UnboundedSender<String>,
}

impl RelayEndpoint {
    /// Push raw text to the user's socket. Fails if the socket has gone.
    pub fn deliver(&self, text: String) -> Result<()> {
        self.tx
            .send(text)
            .map_err(|_| anyhow!("relay socket closed"))
    }
}

impl RelayHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `user_id`, replacing (and closing) any previous socket.
    pub fn connect(
        self: &Arc<Self>,
        user_id: &str,
    ) -> (Arc<RelayClient>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let previous = self.write_users().insert(
            user_id.to_string(),
            Registration {
                tx,
                open: open.clone(),
            },
        );
        if let Some(prev) = previous {
            prev.open.store(false, Ordering::Release);
            warn!(event = "relay_replaced", user = user_id, "Replacing existing relay socket");
        }
        info!(event = "relay_connected", user = user_id, "User connected to relay");

        let client = Arc::new(RelayClient {
            user_id: user_id.to_string(),
            hub: Arc::clone(self),
            open,
        });
        (client, rx)
    }

    /// Drop `user_id`'s socket. Its client reports closed from now on.
    pub fn disconnect(&self, user_id: &str) {
        if let Some(reg) = self.write_users().remove(user_id) {
            reg.open.store(false, Ordering::Release);
            info!(event = "relay_disconnected", user = user_id, "User left relay");
        }
    }

    /// Forward `msg` to its receiver only. Unreachable receivers are logged
    /// and dropped; the sender is not told.
    pub fn route(&self, msg: &RelayMessage) -> Result<()> {
        let Some(receiver) = msg.receiver() else {
            debug!(event = "relay_no_receiver", kind = msg.kind(), "Dropping unaddressed message");
            return Ok(());
        };
        let text = msg.to_json()?;
        match self.lookup(receiver) {
            Some(endpoint) => {
                if endpoint.deliver(text).is_err() {
                    warn!(event = "relay_deliver_failed", receiver, kind = msg.kind(), "Receiver socket gone");
                }
            }
            None => {
                debug!(event = "relay_receiver_offline", receiver, kind = msg.kind(), "Receiver not connected");
            }
        }
        Ok(())
    }

    /// Inject raw text as if it arrived from the server. Test hook for
    /// malformed input.
    pub fn inject_raw(&self, user_id: &str, text: impl Into<String>) -> bool {
        self.lookup(user_id)
            .map(|ep| ep.deliver(text.into()).is_ok())
            .unwrap_or(false)
    }

    fn write_users(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Registration>> {
        self.users.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RelayDirectory for RelayHub {
    fn lookup(&self, user_id: &str) -> Option<RelayEndpoint> {
        let users = self.users.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        users.get(user_id).map(|reg| RelayEndpoint { tx: reg.tx.clone() })
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

/// One user's send side of the hub.
pub struct RelayClient {
    user_id: String,
    hub: Arc<RelayHub>,
    open: Arc<AtomicBool>,
}

impl RelayChannel for RelayClient {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, msg: &RelayMessage) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("relay channel closed"));
        }
        self.hub.route(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(sender: &str, receiver: &str) -> RelayMessage {
        RelayMessage::ConnectionAccepted {
            sender: sender.into(),
            receiver: receiver.into(),
        }
    }

    #[tokio::test]
    async fn test_routes_to_receiver_only() {
        let hub = RelayHub::new();
        let (alice, mut alice_rx) = hub.connect("alice");
        let (_bob, mut bob_rx) = hub.connect("bob");
        let (_carol, mut carol_rx) = hub.connect("carol");

        alice.send(&accepted("alice", "bob")).unwrap();

        let text = bob_rx.recv().await.unwrap();
        let msg = RelayMessage::parse(&text).unwrap().unwrap();
        assert_eq!(msg, accepted("alice", "bob"));
        assert!(carol_rx.try_recv().is_err());
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_receiver_dropped() {
        let hub = RelayHub::new();
        let (alice, _rx) = hub.connect("alice");
        assert!(hub.lookup("nobody").is_none());
        alice.send(&accepted("alice", "nobody")).unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_closes_client() {
        let hub = RelayHub::new();
        let (alice, _rx) = hub.connect("alice");
        assert!(alice.is_open());
        hub.disconnect("alice");
        assert!(!alice.is_open());
        assert!(alice.send(&accepted("alice", "bob")).is_err());
        assert!(hub.lookup("alice").is_none());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_socket() {
        let hub = RelayHub::new();
        let (first, _rx1) = hub.connect("alice");
        let (second, _rx2) = hub.connect("alice");
        assert!(!first.is_open());
        assert!(second.is_open());
    }
}
