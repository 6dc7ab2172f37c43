//! Per-peer session: handshake, transport, and the transfers riding on it.
//!
//! A session is owned by its node's event loop and mutated only there, so
//! none of these fields need locking. The transport and its data channel
//! belong to exactly one session.

use crate::core::connection::negotiation::{close_transport, Negotiator};
use crate::core::connection::DataChannel;
use crate::core::signaling::{Handshake, HandshakeEvent, SignalingPhase};
use crate::core::transfer::receiver::FileReceiver;
use crate::utils::sos::SignalOfStop;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// The file this session is currently sending.
pub struct OutgoingTransfer {
    pub id: Uuid,
    pub name: String,
    pub sos: SignalOfStop,
    pub task: JoinHandle<()>,
}

impl OutgoingTransfer {
    /// Ask the sender to stop; it sends `transfer-cancelled` itself.
    pub fn cancel(&self) {
        self.sos.cancel();
    }
}

/// What a teardown released, for the caller to report.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub cancelled_send: Option<String>,
    pub dropped_receive: Option<String>,
    pub revoked_url: Option<String>,
    /// Closing of the detached transport, running off the event loop.
    pub closing: Option<JoinHandle<()>>,
}

pub struct PeerSession {
    pub local_id: String,
    pub remote_id: String,
    pub handshake: Handshake,
    pub negotiator: Negotiator,
    /// Tags events of the current transport; bumped for every new one.
    pub generation: u64,
    pub outgoing: Option<OutgoingTransfer>,
    pub incoming: FileReceiver,
    /// URL of the last file delivered to the user.
    pub delivered_url: Option<String>,
}

impl PeerSession {
    pub fn new(local_id: &str, remote_id: &str, max_file_size: u64) -> Self {
        Self {
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            handshake: Handshake::new(),
            negotiator: Negotiator::new(),
            generation: 0,
            outgoing: None,
            incoming: FileReceiver::new(max_file_size),
            delivered_url: None,
        }
    }

    pub fn phase(&self) -> SignalingPhase {
        self.handshake.phase()
    }

    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.negotiator.transport().and_then(|t| t.data_channel())
    }

    /// Data channel, only if it is open.
    pub fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.data_channel().filter(|dc| dc.is_open())
    }

    pub fn is_sending(&self) -> bool {
        self.outgoing.as_ref().is_some_and(|o| !o.task.is_finished())
    }

    /// Record a newly delivered object URL, returning the one it replaces.
    pub fn replace_delivered_url(&mut self, url: String) -> Option<String> {
        self.delivered_url.replace(url)
    }

    /// Stop the outgoing transfer, if any. The channel stays open.
    pub fn cancel_outgoing(&mut self) -> Option<String> {
        let out = self.outgoing.take()?;
        out.cancel();
        Some(out.name)
    }

    /// Release everything this session holds and mark it `Closed`.
    ///
    /// Order: stop the sender, detach the transport and drop queued
    /// candidates, drop receive buffers, revoke the delivered URL. The data
    /// channel and transport are closed on a spawned task so a slow close
    /// never holds up the caller.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        if let Some(out) = self.outgoing.take() {
            out.cancel();
            out.task.abort();
            report.cancelled_send = Some(out.name);
        }

        if let Some(transport) = self.negotiator.detach() {
            let peer = self.remote_id.clone();
            report.closing = Some(tokio::spawn(async move {
                close_transport(&peer, transport).await;
            }));
        }

        if let Some(info) = self.incoming.on_cancelled() {
            report.dropped_receive = Some(info.name);
        }
        report.revoked_url = self.delivered_url.take();

        if self.handshake.apply(HandshakeEvent::Close).is_err() {
            debug!(event = "teardown_phase", peer = %self.remote_id, "Session already closed");
        }
        info!(
            event = "session_closed",
            local = %self.local_id,
            peer = %self.remote_id,
            "Session torn down"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MAX_FILE_SIZE;
    use crate::core::connection::memory::{MemoryNetwork, MemoryTransportFactory};
    use crate::core::connection::EventSink;
    use crate::core::relay::SignalBlob;
    use crate::core::transfer::FileInfo;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_teardown_releases_everything() {
        let network = MemoryNetwork::new();
        let factory = MemoryTransportFactory::new(&network);
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut session = PeerSession::new("alice", "bob", MAX_FILE_SIZE);
        session.handshake.apply(HandshakeEvent::LocalRequest).unwrap();
        session.handshake.apply(HandshakeEvent::RemoteAccepted).unwrap();
        session.generation = 1;
        session
            .negotiator
            .create_offer(factory.as_ref(), EventSink::new("bob", 1, tx))
            .await
            .unwrap();
        session
            .negotiator
            .handle_candidate("bob", SignalBlob(serde_json::json!({"c": 1})))
            .await
            .unwrap();
        session
            .incoming
            .on_file_info(FileInfo {
                name: "partial".into(),
                mime_type: String::new(),
                size: 10,
            })
            .unwrap();
        session.incoming.on_chunk(Bytes::from_static(b"abc")).unwrap();
        session.delivered_url = Some("blob:peerlink/old".into());
        let sos = SignalOfStop::new();
        session.outgoing = Some(OutgoingTransfer {
            id: Uuid::new_v4(),
            name: "out.bin".into(),
            sos: sos.clone(),
            task: tokio::spawn(std::future::pending()),
        });

        let report = session.teardown();
        assert_eq!(report.cancelled_send.as_deref(), Some("out.bin"));
        assert_eq!(report.dropped_receive.as_deref(), Some("partial"));
        assert_eq!(report.revoked_url.as_deref(), Some("blob:peerlink/old"));
        assert!(sos.cancelled());
        assert!(!session.negotiator.has_transport());
        assert_eq!(session.negotiator.queued_candidates(), 0);
        assert!(!session.incoming.is_active());
        assert_eq!(session.phase(), SignalingPhase::Closed);
        report.closing.unwrap().await.unwrap();
        assert!(factory.transports()[0].is_closed());
    }

    #[tokio::test]
    async fn test_teardown_of_empty_session() {
        let mut session = PeerSession::new("alice", "bob", MAX_FILE_SIZE);
        let report = session.teardown();
        assert!(report.cancelled_send.is_none());
        assert!(report.closing.is_none());
        assert!(report.revoked_url.is_none());
        assert_eq!(session.phase(), SignalingPhase::Closed);
    }
}
