//! Command side of a running [`PeerNode`](super::PeerNode).

use crate::core::error::{PeerError, PeerResult};
use crate::core::signaling::SignalingPhase;
use crate::core::transfer::sender::OutgoingFile;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// User intents, answered through their `reply` channel once handled.
#[derive(Debug)]
pub enum NodeCommand {
    Connect {
        peer_id: String,
        reply: oneshot::Sender<PeerResult<()>>,
    },
    Accept {
        peer_id: String,
        reply: oneshot::Sender<PeerResult<()>>,
    },
    Reject {
        peer_id: String,
        reply: oneshot::Sender<PeerResult<()>>,
    },
    SendFile {
        peer_id: String,
        file: OutgoingFile,
        reply: oneshot::Sender<PeerResult<Uuid>>,
    },
    CancelTransfer {
        peer_id: String,
        reply: oneshot::Sender<PeerResult<()>>,
    },
    Disconnect {
        peer_id: String,
        reply: oneshot::Sender<PeerResult<()>>,
    },
    Typing {
        peer_id: Option<String>,
        reply: oneshot::Sender<PeerResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<NodeSnapshot>,
    },
    Shutdown,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub peer_id: String,
    pub phase: SignalingPhase,
    pub has_transport: bool,
    pub queued_candidates: usize,
    pub channel_open: bool,
    pub sending: bool,
    pub receiving: bool,
    pub received_bytes: u64,
}

/// Point-in-time view of a node, for status displays and tests.
#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot {
    pub user_id: String,
    pub relay_open: bool,
    /// Senders of unanswered inbound requests, oldest first.
    pub pending_requests: Vec<String>,
    pub sessions: Vec<SessionSnapshot>,
}

impl NodeSnapshot {
    pub fn session(&self, peer_id: &str) -> Option<&SessionSnapshot> {
        self.sessions.iter().find(|s| s.peer_id == peer_id)
    }

    /// Phase of the session with `peer_id`; `Idle` when there is none.
    pub fn phase(&self, peer_id: &str) -> SignalingPhase {
        self.session(peer_id)
            .map_or(SignalingPhase::Idle, |s| s.phase)
    }
}

/// Cloneable handle for driving a node from the application.
#[derive(Clone, Debug)]
pub struct NodeHandle {
    tx: mpsc::UnboundedSender<NodeCommand>,
}

impl NodeHandle {
    pub(super) fn new(tx: mpsc::UnboundedSender<NodeCommand>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<PeerResult<T>>) -> NodeCommand,
    ) -> PeerResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| PeerError::NodeStopped)?;
        rx.await.map_err(|_| PeerError::NodeStopped)?
    }

    /// Ask `peer_id` to connect.
    pub async fn connect(&self, peer_id: &str) -> PeerResult<()> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::Connect { peer_id, reply }).await
    }

    pub async fn accept(&self, peer_id: &str) -> PeerResult<()> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::Accept { peer_id, reply }).await
    }

    pub async fn reject(&self, peer_id: &str) -> PeerResult<()> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::Reject { peer_id, reply }).await
    }

    /// Start sending `file`. Resolves once the transfer is started, with its
    /// id; completion is reported as an [`AppEvent`](super::AppEvent).
    pub async fn send_file(&self, peer_id: &str, file: OutgoingFile) -> PeerResult<Uuid> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::SendFile {
            peer_id,
            file,
            reply,
        })
        .await
    }

    pub async fn cancel_transfer(&self, peer_id: &str) -> PeerResult<()> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::CancelTransfer { peer_id, reply })
            .await
    }

    pub async fn disconnect(&self, peer_id: &str) -> PeerResult<()> {
        let peer_id = peer_id.to_string();
        self.request(|reply| NodeCommand::Disconnect { peer_id, reply })
            .await
    }

    pub async fn typing(&self, peer_id: Option<&str>) -> PeerResult<()> {
        let peer_id = peer_id.map(str::to_string);
        self.request(|reply| NodeCommand::Typing { peer_id, reply }).await
    }

    pub async fn snapshot(&self) -> PeerResult<NodeSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeCommand::Snapshot { reply })
            .map_err(|_| PeerError::NodeStopped)?;
        rx.await.map_err(|_| PeerError::NodeStopped)
    }

    /// Stop the node; every session is torn down before the loop exits.
    pub fn shutdown(&self) {
        let _ = self.tx.send(NodeCommand::Shutdown);
    }
}
