//! User commands arriving through [`NodeHandle`](super::NodeHandle).

use super::{
    notice, notify_app, phase_changed, relay_send, send_cancel_marker, AppEvent, NodeCommand, NodeSnapshot, PeerNode,
    SendOutcome, SessionSnapshot,
};
use crate::core::error::{PeerError, PeerResult, TransferError};
use crate::core::notify::Notification;
use crate::core::relay::RelayMessage;
use crate::core::session::{OutgoingTransfer, PeerSession};
use crate::core::signaling::{HandshakeEvent, SignalingPhase};
use crate::core::transfer::sender::{send_file, OutgoingFile, SendProgress};
use crate::utils::sos::SignalOfStop;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

/// Reply to the caller, surfacing failures as a notice as well.
fn reply<T>(
    tx: &tokio::sync::mpsc::UnboundedSender<AppEvent>,
    reply: oneshot::Sender<PeerResult<T>>,
    result: PeerResult<T>,
) {
    if let Err(e) = &result {
        notice(tx, Notification::error(e.to_string()));
    }
    let _ = reply.send(result);
}

impl PeerNode {
    pub(super) async fn handle_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Connect { peer_id, reply: r } => {
                let res = self.connect(&peer_id);
                reply(&self.event_tx, r, res);
            }
            NodeCommand::Accept { peer_id, reply: r } => {
                let res = self.accept(&peer_id);
                reply(&self.event_tx, r, res);
            }
            NodeCommand::Reject { peer_id, reply: r } => {
                let res = self.reject(&peer_id);
                reply(&self.event_tx, r, res);
            }
            NodeCommand::SendFile {
                peer_id,
                file,
                reply: r,
            } => {
                let res = self.start_send(&peer_id, file);
                reply(&self.event_tx, r, res);
            }
            NodeCommand::CancelTransfer { peer_id, reply: r } => {
                let res = self.cancel_transfer(&peer_id).await;
                reply(&self.event_tx, r, res);
            }
            NodeCommand::Disconnect { peer_id, reply: r } => {
                let res = self.disconnect(&peer_id);
                reply(&self.event_tx, r, res);
            }
            NodeCommand::Typing { peer_id, reply: r } => {
                let msg = RelayMessage::Typing {
                    sender: self.config.user_id.clone(),
                    receiver: peer_id,
                };
                let res = relay_send(self.relay.as_ref(), msg);
                reply(&self.event_tx, r, res);
            }
            NodeCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the loop itself.
            NodeCommand::Shutdown => {}
        }
    }

    fn connect(&mut self, peer: &str) -> PeerResult<()> {
        if peer == self.user_id() {
            return Err(PeerError::SelfConnection);
        }
        if !self.relay.is_open() {
            return Err(PeerError::RelayUnavailable);
        }

        let local = self.config.user_id.clone();
        let max = self.config.limits.max_file_size;
        let session = self
            .sessions
            .entry(peer.to_string())
            .or_insert_with(|| PeerSession::new(&local, peer, max));
        if session.phase().is_busy() {
            return Err(PeerError::AlreadyInProgress(peer.to_string()));
        }
        session
            .handshake
            .apply(HandshakeEvent::LocalRequest)
            .map_err(|_| PeerError::AlreadyInProgress(peer.to_string()))?;
        session.incoming.reset();
        session.delivered_url = None;

        let msg = RelayMessage::ConnectionRequest {
            sender: local,
            receiver: peer.to_string(),
            sender_name: self.config.display_name.clone(),
        };
        if let Err(e) = relay_send(self.relay.as_ref(), msg) {
            self.sessions.remove(peer);
            return Err(e);
        }

        info!(event = "request_sent", peer, "Connection request sent");
        phase_changed(&self.event_tx, peer, SignalingPhase::RequestSent);
        notice(
            &self.event_tx,
            Notification::info(format!("Waiting for {peer} to accept")),
        );
        Ok(())
    }

    fn accept(&mut self, peer: &str) -> PeerResult<()> {
        if !self.relay.is_open() {
            return Err(PeerError::RelayUnavailable);
        }
        if !self.pending.contains(peer) {
            return Err(PeerError::NoPendingRequest(peer.to_string()));
        }
        let Some(session) = self.sessions.get_mut(peer) else {
            self.pending.take(peer);
            return Err(PeerError::NoPendingRequest(peer.to_string()));
        };
        session
            .handshake
            .apply(HandshakeEvent::LocalAccept)
            .map_err(|_| PeerError::NoPendingRequest(peer.to_string()))?;
        let request = self.pending.take(peer);

        let msg = RelayMessage::ConnectionAccepted {
            sender: self.config.user_id.clone(),
            receiver: peer.to_string(),
        };
        if let Err(e) = relay_send(self.relay.as_ref(), msg) {
            self.sessions.remove(peer);
            return Err(e);
        }

        let label = request.as_ref().map_or(peer, |r| r.label()).to_string();
        info!(event = "request_accepted_locally", peer, "Accepted; waiting for offer");
        notice(&self.event_tx, Notification::info(format!("Connecting to {label}")));
        Ok(())
    }

    fn reject(&mut self, peer: &str) -> PeerResult<()> {
        let request = self
            .pending
            .take(peer)
            .ok_or_else(|| PeerError::NoPendingRequest(peer.to_string()))?;
        if let Some(session) = self.sessions.get_mut(peer) {
            if let Err(e) = session.handshake.apply(HandshakeEvent::LocalReject) {
                warn!(event = "reject_phase", peer, error = %e, "Rejecting from unexpected phase");
            }
        }
        self.discard_if_idle(peer);
        phase_changed(&self.event_tx, peer, SignalingPhase::Idle);
        info!(event = "request_rejected_locally", peer, name = %request.label(), "Declined connection request");

        // The request is gone locally either way; a lost reply times out remotely.
        let msg = RelayMessage::ConnectionRejected {
            sender: self.config.user_id.clone(),
            receiver: peer.to_string(),
        };
        relay_send(self.relay.as_ref(), msg)
    }

    fn start_send(&mut self, peer: &str, file: OutgoingFile) -> PeerResult<Uuid> {
        let limits = self.config.limits;
        limits.validate()?;
        let session = self
            .sessions
            .get_mut(peer)
            .filter(|s| s.phase() == SignalingPhase::Connected)
            .ok_or_else(|| PeerError::NotConnected(peer.to_string()))?;
        let dc = session.open_channel().ok_or(TransferError::ChannelNotOpen)?;
        if session.is_sending() {
            return Err(TransferError::TransferInProgress.into());
        }
        if file.size() > limits.max_file_size {
            return Err(TransferError::FileTooLarge {
                size: file.size(),
                limit: limits.max_file_size,
            }
            .into());
        }

        let id = Uuid::new_v4();
        let name = file.name.clone();
        let sos = SignalOfStop::new();
        let task_sos = sos.clone();
        let events = self.event_tx.clone();
        let outcomes = self.outcome_tx.clone();
        let peer_id = peer.to_string();

        let task = tokio::spawn(async move {
            let progress_peer = peer_id.clone();
            let progress_name = file.name.clone();
            let on_progress = |p: SendProgress| {
                notify_app(
                    &events,
                    AppEvent::SendProgress {
                        peer_id: progress_peer.clone(),
                        transfer_id: id,
                        name: progress_name.clone(),
                        sent: p.sent,
                        total: p.total,
                        percent: p.percent,
                    },
                );
            };
            let result = send_file(dc.as_ref(), &file, limits, &task_sos, on_progress).await;
            let _ = outcomes.send(SendOutcome {
                peer_id,
                transfer_id: id,
                name: file.name,
                result,
            });
        });

        session.outgoing = Some(OutgoingTransfer {
            id,
            name: name.clone(),
            sos,
            task,
        });
        info!(event = "send_queued", peer, %name, transfer = %id, "Transfer started");
        Ok(id)
    }

    async fn cancel_transfer(&mut self, peer: &str) -> PeerResult<()> {
        let session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| PeerError::UnknownPeer(peer.to_string()))?;

        if let Some(out) = &session.outgoing {
            // The sender sends the marker and reports the cancellation itself.
            out.cancel();
            info!(event = "send_cancel_requested", peer, name = %out.name, "Cancelling outgoing transfer");
            return Ok(());
        }

        if session.incoming.is_active() {
            send_cancel_marker(peer, session.open_channel()).await;
            if let Some(info) = session.incoming.on_cancelled() {
                notify_app(
                    &self.event_tx,
                    AppEvent::ReceiveCancelled {
                        peer_id: peer.to_string(),
                        name: info.name,
                    },
                );
            }
            return Ok(());
        }

        Err(PeerError::NoActiveTransfer(peer.to_string()))
    }

    fn disconnect(&mut self, peer: &str) -> PeerResult<()> {
        let mut session = self
            .sessions
            .remove(peer)
            .ok_or_else(|| PeerError::UnknownPeer(peer.to_string()))?;
        self.pending.take(peer);
        let report = session.teardown();
        self.report_teardown(peer, report);

        phase_changed(&self.event_tx, peer, SignalingPhase::Closed);
        notify_app(
            &self.event_tx,
            AppEvent::Disconnected {
                peer_id: peer.to_string(),
                reason: "closed locally".to_string(),
            },
        );
        notice(&self.event_tx, Notification::info(format!("Disconnected from {peer}")));
        Ok(())
    }

    fn snapshot(&self) -> NodeSnapshot {
        let mut sessions: Vec<SessionSnapshot> = self
            .sessions
            .values()
            .map(|s| SessionSnapshot {
                peer_id: s.remote_id.clone(),
                phase: s.phase(),
                has_transport: s.negotiator.has_transport(),
                queued_candidates: s.negotiator.queued_candidates(),
                channel_open: s.open_channel().is_some(),
                sending: s.is_sending(),
                receiving: s.incoming.is_active(),
                received_bytes: s.incoming.received_bytes(),
            })
            .collect();
        sessions.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        NodeSnapshot {
            user_id: self.config.user_id.clone(),
            relay_open: self.relay.is_open(),
            pending_requests: self.pending.iter().map(|r| r.sender.clone()).collect(),
            sessions,
        }
    }
}
