//! Transport and data channel events for the node's sessions.
//!
//! Every event carries the generation of the transport that raised it;
//! anything from a transport that has since been replaced or torn down is
//! dropped before it can touch session state. A transport still being
//! built off the loop already counts as current: it may trickle candidates
//! before its description is installed.

use super::{notice, notify_app, phase_changed, relay_send, send_cancel_marker, AppEvent, PeerNode};
use crate::core::connection::{ChannelFrame, Connectivity, SessionEvent, TransportEvent};
use crate::core::error::{PeerError, TransferError};
use crate::core::notify::Notification;
use crate::core::relay::{RelayMessage, SignalBlob};
use crate::core::signaling::{HandshakeEvent, SignalingPhase};
use crate::core::transfer::{ControlMessage, DataFrame, FileInfo};
use bytes::Bytes;
use tracing::{debug, info, warn};

impl PeerNode {
    pub(super) async fn handle_session_event(&mut self, ev: SessionEvent) {
        let SessionEvent {
            peer_id,
            generation,
            event,
        } = ev;

        let live = self.sessions.get(&peer_id).is_some_and(|s| {
            s.generation == generation
                && (s.negotiator.has_transport() || s.negotiator.is_in_flight())
        });
        if !live {
            debug!(
                event = "stale_transport_event",
                peer = %peer_id,
                generation,
                "Dropping event from a retired transport"
            );
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => self.on_local_candidate(&peer_id, candidate),
            TransportEvent::Connectivity(state) => self.on_connectivity(&peer_id, state),
            TransportEvent::ChannelOpen => {
                info!(event = "channel_open", peer = %peer_id, "Data channel open");
                notify_app(&self.event_tx, AppEvent::ChannelOpen { peer_id });
            }
            TransportEvent::ChannelClosed => self.on_channel_closed(&peer_id),
            TransportEvent::ChannelMessage(frame) => self.on_channel_frame(&peer_id, frame).await,
        }
    }

    fn on_local_candidate(&mut self, peer: &str, candidate: SignalBlob) {
        let msg = RelayMessage::Candidate {
            sender: self.config.user_id.clone(),
            receiver: peer.to_string(),
            candidate,
        };
        // A lost candidate only narrows the paths ICE can try.
        if let Err(e) = relay_send(self.relay.as_ref(), msg) {
            warn!(event = "candidate_not_sent", peer, error = %e, "Local candidate not relayed");
        }
    }

    fn on_connectivity(&mut self, peer: &str, state: Connectivity) {
        debug!(event = "connectivity", peer, state = state.as_str(), "Transport state changed");

        if state.is_terminal() {
            let err = PeerError::ConnectionFailed {
                peer: peer.to_string(),
                state: state.as_str().to_string(),
            };
            self.fail_session(peer, err);
            return;
        }
        if !state.is_connected() {
            return;
        }

        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if session.phase() == SignalingPhase::Connected {
            return;
        }
        if let Err(e) = session.handshake.apply(HandshakeEvent::TransportConnected) {
            warn!(event = "connect_ignored", peer, error = %e, "Transport up in unexpected phase");
            return;
        }
        info!(event = "peer_connected", peer, "Direct connection established");
        notify_app(&self.event_tx, AppEvent::Connected { peer_id: peer.to_string() });
        phase_changed(&self.event_tx, peer, SignalingPhase::Connected);
        notice(&self.event_tx, Notification::success(format!("Connected to {peer}")));
    }

    fn on_channel_closed(&mut self, peer: &str) {
        info!(event = "channel_closed", peer, "Data channel closed");
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if let Some(info) = session.incoming.on_cancelled() {
            notify_app(
                &self.event_tx,
                AppEvent::ReceiveFailed {
                    peer_id: peer.to_string(),
                    error: format!("{}: {}", info.name, TransferError::ChannelClosed),
                },
            );
        }
    }

    async fn on_channel_frame(&mut self, peer: &str, frame: ChannelFrame) {
        let frame = match DataFrame::decode(frame) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = "frame_malformed", peer, error = %e, "Dropping data channel frame");
                return;
            }
        };
        match frame {
            DataFrame::Chunk(data) => self.on_chunk(peer, data).await,
            DataFrame::Control(ControlMessage::FileInfo { file_info }) => {
                self.on_file_info(peer, file_info).await
            }
            DataFrame::Control(ControlMessage::FileComplete) => self.on_file_complete(peer),
            DataFrame::Control(ControlMessage::TransferCancelled) => self.on_remote_cancel(peer),
        }
    }

    async fn on_file_info(&mut self, peer: &str, file_info: FileInfo) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        match session.incoming.on_file_info(file_info).cloned() {
            Ok(info) => {
                notify_app(
                    &self.event_tx,
                    AppEvent::ReceiveStarted {
                        peer_id: peer.to_string(),
                        name: info.name,
                        mime_type: info.mime_type,
                        size: info.size,
                    },
                );
            }
            Err(e) => {
                warn!(event = "receive_refused", peer, error = %e, "Incoming file refused");
                notify_app(
                    &self.event_tx,
                    AppEvent::ReceiveFailed {
                        peer_id: peer.to_string(),
                        error: e.to_string(),
                    },
                );
                notice(&self.event_tx, Notification::error(format!("Refused file from {peer}: {e}")));
                // Stop the sender; its chunks would be dropped anyway.
                send_cancel_marker(peer, session.open_channel()).await;
            }
        }
    }

    async fn on_chunk(&mut self, peer: &str, data: Bytes) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        let name = session.incoming.expected().map(|i| i.name.clone());
        match session.incoming.on_chunk(data) {
            Ok(Some(p)) => notify_app(
                &self.event_tx,
                AppEvent::ReceiveProgress {
                    peer_id: peer.to_string(),
                    name: name.unwrap_or_default(),
                    received: p.received,
                    total: p.total,
                    percent: p.percent,
                },
            ),
            Ok(None) => {}
            Err(e) => {
                warn!(event = "receive_failed", peer, error = %e, "Incoming transfer aborted");
                notify_app(
                    &self.event_tx,
                    AppEvent::ReceiveFailed {
                        peer_id: peer.to_string(),
                        error: e.to_string(),
                    },
                );
                notice(&self.event_tx, Notification::error(e.to_string()));
                // The buffer is gone; stop the sender before it reports success.
                send_cancel_marker(peer, session.open_channel()).await;
            }
        }
    }

    fn on_file_complete(&mut self, peer: &str) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        match session.incoming.on_complete() {
            Ok(Some(file)) => {
                if let Some(old) = session.replace_delivered_url(file.object_url.clone()) {
                    notify_app(
                        &self.event_tx,
                        AppEvent::ObjectUrlRevoked {
                            peer_id: peer.to_string(),
                            url: old,
                        },
                    );
                }
                notice(
                    &self.event_tx,
                    Notification::success(format!("Received {} ({} bytes)", file.name, file.size())),
                );
                notify_app(
                    &self.event_tx,
                    AppEvent::FileReceived {
                        peer_id: peer.to_string(),
                        file,
                    },
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(event = "receive_failed", peer, error = %e, "Reassembly failed");
                notify_app(
                    &self.event_tx,
                    AppEvent::ReceiveFailed {
                        peer_id: peer.to_string(),
                        error: e.to_string(),
                    },
                );
                notice(&self.event_tx, Notification::error(e.to_string()));
            }
        }
    }

    /// `transfer-cancelled` from the peer.
    ///
    /// Chunks carry no transfer id, so the marker is matched by direction:
    /// an incoming transfer in progress is the one being cancelled; with
    /// none, it refuses our outgoing file.
    fn on_remote_cancel(&mut self, peer: &str) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if let Some(info) = session.incoming.on_cancelled() {
            notify_app(
                &self.event_tx,
                AppEvent::ReceiveCancelled {
                    peer_id: peer.to_string(),
                    name: info.name.clone(),
                },
            );
            notice(
                &self.event_tx,
                Notification::warn(format!("{peer} cancelled sending {}", info.name)),
            );
            return;
        }
        if let Some(out) = session.outgoing.take() {
            // The peer already knows; stop without sending our own marker.
            out.task.abort();
            info!(event = "send_refused", peer, name = %out.name, "Peer cancelled our transfer");
            notify_app(
                &self.event_tx,
                AppEvent::SendCancelled {
                    peer_id: peer.to_string(),
                    transfer_id: out.id,
                    name: out.name.clone(),
                },
            );
            notice(
                &self.event_tx,
                Notification::warn(format!("{peer} cancelled {}", out.name)),
            );
            return;
        }
        debug!(event = "stray_cancel", peer, "transfer-cancelled with no transfer active");
    }
}
