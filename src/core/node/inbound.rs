//! Relay signaling: requests, answers to them, and transport negotiation.

use super::{
    notice, notify_app, phase_changed, relay_send, AppEvent, NegotiationOutcome, NegotiationStep,
    PeerNode,
};
use crate::core::connection::negotiation::{build_answer, build_offer, close_transport, OfferTarget};
use crate::core::connection::EventSink;
use crate::core::error::PeerError;
use crate::core::notify::Notification;
use crate::core::relay::{RelayMessage, SignalBlob};
use crate::core::session::PeerSession;
use crate::core::signaling::{ConnectionRequest, HandshakeEvent, SignalingPhase};
use tracing::{debug, info, warn};

impl PeerNode {
    pub(super) async fn handle_relay_text(&mut self, text: &str) {
        let msg = match RelayMessage::parse(text) {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e) => {
                warn!(event = "relay_malformed", error = %e, "Dropping relay message");
                return;
            }
        };

        if msg.receiver().is_some_and(|r| r != self.user_id()) {
            debug!(
                event = "relay_misrouted",
                kind = msg.kind(),
                receiver = ?msg.receiver(),
                "Relay message not addressed to us"
            );
            return;
        }
        if msg.sender() == self.user_id() {
            debug!(event = "relay_echo", kind = msg.kind(), "Ignoring our own relay message");
            return;
        }

        match msg {
            RelayMessage::ConnectionRequest {
                sender,
                sender_name,
                ..
            } => self.on_connection_request(sender, sender_name),
            RelayMessage::ConnectionAccepted { sender, .. } => self.on_connection_accepted(&sender),
            RelayMessage::ConnectionRejected { sender, .. } => self.on_connection_rejected(&sender),
            RelayMessage::Offer { sender, offer, .. } => self.on_offer(&sender, &offer),
            RelayMessage::Answer { sender, answer, .. } => self.on_answer(&sender, &answer).await,
            RelayMessage::Candidate {
                sender, candidate, ..
            } => self.on_candidate(&sender, candidate).await,
            RelayMessage::Typing { sender, .. } => {
                notify_app(&self.event_tx, AppEvent::TypingReceived { peer_id: sender });
            }
        }
    }

    fn on_connection_request(&mut self, sender: String, sender_name: Option<String>) {
        let max = self.config.limits.max_file_size;
        let local = self.config.user_id.clone();
        let session = self
            .sessions
            .entry(sender.clone())
            .or_insert_with(|| PeerSession::new(&local, &sender, max));

        match session.phase() {
            SignalingPhase::RequestSent if local > sender => {
                // Both sides asked at once. The lower id's request stands;
                // ours yields and accepts it, since our user already asked.
                if let Err(e) = session.handshake.apply(HandshakeEvent::CrossedRequest) {
                    warn!(event = "request_dropped", peer = %sender, error = %e, "Crossed request not applied");
                    return;
                }
                info!(event = "request_crossed", peer = %sender, "Requests crossed; accepting theirs");
                phase_changed(&self.event_tx, &sender, SignalingPhase::RequestReceived);
                let msg = RelayMessage::ConnectionAccepted {
                    sender: local,
                    receiver: sender.clone(),
                };
                if let Err(e) = relay_send(self.relay.as_ref(), msg) {
                    self.fail_session(&sender, e);
                    return;
                }
                notice(&self.event_tx, Notification::info(format!("Connecting to {sender}")));
                return;
            }
            SignalingPhase::RequestReceived if !session.handshake.is_accepted() => {
                // Repeat of a request still on screen: refresh it.
                self.pending
                    .push(ConnectionRequest::new(&sender, sender_name, &local));
                debug!(event = "request_refreshed", peer = %sender, "Duplicate connection request");
                return;
            }
            phase if phase.is_busy() => {
                warn!(
                    event = "request_dropped",
                    peer = %sender,
                    ?phase,
                    "Connection request while a session is in progress"
                );
                return;
            }
            _ => {}
        }

        if let Err(e) = session.handshake.apply(HandshakeEvent::RemoteRequest) {
            warn!(event = "request_dropped", peer = %sender, error = %e, "Unexpected connection request");
            return;
        }
        // A fresh handshake supersedes anything left over from a closed session.
        session.incoming.reset();
        session.delivered_url = None;

        let request = ConnectionRequest::new(&sender, sender_name, &local);
        let label = request.label().to_string();
        let display_name = request.sender_display_name.clone();
        self.pending.push(request);

        info!(event = "request_received", peer = %sender, name = %label, "Incoming connection request");
        notify_app(
            &self.event_tx,
            AppEvent::ConnectionRequested {
                peer_id: sender.clone(),
                display_name,
            },
        );
        phase_changed(&self.event_tx, &sender, SignalingPhase::RequestReceived);
        notice(
            &self.event_tx,
            Notification::info(format!("{label} wants to connect")),
        );
    }

    /// Initiator: the peer said yes. Build the transport and the offer on a
    /// separate task; the loop carries on meanwhile.
    fn on_connection_accepted(&mut self, peer: &str) {
        let generation = self.bump_generation();
        let Some(session) = self.sessions.get_mut(peer) else {
            warn!(event = "accept_dropped", peer, "Acceptance without a request");
            return;
        };
        if let Err(e) = session.handshake.apply(HandshakeEvent::RemoteAccepted) {
            warn!(event = "accept_dropped", peer, error = %e, "Unexpected acceptance");
            return;
        }
        info!(event = "request_accepted", peer, "Peer accepted; negotiating");
        notify_app(&self.event_tx, AppEvent::RequestAccepted { peer_id: peer.to_string() });
        phase_changed(&self.event_tx, peer, SignalingPhase::Negotiating);

        if !session.negotiator.begin_offer(peer) {
            return;
        }
        session.generation = generation;
        let sink = EventSink::new(peer, generation, self.session_tx.clone());
        let factory = self.factory.clone();
        let outcomes = self.negotiation_tx.clone();
        let peer_id = peer.to_string();
        tokio::spawn(async move {
            let result = build_offer(factory.as_ref(), sink).await;
            let _ = outcomes.send(NegotiationOutcome {
                peer_id,
                generation,
                step: NegotiationStep::Offer,
                result,
            });
        });
    }

    fn on_connection_rejected(&mut self, peer: &str) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if let Err(e) = session.handshake.apply(HandshakeEvent::RemoteRejected) {
            warn!(event = "reject_dropped", peer, error = %e, "Unexpected rejection");
            return;
        }
        self.discard_if_idle(peer);
        info!(event = "request_rejected", peer, "Peer declined the connection");
        notify_app(&self.event_tx, AppEvent::RequestRejected { peer_id: peer.to_string() });
        phase_changed(&self.event_tx, peer, SignalingPhase::Idle);
        notice(
            &self.event_tx,
            Notification::warn(format!("{peer} declined the connection")),
        );
    }

    /// Answerer: apply the offer and produce an answer on a separate task.
    fn on_offer(&mut self, peer: &str, offer: &SignalBlob) {
        let generation = self.bump_generation();
        let Some(session) = self.sessions.get_mut(peer) else {
            warn!(event = "offer_dropped", peer, "Offer without an accepted request");
            return;
        };
        let before = session.phase();
        let after = match session.handshake.apply(HandshakeEvent::RemoteOffer) {
            Ok(phase) => phase,
            Err(e) => {
                warn!(event = "offer_dropped", peer, error = %e, "Offer before the request was accepted");
                return;
            }
        };
        if before != after {
            phase_changed(&self.event_tx, peer, after);
        }

        let Some(target) = session.negotiator.begin_answer(peer) else {
            return;
        };
        if matches!(target, OfferTarget::New) {
            session.generation = generation;
        }
        let sink = EventSink::new(peer, session.generation, self.session_tx.clone());
        let generation = session.generation;
        let factory = self.factory.clone();
        let outcomes = self.negotiation_tx.clone();
        let peer_id = peer.to_string();
        let offer = offer.clone();
        tokio::spawn(async move {
            let result = build_answer(target, factory.as_ref(), sink, &offer).await;
            let _ = outcomes.send(NegotiationOutcome {
                peer_id,
                generation,
                step: NegotiationStep::Answer,
                result,
            });
        });
    }

    /// A negotiation task finished: install its transport and relay the
    /// description, or fail the session.
    pub(super) async fn handle_negotiation_outcome(&mut self, outcome: NegotiationOutcome) {
        let NegotiationOutcome {
            peer_id,
            generation,
            step,
            result,
        } = outcome;

        let session = self
            .sessions
            .get_mut(&peer_id)
            .filter(|s| s.generation == generation && s.negotiator.is_in_flight());
        let Some(session) = session else {
            debug!(event = "stale_negotiation", peer = %peer_id, generation, "Session moved on; discarding");
            if let Ok(prepared) = result {
                let peer = peer_id.clone();
                tokio::spawn(async move { close_transport(&peer, prepared.transport).await });
            }
            return;
        };

        let prepared = match result {
            Ok(prepared) => prepared,
            Err(e) => {
                session.negotiator.abort();
                self.fail_session(&peer_id, PeerError::Transport(format!("{e:#}")));
                return;
            }
        };
        let description = session.negotiator.finish(&peer_id, prepared).await;

        let sender = self.config.user_id.clone();
        let receiver = peer_id.clone();
        let msg = match step {
            NegotiationStep::Offer => RelayMessage::Offer {
                sender,
                receiver,
                offer: description,
            },
            NegotiationStep::Answer => RelayMessage::Answer {
                sender,
                receiver,
                answer: description,
            },
        };
        if let Err(e) = relay_send(self.relay.as_ref(), msg) {
            self.fail_session(&peer_id, e);
        }
    }

    async fn on_answer(&mut self, peer: &str, answer: &SignalBlob) {
        let Some(session) = self.sessions.get_mut(peer) else {
            warn!(event = "answer_dropped", peer, "Answer without a session");
            return;
        };
        if let Err(e) = session.negotiator.handle_answer(peer, answer).await {
            self.fail_session(peer, PeerError::Transport(format!("{e:#}")));
        }
    }

    async fn on_candidate(&mut self, peer: &str, candidate: SignalBlob) {
        let Some(session) = self.sessions.get_mut(peer) else {
            debug!(event = "candidate_dropped", peer, "Candidate without a session");
            return;
        };
        if matches!(session.phase(), SignalingPhase::Idle | SignalingPhase::Closed) {
            debug!(event = "candidate_dropped", peer, phase = ?session.phase(), "Candidate for inactive session");
            return;
        }
        if let Err(e) = session.negotiator.handle_candidate(peer, candidate).await {
            warn!(event = "candidate_apply_failed", peer, error = %e, "Remote candidate rejected");
        }
    }
}
