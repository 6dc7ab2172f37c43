//! PeerNode: one user's event loop over relay, sessions and transfers.
//!
//! # Scheduling
//!
//! Everything that mutates session state runs on a single task: relay
//! messages, transport events, user commands, transfer outcomes and the
//! expiry tick are all `select!`ed here and handled to completion one at a
//! time. Anything that waits on the outside world runs as a separate task
//! and only reports back through channels: file senders, transport
//! creation with offer/answer production, and transport close. No session
//! state is shared across tasks, and one slow peer never stalls another.
//!
//! Handlers are split by source:
//! - `inbound`  relay signaling
//! - `events`   transport and data channel events
//! - `commands` user commands arriving through [`NodeHandle`]

mod commands;
mod events;
mod handle;
mod inbound;

pub use handle::{NodeCommand, NodeHandle, NodeSnapshot, SessionSnapshot};

use crate::core::config::{TransferLimits, CONNECTION_REQUEST_TIMEOUT, EXPIRY_TICK};
use crate::core::connection::negotiation::Prepared;
use crate::core::connection::{DataChannel, SessionEvent, TransportFactory};
use crate::core::error::{PeerError, PeerResult, TransferError};
use crate::core::notify::Notification;
use crate::core::relay::{RelayChannel, RelayMessage};
use crate::core::session::{PeerSession, TeardownReport};
use crate::core::signaling::{HandshakeEvent, PendingRequests, SignalingPhase};
use crate::core::transfer::receiver::ReceivedFile;
use crate::core::transfer::ControlMessage;
use crate::utils::sos::SignalOfStop;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub user_id: String,
    /// Sent as `senderName` with connection requests.
    pub display_name: Option<String>,
    pub limits: TransferLimits,
    pub request_timeout: Duration,
}

impl NodeConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            limits: TransferLimits::default(),
            request_timeout: CONNECTION_REQUEST_TIMEOUT,
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Events sent from PeerNode to the embedding application.
#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionRequested { peer_id: String, display_name: Option<String> },
    RequestAccepted { peer_id: String },
    RequestRejected { peer_id: String },
    RequestExpired { peer_id: String },
    PhaseChanged { peer_id: String, phase: SignalingPhase },
    Connected { peer_id: String },
    ChannelOpen { peer_id: String },
    Disconnected { peer_id: String, reason: String },
    TypingReceived { peer_id: String },
    SendProgress { peer_id: String, transfer_id: Uuid, name: String, sent: u64, total: u64, percent: u8 },
    SendComplete { peer_id: String, transfer_id: Uuid, name: String, bytes: u64 },
    SendCancelled { peer_id: String, transfer_id: Uuid, name: String },
    SendFailed { peer_id: String, transfer_id: Uuid, name: String, error: String },
    ReceiveStarted { peer_id: String, name: String, mime_type: String, size: u64 },
    ReceiveProgress { peer_id: String, name: String, received: u64, total: u64, percent: u8 },
    FileReceived { peer_id: String, file: ReceivedFile },
    ReceiveCancelled { peer_id: String, name: String },
    ReceiveFailed { peer_id: String, error: String },
    ObjectUrlRevoked { peer_id: String, url: String },
    Notice(Notification),
}

/// Forward `event` to the application; silently no-ops once it stopped listening.
#[inline]
fn notify_app(tx: &mpsc::UnboundedSender<AppEvent>, event: AppEvent) {
    let _ = tx.send(event);
}

#[inline]
fn notice(tx: &mpsc::UnboundedSender<AppEvent>, n: Notification) {
    notify_app(tx, AppEvent::Notice(n));
}

fn phase_changed(tx: &mpsc::UnboundedSender<AppEvent>, peer: &str, phase: SignalingPhase) {
    notify_app(
        tx,
        AppEvent::PhaseChanged {
            peer_id: peer.to_string(),
            phase,
        },
    );
}

/// Send on the relay after checking it is open.
fn relay_send(relay: &dyn RelayChannel, msg: RelayMessage) -> PeerResult<()> {
    if !relay.is_open() {
        warn!(event = "relay_closed", kind = msg.kind(), "Relay not open; message not sent");
        return Err(PeerError::RelayUnavailable);
    }
    relay.send(&msg).map_err(|e| {
        warn!(event = "relay_send_failed", kind = msg.kind(), error = %e, "Relay send failed");
        PeerError::RelayUnavailable
    })
}

/// Ask the peer to stop its transfer to us. Best-effort: a closed channel
/// means there is nothing left to stop.
async fn send_cancel_marker(peer: &str, dc: Option<Arc<dyn DataChannel>>) {
    let Some(dc) = dc else {
        return;
    };
    let sent = match ControlMessage::TransferCancelled.encode() {
        Ok(text) => dc.send_text(&text).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        warn!(event = "cancel_marker_failed", peer, error = %e, "Could not send transfer-cancelled");
    }
}

/// Which description a negotiation task produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationStep {
    Offer,
    Answer,
}

/// Outcome reported by a finished negotiation task.
struct NegotiationOutcome {
    peer_id: String,
    generation: u64,
    step: NegotiationStep,
    result: anyhow::Result<Prepared>,
}

/// Outcome reported by a finished sender task.
struct SendOutcome {
    peer_id: String,
    transfer_id: Uuid,
    name: String,
    result: Result<u64, TransferError>,
}

// ── Node ─────────────────────────────────────────────────────────────────────

pub struct PeerNode {
    config: NodeConfig,
    relay: Arc<dyn RelayChannel>,
    relay_rx: mpsc::UnboundedReceiver<String>,
    relay_live: bool,
    factory: Arc<dyn TransportFactory>,
    sessions: HashMap<String, PeerSession>,
    pending: PendingRequests,
    next_generation: u64,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    cmd_rx: mpsc::UnboundedReceiver<NodeCommand>,
    outcome_tx: mpsc::UnboundedSender<SendOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<SendOutcome>,
    negotiation_tx: mpsc::UnboundedSender<NegotiationOutcome>,
    negotiation_rx: mpsc::UnboundedReceiver<NegotiationOutcome>,
    event_tx: mpsc::UnboundedSender<AppEvent>,
    sos: SignalOfStop,
}

impl PeerNode {
    /// Start a node on its own task.
    ///
    /// `relay_rx` is the raw inbound side of `relay`. Returns the command
    /// handle, the application event stream and the loop's join handle.
    pub fn spawn(
        config: NodeConfig,
        relay: Arc<dyn RelayChannel>,
        relay_rx: mpsc::UnboundedReceiver<String>,
        factory: Arc<dyn TransportFactory>,
        sos: SignalOfStop,
    ) -> (NodeHandle, mpsc::UnboundedReceiver<AppEvent>, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (negotiation_tx, negotiation_rx) = mpsc::unbounded_channel();

        let node = Self {
            config,
            relay,
            relay_rx,
            relay_live: true,
            factory,
            sessions: HashMap::new(),
            pending: PendingRequests::new(),
            next_generation: 0,
            session_tx,
            session_rx,
            cmd_rx,
            outcome_tx,
            outcome_rx,
            negotiation_tx,
            negotiation_rx,
            event_tx,
            sos,
        };
        let task = tokio::spawn(node.run());
        (NodeHandle::new(cmd_tx), event_rx, task)
    }

    fn user_id(&self) -> &str {
        &self.config.user_id
    }

    async fn run(mut self) {
        info!(event = "node_started", user = %self.config.user_id, "Peer node running");
        let mut tick = tokio::time::interval(EXPIRY_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.sos.wait() => break,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                text = self.relay_rx.recv(), if self.relay_live => match text {
                    Some(text) => self.handle_relay_text(&text).await,
                    None => {
                        self.relay_live = false;
                        warn!(event = "relay_stream_ended", user = %self.config.user_id, "Relay inbound stream closed");
                        notice(&self.event_tx, Notification::error(PeerError::RelayUnavailable.to_string()));
                    }
                },
                Some(ev) = self.session_rx.recv() => self.handle_session_event(ev).await,
                Some(outcome) = self.outcome_rx.recv() => self.handle_send_outcome(outcome),
                Some(outcome) = self.negotiation_rx.recv() => self.handle_negotiation_outcome(outcome).await,
                _ = tick.tick() => self.expire_requests(),
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        let peers: Vec<String> = self.sessions.keys().cloned().collect();
        let mut closing = Vec::new();
        for peer in peers {
            if let Some(mut session) = self.sessions.remove(&peer) {
                let mut report = session.teardown();
                closing.extend(report.closing.take());
                self.report_teardown(&peer, report);
            }
        }
        // Nothing else is waiting on the loop any more.
        for task in closing {
            let _ = task.await;
        }
        info!(event = "node_stopped", user = %self.config.user_id, "Peer node stopped");
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn report_teardown(&self, peer: &str, report: TeardownReport) {
        if let Some(name) = report.dropped_receive {
            notify_app(
                &self.event_tx,
                AppEvent::ReceiveCancelled {
                    peer_id: peer.to_string(),
                    name,
                },
            );
        }
        if let Some(url) = report.revoked_url {
            notify_app(
                &self.event_tx,
                AppEvent::ObjectUrlRevoked {
                    peer_id: peer.to_string(),
                    url,
                },
            );
        }
        if let Some(name) = report.cancelled_send {
            debug!(event = "send_aborted_on_teardown", peer, %name, "Outgoing transfer stopped by teardown");
        }
    }

    /// Tear the session down after a failure and tell the user why.
    fn fail_session(&mut self, peer: &str, err: PeerError) {
        self.pending.take(peer);
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        let report = session.teardown();
        self.report_teardown(peer, report);
        warn!(event = "session_failed", peer, error = %err, "Session torn down");
        phase_changed(&self.event_tx, peer, SignalingPhase::Closed);
        notify_app(
            &self.event_tx,
            AppEvent::Disconnected {
                peer_id: peer.to_string(),
                reason: err.to_string(),
            },
        );
        notice(&self.event_tx, Notification::error(err.to_string()));
    }

    /// Drop a session that went back to `Idle`.
    fn discard_if_idle(&mut self, peer: &str) {
        if self
            .sessions
            .get(peer)
            .is_some_and(|s| s.phase() == SignalingPhase::Idle)
        {
            self.sessions.remove(peer);
            debug!(event = "session_discarded", peer, "Idle session dropped");
        }
    }

    /// Expire unanswered requests in both directions.
    fn expire_requests(&mut self) {
        let now = tokio::time::Instant::now();
        let timeout = self.config.request_timeout;

        for req in self.pending.expire(now, timeout) {
            if let Some(session) = self.sessions.get_mut(&req.sender) {
                let _ = session.handshake.apply(HandshakeEvent::Expired);
            }
            self.discard_if_idle(&req.sender);
            info!(event = "request_expired", peer = %req.sender, direction = "inbound", "Connection request timed out");
            notify_app(&self.event_tx, AppEvent::RequestExpired { peer_id: req.sender.clone() });
            phase_changed(&self.event_tx, &req.sender, SignalingPhase::Idle);
            notice(
                &self.event_tx,
                Notification::warn(format!("Connection request from {} expired", req.label())),
            );
        }

        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                s.phase() == SignalingPhase::RequestSent && s.handshake.is_expired(now, timeout)
            })
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in stale {
            self.sessions.remove(&peer);
            info!(event = "request_expired", peer = %peer, direction = "outbound", "No answer to connection request");
            notify_app(&self.event_tx, AppEvent::RequestExpired { peer_id: peer.clone() });
            phase_changed(&self.event_tx, &peer, SignalingPhase::Idle);
            notice(
                &self.event_tx,
                Notification::warn(format!("{peer} did not answer; try again later")),
            );
        }
    }

    fn handle_send_outcome(&mut self, outcome: SendOutcome) {
        let SendOutcome {
            peer_id,
            transfer_id,
            name,
            result,
        } = outcome;

        if let Some(session) = self.sessions.get_mut(&peer_id) {
            if session.outgoing.as_ref().is_some_and(|o| o.id == transfer_id) {
                session.outgoing = None;
            }
        }

        match result {
            Ok(bytes) => {
                notify_app(
                    &self.event_tx,
                    AppEvent::SendComplete {
                        peer_id: peer_id.clone(),
                        transfer_id,
                        name: name.clone(),
                        bytes,
                    },
                );
                notice(&self.event_tx, Notification::success(format!("Sent {name} to {peer_id}")));
            }
            Err(TransferError::Cancelled) => {
                notify_app(
                    &self.event_tx,
                    AppEvent::SendCancelled {
                        peer_id,
                        transfer_id,
                        name: name.clone(),
                    },
                );
                notice(&self.event_tx, Notification::warn(format!("Cancelled sending {name}")));
            }
            Err(e) => {
                notice(&self.event_tx, Notification::error(format!("Sending {name} failed: {e}")));
                notify_app(
                    &self.event_tx,
                    AppEvent::SendFailed {
                        peer_id,
                        transfer_id,
                        name,
                        error: e.to_string(),
                    },
                );
            }
        }
    }
}
