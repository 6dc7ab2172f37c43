//! Signaling state machine: the human-level handshake that precedes any
//! transport negotiation.
//!
//! ```text
//!   Idle ──local request──▶ RequestSent ──remote accepted──▶ Negotiating ──transport up──▶ Connected
//!    │                          └──remote rejected / expired──▶ Idle
//!    └──remote request──▶ RequestReceived ──local accept──▶ (accepted) ──remote offer──▶ Negotiating
//!                              └──local reject / expired──▶ Idle
//!   RequestSent ──crossed request──▶ RequestReceived (accepted)
//!   Connected ──remote offer──▶ Connected
//!   any ──close──▶ Closed
//! ```
//!
//! Pure state: no I/O, no clocks other than the timestamp recorded when a
//! request starts waiting. The node feeds it events and performs whatever
//! the resulting phase implies.

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

// ── Phase ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingPhase {
    Idle,
    RequestSent,
    RequestReceived,
    Negotiating,
    Connected,
    Closed,
}

impl SignalingPhase {
    /// Phases in which a human answer is still outstanding.
    pub fn is_awaiting_answer(self) -> bool {
        matches!(self, Self::RequestSent | Self::RequestReceived)
    }

    /// Phases a new local request cannot start from.
    pub fn is_busy(self) -> bool {
        !matches!(self, Self::Idle | Self::Closed)
    }
}

/// Which side of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the request; creates the transport and the offer.
    Initiator,
    /// Received the request; answers the offer.
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    LocalRequest,
    RemoteRequest,
    LocalAccept,
    LocalReject,
    RemoteAccepted,
    RemoteRejected,
    RemoteOffer,
    /// The peer's request crossed ours and ours yields to it.
    CrossedRequest,
    TransportConnected,
    Expired,
    Close,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{event:?} is not valid while {phase:?}")]
pub struct HandshakeError {
    pub phase: SignalingPhase,
    pub event: HandshakeEvent,
}

// ── Handshake ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Handshake {
    phase: SignalingPhase,
    role: Option<Role>,
    accepted: bool,
    since: Instant,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            phase: SignalingPhase::Idle,
            role: None,
            accepted: false,
            since: Instant::now(),
        }
    }

    pub fn phase(&self) -> SignalingPhase {
        self.phase
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// The "waiting for acceptance" flag shown while our request is out.
    pub fn is_waiting(&self) -> bool {
        self.phase == SignalingPhase::RequestSent
    }

    /// Local user accepted and we are waiting for the initiator's offer.
    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// Whether an outstanding request has waited longer than `timeout`.
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.phase.is_awaiting_answer()
            && !self.accepted
            && now.saturating_duration_since(self.since) >= timeout
    }

    /// Apply `event`, returning the new phase. On error the handshake is
    /// left untouched.
    pub fn apply(&mut self, event: HandshakeEvent) -> Result<SignalingPhase, HandshakeError> {
        use HandshakeEvent as E;
        use SignalingPhase as P;

        let next = match (self.phase, event) {
            (_, E::Close) => P::Closed,
            (P::Idle | P::Closed, E::LocalRequest) => {
                self.role = Some(Role::Initiator);
                self.accepted = false;
                P::RequestSent
            }
            (P::Idle | P::Closed, E::RemoteRequest) => {
                self.role = Some(Role::Answerer);
                self.accepted = false;
                P::RequestReceived
            }
            (P::RequestReceived, E::LocalAccept) if !self.accepted => {
                self.accepted = true;
                P::RequestReceived
            }
            (P::RequestReceived, E::LocalReject) if !self.accepted => P::Idle,
            (P::RequestSent, E::CrossedRequest) => {
                self.role = Some(Role::Answerer);
                self.accepted = true;
                P::RequestReceived
            }
            (P::RequestSent, E::RemoteAccepted) => P::Negotiating,
            (P::RequestSent, E::RemoteRejected) => P::Idle,
            (P::RequestReceived, E::RemoteOffer) if self.accepted => P::Negotiating,
            (P::Negotiating, E::RemoteOffer) => P::Negotiating,
            // Renegotiation; the transport decides whether to take it.
            (P::Connected, E::RemoteOffer) => P::Connected,
            (P::RequestSent | P::RequestReceived, E::Expired) => P::Idle,
            (P::Negotiating | P::Connected, E::TransportConnected) => P::Connected,
            (phase, event) => return Err(HandshakeError { phase, event }),
        };

        if next != self.phase {
            self.since = Instant::now();
        }
        if next == P::Idle {
            self.role = None;
            self.accepted = false;
        }
        self.phase = next;
        Ok(next)
    }
}

// ── Pending requests ─────────────────────────────────────────────────────────

/// An inbound request awaiting the local user's decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRequest {
    pub sender: String,
    pub sender_display_name: Option<String>,
    pub receiver: String,
    pub received_at: Instant,
}

impl ConnectionRequest {
    pub fn new(sender: &str, sender_display_name: Option<String>, receiver: &str) -> Self {
        Self {
            sender: sender.to_string(),
            sender_display_name,
            receiver: receiver.to_string(),
            received_at: Instant::now(),
        }
    }

    /// Name to show the user: display name when given, id otherwise.
    pub fn label(&self) -> &str {
        self.sender_display_name.as_deref().unwrap_or(&self.sender)
    }
}

/// Inbound requests in arrival order. Every terminal outcome (accepted,
/// rejected, timed out) removes the entry.
#[derive(Debug, Default)]
pub struct PendingRequests {
    requests: Vec<ConnectionRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `request`. A repeat from the same sender replaces the old one
    /// in place.
    pub fn push(&mut self, request: ConnectionRequest) {
        match self.requests.iter_mut().find(|r| r.sender == request.sender) {
            Some(existing) => *existing = request,
            None => self.requests.push(request),
        }
    }

    pub fn take(&mut self, sender: &str) -> Option<ConnectionRequest> {
        let idx = self.requests.iter().position(|r| r.sender == sender)?;
        Some(self.requests.remove(idx))
    }

    pub fn contains(&self, sender: &str) -> bool {
        self.requests.iter().any(|r| r.sender == sender)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRequest> {
        self.requests.iter()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Remove and return every request older than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<ConnectionRequest> {
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.requests)
            .into_iter()
            .partition(|r| now.saturating_duration_since(r.received_at) >= timeout);
        self.requests = kept;
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use HandshakeEvent as E;
    use SignalingPhase as P;

    fn run(events: &[HandshakeEvent]) -> Handshake {
        let mut hs = Handshake::new();
        for e in events {
            hs.apply(*e).unwrap();
        }
        hs
    }

    #[test]
    fn test_initiator_path() {
        let mut hs = Handshake::new();
        assert_eq!(hs.apply(E::LocalRequest), Ok(P::RequestSent));
        assert!(hs.is_waiting());
        assert_eq!(hs.role(), Some(Role::Initiator));
        assert_eq!(hs.apply(E::RemoteAccepted), Ok(P::Negotiating));
        assert!(!hs.is_waiting());
        assert_eq!(hs.apply(E::TransportConnected), Ok(P::Connected));
    }

    #[test]
    fn test_answerer_waits_for_offer() {
        let mut hs = run(&[E::RemoteRequest]);
        assert_eq!(hs.role(), Some(Role::Answerer));
        assert_eq!(hs.apply(E::LocalAccept), Ok(P::RequestReceived));
        assert!(hs.is_accepted());
        assert_eq!(hs.apply(E::RemoteOffer), Ok(P::Negotiating));
        assert_eq!(hs.apply(E::TransportConnected), Ok(P::Connected));
    }

    #[test]
    fn test_offer_before_accept_rejected() {
        let mut hs = run(&[E::RemoteRequest]);
        let err = hs.apply(E::RemoteOffer).unwrap_err();
        assert_eq!(err.phase, P::RequestReceived);
        assert_eq!(hs.phase(), P::RequestReceived);

        let mut idle = Handshake::new();
        assert!(idle.apply(E::RemoteOffer).is_err());
    }

    #[test]
    fn test_rejections_return_to_idle() {
        let hs = run(&[E::LocalRequest, E::RemoteRejected]);
        assert_eq!(hs.phase(), P::Idle);
        assert_eq!(hs.role(), None);

        let hs = run(&[E::RemoteRequest, E::LocalReject]);
        assert_eq!(hs.phase(), P::Idle);
    }

    #[test]
    fn test_double_request_refused() {
        let mut hs = run(&[E::LocalRequest]);
        assert!(hs.apply(E::LocalRequest).is_err());
        assert!(hs.apply(E::RemoteRequest).is_err());
        assert_eq!(hs.phase(), P::RequestSent);
    }

    #[test]
    fn test_connected_requires_negotiation() {
        let mut hs = Handshake::new();
        assert!(hs.apply(E::TransportConnected).is_err());
        let mut hs = run(&[E::LocalRequest, E::RemoteAccepted, E::Close]);
        assert!(hs.apply(E::TransportConnected).is_err());
        assert_eq!(hs.phase(), P::Closed);
    }

    #[test]
    fn test_close_from_anywhere() {
        for events in [
            vec![],
            vec![E::LocalRequest],
            vec![E::RemoteRequest, E::LocalAccept],
            vec![E::LocalRequest, E::RemoteAccepted, E::TransportConnected],
        ] {
            let mut hs = run(&events);
            assert_eq!(hs.apply(E::Close), Ok(P::Closed));
        }
    }

    #[test]
    fn test_crossed_request_yields_and_accepts() {
        let mut hs = run(&[E::LocalRequest]);
        assert_eq!(hs.apply(E::CrossedRequest), Ok(P::RequestReceived));
        assert_eq!(hs.role(), Some(Role::Answerer));
        assert!(hs.is_accepted());
        assert_eq!(hs.apply(E::RemoteOffer), Ok(P::Negotiating));

        let mut idle = Handshake::new();
        assert!(idle.apply(E::CrossedRequest).is_err());
    }

    #[test]
    fn test_offer_on_connected_session_keeps_phase() {
        let mut hs = run(&[E::LocalRequest, E::RemoteAccepted, E::TransportConnected]);
        assert_eq!(hs.apply(E::RemoteOffer), Ok(P::Connected));
        assert_eq!(hs.phase(), P::Connected);
    }

    #[test]
    fn test_closed_session_can_restart() {
        let mut hs = run(&[E::LocalRequest, E::Close]);
        assert_eq!(hs.apply(E::RemoteRequest), Ok(P::RequestReceived));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_expiry() {
        let timeout = Duration::from_secs(60);
        let hs = run(&[E::LocalRequest]);
        assert!(!hs.is_expired(Instant::now(), timeout));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(hs.is_expired(Instant::now(), timeout));

        let accepted = run(&[E::RemoteRequest, E::LocalAccept]);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!accepted.is_expired(Instant::now(), timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_requests() {
        let mut pending = PendingRequests::new();
        pending.push(ConnectionRequest::new("x", None, "me"));
        tokio::time::advance(Duration::from_secs(30)).await;
        pending.push(ConnectionRequest::new("y", Some("Yan".into()), "me"));
        pending.push(ConnectionRequest::new("y", Some("Yannick".into()), "me"));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.iter().nth(1).unwrap().label(), "Yannick");

        tokio::time::advance(Duration::from_secs(31)).await;
        let expired = pending.expire(Instant::now(), Duration::from_secs(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sender, "x");
        assert!(pending.contains("y"));

        assert!(pending.take("y").is_some());
        assert!(pending.take("y").is_none());
        assert!(pending.is_empty());
    }
}
