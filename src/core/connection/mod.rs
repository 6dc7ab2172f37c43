//! Direct peer transport: the seam between session logic and the network.
//!
//! A [`PeerTransport`] is one negotiated peer connection carrying at most one
//! [`DataChannel`]. Everything it observes asynchronously (local candidates,
//! connectivity changes, channel traffic) is pushed through an [`EventSink`]
//! into the owning node's single event queue, tagged with the session's
//! generation so events from a torn-down transport can be recognized and
//! ignored.
//!
//! Two implementations ship: [`webrtc`] (webrtc-rs) and [`memory`]
//! (in-process links for tests and the demo).

pub mod memory;
pub mod negotiation;
pub mod webrtc;

use crate::core::relay::SignalBlob;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

// ── States ───────────────────────────────────────────────────────────────────

/// Offer/answer state of the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No negotiation in progress.
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
    /// Provisional answers and anything else we never drive into.
    Other,
}

/// Connectivity as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl Connectivity {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    /// States that end the session. There is no automatic retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

/// One data channel message: JSON control text or a raw chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    Binary(Bytes),
}

impl ChannelFrame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A locally gathered candidate, to be relayed immediately.
    LocalCandidate(SignalBlob),
    Connectivity(Connectivity),
    ChannelOpen,
    ChannelMessage(ChannelFrame),
    ChannelClosed,
}

/// A transport event tagged with the session it belongs to.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub peer_id: String,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Where a transport reports its events.
#[derive(Clone, Debug)]
pub struct EventSink {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(peer_id: &str, generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Push an event; silently no-ops once the node has shut down.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(SessionEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }
}

// ── Contracts ────────────────────────────────────────────────────────────────

/// An ordered, reliable message channel over an established transport.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    /// Bytes queued locally but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// Level below which [`wait_buffered_low`](Self::wait_buffered_low) fires.
    async fn set_buffered_low_threshold(&self, threshold: usize);

    /// Resolve once the buffered amount has dropped to the low threshold
    /// (or the channel closed). May return early; callers re-check.
    async fn wait_buffered_low(&self);

    async fn close(&self) -> Result<()>;
}

/// One directly negotiated peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn negotiation_state(&self) -> NegotiationState;

    async fn has_remote_description(&self) -> bool;

    /// Open the local data channel ahead of negotiation (initiator side).
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    /// Produce and install a local offer.
    async fn create_offer(&self) -> Result<SignalBlob>;

    /// Install a remote offer, then produce and install the answer.
    async fn accept_offer(&self, offer: &SignalBlob) -> Result<SignalBlob>;

    /// Install the remote answer to our offer.
    async fn apply_answer(&self, answer: &SignalBlob) -> Result<()>;

    /// Apply a remote candidate. Requires a remote description.
    async fn add_candidate(&self, candidate: &SignalBlob) -> Result<()>;

    /// The data channel, once either side has opened it.
    fn data_channel(&self) -> Option<Arc<dyn DataChannel>>;

    async fn close(&self) -> Result<()>;
}

/// Allocates transports. Called at most once per session generation.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, sink: EventSink) -> Result<Arc<dyn PeerTransport>>;
}
