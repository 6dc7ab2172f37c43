//! Transport establishment: offer, answer and trickled candidates.
//!
//! Owns the session's transport handle and the queue of remote candidates
//! that arrive before a remote description exists. The queue is drained in
//! arrival order as soon as one is installed, then discarded.

use super::{EventSink, NegotiationState, PeerTransport, TransportFactory};
use crate::core::config::DATA_CHANNEL_LABEL;
use crate::core::relay::SignalBlob;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A description produced off the event loop, with the transport it
/// belongs to.
pub struct Prepared {
    pub transport: Arc<dyn PeerTransport>,
    pub description: SignalBlob,
}

/// Where an incoming offer is applied.
pub enum OfferTarget {
    New,
    Existing(Arc<dyn PeerTransport>),
}

#[derive(Default)]
pub struct Negotiator {
    transport: Option<Arc<dyn PeerTransport>>,
    pending_candidates: VecDeque<SignalBlob>,
    /// A transport is being created or a description produced elsewhere.
    in_flight: bool,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn transport(&self) -> Option<&Arc<dyn PeerTransport>> {
        self.transport.as_ref()
    }

    pub fn queued_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Initiator: claim the right to build the transport and offer.
    ///
    /// Returns `false` without side effects if a transport already exists or
    /// is being built, so a repeated click cannot start a second negotiation.
    pub fn begin_offer(&mut self, peer: &str) -> bool {
        if self.transport.is_some() || self.in_flight {
            debug!(event = "offer_skipped", peer, "Transport already exists");
            return false;
        }
        self.in_flight = true;
        true
    }

    /// Answerer: decide where `offer` goes.
    ///
    /// `None` drops the offer: the transport is mid-negotiation (not
    /// `Stable`) or a previous offer is still being answered.
    pub fn begin_answer(&mut self, peer: &str) -> Option<OfferTarget> {
        if self.in_flight {
            warn!(event = "offer_dropped", peer, "Offer received while another is being answered");
            return None;
        }
        let target = match &self.transport {
            None => OfferTarget::New,
            Some(t) => {
                let state = t.negotiation_state();
                if state != NegotiationState::Stable {
                    warn!(
                        event = "offer_dropped",
                        peer,
                        ?state,
                        "Offer received while negotiation in progress"
                    );
                    return None;
                }
                OfferTarget::Existing(t.clone())
            }
        };
        self.in_flight = true;
        Some(target)
    }

    /// Install a description produced by [`build_offer`] or [`build_answer`]
    /// and flush queued candidates if the remote description is now set.
    pub async fn finish(&mut self, peer: &str, prepared: Prepared) -> SignalBlob {
        self.in_flight = false;
        if self.transport.is_none() {
            self.transport = Some(prepared.transport.clone());
        }
        if prepared.transport.has_remote_description().await {
            self.drain_candidates(&prepared.transport).await;
        }
        debug!(event = "description_installed", peer, "Local description ready");
        prepared.description
    }

    /// The off-loop half failed; nothing was installed.
    pub fn abort(&mut self) {
        self.in_flight = false;
    }

    /// Initiator, in one step. Returns `Ok(None)` if a transport exists.
    pub async fn create_offer(
        &mut self,
        factory: &dyn TransportFactory,
        sink: EventSink,
    ) -> Result<Option<SignalBlob>> {
        let peer = sink.peer_id().to_string();
        if !self.begin_offer(&peer) {
            return Ok(None);
        }
        match build_offer(factory, sink).await {
            Ok(prepared) => Ok(Some(self.finish(&peer, prepared).await)),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Answerer, in one step. The offer is dropped (`Ok(None)`) unless the
    /// transport is `Stable`.
    pub async fn handle_offer(
        &mut self,
        factory: &dyn TransportFactory,
        sink: EventSink,
        offer: &SignalBlob,
    ) -> Result<Option<SignalBlob>> {
        let peer = sink.peer_id().to_string();
        let Some(target) = self.begin_answer(&peer) else {
            return Ok(None);
        };
        match build_answer(target, factory, sink, offer).await {
            Ok(prepared) => Ok(Some(self.finish(&peer, prepared).await)),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Initiator: apply the remote answer, then flush queued candidates.
    ///
    /// Returns `Ok(false)` when the answer was dropped for arriving in the
    /// wrong state.
    pub async fn handle_answer(&mut self, peer: &str, answer: &SignalBlob) -> Result<bool> {
        let Some(transport) = self.transport.clone() else {
            warn!(event = "answer_dropped", peer, "Answer received without a transport");
            return Ok(false);
        };

        let state = transport.negotiation_state();
        if state != NegotiationState::HaveLocalOffer {
            warn!(
                event = "answer_dropped",
                peer,
                ?state,
                "Answer received while no local offer pending"
            );
            return Ok(false);
        }

        transport.apply_answer(answer).await.context("apply answer")?;
        self.drain_candidates(&transport).await;
        info!(event = "answer_applied", peer, "Remote answer applied");
        Ok(true)
    }

    /// Apply `candidate` now if a remote description exists, else queue it.
    pub async fn handle_candidate(&mut self, peer: &str, candidate: SignalBlob) -> Result<()> {
        match &self.transport {
            Some(t) if t.has_remote_description().await => {
                t.add_candidate(&candidate).await.context("add candidate")?;
                debug!(event = "candidate_applied", peer, "Remote candidate applied");
            }
            _ => {
                self.pending_candidates.push_back(candidate);
                debug!(
                    event = "candidate_queued",
                    peer,
                    queued = self.pending_candidates.len(),
                    "Remote candidate queued until remote description is set"
                );
            }
        }
        Ok(())
    }

    async fn drain_candidates(&mut self, transport: &Arc<dyn PeerTransport>) {
        let drained = self.pending_candidates.len();
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = transport.add_candidate(&candidate).await {
                warn!(event = "candidate_apply_failed", error = %e, "Queued candidate rejected");
            }
        }
        if drained > 0 {
            debug!(event = "candidates_drained", count = drained, "Applied queued candidates");
        }
    }

    /// Give up the transport and drop the queue. The caller closes the
    /// returned transport with [`close_transport`].
    pub fn detach(&mut self) -> Option<Arc<dyn PeerTransport>> {
        self.pending_candidates.clear();
        self.in_flight = false;
        self.transport.take()
    }
}

/// Allocate a transport, open the data channel up front and produce an
/// offer. A transport that fails halfway is closed before returning.
pub async fn build_offer(factory: &dyn TransportFactory, sink: EventSink) -> Result<Prepared> {
    let peer = sink.peer_id().to_string();
    let transport = factory.create(sink).await.context("create transport")?;

    let offer = async {
        transport
            .create_data_channel(DATA_CHANNEL_LABEL)
            .await
            .context("create data channel")?;
        transport.create_offer().await.context("create offer")
    }
    .await;

    match offer {
        Ok(description) => {
            info!(event = "offer_created", peer = %peer, "Local offer ready");
            Ok(Prepared {
                transport,
                description,
            })
        }
        Err(e) => {
            close_transport(&peer, transport).await;
            Err(e)
        }
    }
}

/// Apply a remote offer and produce the answer, creating the transport
/// first if `target` says so.
pub async fn build_answer(
    target: OfferTarget,
    factory: &dyn TransportFactory,
    sink: EventSink,
    offer: &SignalBlob,
) -> Result<Prepared> {
    let peer = sink.peer_id().to_string();
    let (transport, created) = match target {
        OfferTarget::Existing(t) => (t, false),
        OfferTarget::New => (factory.create(sink).await.context("create transport")?, true),
    };

    match transport.accept_offer(offer).await.context("accept offer") {
        Ok(description) => {
            info!(event = "answer_created", peer = %peer, "Local answer ready");
            Ok(Prepared {
                transport,
                description,
            })
        }
        Err(e) => {
            if created {
                close_transport(&peer, transport).await;
            }
            Err(e)
        }
    }
}

/// Close the data channel, then the transport. Both steps run even if the
/// first fails.
pub async fn close_transport(peer: &str, transport: Arc<dyn PeerTransport>) {
    if let Some(dc) = transport.data_channel() {
        if let Err(e) = dc.close().await {
            warn!(event = "channel_close_failed", peer, error = %e, "Data channel close failed");
        }
    }
    if let Err(e) = transport.close().await {
        warn!(event = "transport_close_failed", peer, error = %e, "Transport close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::{MemoryNetwork, MemoryTransportFactory};
    use crate::core::connection::SessionEvent;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn sink(peer: &str) -> (EventSink, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(peer, 1, tx), rx)
    }

    fn candidate(n: u32) -> SignalBlob {
        SignalBlob(json!({ "candidate": format!("test:{n}") }))
    }

    #[tokio::test]
    async fn test_second_offer_is_noop() {
        let network = MemoryNetwork::new();
        let factory = MemoryTransportFactory::new(&network);
        let mut neg = Negotiator::new();

        let (s1, _rx1) = sink("bob");
        assert!(neg.create_offer(factory.as_ref(), s1).await.unwrap().is_some());
        let (s2, _rx2) = sink("bob");
        assert!(neg.create_offer(factory.as_ref(), s2).await.unwrap().is_none());
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_answer() {
        let network = MemoryNetwork::new();
        let alice_factory = MemoryTransportFactory::new(&network);
        let bob_factory = MemoryTransportFactory::new(&network);
        let mut alice = Negotiator::new();
        let mut bob = Negotiator::new();

        let (sa, _ra) = sink("bob");
        let offer = alice.create_offer(alice_factory.as_ref(), sa).await.unwrap().unwrap();

        for n in 0..3 {
            alice.handle_candidate("bob", candidate(n)).await.unwrap();
        }
        assert_eq!(alice.queued_candidates(), 3);

        let (sb, _rb) = sink("alice");
        let answer = bob
            .handle_offer(bob_factory.as_ref(), sb, &offer)
            .await
            .unwrap()
            .unwrap();
        assert!(alice.handle_answer("bob", &answer).await.unwrap());
        assert_eq!(alice.queued_candidates(), 0);

        let queued_order = alice_factory.transports()[0].applied_candidates();
        assert_eq!(queued_order, (0..3).map(candidate).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_queued_order_matches_immediate_order() {
        let network = MemoryNetwork::new();
        let factory = MemoryTransportFactory::new(&network);
        let peer_factory = MemoryTransportFactory::new(&network);

        // Immediate: remote description first, candidates after.
        let mut immediate = Negotiator::new();
        let mut peer = Negotiator::new();
        let (s, _r) = sink("p");
        let offer = immediate.create_offer(factory.as_ref(), s).await.unwrap().unwrap();
        let (s, _r2) = sink("i");
        let answer = peer.handle_offer(peer_factory.as_ref(), s, &offer).await.unwrap().unwrap();
        immediate.handle_answer("p", &answer).await.unwrap();
        for n in 0..4 {
            immediate.handle_candidate("p", candidate(n)).await.unwrap();
        }

        // Queued: same candidates before the answer.
        let mut queued = Negotiator::new();
        let mut peer2 = Negotiator::new();
        let (s, _r3) = sink("p2");
        let offer = queued.create_offer(factory.as_ref(), s).await.unwrap().unwrap();
        for n in 0..4 {
            queued.handle_candidate("p2", candidate(n)).await.unwrap();
        }
        let (s, _r4) = sink("q");
        let answer = peer2.handle_offer(peer_factory.as_ref(), s, &offer).await.unwrap().unwrap();
        queued.handle_answer("p2", &answer).await.unwrap();

        let transports = factory.transports();
        assert_eq!(
            transports[0].applied_candidates(),
            transports[1].applied_candidates()
        );
    }

    #[tokio::test]
    async fn test_offer_dropped_unless_stable() {
        let network = MemoryNetwork::new();
        let factory = MemoryTransportFactory::new(&network);
        let mut neg = Negotiator::new();

        let (s, _r) = sink("bob");
        let own_offer = neg.create_offer(factory.as_ref(), s).await.unwrap().unwrap();

        // Glare: we have a local offer out and the peer's offer arrives.
        let (s, _r2) = sink("bob");
        let dropped = neg.handle_offer(factory.as_ref(), s, &own_offer).await.unwrap();
        assert!(dropped.is_none());
        assert_eq!(factory.created(), 1);
        assert_eq!(
            neg.transport().unwrap().negotiation_state(),
            NegotiationState::HaveLocalOffer
        );
    }

    #[tokio::test]
    async fn test_answer_dropped_without_local_offer() {
        let mut neg = Negotiator::new();
        assert!(!neg.handle_answer("bob", &candidate(0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_detach_and_close_clear_everything() {
        let network = MemoryNetwork::new();
        let factory = MemoryTransportFactory::new(&network);
        let mut neg = Negotiator::new();
        let (s, _r) = sink("bob");
        neg.create_offer(factory.as_ref(), s).await.unwrap();
        neg.handle_candidate("bob", candidate(1)).await.unwrap();

        let transport = neg.detach().unwrap();
        close_transport("bob", transport).await;
        assert!(!neg.has_transport());
        assert_eq!(neg.queued_candidates(), 0);
        assert!(factory.transports()[0].is_closed());
    }
}
