//! In-process transport: two endpoints on a shared [`MemoryNetwork`] link
//! up once both hold the other's description and at least one candidate.
//!
//! Behaves like the real thing where session logic can observe it:
//! negotiation states, trickled candidates (one per local description),
//! connectivity events, a data channel with a buffered-amount counter and
//! low-threshold wakeups. Frames are delivered in order by a pump task per
//! direction; [`MemoryDataChannel::loopback`] skips the pump and hands the
//! raw queue to a test through [`MemoryChannelTap`].

use super::{
    ChannelFrame, Connectivity, DataChannel, EventSink, NegotiationState, PeerTransport,
    TransportEvent, TransportFactory,
};
use crate::core::config::DATA_CHANNEL_LABEL;
use crate::core::relay::SignalBlob;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Network ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryNetwork {
    next_id: AtomicU64,
    endpoints: Mutex<HashMap<u64, Weak<MemoryTransport>>>,
    link_lock: Mutex<()>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn get(&self, id: u64) -> Option<Arc<MemoryTransport>> {
        lock(&self.endpoints).get(&id).and_then(Weak::upgrade)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Hands out transports on one network and remembers each one it made.
pub struct MemoryTransportFactory {
    network: Arc<MemoryNetwork>,
    transports: Mutex<Vec<Arc<MemoryTransport>>>,
}

impl MemoryTransportFactory {
    pub fn new(network: &Arc<MemoryNetwork>) -> Arc<Self> {
        Arc::new(Self {
            network: Arc::clone(network),
            transports: Mutex::new(Vec::new()),
        })
    }

    /// Number of transports ever allocated by this factory.
    pub fn created(&self) -> usize {
        lock(&self.transports).len()
    }

    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        lock(&self.transports).clone()
    }

    /// Make every link this factory created report `failed` on both ends.
    pub fn fail_all(&self) {
        for t in self.transports() {
            t.fail();
        }
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create(&self, sink: EventSink) -> Result<Arc<dyn PeerTransport>> {
        let id = self.network.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let transport = Arc::new(MemoryTransport {
            id,
            network: Arc::clone(&self.network),
            sink,
            state: Mutex::new(LinkState::default()),
        });
        lock(&self.network.endpoints).insert(id, Arc::downgrade(&transport));
        lock(&self.transports).push(transport.clone());
        debug!(event = "memory_transport_created", id, "Allocated in-memory transport");
        Ok(transport as Arc<dyn PeerTransport>)
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

struct LinkState {
    negotiation: NegotiationState,
    local_description: bool,
    remote_endpoint: Option<u64>,
    applied: Vec<SignalBlob>,
    channel: Option<Arc<MemoryDataChannel>>,
    linked: bool,
    closed: bool,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            negotiation: NegotiationState::Stable,
            local_description: false,
            remote_endpoint: None,
            applied: Vec::new(),
            channel: None,
            linked: false,
            closed: false,
        }
    }
}

impl LinkState {
    fn ready(&self) -> bool {
        self.local_description
            && self.remote_endpoint.is_some()
            && !self.applied.is_empty()
            && !self.linked
            && !self.closed
    }
}

pub struct MemoryTransport {
    id: u64,
    network: Arc<MemoryNetwork>,
    sink: EventSink,
    state: Mutex<LinkState>,
}

impl MemoryTransport {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote candidates applied so far, in application order.
    pub fn applied_candidates(&self) -> Vec<SignalBlob> {
        lock(&self.state).applied.clone()
    }

    pub fn is_linked(&self) -> bool {
        lock(&self.state).linked
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Concrete channel handle, for buffered-amount assertions.
    pub fn memory_channel(&self) -> Option<Arc<MemoryDataChannel>> {
        lock(&self.state).channel.clone()
    }

    /// Simulate a path failure: both ends see `failed`.
    pub fn fail(&self) {
        let remote = {
            let st = lock(&self.state);
            if st.closed {
                return;
            }
            st.remote_endpoint.filter(|_| st.linked)
        };
        self.sink.emit(TransportEvent::Connectivity(Connectivity::Failed));
        if let Some(peer) = remote.and_then(|id| self.network.get(id)) {
            peer.sink.emit(TransportEvent::Connectivity(Connectivity::Failed));
        }
    }

    fn emit_local_candidate(&self) {
        let candidate = SignalBlob(json!({
            "candidate": format!("memory:{}", self.id),
            "endpoint": self.id,
        }));
        self.sink.emit(TransportEvent::LocalCandidate(candidate));
    }

    fn endpoint_of(blob: &SignalBlob, kind: &str) -> Result<u64> {
        if blob.0.get("kind").and_then(|k| k.as_str()) != Some(kind) {
            bail!("not a memory {kind} description");
        }
        blob.0
            .get("endpoint")
            .and_then(|e| e.as_u64())
            .ok_or_else(|| anyhow!("memory {kind} without endpoint"))
    }

    /// Link with the remote endpoint once both sides are ready. Serialized
    /// network-wide so exactly one side performs the link.
    fn try_link(&self) {
        let _guard = lock(&self.network.link_lock);

        let remote = {
            let st = lock(&self.state);
            if !st.ready() {
                return;
            }
            match st.remote_endpoint {
                Some(id) => id,
                None => return,
            }
        };
        let Some(peer) = self.network.get(remote) else {
            return;
        };
        {
            let pst = lock(&peer.state);
            if !pst.ready() || pst.remote_endpoint != Some(self.id) {
                return;
            }
        }

        let mut st = lock(&self.state);
        let mut pst = lock(&peer.state);
        let label = st
            .channel
            .as_ref()
            .or(pst.channel.as_ref())
            .map(|c| c.label.clone())
            .unwrap_or_else(|| DATA_CHANNEL_LABEL.to_string());
        let mine = st
            .channel
            .get_or_insert_with(|| MemoryDataChannel::new(&label))
            .clone();
        let theirs = pst
            .channel
            .get_or_insert_with(|| MemoryDataChannel::new(&label))
            .clone();
        MemoryDataChannel::connect(&mine, &self.sink, &theirs, &peer.sink);
        st.linked = true;
        pst.linked = true;
        drop(pst);
        drop(st);

        info!(event = "memory_linked", local = self.id, remote, "In-memory link established");
        for sink in [&self.sink, &peer.sink] {
            sink.emit(TransportEvent::Connectivity(Connectivity::Connected));
            sink.emit(TransportEvent::ChannelOpen);
        }
    }

    /// The remote end went away.
    fn remote_gone(&self) {
        let channel = {
            let mut st = lock(&self.state);
            if st.closed || !st.linked {
                return;
            }
            st.linked = false;
            st.channel.clone()
        };
        if let Some(ch) = channel {
            ch.shut();
        }
        self.sink
            .emit(TransportEvent::Connectivity(Connectivity::Disconnected));
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn negotiation_state(&self) -> NegotiationState {
        lock(&self.state).negotiation
    }

    async fn has_remote_description(&self) -> bool {
        lock(&self.state).remote_endpoint.is_some()
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let mut st = lock(&self.state);
        if st.closed {
            bail!("transport closed");
        }
        let ch = st
            .channel
            .get_or_insert_with(|| MemoryDataChannel::new(label))
            .clone();
        Ok(ch as Arc<dyn DataChannel>)
    }

    async fn create_offer(&self) -> Result<SignalBlob> {
        {
            let mut st = lock(&self.state);
            if st.closed {
                bail!("transport closed");
            }
            if st.negotiation != NegotiationState::Stable {
                bail!("cannot offer in state {:?}", st.negotiation);
            }
            st.negotiation = NegotiationState::HaveLocalOffer;
            st.local_description = true;
        }
        self.emit_local_candidate();
        Ok(SignalBlob(json!({ "kind": "offer", "endpoint": self.id })))
    }

    async fn accept_offer(&self, offer: &SignalBlob) -> Result<SignalBlob> {
        let remote = Self::endpoint_of(offer, "offer")?;
        {
            let mut st = lock(&self.state);
            if st.closed {
                bail!("transport closed");
            }
            if st.negotiation != NegotiationState::Stable {
                bail!("cannot accept offer in state {:?}", st.negotiation);
            }
            st.remote_endpoint = Some(remote);
            st.local_description = true;
            st.negotiation = NegotiationState::Stable;
        }
        self.emit_local_candidate();
        self.try_link();
        Ok(SignalBlob(json!({ "kind": "answer", "endpoint": self.id })))
    }

    async fn apply_answer(&self, answer: &SignalBlob) -> Result<()> {
        let remote = Self::endpoint_of(answer, "answer")?;
        {
            let mut st = lock(&self.state);
            if st.negotiation != NegotiationState::HaveLocalOffer {
                bail!("cannot apply answer in state {:?}", st.negotiation);
            }
            st.remote_endpoint = Some(remote);
            st.negotiation = NegotiationState::Stable;
        }
        self.try_link();
        Ok(())
    }

    async fn add_candidate(&self, candidate: &SignalBlob) -> Result<()> {
        {
            let mut st = lock(&self.state);
            if st.closed {
                bail!("transport closed");
            }
            if st.remote_endpoint.is_none() {
                bail!("remote description not set");
            }
            st.applied.push(candidate.clone());
        }
        self.try_link();
        Ok(())
    }

    fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        lock(&self.state)
            .channel
            .clone()
            .map(|c| c as Arc<dyn DataChannel>)
    }

    async fn close(&self) -> Result<()> {
        let (channel, remote) = {
            let mut st = lock(&self.state);
            if st.closed {
                return Ok(());
            }
            st.closed = true;
            st.negotiation = NegotiationState::Closed;
            let remote = st.remote_endpoint.filter(|_| st.linked);
            st.linked = false;
            (st.channel.clone(), remote)
        };
        if let Some(ch) = channel {
            ch.shut();
        }
        self.sink
            .emit(TransportEvent::Connectivity(Connectivity::Closed));
        if let Some(peer) = remote.and_then(|id| self.network.get(id)) {
            peer.remote_gone();
        }
        Ok(())
    }
}

// ── Data channel ─────────────────────────────────────────────────────────────

/// Send-side queue accounting shared by a channel and whoever drains it.
#[derive(Default)]
struct Backlog {
    bytes: AtomicUsize,
    peak: AtomicUsize,
    threshold: AtomicUsize,
    low: Notify,
}

impl Backlog {
    fn add(&self, n: usize) {
        let now = self.bytes.fetch_add(n, Ordering::AcqRel) + n;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    fn release(&self, n: usize) {
        let prev = self.bytes.fetch_sub(n, Ordering::AcqRel);
        let now = prev.saturating_sub(n);
        let threshold = self.threshold.load(Ordering::Acquire);
        if prev > threshold && now <= threshold {
            self.low.notify_one();
        }
    }
}

pub struct MemoryDataChannel {
    label: String,
    open: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<ChannelFrame>>>,
    backlog: Arc<Backlog>,
}

impl MemoryDataChannel {
    fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            outbound: Mutex::new(None),
            backlog: Arc::new(Backlog::default()),
        })
    }

    /// An open channel whose outbound frames queue up in the returned tap
    /// until the caller drains them.
    pub fn loopback(label: &str) -> (Arc<Self>, MemoryChannelTap) {
        let ch = Self::new(label);
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&ch.outbound) = Some(tx);
        ch.open.store(true, Ordering::Release);
        let tap = MemoryChannelTap {
            rx,
            backlog: ch.backlog.clone(),
        };
        (ch, tap)
    }

    /// Highest buffered amount ever observed.
    pub fn peak_buffered(&self) -> usize {
        self.backlog.peak.load(Ordering::Acquire)
    }

    fn connect(a: &Arc<Self>, a_sink: &EventSink, b: &Arc<Self>, b_sink: &EventSink) {
        let (ab_tx, ab_rx) = mpsc::unbounded_channel();
        let (ba_tx, ba_rx) = mpsc::unbounded_channel();
        *lock(&a.outbound) = Some(ab_tx);
        *lock(&b.outbound) = Some(ba_tx);
        a.open.store(true, Ordering::Release);
        b.open.store(true, Ordering::Release);

        let ab = MemoryChannelTap {
            rx: ab_rx,
            backlog: a.backlog.clone(),
        };
        let ba = MemoryChannelTap {
            rx: ba_rx,
            backlog: b.backlog.clone(),
        };
        tokio::spawn(ab.pump(b_sink.clone()));
        tokio::spawn(ba.pump(a_sink.clone()));
    }

    fn shut(&self) {
        self.open.store(false, Ordering::Release);
        lock(&self.outbound).take();
        self.backlog.low.notify_one();
    }

    fn push(&self, frame: ChannelFrame) -> Result<()> {
        if !self.is_open() {
            bail!("data channel {} is not open", self.label);
        }
        let len = frame.len();
        let guard = lock(&self.outbound);
        let tx = guard
            .as_ref()
            .ok_or_else(|| anyhow!("data channel {} is not open", self.label))?;
        self.backlog.add(len);
        if tx.send(frame).is_err() {
            self.backlog.release(len);
            bail!("data channel {} peer gone", self.label);
        }
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.push(ChannelFrame::Text(text.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.push(ChannelFrame::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        self.backlog.bytes.load(Ordering::Acquire)
    }

    async fn set_buffered_low_threshold(&self, threshold: usize) {
        self.backlog.threshold.store(threshold, Ordering::Release);
    }

    async fn wait_buffered_low(&self) {
        self.backlog.low.notified().await;
    }

    async fn close(&self) -> Result<()> {
        self.shut();
        Ok(())
    }
}

/// Receiving end of a channel direction. Draining a frame releases its
/// bytes from the sender's buffered amount.
pub struct MemoryChannelTap {
    rx: mpsc::UnboundedReceiver<ChannelFrame>,
    backlog: Arc<Backlog>,
}

impl MemoryChannelTap {
    pub async fn next(&mut self) -> Option<ChannelFrame> {
        let frame = self.rx.recv().await?;
        self.backlog.release(frame.len());
        Some(frame)
    }

    pub fn try_next(&mut self) -> Option<ChannelFrame> {
        let frame = self.rx.try_recv().ok()?;
        self.backlog.release(frame.len());
        Some(frame)
    }

    async fn pump(mut self, sink: EventSink) {
        while let Some(frame) = self.next().await {
            sink.emit(TransportEvent::ChannelMessage(frame));
        }
        sink.emit(TransportEvent::ChannelClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::SessionEvent;
    use std::time::Duration;

    fn sink(peer: &str) -> (EventSink, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(peer, 1, tx), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .event
    }

    fn local_candidate(ev: TransportEvent) -> SignalBlob {
        match ev {
            TransportEvent::LocalCandidate(c) => c,
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_link_after_candidates() {
        let network = MemoryNetwork::new();
        let fa = MemoryTransportFactory::new(&network);
        let fb = MemoryTransportFactory::new(&network);
        let (sa, mut ra) = sink("b");
        let (sb, mut rb) = sink("a");
        let a = fa.create(sa).await.unwrap();
        let b = fb.create(sb).await.unwrap();

        a.create_data_channel("files").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        let ca = local_candidate(next_event(&mut ra).await);
        assert_eq!(a.negotiation_state(), NegotiationState::HaveLocalOffer);

        let answer = b.accept_offer(&offer).await.unwrap();
        let cb = local_candidate(next_event(&mut rb).await);
        a.apply_answer(&answer).await.unwrap();
        assert_eq!(a.negotiation_state(), NegotiationState::Stable);

        a.add_candidate(&cb).await.unwrap();
        assert!(!fa.transports()[0].is_linked());
        b.add_candidate(&ca).await.unwrap();
        assert!(fa.transports()[0].is_linked());

        for rx in [&mut ra, &mut rb] {
            assert!(matches!(
                next_event(rx).await,
                TransportEvent::Connectivity(Connectivity::Connected)
            ));
            assert!(matches!(next_event(rx).await, TransportEvent::ChannelOpen));
        }

        let b_dc = b.data_channel().unwrap();
        assert_eq!(b_dc.label(), "files");
        a.data_channel().unwrap().send_text("hi").await.unwrap();
        match next_event(&mut rb).await {
            TransportEvent::ChannelMessage(ChannelFrame::Text(t)) => assert_eq!(t, "hi"),
            other => panic!("unexpected {other:?}"),
        }

        a.close().await.unwrap();
        assert!(!b_dc.is_open());
        let mut saw_disconnect = false;
        while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(100), rb.recv()).await {
            if matches!(ev.event, TransportEvent::Connectivity(Connectivity::Disconnected)) {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let network = MemoryNetwork::new();
        let f = MemoryTransportFactory::new(&network);
        let (s, _r) = sink("x");
        let t = f.create(s).await.unwrap();
        assert!(t.add_candidate(&SignalBlob(json!({}))).await.is_err());
    }

    #[tokio::test]
    async fn test_loopback_backlog_and_low_signal() {
        let (dc, mut tap) = MemoryDataChannel::loopback("t");
        dc.set_buffered_low_threshold(4).await;
        dc.send_binary(Bytes::from_static(b"12345678")).await.unwrap();
        dc.send_binary(Bytes::from_static(b"1234")).await.unwrap();
        assert_eq!(dc.buffered_amount().await, 12);

        let waiter = {
            let dc = dc.clone();
            tokio::spawn(async move { dc.wait_buffered_low().await })
        };
        tap.next().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dc.buffered_amount().await, 4);
        assert_eq!(dc.peak_buffered(), 12);
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_fails() {
        let (dc, _tap) = MemoryDataChannel::loopback("t");
        dc.close().await.unwrap();
        assert!(dc.send_text("x").await.is_err());
    }
}
