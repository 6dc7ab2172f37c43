//! [`PeerTransport`] over an `RTCPeerConnection`.

use super::channel::WebRtcDataChannel;
use crate::core::connection::{Connectivity, DataChannel, EventSink, NegotiationState, PeerTransport};
use crate::core::relay::SignalBlob;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::debug;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<WebRtcDataChannel>>>>,
    sink: EventSink,
}

impl WebRtcTransport {
    pub(crate) fn new(
        pc: Arc<RTCPeerConnection>,
        channel: Arc<Mutex<Option<Arc<WebRtcDataChannel>>>>,
        sink: EventSink,
    ) -> Self {
        Self { pc, channel, sink }
    }
}

pub(crate) fn map_signaling_state(s: RTCSignalingState) -> NegotiationState {
    match s {
        RTCSignalingState::Stable => NegotiationState::Stable,
        RTCSignalingState::HaveLocalOffer => NegotiationState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => NegotiationState::HaveRemoteOffer,
        RTCSignalingState::Closed => NegotiationState::Closed,
        _ => NegotiationState::Other,
    }
}

pub(crate) fn map_ice_state(s: RTCIceConnectionState) -> Option<Connectivity> {
    Some(match s {
        RTCIceConnectionState::New => Connectivity::New,
        RTCIceConnectionState::Checking => Connectivity::Checking,
        RTCIceConnectionState::Connected => Connectivity::Connected,
        RTCIceConnectionState::Completed => Connectivity::Completed,
        RTCIceConnectionState::Disconnected => Connectivity::Disconnected,
        RTCIceConnectionState::Failed => Connectivity::Failed,
        RTCIceConnectionState::Closed => Connectivity::Closed,
        _ => return None,
    })
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn negotiation_state(&self) -> NegotiationState {
        map_signaling_state(self.pc.signaling_state())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        // Ordered + fully reliable: chunks carry no sequence number.
        let init = Some(RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        });
        let dc = self
            .pc
            .create_data_channel(label, init)
            .await
            .context("create data channel")?;
        let wrapped = WebRtcDataChannel::new(dc);
        if let Ok(mut guard) = self.channel.lock() {
            *guard = Some(wrapped.clone());
        }
        wrapped.attach(self.sink.clone()).await;
        Ok(wrapped as Arc<dyn DataChannel>)
    }

    async fn create_offer(&self) -> Result<SignalBlob> {
        let offer = self.pc.create_offer(None).await?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .context("set local offer")?;
        SignalBlob::encode(&offer)
    }

    async fn accept_offer(&self, offer: &SignalBlob) -> Result<SignalBlob> {
        let desc: RTCSessionDescription = offer.decode().context("decode offer")?;
        self.pc
            .set_remote_description(desc)
            .await
            .context("set remote offer")?;
        let answer = self.pc.create_answer(None).await?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .context("set local answer")?;
        SignalBlob::encode(&answer)
    }

    async fn apply_answer(&self, answer: &SignalBlob) -> Result<()> {
        let desc: RTCSessionDescription = answer.decode().context("decode answer")?;
        self.pc
            .set_remote_description(desc)
            .await
            .context("set remote answer")?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: &SignalBlob) -> Result<()> {
        let init: RTCIceCandidateInit = candidate.decode().context("decode candidate")?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .map(|c| c as Arc<dyn DataChannel>)
    }

    async fn close(&self) -> Result<()> {
        debug!(event = "webrtc_close", peer = self.sink.peer_id(), "Closing peer connection");
        self.pc.close().await?;
        Ok(())
    }
}
