//! WebRTC transport initialization: API construction, ICE servers, and the
//! peer connection callbacks that feed the session's event sink.

use super::channel::WebRtcDataChannel;
use super::transport::{map_ice_state, WebRtcTransport};
use crate::core::config::IceConfig;
use crate::core::connection::{EventSink, PeerTransport, TransportEvent, TransportFactory};
use crate::core::relay::SignalBlob;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

/// Builds one webrtc-rs peer connection per session.
pub struct WebRtcTransportFactory {
    ice: IceConfig,
}

impl WebRtcTransportFactory {
    pub fn new(ice: IceConfig) -> Arc<Self> {
        Arc::new(Self { ice })
    }
}

pub(crate) fn ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::with_capacity(2);
    if !ice.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.stun_urls.clone(),
            username: String::new(),
            credential: String::new(),
        });
    }
    if let Some(turn) = &ice.turn {
        servers.push(RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
        });
    }
    servers
}

fn create_webrtc_api(ice: &IceConfig) -> Result<webrtc::api::API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;

    let mut se = SettingEngine::default();
    se.set_include_loopback_candidate(ice.include_loopback);

    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, sink: EventSink) -> Result<Arc<dyn PeerTransport>> {
        let api = create_webrtc_api(&self.ice)?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: ice_servers(&self.ice),
                ..Default::default()
            })
            .await
            .context("new peer connection")?,
        );

        let channel = Arc::new(Mutex::new(None));
        install_handlers(&pc, &sink, &channel);

        info!(
            event = "webrtc_transport_created",
            peer = sink.peer_id(),
            generation = sink.generation(),
            "Peer connection allocated"
        );
        Ok(Arc::new(WebRtcTransport::new(pc, channel, sink)) as Arc<dyn PeerTransport>)
    }
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    sink: &EventSink,
    channel: &Arc<Mutex<Option<Arc<WebRtcDataChannel>>>>,
) {
    // Trickle every local candidate as soon as it is gathered.
    let cand_sink = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let sink = cand_sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!(event = "ice_gathering_complete", peer = sink.peer_id(), "ICE gathering complete");
                return;
            };
            match candidate.to_json().map_err(anyhow::Error::from).and_then(|init| SignalBlob::encode(&init)) {
                Ok(blob) => sink.emit(TransportEvent::LocalCandidate(blob)),
                Err(e) => warn!(event = "ice_candidate_encode_failed", error = %e, "Dropping local candidate"),
            }
        })
    }));

    let state_sink = sink.clone();
    pc.on_ice_connection_state_change(Box::new(move |s| {
        let sink = state_sink.clone();
        Box::pin(async move {
            match s {
                RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                    info!(event = "webrtc_connected", peer = sink.peer_id(), state = %s, "WebRTC connection established");
                }
                RTCIceConnectionState::Failed => {
                    error!(event = "webrtc_failed", peer = sink.peer_id(), "WebRTC connection failed");
                }
                RTCIceConnectionState::Disconnected => {
                    warn!(event = "webrtc_disconnected", peer = sink.peer_id(), "WebRTC connection lost");
                }
                RTCIceConnectionState::Closed => {
                    info!(event = "webrtc_closed", peer = sink.peer_id(), "WebRTC connection closed");
                }
                _ => debug!(event = "webrtc_ice_state", peer = sink.peer_id(), state = %s, "ICE state changed"),
            }
            if let Some(c) = map_ice_state(s) {
                sink.emit(TransportEvent::Connectivity(c));
            }
        })
    }));

    // Answerer side: the initiator's pre-opened channel arrives here.
    let dc_sink = sink.clone();
    let slot = channel.clone();
    pc.on_data_channel(Box::new(move |dc| {
        let sink = dc_sink.clone();
        let slot = slot.clone();
        Box::pin(async move {
            info!(event = "data_channel_received", peer = sink.peer_id(), label = dc.label(), "Remote data channel announced");
            let wrapped = WebRtcDataChannel::new(dc);
            if let Ok(mut guard) = slot.lock() {
                *guard = Some(wrapped.clone());
            }
            wrapped.attach(sink).await;
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TurnServer;

    #[test]
    fn test_ice_servers_from_config() {
        let ice = IceConfig {
            stun_urls: vec!["stun:a:1".into(), "stun:b:2".into()],
            turn: Some(TurnServer {
                url: "turn:t:3478".into(),
                username: "u".into(),
                credential: "p".into(),
            }),
            include_loopback: false,
        };
        let servers = ice_servers(&ice);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls.len(), 2);
        assert_eq!(servers[1].username, "u");
    }

    #[test]
    fn test_no_servers_for_local_only() {
        let ice = IceConfig {
            stun_urls: vec![],
            turn: None,
            include_loopback: true,
        };
        assert!(ice_servers(&ice).is_empty());
    }
}
